// ==============================================================================
// matcher.rs - Pipeline Readiness Matcher
// ==============================================================================
// Description: Decides which sample groups satisfy an assay's required inputs
// Author: Matt Barham
// Created: 2026-05-20
// Modified: 2026-08-02
// Version: 1.1.0
// ==============================================================================

use std::collections::{HashMap, HashSet};

use thiserror::Error;
use tracing::error;

use crate::models::{AssayDefinition, SampleGroup};

/// Errors raised while matching sample groups against assay definitions.
#[derive(Error, Debug)]
pub enum MatchError {
    /// A data file references an assay id absent from the assay collection.
    /// This is a data-integrity problem, so the whole batch is rejected
    /// rather than silently skipping the group.
    #[error("a data file with an invalid assay id was found: {0}")]
    UnknownAssay(String),
}

/// Builds the assay-id keyed index used during matching, keeping only assays
/// that actually have a pipeline attached.
pub fn build_assay_index(assays: Vec<AssayDefinition>) -> HashMap<String, AssayDefinition> {
    assays
        .into_iter()
        .filter(|assay| assay.workflow_location.is_some())
        .map(|assay| (assay.id.clone(), assay))
        .collect()
}

/// Returns the (group, assay) pairs eligible to start a run.
///
/// A group is eligible iff the set of mapping tags present exactly equals
/// the assay's `non_static_inputs` set. A group whose assay id is missing
/// from the index fails the whole batch (fail-closed): no runs are returned
/// and the caller logs a data-integrity error.
pub fn find_valid_runs(
    groups: Vec<SampleGroup>,
    assay_index: &HashMap<String, AssayDefinition>,
) -> Result<Vec<(SampleGroup, AssayDefinition)>, MatchError> {
    let mut valid_runs = Vec::new();

    for group in groups {
        let assay = match assay_index.get(&group.key.assay) {
            Some(assay) => assay,
            None => {
                error!(
                    category = "ERROR-MATCHER",
                    assay = %group.key.assay,
                    "a data file with an invalid assay id was found"
                );
                return Err(MatchError::UnknownAssay(group.key.assay.clone()));
            }
        };

        let present: HashSet<&str> = group.records.iter().map(|r| r.mapping.as_str()).collect();
        let required: HashSet<&str> = assay.non_static_inputs.iter().map(String::as_str).collect();

        if present == required {
            valid_runs.push((group, assay.clone()));
        }
    }

    Ok(valid_runs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{GroupKey, RecordSlice};

    fn assay(id: &str, inputs: &[&str], workflow: Option<&str>) -> AssayDefinition {
        AssayDefinition {
            id: id.to_string(),
            assay_name: format!("assay-{id}"),
            non_static_inputs: inputs.iter().map(|s| s.to_string()).collect(),
            static_inputs: vec![],
            workflow_location: workflow.map(|s| s.to_string()),
        }
    }

    fn group(assay_id: &str, mappings: &[&str]) -> SampleGroup {
        SampleGroup {
            key: GroupKey {
                trial: "t1".into(),
                trial_name: String::new(),
                assay: assay_id.into(),
                sample_ids: vec!["s1".into()],
                experimental_strategy: String::new(),
            },
            records: mappings
                .iter()
                .enumerate()
                .map(|(i, mapping)| RecordSlice {
                    id: format!("r{i}"),
                    file_name: format!("f{i}"),
                    gs_uri: format!("gs://bucket/f{i}"),
                    mapping: mapping.to_string(),
                })
                .collect(),
        }
    }

    #[test]
    fn test_exact_mapping_set_matches() {
        let index = build_assay_index(vec![assay("a1", &["fastq1", "fastq2"], Some("wf"))]);

        let runs =
            find_valid_runs(vec![group("a1", &["fastq2", "fastq1"])], &index).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].1.id, "a1");
    }

    #[test]
    fn test_incomplete_group_does_not_match() {
        let index = build_assay_index(vec![assay("a1", &["fastq1", "fastq2"], Some("wf"))]);

        let runs = find_valid_runs(vec![group("a1", &["fastq1"])], &index).unwrap();
        assert!(runs.is_empty());
    }

    #[test]
    fn test_extra_mapping_does_not_match() {
        let index = build_assay_index(vec![assay("a1", &["fastq1"], Some("wf"))]);

        let runs =
            find_valid_runs(vec![group("a1", &["fastq1", "fastq2"])], &index).unwrap();
        assert!(runs.is_empty());
    }

    #[test]
    fn test_unknown_assay_fails_whole_batch() {
        let index = build_assay_index(vec![assay("a1", &["fastq1"], Some("wf"))]);

        let result = find_valid_runs(
            vec![group("a1", &["fastq1"]), group("missing", &["fastq1"])],
            &index,
        );
        assert!(matches!(result, Err(MatchError::UnknownAssay(id)) if id == "missing"));
    }

    #[test]
    fn test_index_drops_assays_without_workflows() {
        let index = build_assay_index(vec![
            assay("a1", &["fastq1"], Some("wf")),
            assay("a2", &["npx"], None),
        ]);
        assert!(index.contains_key("a1"));
        assert!(!index.contains_key("a2"));
    }

    #[test]
    fn test_no_groups_yields_no_runs() {
        // Re-running the matcher after every record was reserved produces an
        // empty aggregation, and therefore no new runs.
        let index = build_assay_index(vec![assay("a1", &["fastq1"], Some("wf"))]);
        let runs = find_valid_runs(vec![], &index).unwrap();
        assert!(runs.is_empty());
    }
}
