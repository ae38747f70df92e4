// ==============================================================================
// manifest.rs - Run Input Manifest Builder
// ==============================================================================
// Description: Materializes the inputs.json for a launched pipeline run
// Author: Matt Barham
// Created: 2026-05-20
// Modified: 2026-08-02
// Version: 1.0.0
// ==============================================================================

use std::collections::BTreeMap;

use thiserror::Error;
use tracing::info;

use crate::models::{AssayDefinition, SampleGroup};

/// Errors raised while building an input manifest.
#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("assay {0} declares no static inputs, cannot derive run prefix")]
    NoStaticInputs(String),

    #[error("sample group for assay {0} has no sample id")]
    NoSampleId(String),
}

/// Merges an assay's static inputs with a sample group's file mappings into
/// the flat key/value manifest the workflow engine consumes.
///
/// Keys ending in `.prefix` take the group's sample id as their value so
/// output paths are sample-scoped. Record mappings not already carrying the
/// run prefix (the first segment of the first static-input key) are
/// namespaced under it.
pub fn create_input_manifest(
    assay: &AssayDefinition,
    group: &SampleGroup,
) -> Result<BTreeMap<String, String>, ManifestError> {
    let sample_id = group
        .primary_sample_id()
        .ok_or_else(|| ManifestError::NoSampleId(assay.id.clone()))?;

    let run_prefix = assay
        .static_inputs
        .first()
        .map(|input| input.key_name.split('.').next().unwrap_or_default())
        .ok_or_else(|| ManifestError::NoStaticInputs(assay.id.clone()))?;

    let mut manifest = BTreeMap::new();

    for input in &assay.static_inputs {
        if input.key_name.ends_with(".prefix") {
            manifest.insert(input.key_name.clone(), sample_id.to_string());
        } else {
            manifest.insert(input.key_name.clone(), input.key_value.clone());
        }
    }

    for record in &group.records {
        if record.mapping.contains(run_prefix) {
            manifest.insert(record.mapping.clone(), record.gs_uri.clone());
        } else {
            manifest.insert(
                format!("{}.{}", run_prefix, record.mapping),
                record.gs_uri.clone(),
            );
        }
    }

    info!(
        category = "INFO-MANIFEST",
        assay = %assay.id,
        sample = %sample_id,
        keys = manifest.len(),
        "input manifest created"
    );
    Ok(manifest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{GroupKey, RecordSlice, StaticInput};

    fn group_with_mapping(mapping: &str) -> SampleGroup {
        SampleGroup {
            key: GroupKey {
                trial: "t1".into(),
                trial_name: String::new(),
                assay: "a1".into(),
                sample_ids: vec!["SAMPLE-007".into()],
                experimental_strategy: String::new(),
            },
            records: vec![RecordSlice {
                id: "r1".into(),
                file_name: "reads.fastq".into(),
                gs_uri: "gs://bucket/reads.fastq".into(),
                mapping: mapping.into(),
            }],
        }
    }

    fn assay(static_inputs: Vec<StaticInput>) -> AssayDefinition {
        AssayDefinition {
            id: "a1".into(),
            assay_name: "wes".into(),
            non_static_inputs: vec![],
            static_inputs,
            workflow_location: Some("gs://bucket/wf.wdl".into()),
        }
    }

    #[test]
    fn test_static_inputs_and_mapping_round_trip() {
        let assay = assay(vec![StaticInput {
            key_name: "k".into(),
            key_value: "v".into(),
        }]);
        let manifest = create_input_manifest(&assay, &group_with_mapping("fastq1")).unwrap();

        assert_eq!(manifest.get("k"), Some(&"v".to_string()));
        assert_eq!(
            manifest.get("k.fastq1"),
            Some(&"gs://bucket/reads.fastq".to_string())
        );
    }

    #[test]
    fn test_prefix_key_resolves_to_sample_id() {
        let assay = assay(vec![
            StaticInput {
                key_name: "run_bwamem.num_cpu".into(),
                key_value: "2".into(),
            },
            StaticInput {
                key_name: "run_bwamem.prefix".into(),
                key_value: "unused".into(),
            },
        ]);
        let manifest =
            create_input_manifest(&assay, &group_with_mapping("run_bwamem.fastq1")).unwrap();

        assert_eq!(
            manifest.get("run_bwamem.prefix"),
            Some(&"SAMPLE-007".to_string())
        );
        assert_eq!(manifest.get("run_bwamem.num_cpu"), Some(&"2".to_string()));
        // Mapping already carries the run prefix, so it is not re-namespaced.
        assert_eq!(
            manifest.get("run_bwamem.fastq1"),
            Some(&"gs://bucket/reads.fastq".to_string())
        );
    }

    #[test]
    fn test_missing_static_inputs_is_an_error() {
        let assay = assay(vec![]);
        let result = create_input_manifest(&assay, &group_with_mapping("fastq1"));
        assert!(matches!(result, Err(ManifestError::NoStaticInputs(_))));
    }
}
