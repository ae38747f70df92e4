// ==============================================================================
// processing.rs - Upload Post-Processing
// ==============================================================================
// Description: Parses uploaded lab files and maintains the combined MAF
// Author: Matt Barham
// Created: 2026-06-01
// Modified: 2026-08-23
// Version: 1.3.0
// ==============================================================================
// Uploads are dispatched by file kind: lab reports are pulled down, parsed
// into structured child records, and posted back to the API; MAF outputs
// are folded into the per-trial combined artifact. The combined file is
// shared mutable state guarded only by etag writes, so the merge carries a
// race-window check against other just-finished runs and a bounded retry
// on patch conflicts.
// ==============================================================================

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use ingestion_core::models::{AnalysisRun, ChildRef, DataRecord, RecordContext};
use ingestion_core::parsers::maf::{combine_mafs, reformat_maf};
use ingestion_core::parsers::metadata::process_clinical_metadata;
use ingestion_core::parsers::npx::process_olink_npx;
use ingestion_core::parsers::sheet::Sheet;
use ingestion_core::validation::ValidationError;
use serde_json::{json, Value};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::eve::{EveClient, EveError, RecordStore};
use crate::genes;
use crate::storage::{gsutil_cp, gsutil_mv};

/// Two runs finishing this close together contend for the combined file.
const MERGE_WINDOW_SECONDS: i64 = 30;

/// How many times a backed-off merge re-attempts from the top.
const MERGE_ATTEMPTS: u32 = 3;

/// Pause between merge attempts, and before the single patch retry.
const MERGE_BACKOFF: Duration = Duration::from_secs(5);

/// Closed set of upload kinds with a post-processing step. Anything else
/// is stored as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    OlinkNpx,
    OlinkMeta,
    Maf,
}

impl FileKind {
    pub fn match_name(file_name: &str) -> Option<Self> {
        let name = file_name.to_lowercase();
        if name.contains("olink") && name.contains("npx") {
            Some(Self::OlinkNpx)
        } else if name.contains("olink") && name.contains("biorepository") {
            Some(Self::OlinkMeta)
        } else if name.ends_with(".maf") {
            Some(Self::Maf)
        } else {
            None
        }
    }

    /// Resource endpoint the parsed record is posted to.
    fn endpoint(self) -> &'static str {
        match self {
            Self::OlinkNpx => "olink",
            Self::OlinkMeta => "olink_meta",
            Self::Maf => "data_edit",
        }
    }
}

fn temp_path() -> PathBuf {
    std::env::temp_dir().join(Uuid::new_v4().to_string())
}

/// Post-processes a batch of freshly uploaded records.
pub async fn process_uploads(
    eve: &EveClient,
    store: &dyn RecordStore,
    records: Vec<DataRecord>,
) -> Result<()> {
    for record in records {
        let Some(kind) = FileKind::match_name(&record.file_name) else {
            info!(
                category = "FAIR-PROCESSING",
                "No post-processing step for {}", record.file_name
            );
            continue;
        };
        info!(
            category = "FAIR-PROCESSING",
            "Processing {} as {kind:?}", record.file_name
        );

        let outcome = match kind {
            FileKind::Maf => merge_combined_maf(store, &record, MERGE_BACKOFF).await,
            FileKind::OlinkNpx | FileKind::OlinkMeta => {
                process_file(eve, &record, kind).await
            }
        };
        if let Err(err) = outcome {
            error!(
                category = "ERROR-PROCESSING",
                "Post-processing of {} failed: {err:#}", record.file_name
            );
        }
    }
    Ok(())
}

/// Downloads, parses, and registers one lab report. A schema rejection is
/// downgraded to an error record so the submitter can see what failed.
async fn process_file(eve: &EveClient, record: &DataRecord, kind: FileKind) -> Result<()> {
    let local = temp_path();
    gsutil_cp(
        &record.gs_uri,
        &local.to_string_lossy(),
        "Downloading upload for parsing",
    )
    .await?;

    let record_id = record.id.as_deref().unwrap_or_default();
    let context = RecordContext::new(&record.trial, &record.assay, record_id);
    let sheet = Sheet::load(&local).context("Upload is not a readable sheet")?;

    let parsed = match kind {
        FileKind::OlinkNpx => {
            let mut report = process_olink_npx(&sheet, &context);
            let symbols: Vec<String> = report
                .ol_assay
                .iter()
                .filter_map(|assay| assay.assay.clone())
                .collect();
            if !symbols.is_empty() {
                if let Some(finding) = genes::check_symbols_valid(eve, &symbols).await {
                    report.validation_errors.push(finding);
                }
            }
            serde_json::to_value(&report)?
        }
        FileKind::OlinkMeta => serde_json::to_value(&process_clinical_metadata(&sheet, &context))?,
        FileKind::Maf => unreachable!("MAF uploads take the merge path"),
    };
    std::fs::remove_file(&local).ok();

    let endpoint = kind.endpoint();
    let response = match eve.post(endpoint, &parsed).await {
        Ok(response) => response,
        Err(EveError::Validation { body }) => {
            warn!(
                category = "WARNING-PROCESSING",
                "Parsed record for {} rejected by schema validation", record.file_name
            );
            let fallback = json!({
                "trial": record.trial,
                "assay": record.assay,
                "record_id": record_id,
                "validation_errors": extract_issues(&body),
            });
            eve.post(endpoint, &fallback)
                .await
                .context("Failed to upload validation-error record")?
        }
        Err(err) => return Err(err.into()),
    };

    let child_id = response
        .get("_id")
        .and_then(Value::as_str)
        .context("Parsed-record response carried no id")?;
    update_child_list(eve, record, child_id, endpoint).await?;

    info!(
        category = "FAIR-RECORD",
        "Registered parsed record {child_id} for {}", record.file_name
    );
    Ok(())
}

/// Turns a schema-rejection body into structured validation findings.
pub fn extract_issues(body: &str) -> Vec<ValidationError> {
    let Ok(doc) = serde_json::from_str::<Value>(body) else {
        return vec![ValidationError::critical(body, vec![])];
    };
    let Some(issues) = doc.get("_issues").and_then(Value::as_object) else {
        return vec![ValidationError::critical(body, vec![])];
    };
    issues
        .iter()
        .map(|(field, message)| {
            let message = message.as_str().map(str::to_string).unwrap_or_else(|| message.to_string());
            ValidationError::critical(format!("{field}: {message}"), vec![field.clone()])
        })
        .collect()
}

/// Links a derived child document back to its source data record.
async fn update_child_list(
    eve: &EveClient,
    parent: &DataRecord,
    child_id: &str,
    resource: &str,
) -> Result<()> {
    let parent_id = parent.id.as_deref().context("Parent record has no id")?;
    // Re-fetch for a current etag and child list.
    let fresh: DataRecord = eve.get_item("data", parent_id).await?;
    let etag = fresh.etag.as_deref().unwrap_or_default();

    let mut children = fresh.children.clone();
    children.push(ChildRef {
        id: child_id.to_string(),
        resource: resource.to_string(),
    });
    eve.patch("data_edit", parent_id, etag, &json!({ "children": children }))
        .await
        .context("Failed to update parent child list")?;
    Ok(())
}

/// Whether this run should yield the first-writer slot to another run that
/// finished within the contention window. The later finisher defers; exact
/// ties go to the lexicographically smaller run id.
pub fn should_back_off(
    my_end: DateTime<Utc>,
    my_id: &str,
    other_end: DateTime<Utc>,
    other_id: &str,
) -> bool {
    let gap = (my_end - other_end).num_seconds().abs();
    if gap > MERGE_WINDOW_SECONDS {
        return false;
    }
    if my_end != other_end {
        return my_end > other_end;
    }
    my_id > other_id
}

/// Patch body updating the combined artifact's sample membership: the
/// union of its samples and the new run's, with the count kept in step.
pub fn merge_patch_body(existing: &DataRecord, new_sample_ids: &[String]) -> Value {
    let mut sample_ids = existing.sample_ids.clone();
    for sample in new_sample_ids {
        if !sample_ids.contains(sample) {
            sample_ids.push(sample.clone());
        }
    }
    json!({
        "number_of_samples": sample_ids.len(),
        "sample_ids": sample_ids,
    })
}

/// The completed run that generated this MAF output, identified through
/// the runs' generated-file lists.
pub fn find_producing_run<'a>(
    runs: &'a [AnalysisRun],
    record: &DataRecord,
) -> Option<&'a AnalysisRun> {
    runs.iter().find(|run| {
        run.files_generated
            .iter()
            .any(|file| file.gs_uri == record.gs_uri)
    })
}

/// Whether another run finishing inside the contention window outranks
/// this record's producing run for creating the combined artifact. With no
/// identifiable producing run there is nothing to rank, so the merge
/// proceeds.
pub fn merge_contended(runs: &[AnalysisRun], record: &DataRecord) -> bool {
    let Some(mine) = find_producing_run(runs, record) else {
        return false;
    };
    let (Some(my_end), Some(my_run_id)) = (mine.end_date, mine.id.as_deref()) else {
        return false;
    };
    runs.iter().any(|run| {
        let (Some(end), Some(id)) = (run.end_date, run.id.as_deref()) else {
            return false;
        };
        id != my_run_id && should_back_off(my_end, my_run_id, end, id)
    })
}

/// Folds one run's MAF output into the trial's combined artifact. Without
/// an existing artifact the run's file becomes the artifact, unless another
/// run finished inside the contention window, in which case this merge
/// backs off and re-checks from the top.
pub async fn merge_combined_maf(
    store: &dyn RecordStore,
    record: &DataRecord,
    backoff: Duration,
) -> Result<()> {
    // The combined file is the merge target, never a contribution.
    if record.file_name == "combined.maf" {
        return Ok(());
    }

    let my_id = record.id.as_deref().unwrap_or_default();

    for attempt in 1..=MERGE_ATTEMPTS {
        match store.find_combined_artifact(&record.trial, &record.assay).await? {
            Some(artifact) => {
                append_to_artifact(store, &artifact, record, backoff).await?;
                return Ok(());
            }
            None => {
                let runs = store
                    .recent_completed_runs(&record.trial, &record.assay)
                    .await?;
                if merge_contended(&runs, record) {
                    warn!(
                        category = "WARNING-PROCESSING",
                        "Another run is creating the combined MAF for trial {}; \
                         backing off (attempt {attempt})",
                        record.trial
                    );
                    tokio::time::sleep(backoff).await;
                    continue;
                }

                let context = RecordContext::new(&record.trial, &record.assay, my_id);
                let combined = reformat_maf(record.clone(), &context);
                gsutil_mv(
                    &record.gs_uri,
                    &combined.gs_uri,
                    "Promoting run output to combined MAF",
                )
                .await?;
                store.insert_record(&combined).await?;
                info!(
                    category = "FAIR-RECORD",
                    "Created combined MAF for trial {}", record.trial
                );
                return Ok(());
            }
        }
    }

    error!(
        category = "ERROR-PROCESSING",
        "Gave up merging MAF for trial {} after {MERGE_ATTEMPTS} attempts", record.trial
    );
    Ok(())
}

/// Appends the run's rows to the existing artifact and patches its sample
/// membership with an etag guard.
async fn append_to_artifact(
    store: &dyn RecordStore,
    artifact: &DataRecord,
    record: &DataRecord,
    backoff: Duration,
) -> Result<()> {
    let local_combined = temp_path();
    let local_new = temp_path();
    gsutil_cp(
        &artifact.gs_uri,
        &local_combined.to_string_lossy(),
        "Downloading combined MAF",
    )
    .await?;
    gsutil_cp(
        &record.gs_uri,
        &local_new.to_string_lossy(),
        "Downloading run MAF output",
    )
    .await?;

    let appended = combine_mafs(&local_new, &local_combined)?;
    info!(
        category = "FAIR-RECORD",
        "Appended {appended} rows to combined MAF for trial {}", record.trial
    );

    gsutil_cp(
        &local_combined.to_string_lossy(),
        &artifact.gs_uri,
        "Uploading combined MAF",
    )
    .await?;
    std::fs::remove_file(&local_combined).ok();
    std::fs::remove_file(&local_new).ok();

    patch_combined_membership(store, artifact, &record.sample_ids, backoff).await
}

/// Etag-guarded membership patch with exactly one retry on conflict.
pub async fn patch_combined_membership(
    store: &dyn RecordStore,
    artifact: &DataRecord,
    new_sample_ids: &[String],
    backoff: Duration,
) -> Result<()> {
    let id = artifact.id.as_deref().context("Combined artifact has no id")?;
    let etag = artifact.etag.as_deref().unwrap_or_default();
    let body = merge_patch_body(artifact, new_sample_ids);

    match store.patch_artifact(id, etag, &body).await {
        Ok(()) => return Ok(()),
        Err(EveError::Conflict { .. }) => {
            warn!(
                category = "WARNING-PROCESSING",
                "Combined MAF patch conflicted; refreshing and retrying once"
            );
        }
        Err(err) => return Err(err.into()),
    }

    tokio::time::sleep(backoff).await;
    let fresh = store
        .find_combined_artifact(&artifact.trial, &artifact.assay)
        .await?
        .context("Combined artifact disappeared during merge")?;
    let etag = fresh.etag.as_deref().unwrap_or_default();
    let body = merge_patch_body(&fresh, new_sample_ids);

    if let Err(err) = store.patch_artifact(id, etag, &body).await {
        error!(
            category = "ERROR-PROCESSING",
            "Combined MAF patch failed again ({err}); giving up"
        );
    }
    Ok(())
}
