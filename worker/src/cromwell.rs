// ==============================================================================
// cromwell.rs - Workflow Engine Client and Run Poller
// ==============================================================================
// Description: Submits WDL runs and reconciles their outputs on completion
// Author: Matt Barham
// Created: 2026-05-30
// Modified: 2026-08-04
// Version: 1.1.0
// ==============================================================================
// Submission is a multipart POST of the workflow source and its inputs
// manifest. The poller asks for status at a fixed interval until the engine
// reports a terminal state, then reconciles: bucket-URI outputs become data
// records with collaborator read access, scalar outputs are logged, and the
// analysis record is patched with the outcome. A worker crash mid-poll
// leaves the run In Progress; there is no cancellation path.
// ==============================================================================

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use ingestion_core::models::{DataRecord, FileRef, RunStatus, SampleGroup, WorkflowStatus};
use serde_json::Value;
use tracing::{error, info};

use crate::admin;
use crate::analysis::{finalize_run, RunContext};
use crate::storage;

const POLL_INTERVAL: Duration = Duration::from_secs(5);

pub struct CromwellClient {
    http: reqwest::Client,
    base_url: String,
}

impl CromwellClient {
    pub fn new(http: reqwest::Client, base_url: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Submits a workflow; the engine answers with the run's engine id.
    pub async fn submit(&self, workflow_source: &str, workflow_inputs: &str) -> Result<String> {
        let form = reqwest::multipart::Form::new()
            .text("workflowSource", workflow_source.to_string())
            .text("workflowInputs", workflow_inputs.to_string());

        let response = self
            .http
            .post(&self.base_url)
            .multipart(form)
            .send()
            .await
            .context("Workflow submission failed")?
            .error_for_status()
            .context("Workflow engine rejected the submission")?;

        let doc: Value = response.json().await?;
        doc.get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .context("Submission response carried no run id")
    }

    pub async fn status(&self, engine_id: &str) -> Result<WorkflowStatus> {
        let doc: Value = self
            .http
            .get(format!("{}/{engine_id}/status", self.base_url))
            .send()
            .await
            .context("Status request failed")?
            .error_for_status()?
            .json()
            .await?;
        let status = doc
            .get("status")
            .cloned()
            .context("Status response carried no status")?;
        serde_json::from_value(status).context("Unrecognized workflow status")
    }

    pub async fn metadata(&self, engine_id: &str) -> Result<Value> {
        Ok(self
            .http
            .get(format!("{}/{engine_id}/metadata", self.base_url))
            .send()
            .await
            .context("Metadata request failed")?
            .error_for_status()?
            .json()
            .await?)
    }

    pub async fn logs(&self, engine_id: &str) -> Result<String> {
        Ok(self
            .http
            .get(format!("{}/{engine_id}/logs", self.base_url))
            .send()
            .await
            .context("Log request failed")?
            .error_for_status()?
            .text()
            .await?)
    }
}

/// Splits an engine's output map into bucket objects and scalar values.
pub fn classify_outputs(outputs: &Value) -> (Vec<(String, String)>, Vec<(String, Value)>) {
    let mut uris = Vec::new();
    let mut scalars = Vec::new();

    let Some(map) = outputs.as_object() else {
        return (uris, scalars);
    };
    for (name, value) in map {
        match value.as_str() {
            Some(text) if text.starts_with("gs://") => {
                uris.push((name.clone(), text.to_string()));
            }
            _ => scalars.push((name.clone(), value.clone())),
        }
    }
    (uris, scalars)
}

/// Builds the data record registering one bucket-URI output of a run.
pub fn build_output_record(name: &str, gs_uri: &str, group: &SampleGroup) -> DataRecord {
    DataRecord {
        id: None,
        etag: None,
        trial: group.key.trial.clone(),
        trial_name: group.key.trial_name.clone(),
        assay: group.key.assay.clone(),
        file_name: gs_uri.rsplit('/').next().unwrap_or(gs_uri).to_string(),
        gs_uri: gs_uri.to_string(),
        mapping: name.to_string(),
        sample_ids: group.key.sample_ids.clone(),
        number_of_samples: group.key.sample_ids.len() as u32,
        data_format: name.to_string(),
        file_size: 0,
        experimental_strategy: group.key.experimental_strategy.clone(),
        date_created: Some(Utc::now()),
        processed: false,
        visibility: true,
        children: vec![],
        validation_errors: vec![],
    }
}

/// Polls a launched run to a terminal state, then reconciles its outputs
/// and patches the analysis record.
pub async fn poll_run(
    ctx: &RunContext<'_>,
    run_id: &str,
    engine_id: &str,
    group: &SampleGroup,
) -> Result<()> {
    let terminal = loop {
        let status = ctx.cromwell.status(engine_id).await?;
        if status.is_terminal() {
            break status;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    };

    if terminal != WorkflowStatus::Succeeded {
        let logs = ctx.cromwell.logs(engine_id).await.unwrap_or_default();
        error!(
            category = "ERROR-CROMWELL",
            "Run {engine_id} ended {}; capturing engine logs", terminal.as_str()
        );
        return finalize_run(ctx.eve, run_id, RunStatus::Failed, &[], Some(&logs)).await;
    }

    let metadata = ctx.cromwell.metadata(engine_id).await?;
    let outputs = metadata.get("outputs").cloned().unwrap_or(Value::Null);
    let (uris, scalars) = classify_outputs(&outputs);

    for (name, value) in &scalars {
        info!(
            category = "INFO-CROMWELL",
            "Run {engine_id} produced scalar output {name}: {value}"
        );
    }

    let authorized =
        admin::get_authorized_users(ctx.eve, &group.key.trial, &group.key.assay).await?;

    let mut generated = Vec::new();
    let mut records = Vec::new();
    for (name, gs_uri) in &uris {
        storage::manage_bucket_acl(gs_uri, &authorized).await?;
        records.push(build_output_record(name, gs_uri, group));
        generated.push(FileRef {
            file_name: gs_uri.rsplit('/').next().unwrap_or(gs_uri).to_string(),
            gs_uri: gs_uri.clone(),
        });
    }

    if !records.is_empty() {
        ctx.eve
            .post("data_edit", &records)
            .await
            .context("Failed to register run outputs")?;
        info!(
            category = "FAIR-RECORD",
            "Registered {} output records for run {engine_id}",
            records.len()
        );
    }

    finalize_run(ctx.eve, run_id, RunStatus::Completed, &generated, None).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use ingestion_core::models::{GroupKey, RecordSlice};
    use serde_json::json;

    #[test]
    fn test_classify_outputs_splits_uris_from_scalars() {
        let outputs = json!({
            "wes.vcf": "gs://bucket/runs/1/out.vcf",
            "wes.maf": "gs://bucket/runs/1/out.maf",
            "wes.coverage": 29.4,
            "wes.notes": "duplicates removed",
        });
        let (uris, scalars) = classify_outputs(&outputs);
        assert_eq!(uris.len(), 2);
        assert!(uris.contains(&("wes.vcf".into(), "gs://bucket/runs/1/out.vcf".into())));
        assert_eq!(scalars.len(), 2);
    }

    #[test]
    fn test_output_record_carries_group_identity() {
        let group = SampleGroup {
            key: GroupKey {
                trial: "t1".into(),
                trial_name: "Trial One".into(),
                assay: "a1".into(),
                sample_ids: vec!["s1".into()],
                experimental_strategy: "WES".into(),
            },
            records: vec![RecordSlice {
                id: "r1".into(),
                file_name: "in.fastq".into(),
                gs_uri: "gs://bucket/in.fastq".into(),
                mapping: "fastq1".into(),
            }],
        };
        let record = build_output_record("wes.maf", "gs://bucket/runs/1/out.maf", &group);
        assert_eq!(record.file_name, "out.maf");
        assert_eq!(record.trial, "t1");
        assert_eq!(record.sample_ids, vec!["s1"]);
        assert!(!record.processed);

        // Status strings parse into the engine status enum.
        let status: WorkflowStatus = serde_json::from_value(json!("Succeeded")).unwrap();
        assert!(status.is_terminal());
    }
}
