// ==============================================================================
// snakemake.rs - Snakemake Workflow Launcher
// ==============================================================================
// Description: Clones, configures, and runs Snakemake pipelines on Kubernetes
// Author: Matt Barham
// Created: 2026-05-31
// Modified: 2026-08-04
// Version: 1.1.0
// ==============================================================================
// The workflow repository declares its own inputs.json and
// output_schema.json. The launcher clones the repo into a per-run working
// directory, rewrites the inputs for this sample group, uploads the bundled
// reference files, runs the snakemake CLI against the cluster, and maps the
// declared outputs back to data records via the bucket listing.
// ==============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;
use ingestion_core::models::{DataRecord, FileRef, RecordSlice, RunStatus, SampleGroup};
use serde::Serialize;
use serde_json::Value;
use tracing::{error, info};

use crate::analysis::{finalize_run, RunContext};
use crate::storage::{run_subprocess_capture, run_subprocess_with_logs};

/// A Kubernetes toleration block attached to pipeline jobs.
#[derive(Debug, Clone, Serialize)]
pub struct KubeToleration {
    pub effect: String,
    pub key: String,
    pub operator: String,
    pub value: String,
}

/// Kubernetes settings for snakemake jobs.
#[derive(Debug, Clone)]
pub struct SnakeJobSettings {
    pub cpu: u32,
    pub memory_mb: u32,
    pub namespace: String,
    pub tolerations: Vec<KubeToleration>,
}

impl Default for SnakeJobSettings {
    fn default() -> Self {
        Self {
            cpu: 6,
            memory_mb: 8000,
            namespace: "default".to_string(),
            tolerations: vec![KubeToleration {
                effect: "NoSchedule".to_string(),
                key: "snakemake".to_string(),
                operator: "Equal".to_string(),
                value: "issnake".to_string(),
            }],
        }
    }
}

impl SnakeJobSettings {
    /// CLI arguments for a run with these settings.
    pub fn cli_args(&self, snakefile: &str, workdir: &str, remote_prefix: &str) -> Vec<String> {
        let mut args = vec![
            "--snakefile".to_string(),
            snakefile.to_string(),
            "--directory".to_string(),
            workdir.to_string(),
            "--kubernetes".to_string(),
            self.namespace.clone(),
            "--cores".to_string(),
            self.cpu.to_string(),
            "--default-resources".to_string(),
            format!("mem_mb={}", self.memory_mb),
            "--default-remote-provider".to_string(),
            "GS".to_string(),
            "--default-remote-prefix".to_string(),
            remote_prefix.to_string(),
        ];
        for toleration in &self.tolerations {
            args.push("--kubernetes-toleration".to_string());
            args.push(format!(
                "{}={}:{}",
                toleration.key, toleration.value, toleration.effect
            ));
        }
        args
    }
}

/// Clones the workflow repository and returns the Snakefile path.
async fn clone_workflow(git_url: &str, folder_name: &str) -> Result<String> {
    run_subprocess_with_logs(
        "git",
        &[
            "clone",
            "--single-branch",
            "--branch",
            "single_sample",
            git_url,
            folder_name,
        ],
        "Cloning workflow repository",
    )
    .await?;
    Ok(format!("{folder_name}/Snakefile"))
}

/// Rewrites the cloned inputs document for this run: the run id, the sample
/// id, and the group's files keyed by mapping with the remote prefix
/// stripped. Returns the bundled reference files to upload, with their
/// document entries already pointed at the per-run bucket paths.
pub fn rewrite_inputs_doc(
    inputs: &mut Value,
    run_id: &str,
    sample_id: &str,
    records: &[RecordSlice],
    remote_prefix: &str,
) -> Vec<(String, String)> {
    inputs["run_id"] = Value::String(run_id.to_string());
    inputs["meta"]["SAMPLE_ID"] = Value::String(sample_id.to_string());

    let bucket_prefix = format!("gs://{remote_prefix}/");
    let mut sample_files = serde_json::Map::new();
    for record in records {
        let stripped = record
            .gs_uri
            .strip_prefix(&bucket_prefix)
            .unwrap_or(&record.gs_uri);
        sample_files.insert(record.mapping.clone(), Value::String(stripped.to_string()));
    }
    inputs["sample_files"] = Value::Object(sample_files);

    let mut uploads = Vec::new();
    if let Some(references) = inputs
        .get_mut("reference_files")
        .and_then(Value::as_object_mut)
    {
        for (reference, location) in references.iter_mut() {
            let Some(local) = location.as_str() else {
                continue;
            };
            let new_path = format!("{run_id}/{local}");
            uploads.push((reference.clone(), local.to_string()));
            *location = Value::String(new_path);
        }
    }
    uploads
}

/// Reads, rewrites, and writes back the run's inputs.json, uploading the
/// workflow's bundled reference files to the pipeline bucket.
async fn prepare_inputs(
    work_id: &str,
    group: &SampleGroup,
    remote_prefix: &str,
) -> Result<()> {
    let inputs_path = format!("{work_id}/inputs.json");
    let contents = std::fs::read_to_string(&inputs_path)
        .with_context(|| format!("Failed to read {inputs_path}"))?;
    let mut inputs: Value = serde_json::from_str(&contents).context("Malformed inputs.json")?;

    let sample_id = group
        .primary_sample_id()
        .context("Sample group has no sample id")?;
    let uploads = rewrite_inputs_doc(&mut inputs, work_id, sample_id, &group.records, remote_prefix);

    for (_, location) in &uploads {
        let local = format!("{work_id}/{location}");
        let remote = format!("gs://{remote_prefix}/{work_id}/{location}");
        run_subprocess_with_logs("gsutil", &["cp", &local, &remote], "Uploading references")
            .await?;
    }

    std::fs::write(&inputs_path, serde_json::to_vec(&inputs)?)
        .with_context(|| format!("Failed to write {inputs_path}"))?;
    Ok(())
}

/// Parses one entry of `gsutil ls -l` output: size, timestamp, object URI.
pub fn parse_ls_entry(line: &str) -> Option<(u64, String)> {
    let mut parts = line.split_whitespace();
    let size = parts.next()?.parse().ok()?;
    let _timestamp = parts.next()?;
    let uri = parts.next()?;
    uri.starts_with("gs://").then(|| (size, uri.to_string()))
}

/// Finds the declared outputs in the bucket and returns them as data
/// records ready for upload.
async fn map_outputs(
    work_id: &str,
    group: &SampleGroup,
    remote_prefix: &str,
) -> Result<Vec<DataRecord>> {
    let schema_path = format!("{work_id}/output_schema.json");
    let contents = std::fs::read_to_string(&schema_path)
        .with_context(|| format!("Failed to read {schema_path}"))?;
    let outputs: Value = serde_json::from_str(&contents).context("Malformed output schema")?;
    let Some(outputs) = outputs.as_object() else {
        return Ok(vec![]);
    };

    let sample_id = group
        .primary_sample_id()
        .context("Sample group has no sample id")?;

    let mut payload = Vec::new();
    for (output_name, output_location) in outputs {
        let Some(location) = output_location.as_str() else {
            continue;
        };
        let prefix = format!("gs://{remote_prefix}/runs/{work_id}/results/{location}");
        let listing =
            run_subprocess_capture("gsutil", &["ls", "-l", &prefix], "Listing run outputs")
                .await?;
        let Some((file_size, gs_uri)) = listing.lines().find_map(parse_ls_entry) else {
            error!(
                category = "ERROR-SNAKEMAKE",
                "File {prefix} could not be found"
            );
            continue;
        };

        payload.push(DataRecord {
            id: None,
            etag: None,
            trial: group.key.trial.clone(),
            trial_name: group.key.trial_name.clone(),
            assay: group.key.assay.clone(),
            file_name: gs_uri.rsplit('/').next().unwrap_or(&gs_uri).to_string(),
            gs_uri: gs_uri.clone(),
            mapping: output_name.clone(),
            sample_ids: vec![sample_id.to_string()],
            number_of_samples: 1,
            data_format: output_name.clone(),
            file_size,
            experimental_strategy: group.key.experimental_strategy.clone(),
            date_created: Some(Utc::now()),
            processed: false,
            visibility: true,
            children: vec![],
            validation_errors: vec![],
        });
    }
    Ok(payload)
}

/// Create inputs, run snakemake, report results.
pub async fn execute(
    ctx: &RunContext<'_>,
    run_id: &str,
    work_id: &str,
    workflow_location: &str,
    group: &SampleGroup,
) -> Result<()> {
    let snakefile = clone_workflow(workflow_location, work_id).await?;
    prepare_inputs(work_id, group, &ctx.config.pipeline_bucket).await?;

    let settings = SnakeJobSettings::default();
    let args = settings.cli_args(&snakefile, work_id, &ctx.config.pipeline_bucket);
    let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
    let run_result =
        run_subprocess_with_logs("snakemake", &arg_refs, "Running snakemake workflow").await;

    if let Err(err) = run_result {
        error!(category = "ERROR-SNAKEMAKE", "Snakemake run failed!");
        finalize_run(
            ctx.eve,
            run_id,
            RunStatus::Failed,
            &[],
            Some(&format!("{err:#}")),
        )
        .await?;
        return Err(err);
    }

    let payload = map_outputs(work_id, group, &ctx.config.pipeline_bucket).await?;
    let generated: Vec<FileRef> = payload
        .iter()
        .map(|record| FileRef {
            file_name: record.file_name.clone(),
            gs_uri: record.gs_uri.clone(),
        })
        .collect();

    if !payload.is_empty() {
        ctx.eve
            .post("data_edit", &payload)
            .await
            .context("Upload of workflow results failed")?;
        info!(
            category = "INFO-FAIR-SNAKEMAKE",
            "Upload of output files successful"
        );
    }

    finalize_run(ctx.eve, run_id, RunStatus::Completed, &generated, None).await?;

    if Path::new(work_id).exists() {
        std::fs::remove_dir_all(work_id).ok();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_default_settings_match_cluster_policy() {
        let settings = SnakeJobSettings::default();
        assert_eq!(settings.cpu, 6);
        assert_eq!(settings.memory_mb, 8000);
        assert_eq!(settings.namespace, "default");
        assert_eq!(settings.tolerations.len(), 1);
        assert_eq!(settings.tolerations[0].key, "snakemake");

        let args = settings.cli_args("wf/Snakefile", "run-1", "pipeline-bucket");
        assert!(args.contains(&"--kubernetes".to_string()));
        assert!(args.contains(&"mem_mb=8000".to_string()));
        assert!(args.contains(&"snakemake=issnake:NoSchedule".to_string()));
    }

    #[test]
    fn test_rewrite_inputs_doc() {
        let mut inputs = json!({
            "run_id": "",
            "meta": { "SAMPLE_ID": "" },
            "sample_files": { "stale": "entry" },
            "reference_files": { "genome": "refs/hg38.fa" },
        });
        let records = vec![RecordSlice {
            id: "r1".into(),
            file_name: "in.fastq".into(),
            gs_uri: "gs://pipeline-bucket/t1/a1/in.fastq".into(),
            mapping: "fastq1".into(),
        }];

        let uploads = rewrite_inputs_doc(&mut inputs, "run-1", "s1", &records, "pipeline-bucket");

        assert_eq!(inputs["run_id"], "run-1");
        assert_eq!(inputs["meta"]["SAMPLE_ID"], "s1");
        // Stale entries are dropped and the remote prefix is stripped.
        assert_eq!(inputs["sample_files"], json!({ "fastq1": "t1/a1/in.fastq" }));
        assert_eq!(inputs["reference_files"]["genome"], "run-1/refs/hg38.fa");
        assert_eq!(uploads, vec![("genome".to_string(), "refs/hg38.fa".to_string())]);
    }

    #[test]
    fn test_parse_ls_entry() {
        let line = "   52416  2026-08-01T10:00:00Z  gs://pipeline-bucket/runs/1/results/out.maf";
        assert_eq!(
            parse_ls_entry(line),
            Some((52416, "gs://pipeline-bucket/runs/1/results/out.maf".to_string()))
        );
        assert_eq!(parse_ls_entry("TOTAL: 1 objects, 52416 bytes"), None);
    }
}
