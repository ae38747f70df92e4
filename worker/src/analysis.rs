// ==============================================================================
// analysis.rs - Readiness Poll and Run Launch
// ==============================================================================
// Description: Finds launchable sample groups and starts pipeline runs
// Author: Matt Barham
// Created: 2026-05-29
// Modified: 2026-08-23
// Version: 1.3.0
// ==============================================================================
// Launching is reserve-then-verify: members are re-fetched, any group with
// an already-processed record is abandoned, and each record is reserved
// with an etag-checked patch. A conflict on any reservation rolls back the
// holds already taken, so no record is ever consumed by two runs and no
// record is left stranded on a failed launch. Rollback stops at engine
// acceptance: once a run is submitted, its records stay reserved even when
// polling or reconciliation later fails, because the engine is still
// consuming the files.
// ==============================================================================

use std::collections::HashMap;
use std::future::Future;

use anyhow::{Context, Result};
use chrono::Utc;
use ingestion_core::manifest::create_input_manifest;
use ingestion_core::matcher::{build_assay_index, find_valid_runs};
use ingestion_core::models::{
    AnalysisRun, AssayDefinition, FileRef, RunStatus, SampleGroup,
};
use serde_json::json;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::cromwell::{self, CromwellClient};
use crate::eve::{EveClient, EveError, RecordStore};
use crate::snakemake;

/// Everything a run needs to go from sample group to finished records.
pub struct RunContext<'a> {
    pub eve: &'a EveClient,
    pub store: &'a dyn RecordStore,
    pub cromwell: &'a CromwellClient,
    pub http: &'a reqwest::Client,
    pub config: &'a Config,
}

/// Which engine executes a workflow, decided by its location.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Engine {
    Cromwell,
    Snakemake,
}

pub fn engine_for(workflow_location: &str) -> Engine {
    if workflow_location.ends_with(".wdl") {
        Engine::Cromwell
    } else {
        Engine::Snakemake
    }
}

/// Fetches pipeline-backed assays and the aggregation of unprocessed data
/// records grouped by (trial, assay, sample). Query failures fail closed.
pub async fn check_for_runs(
    eve: &EveClient,
) -> Result<(Vec<SampleGroup>, HashMap<String, AssayDefinition>)> {
    let assays: Vec<AssayDefinition> = eve
        .get_where("assays", &json!({ "workflow_location": { "$ne": null } }))
        .await
        .map_err(|err| {
            error!(category = "ERROR-EVE-QUERY", "Failed to fetch assays: {err}");
            err
        })?;

    let sought_mappings: Vec<&str> = assays
        .iter()
        .flat_map(|assay| assay.non_static_inputs.iter().map(String::as_str))
        .collect();

    let groups: Vec<SampleGroup> = eve
        .get_aggregate("data/query", &json!({ "$inputs": sought_mappings }))
        .await
        .map_err(|err| {
            error!(
                category = "ERROR-EVE-QUERY",
                "Data aggregation query failed: {err}"
            );
            err
        })?;

    Ok((groups, build_assay_index(assays)))
}

/// Re-fetches the group's members and reserves each one with an
/// etag-checked patch. Returns `None` without launching when any member is
/// already processed or a reservation conflicts; holds taken before the
/// conflict are rolled back.
pub async fn reserve_group(
    store: &dyn RecordStore,
    ids: &[String],
) -> Result<Option<Vec<ingestion_core::models::DataRecord>>, EveError> {
    let records = store.fetch_records(ids).await?;
    if records.len() != ids.len() {
        warn!(
            category = "WARN-ANALYSIS",
            "Group members disappeared before launch; aborting"
        );
        return Ok(None);
    }
    if records.iter().any(|record| record.processed) {
        warn!(
            category = "WARN-ANALYSIS",
            "Group contains an already-reserved record; another launch won the race"
        );
        return Ok(None);
    }

    let mut reserved: Vec<String> = Vec::new();
    for record in &records {
        let (Some(id), Some(etag)) = (&record.id, &record.etag) else {
            warn!(category = "WARN-ANALYSIS", "Record missing id or etag; aborting");
            rollback_reservations(store, &reserved).await;
            return Ok(None);
        };
        match store.set_processed(id, etag, true).await {
            Ok(()) => reserved.push(id.clone()),
            Err(err) => {
                warn!(
                    category = "WARN-ANALYSIS",
                    "Reservation of record {id} failed ({err}); rolling back"
                );
                rollback_reservations(store, &reserved).await;
                return Ok(None);
            }
        }
    }
    Ok(Some(records))
}

/// Releases holds taken during a failed launch, best effort.
pub async fn rollback_reservations(store: &dyn RecordStore, ids: &[String]) {
    if ids.is_empty() {
        return;
    }
    let records = match store.fetch_records(ids).await {
        Ok(records) => records,
        Err(err) => {
            error!(
                category = "ERROR-ANALYSIS",
                "Could not re-fetch records for rollback: {err}"
            );
            return;
        }
    };
    for record in records {
        let (Some(id), Some(etag)) = (&record.id, &record.etag) else {
            continue;
        };
        if record.processed {
            if let Err(err) = store.set_processed(id, etag, false).await {
                error!(
                    category = "ERROR-ANALYSIS",
                    "Rollback of record {id} failed: {err}"
                );
            }
        }
    }
}

/// Creates the In Progress analysis record for a launch.
async fn create_run_record(ctx: &RunContext<'_>, group: &SampleGroup) -> Result<String> {
    let run = AnalysisRun {
        id: None,
        etag: None,
        trial: group.key.trial.clone(),
        assay: group.key.assay.clone(),
        status: RunStatus::InProgress,
        start_date: Utc::now(),
        end_date: None,
        files_used: group
            .records
            .iter()
            .map(|record| FileRef {
                file_name: record.file_name.clone(),
                gs_uri: record.gs_uri.clone(),
            })
            .collect(),
        files_generated: vec![],
        logs: None,
    };
    let response = ctx
        .eve
        .post("analysis", &run)
        .await
        .context("Failed to create analysis record")?;
    response
        .get("_id")
        .and_then(serde_json::Value::as_str)
        .map(str::to_string)
        .context("Analysis record response carried no id")
}

/// Patches an analysis record to its terminal state.
pub async fn finalize_run(
    eve: &EveClient,
    run_id: &str,
    status: RunStatus,
    files_generated: &[FileRef],
    logs: Option<&str>,
) -> Result<()> {
    // Re-fetch for a current etag.
    let run: AnalysisRun = eve.get_item("analysis", run_id).await?;
    let etag = run.etag.as_deref().unwrap_or_default();

    let mut body = json!({
        "status": status.as_str(),
        "end_date": Utc::now(),
        "files_generated": files_generated,
    });
    if let Some(logs) = logs {
        body["logs"] = json!(logs);
    }
    eve.patch("analysis", run_id, etag, &body)
        .await
        .context("Failed to finalize analysis record")?;
    Ok(())
}

/// A run the engine has accepted, carrying what the drive phase needs.
enum LaunchedRun {
    Cromwell { run_id: String, engine_id: String },
    Snakemake { run_id: String, workflow_location: String },
}

/// Runs the launch future and releases the group's holds when it fails.
/// Errors past a successful launch never reach this rollback: the engine is
/// consuming the reserved files, and releasing them would let the next scan
/// start a second run on the same group.
async fn launch_with_rollback<T>(
    store: &dyn RecordStore,
    ids: &[String],
    launch: impl Future<Output = Result<T>>,
) -> Result<T> {
    match launch.await {
        Ok(launched) => Ok(launched),
        Err(err) => {
            error!(
                category = "ERROR-ANALYSIS",
                "Launch failed before engine acceptance; releasing holds: {err:#}"
            );
            rollback_reservations(store, ids).await;
            Err(err)
        }
    }
}

/// Reserves a group's records and drives the run to completion on the
/// engine its workflow lives in.
pub async fn execute_workflow(
    ctx: &RunContext<'_>,
    group: &SampleGroup,
    assay: &AssayDefinition,
) -> Result<()> {
    let ids: Vec<String> = group.records.iter().map(|record| record.id.clone()).collect();
    let Some(_records) = reserve_group(ctx.store, &ids).await? else {
        return Ok(());
    };
    info!(category = "INFO-ANALYSIS", "Setting files to processed");

    let launched =
        launch_with_rollback(ctx.store, &ids, launch_workflow(ctx, group, assay)).await?;
    drive_run(ctx, launched, group).await
}

/// Creates the analysis record and hands the run to its engine. A failure
/// here means the engine never accepted the run.
async fn launch_workflow(
    ctx: &RunContext<'_>,
    group: &SampleGroup,
    assay: &AssayDefinition,
) -> Result<LaunchedRun> {
    let workflow_location = assay
        .workflow_location
        .as_deref()
        .context("Assay has no workflow location")?;

    match engine_for(workflow_location) {
        Engine::Cromwell => {
            let manifest = create_input_manifest(assay, group)?;
            let source = ctx
                .http
                .get(workflow_location)
                .send()
                .await
                .context("Failed to fetch workflow source")?
                .error_for_status()?
                .text()
                .await?;
            let inputs = serde_json::to_string(&manifest)?;
            let run_id = create_run_record(ctx, group).await?;
            let engine_id = ctx.cromwell.submit(&source, &inputs).await?;
            Ok(LaunchedRun::Cromwell { run_id, engine_id })
        }
        Engine::Snakemake => {
            let run_id = create_run_record(ctx, group).await?;
            Ok(LaunchedRun::Snakemake {
                run_id,
                workflow_location: workflow_location.to_string(),
            })
        }
    }
}

/// Drives an accepted run to completion. The group's records stay reserved
/// whatever happens here; failed runs are finalized by the engine modules.
async fn drive_run(ctx: &RunContext<'_>, launched: LaunchedRun, group: &SampleGroup) -> Result<()> {
    match launched {
        LaunchedRun::Cromwell { run_id, engine_id } => {
            cromwell::poll_run(ctx, &run_id, &engine_id, group).await
        }
        LaunchedRun::Snakemake {
            run_id,
            workflow_location,
        } => {
            let work_id = Uuid::new_v4().to_string();
            snakemake::execute(ctx, &run_id, &work_id, &workflow_location, group).await
        }
    }
}

/// Scans for launchable sample groups and runs each one.
pub async fn manage_workflows(ctx: &RunContext<'_>) -> Result<()> {
    let (groups, assay_index) = check_for_runs(ctx.eve).await?;

    let valid_runs = match find_valid_runs(groups, &assay_index) {
        Ok(valid_runs) => valid_runs,
        Err(err) => {
            error!(category = "ERROR-ANALYSIS", "{err}");
            return Ok(());
        }
    };

    if valid_runs.is_empty() {
        return Ok(());
    }
    info!(category = "INFO-ANALYSIS", "Pipeline runs starting");

    for (group, assay) in &valid_runs {
        if let Err(err) = execute_workflow(ctx, group, assay).await {
            error!(
                category = "ERROR-ANALYSIS",
                "Run failed for trial {} assay {}: {err:#}", group.key.trial, group.key.assay
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eve::testing::FakeRecordStore;
    use ingestion_core::models::DataRecord;

    fn record(id: &str) -> DataRecord {
        DataRecord {
            id: Some(id.into()),
            etag: Some("e0".into()),
            trial: "t1".into(),
            assay: "a1".into(),
            file_name: format!("{id}.fastq"),
            gs_uri: format!("gs://bucket/{id}.fastq"),
            mapping: "fastq1".into(),
            ..DataRecord::default()
        }
    }

    #[tokio::test]
    async fn test_second_reservation_sees_processed_and_aborts() {
        let store = FakeRecordStore::with_records(vec![record("r1"), record("r2")]);
        let ids = vec!["r1".to_string(), "r2".to_string()];

        let first = reserve_group(&store, &ids).await.unwrap();
        assert!(first.is_some());
        assert!(store.record("r1").processed);
        assert!(store.record("r2").processed);

        // A second launch observes the holds and backs out without patching.
        let second = reserve_group(&store, &ids).await.unwrap();
        assert!(second.is_none());
        assert!(store.record("r1").processed);
    }

    #[tokio::test]
    async fn test_reservation_conflict_rolls_back_earlier_holds() {
        let store = FakeRecordStore::with_records(vec![record("r1"), record("r2")]);
        store.reserve_conflicts.lock().unwrap().insert("r2".into());
        let ids = vec!["r1".to_string(), "r2".to_string()];

        let outcome = reserve_group(&store, &ids).await.unwrap();
        assert!(outcome.is_none());
        // r1 was reserved then released; r2 never flipped.
        assert!(!store.record("r1").processed);
        assert!(!store.record("r2").processed);
    }

    #[tokio::test]
    async fn test_rollback_scope_ends_at_engine_acceptance() {
        let store = FakeRecordStore::with_records(vec![record("r1"), record("r2")]);
        let ids = vec!["r1".to_string(), "r2".to_string()];

        reserve_group(&store, &ids).await.unwrap().unwrap();
        // The engine never saw the run, so the holds go back.
        let refused: Result<&str> = launch_with_rollback(&store, &ids, async {
            Err(anyhow::anyhow!("engine unreachable"))
        })
        .await;
        assert!(refused.is_err());
        assert!(!store.record("r1").processed);
        assert!(!store.record("r2").processed);

        reserve_group(&store, &ids).await.unwrap().unwrap();
        // An accepted run keeps its records reserved; a later polling
        // failure must not hand them to a second launch.
        let accepted = launch_with_rollback(&store, &ids, async { Ok("engine-1") })
            .await
            .unwrap();
        assert_eq!(accepted, "engine-1");
        assert!(store.record("r1").processed);
        assert!(store.record("r2").processed);
    }

    #[test]
    fn test_engine_dispatch_by_workflow_location() {
        assert_eq!(engine_for("https://example.org/wes/pipeline.wdl"), Engine::Cromwell);
        assert_eq!(engine_for("https://github.com/lab/wes-snakemake"), Engine::Snakemake);
    }
}
