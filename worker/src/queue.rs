// ==============================================================================
// queue.rs - Redis Task Queue Management (Worker Side)
// ==============================================================================
// Description: Task queue operations for consuming tasks from Redis
// Author: Matt Barham
// Created: 2026-05-24
// Modified: 2026-08-03
// Version: 1.0.0
// ==============================================================================

use anyhow::{Context, Result};
use ingestion_core::models::{Account, DataRecord, Trial};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};

use crate::admin::AccountAction;
use crate::storage::UploadRecord;

const QUEUE_KEY: &str = "ingestion:task_queue";

/// Task payload from the Redis queue (must match the API enqueue side).
/// Closed set: an unrecognized task name fails deserialization instead of
/// dispatching to arbitrary code.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "task", content = "args", rename_all = "snake_case")]
pub enum TaskPayload {
    /// Scan for sample groups that satisfy an assay's input set and launch runs.
    ManageWorkflows,

    /// Post-process freshly uploaded records (lab reports, MAFs).
    ProcessUploads { records: Vec<DataRecord> },

    /// Move staged uploads into permanent storage and register them.
    MoveFilesFromStaging {
        upload_record: UploadRecord,
        google_path: String,
    },

    /// Fill in the fields of a newly registered account.
    AddNewUser { account: Account },

    /// Deactivate, delete, or purge a user account.
    ManageAccount {
        email: String,
        method: AccountAction,
    },

    /// Grant a list of users read access to a trial.
    GrantTrialAccess {
        users: Vec<String>,
        admin: String,
        trial: Trial,
    },

    /// Rebuild the gene-symbol collection from the reference table.
    RefreshGeneSymbols,

    /// Pull new auth provider logs into the log store.
    PollAuthLogs,
}

/// Task queue manager
pub struct TaskQueue {
    conn: ConnectionManager,
}

impl TaskQueue {
    /// Create new task queue manager
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    /// Dequeue a task (blocking pop with timeout)
    pub async fn dequeue(&mut self) -> Result<Option<TaskPayload>> {
        // BRPOP with 1 second timeout
        let result: Option<(String, String)> = self
            .conn
            .brpop(QUEUE_KEY, 1.0)
            .await
            .context("Failed to pop from queue")?;

        match result {
            Some((_, payload_json)) => {
                let payload: TaskPayload = serde_json::from_str(&payload_json)
                    .context("Failed to deserialize task payload")?;
                Ok(Some(payload))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_round_trip() {
        let payload = TaskPayload::GrantTrialAccess {
            users: vec!["ada@lab.org".into()],
            admin: "root@lab.org".into(),
            trial: Trial {
                id: "t1".into(),
                etag: None,
                trial_name: "Trial One".into(),
                collaborators: vec![],
            },
        };
        let json = serde_json::to_string(&payload).unwrap();
        assert!(json.contains("\"task\":\"grant_trial_access\""));

        let back: TaskPayload = serde_json::from_str(&json).unwrap();
        assert!(matches!(back, TaskPayload::GrantTrialAccess { users, .. } if users.len() == 1));
    }

    #[test]
    fn test_unit_tasks_serialize_by_name() {
        let json = serde_json::to_string(&TaskPayload::ManageWorkflows).unwrap();
        assert_eq!(json, "{\"task\":\"manage_workflows\"}");

        let back: TaskPayload = serde_json::from_str("{\"task\":\"refresh_gene_symbols\"}").unwrap();
        assert!(matches!(back, TaskPayload::RefreshGeneSymbols));
    }

    #[test]
    fn test_unknown_task_is_rejected() {
        let result: Result<TaskPayload, _> = serde_json::from_str("{\"task\":\"drop_tables\"}");
        assert!(result.is_err());
    }
}
