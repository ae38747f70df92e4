// ==============================================================================
// models.rs - Ingestion Data Models
// ==============================================================================
// Description: Wire-shaped records for the Eve data API and run bookkeeping
// Author: Matt Barham
// Created: 2026-05-18
// Modified: 2026-08-02
// Version: 1.2.0
// ==============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::validation::ValidationError;

/// Reference to a derived child document on another resource endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildRef {
    #[serde(rename = "_id")]
    pub id: String,
    pub resource: String,
}

/// An uploaded or derived file reference in the data collection.
///
/// Created on upload, patched to `processed = true` when reserved for a
/// pipeline run, otherwise immutable. `id`/`etag` are absent on POST
/// payloads and populated by the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataRecord {
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(rename = "_etag", default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,

    /// Trial the file belongs to
    pub trial: String,

    /// Human-readable trial name, denormalized for display
    #[serde(default)]
    pub trial_name: String,

    /// Assay the file was uploaded for
    pub assay: String,

    pub file_name: String,

    /// Cloud storage URI of the object
    pub gs_uri: String,

    /// Semantic role of the file within the assay's required-input set
    /// (e.g. "fastq1")
    pub mapping: String,

    #[serde(default)]
    pub sample_ids: Vec<String>,

    #[serde(default)]
    pub number_of_samples: u32,

    #[serde(default)]
    pub data_format: String,

    #[serde(default)]
    pub file_size: u64,

    #[serde(default)]
    pub experimental_strategy: String,

    #[serde(default)]
    pub date_created: Option<DateTime<Utc>>,

    /// True once the record has been reserved by a pipeline run
    pub processed: bool,

    #[serde(default = "default_visibility")]
    pub visibility: bool,

    #[serde(default)]
    pub children: Vec<ChildRef>,

    /// Findings attached during upload validation, empty for clean files
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub validation_errors: Vec<ValidationError>,
}

fn default_visibility() -> bool {
    true
}

impl Default for DataRecord {
    fn default() -> Self {
        Self {
            id: None,
            etag: None,
            trial: String::new(),
            trial_name: String::new(),
            assay: String::new(),
            file_name: String::new(),
            gs_uri: String::new(),
            mapping: String::new(),
            sample_ids: vec![],
            number_of_samples: 0,
            data_format: String::new(),
            file_size: 0,
            experimental_strategy: String::new(),
            date_created: None,
            processed: false,
            visibility: true,
            children: vec![],
            validation_errors: vec![],
        }
    }
}

/// Fixed key/value pair merged into every run's input manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StaticInput {
    pub key_name: String,
    pub key_value: String,
}

/// Assay definition owned by the data API.
///
/// `non_static_inputs` is the set of mapping tags that must all be present
/// for a sample group to trigger a run; `workflow_location` is the WDL or
/// Snakefile repository URL, null for assays without a pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssayDefinition {
    #[serde(rename = "_id")]
    pub id: String,

    pub assay_name: String,

    pub non_static_inputs: Vec<String>,

    #[serde(default)]
    pub static_inputs: Vec<StaticInput>,

    #[serde(default)]
    pub workflow_location: Option<String>,
}

/// Grouping key of the data aggregation: one group per (trial, assay,
/// sample) with denormalized trial fields carried along for output records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupKey {
    pub trial: String,

    #[serde(default)]
    pub trial_name: String,

    pub assay: String,

    pub sample_ids: Vec<String>,

    #[serde(default)]
    pub experimental_strategy: String,
}

/// Slim record view returned inside aggregation groups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordSlice {
    #[serde(rename = "_id")]
    pub id: String,
    pub file_name: String,
    pub gs_uri: String,
    pub mapping: String,
}

/// One result of grouping unprocessed data records by (trial, assay,
/// sample). Exists only in memory for the duration of a poll cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleGroup {
    #[serde(rename = "_id")]
    pub key: GroupKey,
    pub records: Vec<RecordSlice>,
}

impl SampleGroup {
    /// Sample id used for prefix resolution and output records.
    pub fn primary_sample_id(&self) -> Option<&str> {
        self.key.sample_ids.first().map(String::as_str)
    }

    /// Mapping tags present in the group, in record order.
    pub fn mapping_tags(&self) -> Vec<&str> {
        self.records.iter().map(|r| r.mapping.as_str()).collect()
    }
}

/// Lifecycle of an analysis run record in the data store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    #[serde(rename = "In Progress")]
    InProgress,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::InProgress => "In Progress",
            RunStatus::Completed => "Completed",
            RunStatus::Failed => "Failed",
        }
    }
}

/// Reference to a file consumed or produced by a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRef {
    pub file_name: String,
    pub gs_uri: String,
}

/// A pipeline run record: created at launch with `InProgress`, patched once
/// at completion, never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisRun {
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(rename = "_etag", default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,

    pub trial: String,
    pub assay: String,
    pub status: RunStatus,

    pub start_date: DateTime<Utc>,

    #[serde(default)]
    pub end_date: Option<DateTime<Utc>>,

    #[serde(default)]
    pub files_used: Vec<FileRef>,

    #[serde(default)]
    pub files_generated: Vec<FileRef>,

    /// Captured engine logs, populated on failure only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logs: Option<String>,
}

/// Status reported by the external workflow engine for a launched run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkflowStatus {
    Submitted,
    Running,
    Succeeded,
    Failed,
    Aborted,
}

impl WorkflowStatus {
    /// True once the engine will not change the status again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowStatus::Succeeded | WorkflowStatus::Failed | WorkflowStatus::Aborted
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Submitted => "Submitted",
            WorkflowStatus::Running => "Running",
            WorkflowStatus::Succeeded => "Succeeded",
            WorkflowStatus::Failed => "Failed",
            WorkflowStatus::Aborted => "Aborted",
        }
    }
}

/// Fields common to every derived record: the trial, assay, and parent
/// record a processed file came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordContext {
    pub trial: String,
    pub assay: String,
    pub record: String,
}

impl RecordContext {
    pub fn new(trial: &str, assay: &str, record: &str) -> Self {
        Self {
            trial: trial.to_string(),
            assay: assay.to_string(),
            record: record.to_string(),
        }
    }
}

/// Trial document, read for collaborator lists and patched on
/// account deactivation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trial {
    #[serde(rename = "_id")]
    pub id: String,

    #[serde(rename = "_etag", default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,

    pub trial_name: String,

    #[serde(default)]
    pub collaborators: Vec<String>,
}

/// A single grant on a user account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Permission {
    #[serde(default)]
    pub trial: Option<String>,

    #[serde(default)]
    pub assay: Option<String>,

    pub role: String,
}

/// User account document in the accounts collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    #[serde(rename = "_id")]
    pub id: String,

    #[serde(rename = "_etag", default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,

    pub email: String,

    #[serde(default)]
    pub role: String,

    #[serde(default)]
    pub permissions: Vec<Permission>,

    #[serde(default)]
    pub last_access: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_status_wire_names() {
        assert_eq!(
            serde_json::to_string(&RunStatus::InProgress).unwrap(),
            "\"In Progress\""
        );
        assert_eq!(
            serde_json::to_string(&RunStatus::Completed).unwrap(),
            "\"Completed\""
        );
        assert_eq!(RunStatus::InProgress.as_str(), "In Progress");
    }

    #[test]
    fn test_workflow_status_terminal() {
        assert!(!WorkflowStatus::Submitted.is_terminal());
        assert!(!WorkflowStatus::Running.is_terminal());
        assert!(WorkflowStatus::Succeeded.is_terminal());
        assert!(WorkflowStatus::Failed.is_terminal());
        assert!(WorkflowStatus::Aborted.is_terminal());
    }

    #[test]
    fn test_data_record_omits_server_fields_on_post() {
        let record = DataRecord {
            id: None,
            etag: None,
            trial: "t1".into(),
            trial_name: "Trial One".into(),
            assay: "a1".into(),
            file_name: "sample.maf".into(),
            gs_uri: "gs://bucket/t1/a1/sample.maf".into(),
            mapping: "maf_file".into(),
            sample_ids: vec!["s1".into()],
            number_of_samples: 1,
            data_format: "maf_file".into(),
            file_size: 1024,
            experimental_strategy: "WES".into(),
            date_created: None,
            processed: false,
            visibility: true,
            children: vec![],
            validation_errors: vec![],
        };
        let json = serde_json::to_value(&record).unwrap();
        assert!(json.get("_id").is_none());
        assert!(json.get("_etag").is_none());
        assert!(json.get("validation_errors").is_none());
        assert_eq!(json["gs_uri"], "gs://bucket/t1/a1/sample.maf");
    }

    #[test]
    fn test_sample_group_accessors() {
        let group = SampleGroup {
            key: GroupKey {
                trial: "t1".into(),
                trial_name: String::new(),
                assay: "a1".into(),
                sample_ids: vec!["s1".into(), "s2".into()],
                experimental_strategy: String::new(),
            },
            records: vec![RecordSlice {
                id: "r1".into(),
                file_name: "f1.fastq".into(),
                gs_uri: "gs://b/f1.fastq".into(),
                mapping: "fastq1".into(),
            }],
        };
        assert_eq!(group.primary_sample_id(), Some("s1"));
        assert_eq!(group.mapping_tags(), vec!["fastq1"]);
    }
}
