// ==============================================================================
// validation.rs - Structured Validation Errors
// ==============================================================================
// Description: Severity-coded validation errors attached to parsed records
// Author: Matt Barham
// Created: 2026-05-18
// Modified: 2026-07-11
// Version: 1.0.0
// ==============================================================================

use serde::{Deserialize, Serialize};

/// How severe a validation finding is. CRITICAL findings mean the record is
/// unusable; WARNING findings travel with an otherwise valid record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Critical,
    Warning,
}

/// Whether the issue is with the file object itself or with its content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ErrorSource {
    Raw,
    Parse,
}

/// A single validation finding, uploaded alongside (or instead of) a parsed
/// record so the submitter can see why a file was rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationError {
    /// Long-form explanation of the error
    pub explanation: String,

    /// JSON paths in the record affected by the error
    pub affected_paths: Vec<String>,

    pub raw_or_parse: ErrorSource,

    pub severity: Severity,
}

impl ValidationError {
    /// Parse-level warning, the common case.
    pub fn new(explanation: impl Into<String>, affected_paths: Vec<String>) -> Self {
        Self {
            explanation: explanation.into(),
            affected_paths,
            raw_or_parse: ErrorSource::Parse,
            severity: Severity::Warning,
        }
    }

    /// Parse-level critical finding.
    pub fn critical(explanation: impl Into<String>, affected_paths: Vec<String>) -> Self {
        Self {
            severity: Severity::Critical,
            ..Self::new(explanation, affected_paths)
        }
    }

    /// Finding about the raw file object rather than its content.
    pub fn raw(explanation: impl Into<String>, severity: Severity) -> Self {
        Self {
            explanation: explanation.into(),
            affected_paths: vec![],
            raw_or_parse: ErrorSource::Raw,
            severity,
        }
    }
}

/// Returns the items of `actual` that are not present in `expected`.
pub fn diff_fields(actual: &[String], expected: &[String]) -> Vec<String> {
    actual
        .iter()
        .filter(|item| !expected.contains(item))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diff_fields() {
        let actual: Vec<String> = ["a", "b", "c", "e"].iter().map(|s| s.to_string()).collect();
        let expected: Vec<String> = ["a", "b", "c", "d"].iter().map(|s| s.to_string()).collect();
        assert_eq!(diff_fields(&actual, &expected), vec!["e".to_string()]);
    }

    #[test]
    fn test_diff_fields_no_difference() {
        let fields: Vec<String> = ["x", "y"].iter().map(|s| s.to_string()).collect();
        assert!(diff_fields(&fields, &fields).is_empty());
    }

    #[test]
    fn test_severity_wire_names() {
        let err = ValidationError::critical("bad sheet", vec!["samples".into()]);
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["severity"], "CRITICAL");
        assert_eq!(json["raw_or_parse"], "PARSE");
    }

    #[test]
    fn test_raw_error() {
        let err = ValidationError::raw("not an xlsx export", Severity::Critical);
        assert_eq!(err.raw_or_parse, ErrorSource::Raw);
        assert!(err.affected_paths.is_empty());
    }
}
