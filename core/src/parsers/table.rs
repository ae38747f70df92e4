// ==============================================================================
// table.rs - Tab-Delimited Table Processor
// ==============================================================================
// Description: Turns header-led tab-delimited instrument output into records
// Author: Matt Barham
// Created: 2026-05-22
// Modified: 2026-07-30
// Version: 1.0.0
// ==============================================================================
// Format: optional leading '#' comment lines, one header row, then one row
// per record. A row whose value count differs from the header count is a
// hard error.
// ==============================================================================

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use thiserror::Error;
use tracing::error;

use crate::models::RecordContext;

/// Errors that can occur while processing a table file.
#[derive(Error, Debug)]
pub enum TableError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("row {row} has {values} values but the header declares {headers} columns")]
    ColumnCountMismatch {
        row: usize,
        headers: usize,
        values: usize,
    },
}

/// One parsed row: header-keyed values plus the record context fields.
pub type TableRow = BTreeMap<String, String>;

/// Parses a tab-delimited table assuming the first non-comment row is the
/// header. Each subsequent row becomes a record carrying the trial, assay,
/// and parent-record ids from `context`.
pub fn process_table(path: &Path, context: &RecordContext) -> Result<Vec<TableRow>, TableError> {
    let reader = BufReader::with_capacity(8192, File::open(path)?);

    let mut headers: Vec<String> = Vec::new();
    let mut entries = Vec::new();

    for (row, line) in reader.lines().enumerate() {
        let line = line?;
        if headers.is_empty() {
            if line.starts_with('#') {
                continue;
            }
            headers = line
                .split('\t')
                .map(|header| header.trim().replace(['"', '.'], ""))
                .collect();
        } else {
            let values: Vec<&str> = line.split('\t').collect();
            if values.len() != headers.len() {
                error!(
                    category = "ERROR-PROCESSING",
                    row, "header and value length mismatch"
                );
                return Err(TableError::ColumnCountMismatch {
                    row,
                    headers: headers.len(),
                    values: values.len(),
                });
            }

            let mut entry: TableRow = headers
                .iter()
                .zip(values.iter())
                .map(|(header, value)| (header.clone(), value.trim().replace('"', "")))
                .collect();
            entry.insert("trial".into(), context.trial.clone());
            entry.insert("assay".into(), context.assay.clone());
            entry.insert("record_id".into(), context.record.clone());
            entries.push(entry);
        }
    }

    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn context() -> RecordContext {
        RecordContext::new("t1", "a1", "rec1")
    }

    #[test]
    fn test_header_row_keys_records() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "# comment line").unwrap();
        writeln!(file, "Hugo.Symbol\tChromosome\tPosition").unwrap();
        writeln!(file, "TP53\t17\t7674220").unwrap();
        file.flush().unwrap();

        let rows = process_table(file.path(), &context()).unwrap();
        assert_eq!(rows.len(), 1);
        // Dots are stripped from header names.
        assert_eq!(rows[0].get("HugoSymbol"), Some(&"TP53".to_string()));
        assert_eq!(rows[0].get("trial"), Some(&"t1".to_string()));
        assert_eq!(rows[0].get("record_id"), Some(&"rec1".to_string()));
    }

    #[test]
    fn test_column_count_mismatch_is_hard_error() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "a\tb\tc").unwrap();
        writeln!(file, "1\t2").unwrap();
        file.flush().unwrap();

        let result = process_table(file.path(), &context());
        assert!(matches!(
            result,
            Err(TableError::ColumnCountMismatch {
                headers: 3,
                values: 2,
                ..
            })
        ));
    }

    #[test]
    fn test_quotes_stripped_from_values() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "symbol\tsynonym").unwrap();
        writeln!(file, "\"BRCA1\"\tRNF53").unwrap();
        file.flush().unwrap();

        let rows = process_table(file.path(), &context()).unwrap();
        assert_eq!(rows[0].get("symbol"), Some(&"BRCA1".to_string()));
    }
}
