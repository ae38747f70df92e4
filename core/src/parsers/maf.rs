// ==============================================================================
// maf.rs - Mutation Annotation Format Handling
// ==============================================================================
// Description: Appends MAF files into a per-trial combined.maf artifact
// Author: Matt Barham
// Created: 2026-05-23
// Modified: 2026-08-02
// Version: 1.0.0
// ==============================================================================
// Each trial/assay pair keeps a single combined.maf. New MAF output is
// appended data-rows-only: leading '#' version comments and the one header
// row are dropped, since the combined file already carries a header.
// ==============================================================================

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use thiserror::Error;

use crate::models::{DataRecord, RecordContext};

pub const COMBINED_FILE_NAME: &str = "combined.maf";

/// Errors that can occur while merging MAF files.
#[derive(Error, Debug)]
pub enum MafError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("MAF file has no data rows")]
    NoData,
}

/// Appends the data rows of the MAF at `path` to the combined file.
/// Leading '#' comment lines and the single header row are skipped.
pub fn combine_mafs(path: &Path, combined_path: &Path) -> Result<usize, MafError> {
    let reader = BufReader::new(File::open(path)?);
    let mut writer = BufWriter::new(OpenOptions::new().append(true).open(combined_path)?);

    let mut header_seen = false;
    let mut appended = 0;
    for line in reader.lines() {
        let line = line?;
        if !header_seen {
            if line.starts_with('#') {
                continue;
            }
            header_seen = true;
            continue;
        }
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
        appended += 1;
    }
    writer.flush()?;

    if !header_seen {
        return Err(MafError::NoData);
    }
    Ok(appended)
}

/// Rewrites a MAF upload record into the combined.maf record for its trial
/// and assay. Server-managed fields are cleared so the result can be posted
/// as a fresh document, and the alias points at the combined object in the
/// same bucket directory.
pub fn reformat_maf(mut record: DataRecord, context: &RecordContext) -> DataRecord {
    let directory = record
        .gs_uri
        .rsplit_once('/')
        .map(|(dir, _)| dir.to_string())
        .unwrap_or_default();

    record.id = None;
    record.etag = None;
    record.date_created = None;
    record.file_name = COMBINED_FILE_NAME.into();
    record.gs_uri = format!("{directory}/{COMBINED_FILE_NAME}");
    record.trial = context.trial.clone();
    record.assay = context.assay.clone();
    record.processed = true;
    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use tempfile::NamedTempFile;

    fn maf_file(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{contents}").unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_combine_skips_comments_and_header() {
        let combined = maf_file("#version 2.4\nHugo_Symbol\tChromosome\nTP53\t17\n");
        let incoming = maf_file("#version 2.4\n#filtered\nHugo_Symbol\tChromosome\nKRAS\t12\nEGFR\t7\n");

        let appended = combine_mafs(incoming.path(), combined.path()).unwrap();
        assert_eq!(appended, 2);

        let merged = std::fs::read_to_string(combined.path()).unwrap();
        assert_eq!(
            merged,
            "#version 2.4\nHugo_Symbol\tChromosome\nTP53\t17\nKRAS\t12\nEGFR\t7\n"
        );
    }

    #[test]
    fn test_combine_rejects_comment_only_file() {
        let combined = maf_file("Hugo_Symbol\n");
        let incoming = maf_file("#version 2.4\n");

        assert!(matches!(
            combine_mafs(incoming.path(), combined.path()),
            Err(MafError::NoData)
        ));
    }

    #[test]
    fn test_reformat_clears_server_fields_and_realiases() {
        let record = DataRecord {
            id: Some("abc123".into()),
            etag: Some("tag".into()),
            date_created: Some(chrono::Utc::now()),
            file_name: "sample_42.maf".into(),
            gs_uri: "gs://lloyd-test-data/t1/a1/sample_42.maf".into(),
            trial: "other".into(),
            assay: "other".into(),
            processed: false,
            ..DataRecord::default()
        };
        let context = RecordContext::new("t1", "a1", "rec1");

        let combined = reformat_maf(record, &context);
        assert!(combined.id.is_none());
        assert!(combined.etag.is_none());
        assert!(combined.date_created.is_none());
        assert_eq!(combined.file_name, "combined.maf");
        assert_eq!(combined.gs_uri, "gs://lloyd-test-data/t1/a1/combined.maf");
        assert_eq!(combined.trial, "t1");
        assert!(combined.processed);
    }
}
