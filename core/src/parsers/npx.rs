// ==============================================================================
// npx.rs - Olink NPX Report Parser
// ==============================================================================
// Description: Extracts assay panels and per-sample NPX values from reports
// Author: Matt Barham
// Created: 2026-05-23
// Modified: 2026-08-23
// Version: 1.2.0
// ==============================================================================
// Layout: column A carries a marker block (NPX data / Panel / Assay /
// Uniprot ID / OlinkID) followed by one row per sample, an LOD row, a
// missing-data-frequency row, and a panel-type row. Each assay occupies one
// column; the last two columns are Plate ID and QC Status. Parsing collects
// validation errors instead of failing so partially valid reports still
// yield a record.
// ==============================================================================

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::models::RecordContext;
use crate::parsers::sheet::Sheet;
use crate::validation::{diff_fields, ValidationError};

/// Expected marker block in the first column, top to bottom.
const OLINK_FIRST_COLUMN: [&str; 5] = ["npx data", "panel", "assay", "uniprot id", "olinkid"];

/// NPX value for one sample on one assay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OlinkResult {
    pub sample_id: String,

    /// Measured NPX value, `None` for blank cells
    pub value: Option<f64>,

    /// True when the value fell below the assay's limit of detection
    pub below_lod: bool,
}

/// One assay column of the report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OlinkAssay {
    pub panel: Option<String>,
    pub assay: Option<String>,
    pub uniprot_id: Option<String>,
    pub olink_id: Option<String>,

    /// Limit of detection
    pub lod: Option<f64>,

    pub missing_data_freq: Option<f64>,

    pub results: Vec<OlinkResult>,
}

/// Per-sample QC block from the trailing columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleQc {
    pub sample_id: String,
    pub plate_id: Option<String>,
    pub qc_status: Option<String>,
}

/// Parsed NPX report in upload form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OlinkRecord {
    pub trial: String,
    pub assay: String,
    pub record_id: String,

    /// NPX manager version from the report header
    pub npx_m_ver: Option<String>,

    pub ol_panel_type: Option<String>,

    pub ol_assay: Vec<OlinkAssay>,

    pub samples: Vec<SampleQc>,

    pub validation_errors: Vec<ValidationError>,
}

impl OlinkRecord {
    fn empty(context: &RecordContext) -> Self {
        Self {
            trial: context.trial.clone(),
            assay: context.assay.clone(),
            record_id: context.record.clone(),
            npx_m_ver: None,
            ol_panel_type: None,
            ol_assay: vec![],
            samples: vec![],
            validation_errors: vec![],
        }
    }
}

/// Row landmarks discovered by walking the first column below the marker
/// block.
struct SampleRows {
    first: usize,
    last: usize,
    mdf_row: Option<usize>,
    panel_row: Option<usize>,
    sample_ids: Vec<String>,
}

fn scan_sample_rows(sheet: &Sheet, below: usize) -> Option<SampleRows> {
    let mut sample_rows: Vec<usize> = Vec::new();
    let mut sample_ids: Vec<String> = Vec::new();
    let mut mdf_row = None;
    let mut panel_row = None;

    for row in (below + 1)..sheet.n_rows() {
        match sheet.cell(row, 0) {
            Some("Missing Data freq.") => mdf_row = Some(row),
            Some("Panel") => panel_row = Some(row),
            Some("LOD") | None => {}
            Some(value) => {
                sample_rows.push(row);
                sample_ids.push(value.to_string());
            }
        }
    }

    Some(SampleRows {
        first: *sample_rows.first()?,
        last: *sample_rows.last()?,
        mdf_row,
        panel_row,
        sample_ids,
    })
}

/// Validates the marker block and returns the row of its last entry
/// ("OlinkID"), which anchors every other lookup.
fn locate_marker_block(sheet: &Sheet, errors: &mut Vec<ValidationError>) -> Option<usize> {
    let start = sheet.find_in_column(0, 0, OLINK_FIRST_COLUMN[0])?;
    let end = sheet.find_in_column(0, start, OLINK_FIRST_COLUMN[4])?;

    // Anchor lookups reach three rows above the block's end, so a block
    // spanning fewer than five rows cannot be addressed.
    if end < start + OLINK_FIRST_COLUMN.len() - 1 {
        return None;
    }

    let found: Vec<String> = (start..=end)
        .filter_map(|row| sheet.cell(row, 0).map(|c| c.to_lowercase()))
        .collect();
    let expected: Vec<String> = OLINK_FIRST_COLUMN.iter().map(|s| s.to_string()).collect();
    if found != expected {
        let diff = diff_fields(&found, &expected);
        errors.push(ValidationError::new(
            format!(
                "Values of column did not match expected values. Missing: {}",
                if diff.is_empty() { "None".into() } else { diff.join(", ") }
            ),
            diff,
        ));
    }

    Some(end)
}

fn extract_assay_data(
    sheet: &Sheet,
    olink_row: usize,
    rows: &SampleRows,
    errors: &mut Vec<ValidationError>,
) -> Vec<OlinkAssay> {
    // Trailing two columns are Plate ID / QC Status, not assays.
    let last_assay_col = sheet.n_cols().saturating_sub(2);
    let mut assays = Vec::new();

    for col in 1..last_assay_col {
        let mut assay = OlinkAssay {
            panel: sheet.cell(olink_row - 3, col).map(str::to_string),
            assay: sheet.cell(olink_row - 2, col).map(str::to_string),
            uniprot_id: sheet.cell(olink_row - 1, col).map(str::to_string),
            olink_id: sheet.cell(olink_row, col).map(str::to_string),
            lod: rows.mdf_row.and_then(|mdf| sheet.cell_f64(mdf - 1, col)),
            missing_data_freq: rows.mdf_row.and_then(|mdf| sheet.cell_f64(mdf, col)),
            results: vec![],
        };

        let values: Vec<Option<f64>> = (rows.first..=rows.last)
            .map(|row| sheet.cell_f64(row, col))
            .collect();
        if values.len() != rows.sample_ids.len() {
            errors.push(ValidationError::critical(
                format!(
                    "There is a mismatch between the number of samples and the number of data points for assay {}",
                    assay.assay.as_deref().unwrap_or("unknown")
                ),
                vec!["samples".into()],
            ));
            return vec![];
        }

        for (sample_id, value) in rows.sample_ids.iter().zip(values) {
            let below_lod = match (value, assay.lod) {
                (Some(v), Some(lod)) => v < lod,
                _ => false,
            };
            assay.results.push(OlinkResult {
                sample_id: sample_id.clone(),
                value,
                below_lod,
            });
        }
        assays.push(assay);
    }

    assays
}

fn extract_sample_qc(sheet: &Sheet, rows: &SampleRows) -> Vec<SampleQc> {
    let plate_col = sheet.n_cols().saturating_sub(2);
    let qc_col = sheet.n_cols().saturating_sub(1);

    rows.sample_ids
        .iter()
        .zip(rows.first..=rows.last)
        .map(|(sample_id, row)| SampleQc {
            sample_id: sample_id.clone(),
            plate_id: sheet.cell(row, plate_col).map(str::to_string),
            qc_status: sheet.cell(row, qc_col).map(str::to_string),
        })
        .collect()
}

/// Processes an Olink NPX report and builds an upload record. Validation
/// findings are attached to the record rather than raised.
pub fn process_olink_npx(sheet: &Sheet, context: &RecordContext) -> OlinkRecord {
    let mut record = OlinkRecord::empty(context);
    record.npx_m_ver = sheet.cell(0, 1).map(str::to_string);

    let olink_row = match locate_marker_block(sheet, &mut record.validation_errors) {
        Some(row) => row,
        None => {
            warn!(
                category = "WARNING-IMPORT",
                record = %context.record,
                "NPX report marker block not found"
            );
            record.validation_errors.push(ValidationError::critical(
                "The field names in the first column do not match expected names",
                vec![],
            ));
            return record;
        }
    };

    let rows = match scan_sample_rows(sheet, olink_row) {
        Some(rows) => rows,
        None => {
            record.validation_errors.push(ValidationError::critical(
                "No sample rows were found below the assay block",
                vec!["samples".into()],
            ));
            return record;
        }
    };

    match rows.panel_row {
        Some(panel_row) => record.ol_panel_type = sheet.cell(panel_row, 1).map(str::to_string),
        None => record.validation_errors.push(ValidationError::new(
            "Unable to determine panel type",
            vec!["ol_panel_type".into()],
        )),
    }

    if rows.mdf_row.is_none() {
        record.validation_errors.push(ValidationError::critical(
            "The field names in the first column do not match expected names",
            vec![],
        ));
    }

    record.ol_assay = extract_assay_data(sheet, olink_row, &rows, &mut record.validation_errors);
    record.samples = extract_sample_qc(sheet, &rows);
    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validation::Severity;

    fn npx_sheet() -> Sheet {
        Sheet::from_rows(vec![
            vec!["NPX data", "2.1.0", "", "", ""],
            vec!["Panel", "Onc II", "Onc II", "", ""],
            vec!["Assay", "IL6", "TNF", "", ""],
            vec!["Uniprot ID", "P05231", "P01375", "", ""],
            vec!["OlinkID", "OID00001", "OID00002", "Plate ID", "QC Status"],
            vec!["SAMPLE-1", "7.5", "3.1", "plate-1", "Pass"],
            vec!["SAMPLE-2", "1.0", "", "plate-1", "Warning"],
            vec!["LOD", "2.0", "1.5", "", ""],
            vec!["Missing Data freq.", "0.0", "0.5", "", ""],
            vec!["Panel", "Olink Oncology II", "", "", ""],
        ])
    }

    fn context() -> RecordContext {
        RecordContext::new("t1", "a1", "rec1")
    }

    #[test]
    fn test_parses_assays_and_samples() {
        let record = process_olink_npx(&npx_sheet(), &context());

        assert!(record.validation_errors.is_empty());
        assert_eq!(record.npx_m_ver.as_deref(), Some("2.1.0"));
        assert_eq!(record.ol_panel_type.as_deref(), Some("Olink Oncology II"));
        assert_eq!(record.ol_assay.len(), 2);

        let il6 = &record.ol_assay[0];
        assert_eq!(il6.assay.as_deref(), Some("IL6"));
        assert_eq!(il6.lod, Some(2.0));
        assert_eq!(il6.results.len(), 2);
        assert!(!il6.results[0].below_lod);
        assert!(il6.results[1].below_lod); // 1.0 < LOD 2.0

        assert_eq!(record.samples.len(), 2);
        assert_eq!(record.samples[1].qc_status.as_deref(), Some("Warning"));
    }

    #[test]
    fn test_blank_cell_yields_none_value() {
        let record = process_olink_npx(&npx_sheet(), &context());
        let tnf = &record.ol_assay[1];
        assert_eq!(tnf.results[1].value, None);
        assert!(!tnf.results[1].below_lod);
    }

    #[test]
    fn test_truncated_marker_block_is_critical() {
        // "NPX data" directly followed by "OlinkID": the header rows
        // between them are missing, so assay lookups have no anchor.
        let sheet = Sheet::from_rows(vec![
            vec!["NPX data", "2.1.0"],
            vec!["OlinkID", "OID00001"],
            vec!["SAMPLE-1", "7.5"],
        ]);
        let record = process_olink_npx(&sheet, &context());

        assert!(record.ol_assay.is_empty());
        assert!(record
            .validation_errors
            .iter()
            .any(|e| e.severity == Severity::Critical));
        // Header fields parsed before the block are still kept.
        assert_eq!(record.npx_m_ver.as_deref(), Some("2.1.0"));
    }

    #[test]
    fn test_missing_marker_block_is_critical() {
        let sheet = Sheet::from_rows(vec![vec!["not", "an"], vec!["npx", "file"]]);
        let record = process_olink_npx(&sheet, &context());

        assert!(record.ol_assay.is_empty());
        assert!(record
            .validation_errors
            .iter()
            .any(|e| e.severity == Severity::Critical));
    }

    #[test]
    fn test_sample_count_mismatch_is_critical_but_still_yields_record() {
        // A blank row wedged between sample rows desynchronizes the value
        // range from the sample-id list.
        let sheet = Sheet::from_rows(vec![
            vec!["NPX data", "2.1.0", "", ""],
            vec!["Panel", "Onc II", "", ""],
            vec!["Assay", "IL6", "", ""],
            vec!["Uniprot ID", "P05231", "", ""],
            vec!["OlinkID", "OID00001", "Plate ID", "QC Status"],
            vec!["SAMPLE-1", "7.5", "plate-1", "Pass"],
            vec!["", "4.0", "", ""],
            vec!["SAMPLE-2", "3.1", "plate-1", "Pass"],
            vec!["LOD", "2.0", "", ""],
            vec!["Missing Data freq.", "0.0", "", ""],
            vec!["Panel", "Olink Oncology II", "", ""],
        ]);
        let record = process_olink_npx(&sheet, &context());

        assert!(record.ol_assay.is_empty());
        assert!(record
            .validation_errors
            .iter()
            .any(|e| e.severity == Severity::Critical
                && e.affected_paths == vec!["samples".to_string()]));
        // The record itself survives with its identity fields intact.
        assert_eq!(record.trial, "t1");
        assert_eq!(record.npx_m_ver.as_deref(), Some("2.1.0"));
    }

    #[test]
    fn test_missing_panel_row_is_warning() {
        // Same layout as npx_sheet but without the trailing panel-type row.
        let sheet = Sheet::from_rows(vec![
            vec!["NPX data", "2.1.0", "", ""],
            vec!["Panel", "Onc II", "", ""],
            vec!["Assay", "IL6", "", ""],
            vec!["Uniprot ID", "P05231", "", ""],
            vec!["OlinkID", "OID00001", "Plate ID", "QC Status"],
            vec!["SAMPLE-1", "7.5", "plate-1", "Pass"],
            vec!["LOD", "2.0", "", ""],
            vec!["Missing Data freq.", "0.0", "", ""],
        ]);
        let record = process_olink_npx(&sheet, &context());

        assert_eq!(record.ol_panel_type, None);
        assert!(record
            .validation_errors
            .iter()
            .any(|e| e.severity == Severity::Warning
                && e.affected_paths == vec!["ol_panel_type".to_string()]));
        // Still yields the assay data.
        assert_eq!(record.ol_assay.len(), 1);
    }
}
