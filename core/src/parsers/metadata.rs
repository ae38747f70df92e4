// ==============================================================================
// metadata.rs - Clinical Shipping Manifest Parser
// ==============================================================================
// Description: Extracts shipment fields and the sample table from manifests
// Author: Matt Barham
// Created: 2026-05-23
// Modified: 2026-08-23
// Version: 1.0.1
// ==============================================================================
// Manifests carry several side-by-side label/value column blocks (manifest
// header, shipper, shipping details, sender, receiver) plus a row-wise
// sample table located by scanning for its header row. Findings are
// reported as validation errors so a partially valid manifest still yields
// a record.
// ==============================================================================

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::models::RecordContext;
use crate::parsers::sheet::Sheet;
use crate::validation::{diff_fields, ValidationError};

/// One label/value column block: (cell label, record field name).
type FieldBlock = &'static [(&'static str, &'static str)];

const MANIFEST_HEADERS: FieldBlock = &[
    ("manifest id:", "manifest_id"),
    ("protocol id:", "protocol_id"),
    ("request:", "request"),
    ("assay priority:", "assay_priority"),
    ("assay type:", "assay_type"),
    ("batch number:", "batch_number"),
];

const SHIPPER_INFO: FieldBlock = &[
    ("courier:", "courier"),
    ("tracking number:", "tracking_number"),
    ("account number:", "account_number"),
];

const SHIPPING_DETAILS: FieldBlock = &[
    ("shipping condition:", "shipping_condition"),
    ("date shipped:", "date_shipped"),
    ("# of samples shipped:", "number_shipped"),
];

const SENDER_ADDRESS: FieldBlock = &[
    ("name:", "sender_name"),
    ("address:", "sender_address"),
    ("email:", "sender_email"),
];

const RECEIVER_ADDRESS: FieldBlock = &[
    ("name:", "receiver_name"),
    ("address:", "receiver_address"),
    ("email:", "receiver_email"),
];

/// (block, 0-based column of the label cells)
const FIELD_BLOCKS: [(FieldBlock, usize); 5] = [
    (MANIFEST_HEADERS, 0),
    (SHIPPER_INFO, 0),
    (SHIPPING_DETAILS, 3),
    (SENDER_ADDRESS, 1),
    (RECEIVER_ADDRESS, 4),
];

/// Sample table headers, in expected order, with record field names.
const SAMPLE_DESCRIPTION: FieldBlock = &[
    ("pathology report", "pathology_report"),
    ("time point", "time_point"),
    ("specimen type", "specimen_type"),
    ("specimen format", "specimen_format"),
    ("collection date", "collection_date"),
    ("processing date", "processing_date"),
    ("quantity", "quantity"),
    ("volume", "volume"),
    ("units", "units"),
    ("sample source", "sample_source"),
    ("comments", "comments"),
];

/// Parsed manifest in upload form. Block fields are flattened onto the
/// record the way the API schema declares them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataRecord {
    pub trial: String,
    pub assay: String,
    pub record_id: String,

    #[serde(flatten)]
    pub fields: BTreeMap<String, Option<String>>,

    pub samples: Vec<BTreeMap<String, Option<String>>>,

    pub validation_errors: Vec<ValidationError>,
}

/// Extracts one label/value column block. The labels live in `col`, their
/// values one column to the right.
fn parse_matched_column(
    sheet: &Sheet,
    block: FieldBlock,
    col: usize,
    fields: &mut BTreeMap<String, Option<String>>,
    errors: &mut Vec<ValidationError>,
) {
    let first_label = block[0].0;
    let last_label = block[block.len() - 1].0;

    let start = sheet.find_in_column(col, 0, first_label);
    let end = start.and_then(|s| sheet.find_in_column(col, s, last_label));

    let (start, end) = match (start, end) {
        (Some(start), Some(end)) => (start, end),
        _ => {
            errors.push(ValidationError::new(
                format!(
                    "Could not find a column matching the provided description. Affected Column: {col}"
                ),
                vec![],
            ));
            return;
        }
    };

    let found: Vec<String> = sheet
        .column_values(col, start..=end)
        .into_iter()
        .map(|v| v.unwrap_or_default().to_lowercase())
        .collect();
    let expected: Vec<String> = block.iter().map(|(label, _)| label.to_string()).collect();
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

    for (offset, (_, field)) in block.iter().enumerate() {
        let value = sheet.cell(start + offset, col + 1).map(str::to_string);
        fields.insert(field.to_string(), value);
    }
}

/// Locates the sample table's header row by scanning for its first header.
fn find_sample_header(sheet: &Sheet) -> Option<(usize, usize)> {
    sheet.find_anywhere(SAMPLE_DESCRIPTION[0].0)
}

fn validate_sample_headers(
    sheet: &Sheet,
    header_row: usize,
    col: usize,
    errors: &mut Vec<ValidationError>,
) {
    let found: Vec<String> = (col..col + SAMPLE_DESCRIPTION.len())
        .map(|c| {
            sheet
                .cell(header_row, c)
                .map(|v| v.to_lowercase())
                .unwrap_or_default()
        })
        .collect();
    let expected: Vec<String> = SAMPLE_DESCRIPTION
        .iter()
        .map(|(label, _)| label.to_string())
        .collect();

    if found != expected {
        let diff = diff_fields(&found, &expected);
        errors.push(ValidationError::new(
            format!(
                "Field names for row did not match expected. Missing values: {}",
                if diff.is_empty() { "None".into() } else { diff.join(", ") }
            ),
            vec![],
        ));
    }
}

/// Reads sample rows below the header until the first blank row.
fn extract_sample_rows(
    sheet: &Sheet,
    header_row: usize,
    col: usize,
) -> Vec<BTreeMap<String, Option<String>>> {
    let width = SAMPLE_DESCRIPTION.len();
    let mut samples = Vec::new();

    for row in (header_row + 1)..sheet.n_rows() {
        if sheet.row_is_blank(row, col, width) {
            break;
        }
        let sample: BTreeMap<String, Option<String>> = SAMPLE_DESCRIPTION
            .iter()
            .enumerate()
            .map(|(offset, (_, field))| {
                (
                    field.to_string(),
                    sheet.cell(row, col + offset).map(str::to_string),
                )
            })
            .collect();
        samples.push(sample);
    }

    samples
}

/// Processes a clinical shipping manifest export into an upload record.
pub fn process_clinical_metadata(sheet: &Sheet, context: &RecordContext) -> MetadataRecord {
    let mut record = MetadataRecord {
        trial: context.trial.clone(),
        assay: context.assay.clone(),
        record_id: context.record.clone(),
        fields: BTreeMap::new(),
        samples: vec![],
        validation_errors: vec![],
    };

    for (block, col) in FIELD_BLOCKS {
        parse_matched_column(
            sheet,
            block,
            col,
            &mut record.fields,
            &mut record.validation_errors,
        );
    }

    match find_sample_header(sheet) {
        Some((header_row, col)) => {
            validate_sample_headers(sheet, header_row, col, &mut record.validation_errors);
            record.samples = extract_sample_rows(sheet, header_row, col);
        }
        None => record.validation_errors.push(ValidationError::new(
            "Unable to locate the sample description table",
            vec!["samples".into()],
        )),
    }

    record
}
