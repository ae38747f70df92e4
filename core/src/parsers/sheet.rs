// ==============================================================================
// sheet.rs - Workbook Cell Grid
// ==============================================================================
// Description: In-memory cell grid over CSV exports of lab report workbooks
// Author: Matt Barham
// Created: 2026-05-22
// Modified: 2026-08-02
// Version: 1.0.0
// ==============================================================================
// Lab reports arrive as CSV exports of a single worksheet. The grid keeps
// every cell addressable by (row, column) so parsers can scan for named
// header cells the way the reports lay them out.
// ==============================================================================

use std::path::Path;

use csv::ReaderBuilder;
use thiserror::Error;

/// Errors that can occur while loading a worksheet export.
#[derive(Error, Debug)]
pub enum SheetError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV parsing error: {0}")]
    Csv(#[from] csv::Error),

    #[error("worksheet is empty")]
    Empty,
}

/// A rectangular cell grid. Rows may be ragged in the export; out-of-range
/// reads simply return `None`, matching how parsers probe for cells.
#[derive(Debug, Clone)]
pub struct Sheet {
    rows: Vec<Vec<String>>,
    n_cols: usize,
}

impl Sheet {
    /// Loads a worksheet from a CSV export.
    pub fn load(path: &Path) -> Result<Self, SheetError> {
        let mut reader = ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_path(path)?;

        let mut rows: Vec<Vec<String>> = Vec::new();
        for record in reader.records() {
            let record = record?;
            rows.push(record.iter().map(|cell| cell.trim().to_string()).collect());
        }
        if rows.is_empty() {
            return Err(SheetError::Empty);
        }

        let n_cols = rows.iter().map(Vec::len).max().unwrap_or(0);
        Ok(Self { rows, n_cols })
    }

    /// Builds a sheet directly from rows, used by tests.
    pub fn from_rows(rows: Vec<Vec<&str>>) -> Self {
        let rows: Vec<Vec<String>> = rows
            .into_iter()
            .map(|row| row.into_iter().map(str::to_string).collect())
            .collect();
        let n_cols = rows.iter().map(Vec::len).max().unwrap_or(0);
        Self { rows, n_cols }
    }

    pub fn n_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn n_cols(&self) -> usize {
        self.n_cols
    }

    /// Cell content at (row, col), `None` when out of range or blank.
    pub fn cell(&self, row: usize, col: usize) -> Option<&str> {
        self.rows
            .get(row)
            .and_then(|r| r.get(col))
            .map(String::as_str)
            .filter(|value| !value.is_empty())
    }

    /// Cell content parsed as a float.
    pub fn cell_f64(&self, row: usize, col: usize) -> Option<f64> {
        self.cell(row, col).and_then(|value| value.parse().ok())
    }

    /// First row at or below `from_row` whose cell in `col` matches `value`
    /// case-insensitively.
    pub fn find_in_column(&self, col: usize, from_row: usize, value: &str) -> Option<usize> {
        (from_row..self.n_rows())
            .find(|&row| self.cell(row, col).is_some_and(|c| c.eq_ignore_ascii_case(value)))
    }

    /// Scans columns left to right for a cell matching `value`, returning
    /// (row, col) of the first hit.
    pub fn find_anywhere(&self, value: &str) -> Option<(usize, usize)> {
        for col in 0..self.n_cols() {
            if let Some(row) = self.find_in_column(col, 0, value) {
                return Some((row, col));
            }
        }
        None
    }

    /// Values of `col` over the inclusive row range.
    pub fn column_values(&self, col: usize, rows: std::ops::RangeInclusive<usize>) -> Vec<Option<String>> {
        rows.map(|row| self.cell(row, col).map(str::to_string)).collect()
    }

    /// True when every cell of the row range `row`, columns
    /// `col..col + width`, is blank.
    pub fn row_is_blank(&self, row: usize, col: usize, width: usize) -> bool {
        (col..col + width).all(|c| self.cell(row, c).is_none())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_and_address_cells() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "NPX data,2.1.0").unwrap();
        writeln!(file, "Panel,Oncology II").unwrap();
        writeln!(file, ",").unwrap();
        file.flush().unwrap();

        let sheet = Sheet::load(file.path()).unwrap();
        assert_eq!(sheet.cell(0, 0), Some("NPX data"));
        assert_eq!(sheet.cell(0, 1), Some("2.1.0"));
        assert_eq!(sheet.cell(2, 0), None);
        assert_eq!(sheet.cell(99, 0), None);
    }

    #[test]
    fn test_find_in_column_is_case_insensitive() {
        let sheet = Sheet::from_rows(vec![vec!["header"], vec!["olinkid"], vec!["LOD"]]);
        assert_eq!(sheet.find_in_column(0, 0, "OlinkID"), Some(1));
        assert_eq!(sheet.find_in_column(0, 2, "OlinkID"), None);
    }

    #[test]
    fn test_find_anywhere_scans_left_to_right() {
        let sheet = Sheet::from_rows(vec![vec!["", "x"], vec!["x", ""]]);
        assert_eq!(sheet.find_anywhere("x"), Some((1, 0)));
    }

    #[test]
    fn test_blank_row_detection() {
        let sheet = Sheet::from_rows(vec![vec!["a", "", "c"], vec!["", "", ""]]);
        assert!(!sheet.row_is_blank(0, 0, 3));
        assert!(sheet.row_is_blank(1, 0, 3));
        assert!(sheet.row_is_blank(0, 1, 1));
    }
}
