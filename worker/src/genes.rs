// ==============================================================================
// genes.rs - Gene Symbol Maintenance
// ==============================================================================
// Description: Rebuilds and queries the reference gene-symbol collection
// Author: Matt Barham
// Created: 2026-05-28
// Modified: 2026-08-23
// Version: 1.0.1
// ==============================================================================
// The symbol collection is rebuilt from the NCBI gene-info table. Deleting
// any one record triggers an API hook that drops the whole collection, so a
// refresh is one etag-checked delete followed by chunked re-uploads.
// ==============================================================================

use std::collections::BTreeSet;
use std::io::Read;

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use ingestion_core::validation::ValidationError;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info};

use crate::eve::EveClient;

const GENE_INFO_URL: &str =
    "https://ftp.ncbi.nlm.nih.gov/gene/DATA/GENE_INFO/Mammalia/Homo_sapiens.gene_info.gz";

const UPLOAD_CHUNK_SIZE: usize = 10_000;

/// Tab positions of the identifier columns in the gene-info table.
const SYMBOL_COLUMN: usize = 2;
const SYNONYMS_COLUMN: usize = 4;
const AUTHORITY_COLUMN: usize = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneSymbol {
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(rename = "_etag", default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,

    pub symbol: String,
}

/// Extracts the set of valid symbols from the tab-delimited gene-info table:
/// the official symbol, the pipe-delimited synonyms, and the nomenclature
/// authority symbol. `-` marks an absent value.
pub fn build_gene_collection(tsv: &str) -> Vec<String> {
    let mut symbols = BTreeSet::new();
    for line in tsv.lines() {
        if line.starts_with('#') || line.is_empty() {
            continue;
        }
        let values: Vec<&str> = line.split('\t').collect();
        for column in [SYMBOL_COLUMN, SYNONYMS_COLUMN, AUTHORITY_COLUMN] {
            let Some(value) = values.get(column) else {
                continue;
            };
            if column == SYNONYMS_COLUMN && value.contains('|') {
                symbols.extend(value.split('|').map(str::to_string));
            } else if *value != "-" {
                symbols.insert(value.to_string());
            }
        }
    }
    symbols.into_iter().collect()
}

/// Periodic task keeping the symbol collection up to date with the
/// reference table.
pub async fn refresh_gene_symbols(eve: &EveClient, http: &reqwest::Client) -> Result<()> {
    let compressed = http
        .get(GENE_INFO_URL)
        .send()
        .await
        .context("Gene-info download failed")?
        .error_for_status()
        .context("Gene-info server rejected the request")?
        .bytes()
        .await?;

    let tsv = tokio::task::spawn_blocking(move || -> Result<String> {
        let mut text = String::new();
        GzDecoder::new(compressed.as_ref())
            .read_to_string(&mut text)
            .context("Gene-info table is not valid gzip")?;
        Ok(text)
    })
    .await
    .context("Decompression task failed")??;

    let entries = build_gene_collection(&tsv);

    // Any record: deleting it drops the collection via the API hook.
    let existing: Vec<GeneSymbol> = eve.get_all("gene_symbols").await?;
    if let Some(first) = existing.first() {
        let id = first.id.as_deref().unwrap_or_default();
        let etag = first.etag.as_deref().unwrap_or_default();
        eve.delete("gene_symbols", id, etag).await?;
    }

    let mut failed = false;
    for chunk in entries.chunks(UPLOAD_CHUNK_SIZE) {
        let records: Vec<_> = chunk.iter().map(|symbol| json!({ "symbol": symbol })).collect();
        if let Err(err) = eve.post("gene_symbols", &records).await {
            error!(
                category = "ERROR-GENES",
                "Error adding gene symbols to DB: {err}"
            );
            failed = true;
        }
    }

    if !failed {
        info!("Gene symbols updated");
    }
    Ok(())
}

/// Confirms a list of symbols against the collection, returning an error
/// record naming the invalid ones.
pub async fn check_symbols_valid(
    eve: &EveClient,
    symbols: &[String],
) -> Option<ValidationError> {
    let found: Vec<GeneSymbol> = match eve
        .get_where("gene_symbols", &json!({ "symbol": { "$in": symbols } }))
        .await
    {
        Ok(found) => found,
        Err(err) => {
            error!(
                category = "ERROR-GENES",
                "Error looking up gene symbols: {err}"
            );
            return Some(ValidationError::new(
                "Was unable to run gene symbol validation, please contact support",
                vec![],
            ));
        }
    };

    let invalid = invalid_symbols(symbols, &found);
    if invalid.is_empty() {
        return None;
    }
    Some(ValidationError::new(
        format!("Found invalid gene symbols: {}", invalid.join(", ")),
        vec!["ol_assay".into()],
    ))
}

/// Symbols absent from the reference collection. Both sides are compared
/// as sets, since a report can list the same assay name more than once.
pub fn invalid_symbols<'a>(symbols: &'a [String], found: &[GeneSymbol]) -> Vec<&'a str> {
    let matched: BTreeSet<&str> = found.iter().map(|entry| entry.symbol.as_str()).collect();
    symbols
        .iter()
        .map(String::as_str)
        .collect::<BTreeSet<&str>>()
        .into_iter()
        .filter(|symbol| !matched.contains(symbol))
        .collect()
}
