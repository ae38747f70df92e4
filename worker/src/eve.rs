// ==============================================================================
// eve.rs - Data API Client
// ==============================================================================
// Description: Bearer-token JSON client for the Eve-style data API
// Author: Matt Barham
// Created: 2026-05-25
// Modified: 2026-08-03
// Version: 1.1.0
// ==============================================================================
// The API speaks Mongo-style query strings (`where`, `projection`,
// `aggregate` as JSON in the URL) and enforces optimistic concurrency with
// `If-Match` etags on PATCH and DELETE. Status codes are classified so
// callers can react to 412 conflicts and 422 validation rejections.
// ==============================================================================

use std::sync::Arc;

use async_trait::async_trait;
use ingestion_core::models::{AnalysisRun, DataRecord};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::auth::TokenProvider;

/// Errors surfaced by data API calls.
#[derive(Error, Debug)]
pub enum EveError {
    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("failed to obtain access token: {0}")]
    Token(#[source] anyhow::Error),

    #[error("precondition failed (412) on {endpoint}")]
    Conflict { endpoint: String },

    #[error("document rejected by schema validation (422): {body}")]
    Validation { body: String },

    #[error("document not found (404) on {endpoint}")]
    NotFound { endpoint: String },

    #[error("unexpected status {status} from {endpoint}: {body}")]
    Status {
        status: u16,
        endpoint: String,
        body: String,
    },
}

#[derive(Debug, Deserialize)]
struct Items<T> {
    #[serde(rename = "_items")]
    items: Vec<T>,
}

/// Serializes a filter document into the compact JSON form the API expects
/// in `where`/`projection`/`aggregate` parameters.
pub fn query_param(filter: &Value) -> String {
    filter.to_string()
}

pub struct EveClient {
    http: reqwest::Client,
    base_url: String,
    audience: String,
    tokens: Arc<TokenProvider>,
}

impl EveClient {
    pub fn new(
        http: reqwest::Client,
        base_url: &str,
        audience: &str,
        tokens: Arc<TokenProvider>,
    ) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            audience: audience.to_string(),
            tokens,
        }
    }

    async fn bearer(&self) -> Result<String, EveError> {
        self.tokens.token(&self.audience).await.map_err(EveError::Token)
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/{}", self.base_url, endpoint)
    }

    async fn classify(endpoint: &str, response: reqwest::Response) -> EveError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        match status {
            StatusCode::PRECONDITION_FAILED => EveError::Conflict {
                endpoint: endpoint.to_string(),
            },
            StatusCode::UNPROCESSABLE_ENTITY => EveError::Validation { body },
            StatusCode::NOT_FOUND => EveError::NotFound {
                endpoint: endpoint.to_string(),
            },
            _ => EveError::Status {
                status: status.as_u16(),
                endpoint: endpoint.to_string(),
                body,
            },
        }
    }

    async fn get_items<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        params: &[(&str, String)],
    ) -> Result<Vec<T>, EveError> {
        let token = self.bearer().await?;
        let response = self
            .http
            .get(self.url(endpoint))
            .query(params)
            .bearer_auth(token)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::classify(endpoint, response).await);
        }
        Ok(response.json::<Items<T>>().await?.items)
    }

    /// GET with a Mongo-style `where` filter.
    pub async fn get_where<T: DeserializeOwned>(
        &self,
        resource: &str,
        filter: &Value,
    ) -> Result<Vec<T>, EveError> {
        self.get_items(resource, &[("where", query_param(filter))])
            .await
    }

    /// GET with `where` and `projection` filters.
    pub async fn get_projected<T: DeserializeOwned>(
        &self,
        resource: &str,
        filter: &Value,
        projection: &Value,
    ) -> Result<Vec<T>, EveError> {
        self.get_items(
            resource,
            &[
                ("where", query_param(filter)),
                ("projection", query_param(projection)),
            ],
        )
        .await
    }

    /// GET against an aggregation endpoint.
    pub async fn get_aggregate<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        pipeline: &Value,
    ) -> Result<Vec<T>, EveError> {
        self.get_items(endpoint, &[("aggregate", query_param(pipeline))])
            .await
    }

    /// GET every item of a resource.
    pub async fn get_all<T: DeserializeOwned>(&self, resource: &str) -> Result<Vec<T>, EveError> {
        self.get_items(resource, &[]).await
    }

    /// GET a single item by id.
    pub async fn get_item<T: DeserializeOwned>(
        &self,
        resource: &str,
        id: &str,
    ) -> Result<T, EveError> {
        let endpoint = format!("{resource}/{id}");
        let token = self.bearer().await?;
        let response = self
            .http
            .get(self.url(&endpoint))
            .bearer_auth(token)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::classify(&endpoint, response).await);
        }
        Ok(response.json().await?)
    }

    /// POST a document (or list of documents); the API answers 201.
    pub async fn post<B: Serialize + ?Sized>(
        &self,
        resource: &str,
        body: &B,
    ) -> Result<Value, EveError> {
        let token = self.bearer().await?;
        let response = self
            .http
            .post(self.url(resource))
            .bearer_auth(token)
            .json(body)
            .send()
            .await?;

        if response.status() != StatusCode::CREATED {
            return Err(Self::classify(resource, response).await);
        }
        Ok(response.json().await?)
    }

    /// Etag-guarded PATCH of a single item.
    pub async fn patch<B: Serialize + ?Sized>(
        &self,
        resource: &str,
        id: &str,
        etag: &str,
        body: &B,
    ) -> Result<Value, EveError> {
        let endpoint = format!("{resource}/{id}");
        let token = self.bearer().await?;
        let response = self
            .http
            .patch(self.url(&endpoint))
            .bearer_auth(token)
            .header("If-Match", etag)
            .json(body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::classify(&endpoint, response).await);
        }
        Ok(response.json().await?)
    }

    /// Etag-guarded DELETE of a single item.
    pub async fn delete(&self, resource: &str, id: &str, etag: &str) -> Result<(), EveError> {
        let endpoint = format!("{resource}/{id}");
        let token = self.bearer().await?;
        let response = self
            .http
            .delete(self.url(&endpoint))
            .bearer_auth(token)
            .header("If-Match", etag)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::classify(&endpoint, response).await);
        }
        Ok(())
    }
}

/// The compare-and-swap seam the reservation and combined-artifact logic
/// are written against. `EveClient` is the production implementation; tests
/// use an in-memory fake.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Fresh copies of the given data records, etags included.
    async fn fetch_records(&self, ids: &[String]) -> Result<Vec<DataRecord>, EveError>;

    /// Etag-checked flip of a record's `processed` flag.
    async fn set_processed(&self, id: &str, etag: &str, processed: bool)
        -> Result<(), EveError>;

    /// The combined artifact for a (trial, assay), if one exists.
    async fn find_combined_artifact(
        &self,
        trial: &str,
        assay: &str,
    ) -> Result<Option<DataRecord>, EveError>;

    /// Etag-checked partial update of a data record.
    async fn patch_artifact(&self, id: &str, etag: &str, body: &Value) -> Result<(), EveError>;

    /// Inserts a new data record.
    async fn insert_record(&self, record: &DataRecord) -> Result<(), EveError>;

    /// Completed analysis runs for a (trial, assay).
    async fn recent_completed_runs(
        &self,
        trial: &str,
        assay: &str,
    ) -> Result<Vec<AnalysisRun>, EveError>;
}

#[async_trait]
impl RecordStore for EveClient {
    async fn fetch_records(&self, ids: &[String]) -> Result<Vec<DataRecord>, EveError> {
        self.get_where("data", &serde_json::json!({ "_id": { "$in": ids } }))
            .await
    }

    async fn set_processed(
        &self,
        id: &str,
        etag: &str,
        processed: bool,
    ) -> Result<(), EveError> {
        self.patch("data_edit", id, etag, &serde_json::json!({ "processed": processed }))
            .await
            .map(|_| ())
    }

    async fn find_combined_artifact(
        &self,
        trial: &str,
        assay: &str,
    ) -> Result<Option<DataRecord>, EveError> {
        let mut found: Vec<DataRecord> = self
            .get_where(
                "data",
                &serde_json::json!({
                    "trial": trial,
                    "assay": assay,
                    "file_name": "combined.maf",
                }),
            )
            .await?;
        Ok(if found.is_empty() {
            None
        } else {
            Some(found.remove(0))
        })
    }

    async fn patch_artifact(&self, id: &str, etag: &str, body: &Value) -> Result<(), EveError> {
        self.patch("data_edit", id, etag, body).await.map(|_| ())
    }

    async fn insert_record(&self, record: &DataRecord) -> Result<(), EveError> {
        self.post("data_edit", record).await.map(|_| ())
    }

    async fn recent_completed_runs(
        &self,
        trial: &str,
        assay: &str,
    ) -> Result<Vec<AnalysisRun>, EveError> {
        self.get_where(
            "analysis",
            &serde_json::json!({ "trial": trial, "assay": assay, "status": "Completed" }),
        )
        .await
    }
}

#[cfg(test)]
pub mod testing {
    //! In-memory record store for reservation and merge tests.

    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    pub struct FakeRecordStore {
        pub records: Mutex<HashMap<String, DataRecord>>,
        pub runs: Mutex<Vec<AnalysisRun>>,
        /// Number of upcoming `patch_artifact` calls to reject with 412.
        pub patch_conflicts: Mutex<u32>,
        pub patch_calls: Mutex<u32>,
        /// Record ids whose `set_processed` always answers 412.
        pub reserve_conflicts: Mutex<HashSet<String>>,
    }

    impl FakeRecordStore {
        pub fn with_records(records: Vec<DataRecord>) -> Self {
            let map = records
                .into_iter()
                .map(|r| (r.id.clone().expect("fixture record needs an id"), r))
                .collect();
            Self {
                records: Mutex::new(map),
                ..Default::default()
            }
        }

        pub fn record(&self, id: &str) -> DataRecord {
            self.records.lock().unwrap()[id].clone()
        }
    }

    fn bump_etag(etag: &mut Option<String>) {
        let next = format!("{}x", etag.as_deref().unwrap_or(""));
        *etag = Some(next);
    }

    #[async_trait]
    impl RecordStore for FakeRecordStore {
        async fn fetch_records(&self, ids: &[String]) -> Result<Vec<DataRecord>, EveError> {
            let records = self.records.lock().unwrap();
            Ok(ids.iter().filter_map(|id| records.get(id).cloned()).collect())
        }

        async fn set_processed(
            &self,
            id: &str,
            etag: &str,
            processed: bool,
        ) -> Result<(), EveError> {
            if self.reserve_conflicts.lock().unwrap().contains(id) {
                return Err(EveError::Conflict {
                    endpoint: format!("data_edit/{id}"),
                });
            }
            let mut records = self.records.lock().unwrap();
            let record = records.get_mut(id).ok_or_else(|| EveError::NotFound {
                endpoint: format!("data_edit/{id}"),
            })?;
            if record.etag.as_deref() != Some(etag) {
                return Err(EveError::Conflict {
                    endpoint: format!("data_edit/{id}"),
                });
            }
            record.processed = processed;
            bump_etag(&mut record.etag);
            Ok(())
        }

        async fn find_combined_artifact(
            &self,
            trial: &str,
            assay: &str,
        ) -> Result<Option<DataRecord>, EveError> {
            let records = self.records.lock().unwrap();
            Ok(records
                .values()
                .find(|r| r.trial == trial && r.assay == assay && r.file_name == "combined.maf")
                .cloned())
        }

        async fn patch_artifact(
            &self,
            id: &str,
            etag: &str,
            body: &Value,
        ) -> Result<(), EveError> {
            *self.patch_calls.lock().unwrap() += 1;
            {
                let mut conflicts = self.patch_conflicts.lock().unwrap();
                if *conflicts > 0 {
                    *conflicts -= 1;
                    return Err(EveError::Conflict {
                        endpoint: format!("data_edit/{id}"),
                    });
                }
            }
            let mut records = self.records.lock().unwrap();
            let record = records.get_mut(id).ok_or_else(|| EveError::NotFound {
                endpoint: format!("data_edit/{id}"),
            })?;
            if record.etag.as_deref() != Some(etag) {
                return Err(EveError::Conflict {
                    endpoint: format!("data_edit/{id}"),
                });
            }
            if let Some(sample_ids) = body.get("sample_ids").and_then(Value::as_array) {
                record.sample_ids = sample_ids
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect();
            }
            if let Some(n) = body.get("number_of_samples").and_then(Value::as_u64) {
                record.number_of_samples = n as u32;
            }
            bump_etag(&mut record.etag);
            Ok(())
        }

        async fn insert_record(&self, record: &DataRecord) -> Result<(), EveError> {
            let mut stored = record.clone();
            let id = stored
                .id
                .clone()
                .unwrap_or_else(|| format!("generated-{}", self.records.lock().unwrap().len()));
            stored.id = Some(id.clone());
            if stored.etag.is_none() {
                stored.etag = Some("e0".into());
            }
            self.records.lock().unwrap().insert(id, stored);
            Ok(())
        }

        async fn recent_completed_runs(
            &self,
            trial: &str,
            assay: &str,
        ) -> Result<Vec<AnalysisRun>, EveError> {
            Ok(self
                .runs
                .lock()
                .unwrap()
                .iter()
                .filter(|r| r.trial == trial && r.assay == assay)
                .cloned()
                .collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_query_param_is_compact_json() {
        // Maps serialize with sorted keys, so the parameter form is stable.
        let filter = json!({ "trial": "t1", "assay": "a1", "file_name": "combined.maf" });
        assert_eq!(
            query_param(&filter),
            r#"{"assay":"a1","file_name":"combined.maf","trial":"t1"}"#
        );

        let id_set = json!({ "_id": { "$in": ["a", "b"] } });
        assert_eq!(query_param(&id_set), r#"{"_id":{"$in":["a","b"]}}"#);
    }
}
