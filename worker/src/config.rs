// ==============================================================================
// config.rs - Worker Environment Configuration
// ==============================================================================
// Description: Environment-derived settings for the ingestion worker
// Author: Matt Barham
// Created: 2026-05-24
// Modified: 2026-08-03
// Version: 1.0.0
// ==============================================================================
// Outside the cluster the data API and workflow engine run on localhost.
// Inside the cluster (IN_CLOUD set) the data API endpoint comes from the
// deployment-injected service host/port pair.
// ==============================================================================

use anyhow::{Context, Result};

/// Settings shared by every task in the worker.
#[derive(Debug, Clone)]
pub struct Config {
    pub auth0_domain: String,
    pub client_id: String,
    pub client_secret: String,
    pub audience: String,
    pub management_api: String,

    pub eve_url: String,
    pub cromwell_url: String,

    pub google_bucket: String,
    pub google_upload_bucket: String,
    pub pipeline_bucket: String,
    pub logstore: String,

    pub redis_url: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let in_cloud = std::env::var("IN_CLOUD").is_ok();

        let eve_url = if in_cloud {
            format!(
                "http://{}:{}",
                require("INGESTION_API_SERVICE_HOST")?,
                require("INGESTION_API_SERVICE_PORT")?
            )
        } else {
            "http://localhost:5000".to_string()
        };

        // Cromwell runs as a sidecar in both deployments.
        let cromwell_url = "http://localhost:8000/api/workflows/v1".to_string();

        Ok(Self {
            auth0_domain: require("AUTH0_DOMAIN")?,
            client_id: require("CLIENT_ID")?,
            client_secret: require("CLIENT_SECRET")?.trim().to_string(),
            audience: require("AUDIENCE")?,
            management_api: require("MANAGEMENT_API")?,
            eve_url,
            cromwell_url,
            google_bucket: require("GOOGLE_BUCKET_NAME")?,
            google_upload_bucket: require("GOOGLE_UPLOAD_BUCKET")?,
            pipeline_bucket: std::env::var("PIPELINE_BUCKET")
                .unwrap_or_else(|_| "lloyd-test-pipeline".to_string()),
            logstore: require("LOGSTORE")?,
            redis_url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
        })
    }
}

fn require(name: &str) -> Result<String> {
    std::env::var(name).with_context(|| format!("{name} must be set"))
}
