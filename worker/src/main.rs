// ==============================================================================
// main.rs - Ingestion Worker Process
// ==============================================================================
// Description: Background worker consuming ingestion tasks from Redis
// Author: Matt Barham
// Created: 2026-05-24
// Modified: 2026-08-04
// Version: 1.2.0
// ==============================================================================
// One process per deployment replica. Queued tasks are dispatched into
// their own tokio task so a slow pipeline run never blocks the queue;
// periodic maintenance (readiness scans, account sweeps, reference-table
// refreshes, auth-log polling) runs on spawned interval loops.
// ==============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use redis::aio::ConnectionManager;
use redis::Client as RedisClient;
use tracing::{error, info, Level};

mod admin;
mod analysis;
mod auth;
mod config;
mod cromwell;
mod eve;
mod genes;
mod processing;
mod queue;
mod snakemake;
mod storage;

use auth::TokenProvider;
use config::Config;
use cromwell::CromwellClient;
use eve::EveClient;
use queue::{TaskPayload, TaskQueue};

const WORKFLOW_SCAN_INTERVAL: Duration = Duration::from_secs(300);
const ACCOUNT_SWEEP_INTERVAL: Duration = Duration::from_secs(86_400);
const GENE_REFRESH_INTERVAL: Duration = Duration::from_secs(604_800);
const AUTH_LOG_INTERVAL: Duration = Duration::from_secs(3_600);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .with_target(false)
        .compact()
        .init();

    info!("Starting Ingestion Worker v1.2.0");

    // Load environment variables
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    let redis_client =
        RedisClient::open(config.redis_url.clone()).context("Failed to create Redis client")?;
    let redis_conn = ConnectionManager::new(redis_client)
        .await
        .context("Failed to create Redis connection manager")?;

    info!("Connected to Redis");

    let http = reqwest::Client::new();
    let tokens = Arc::new(TokenProvider::new(
        http.clone(),
        &config.auth0_domain,
        &config.client_id,
        &config.client_secret,
    ));
    let eve = Arc::new(EveClient::new(
        http.clone(),
        &config.eve_url,
        &config.audience,
        tokens.clone(),
    ));
    let cromwell = Arc::new(CromwellClient::new(http.clone(), &config.cromwell_url));

    let worker = Worker {
        config: Arc::new(config),
        redis_conn,
        http,
        tokens,
        eve,
        cromwell,
    };

    // Periodic maintenance loops
    tokio::spawn(worker.clone().workflow_scan_loop());
    tokio::spawn(worker.clone().account_sweep_loop());
    tokio::spawn(worker.clone().gene_refresh_loop());
    tokio::spawn(worker.clone().auth_log_loop());

    info!("Worker ready, waiting for tasks...");
    worker.run().await
}

/// Main worker struct
#[derive(Clone)]
struct Worker {
    config: Arc<Config>,
    redis_conn: ConnectionManager,
    http: reqwest::Client,
    tokens: Arc<TokenProvider>,
    eve: Arc<EveClient>,
    cromwell: Arc<CromwellClient>,
}

impl Worker {
    fn run_context(&self) -> analysis::RunContext<'_> {
        analysis::RunContext {
            eve: &self.eve,
            store: self.eve.as_ref(),
            cromwell: &self.cromwell,
            http: &self.http,
            config: &self.config,
        }
    }

    /// Main processing loop polling the Redis queue for tasks.
    async fn run(&self) -> Result<()> {
        let mut task_queue = TaskQueue::new(self.redis_conn.clone());

        loop {
            match task_queue.dequeue().await {
                Ok(Some(payload)) => {
                    // Process in the background so the queue keeps draining.
                    let worker = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = worker.process_task(payload).await {
                            error!("Task processing failed: {e:#}");
                        }
                    });
                }
                Ok(None) => {
                    // Queue is empty, BRPOP already waited its timeout.
                }
                Err(e) => {
                    error!("Failed to dequeue task: {e}");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
            }
        }
    }

    /// Dispatch a single queued task.
    async fn process_task(&self, payload: TaskPayload) -> Result<()> {
        match payload {
            TaskPayload::ManageWorkflows => analysis::manage_workflows(&self.run_context()).await,
            TaskPayload::ProcessUploads { records } => {
                processing::process_uploads(&self.eve, self.eve.as_ref(), records).await
            }
            TaskPayload::MoveFilesFromStaging {
                upload_record,
                google_path,
            } => {
                storage::move_files_from_staging(&self.eve, &self.config, upload_record, &google_path)
                    .await
            }
            TaskPayload::AddNewUser { account } => admin::add_new_user(&self.eve, &account).await,
            TaskPayload::ManageAccount { email, method } => {
                admin::manage_account(&self.eve, &self.config, &email, method).await
            }
            TaskPayload::GrantTrialAccess {
                users,
                admin,
                trial,
            } => admin::grant_trial_access(&self.eve, &users, &admin, &trial).await,
            TaskPayload::RefreshGeneSymbols => {
                genes::refresh_gene_symbols(&self.eve, &self.http).await
            }
            TaskPayload::PollAuthLogs => {
                admin::poll_auth0_logs(&self.config, &self.tokens, &self.http).await
            }
        }
    }

    /// Scans for launchable sample groups on a fixed interval.
    async fn workflow_scan_loop(self) {
        loop {
            tokio::time::sleep(WORKFLOW_SCAN_INTERVAL).await;
            if let Err(e) = analysis::manage_workflows(&self.run_context()).await {
                error!("Workflow scan failed: {e:#}");
            }
        }
    }

    /// Daily sweep of stale accounts.
    async fn account_sweep_loop(self) {
        loop {
            tokio::time::sleep(ACCOUNT_SWEEP_INTERVAL).await;
            if let Err(e) = admin::check_last_login(&self.eve, &self.config).await {
                error!("Account sweep failed: {e:#}");
            }
        }
    }

    /// Weekly rebuild of the gene-symbol collection.
    async fn gene_refresh_loop(self) {
        loop {
            tokio::time::sleep(GENE_REFRESH_INTERVAL).await;
            if let Err(e) = genes::refresh_gene_symbols(&self.eve, &self.http).await {
                error!("Gene symbol refresh failed: {e:#}");
            }
        }
    }

    /// Hourly pull of auth provider activity logs.
    async fn auth_log_loop(self) {
        loop {
            tokio::time::sleep(AUTH_LOG_INTERVAL).await;
            if let Err(e) = admin::poll_auth0_logs(&self.config, &self.tokens, &self.http).await {
                error!("Auth log polling failed: {e:#}");
            }
        }
    }
}
