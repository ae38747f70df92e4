// ==============================================================================
// admin.rs - Administrative and User Management Tasks
// ==============================================================================
// Description: Account lifecycle, trial permissions, auth provider log polling
// Author: Matt Barham
// Created: 2026-05-27
// Modified: 2026-08-03
// Version: 1.1.0
// ==============================================================================

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use ingestion_core::models::{Account, Permission, Trial};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::auth::TokenProvider;
use crate::config::Config;
use crate::eve::{EveClient, EveError};
use crate::storage;

/// Account management methods accepted over the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountAction {
    /// Remove all data access but keep the account record.
    Deactivate,
    /// Remove the account record; intended to follow deactivation.
    Delete,
    /// Deactivate and delete together.
    Purge,
}

/// Action the inactivity sweep takes for one account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepAction {
    Deactivate,
    Delete,
}

/// Inactive for over a year: delete. Over ninety days: deactivate.
pub fn sweep_action(last_access: DateTime<Utc>, now: DateTime<Utc>) -> Option<SweepAction> {
    let idle = now - last_access;
    if idle > Duration::days(365) {
        Some(SweepAction::Delete)
    } else if idle > Duration::days(90) {
        Some(SweepAction::Deactivate)
    } else {
        None
    }
}

/// Builds the `$or` filter matching every data record a permission list can
/// reach: whole-trial grants, whole-assay grants, and (trial, assay) pairs.
pub fn permissions_filter(permissions: &[Permission]) -> Value {
    let mut conditions: Vec<Value> = Vec::new();
    for perm in permissions {
        match perm.role.as_str() {
            "trial_r" | "trial_w" => {
                if let Some(trial) = &perm.trial {
                    conditions.push(json!({ "trial": trial }));
                }
            }
            "assay_r" | "assay_w" => {
                if let Some(assay) = &perm.assay {
                    conditions.push(json!({ "assay": assay }));
                }
            }
            _ => {
                conditions.push(json!({ "trial": perm.trial, "assay": perm.assay }));
            }
        }
    }
    json!({ "$or": conditions })
}

/// Trials the user appears on as a collaborator.
async fn get_user_trials(eve: &EveClient, user_email: &str) -> Result<Vec<Trial>, EveError> {
    eve.get_where("trials", &json!({ "collaborators": user_email }))
        .await
}

#[derive(Debug, Deserialize)]
struct RecordUri {
    gs_uri: String,
}

/// URIs of every data object the user's permissions can reach.
async fn get_user_records(eve: &EveClient, permissions: &[Permission]) -> Vec<String> {
    let filter = permissions_filter(permissions);
    let records: Result<Vec<RecordUri>, _> = eve
        .get_projected("data", &filter, &json!({ "gs_uri": 1 }))
        .await;
    match records {
        Ok(records) => records.into_iter().map(|r| r.gs_uri).collect(),
        Err(err) => {
            error!(
                category = "ERROR-ORQUERY",
                "get_user_records failed with error {err}. Query structure = {filter}"
            );
            vec![]
        }
    }
}

/// Empties the permissions list of an account.
async fn clear_permissions(eve: &EveClient, user_id: &str) -> Result<()> {
    let account: Account = match eve.get_item("accounts", user_id).await {
        Ok(account) => account,
        Err(EveError::NotFound { .. }) => {
            warn!(
                category = "WARN-DEACTIVATE",
                "Account {user_id} was not found by the account deactivation function. \
                 This may be because of a purge function."
            );
            return Ok(());
        }
        Err(err) => {
            error!(category = "ERROR-DEACTIVATE", "unspecified error {err}");
            return Ok(());
        }
    };

    let etag = account.etag.as_deref().unwrap_or_default();
    if let Err(err) = eve
        .patch("accounts", user_id, etag, &json!({ "permissions": [] }))
        .await
    {
        error!(
            category = "ERROR-USER-FAIR",
            "Error attempting to clear permissions for user {user_id}: {err}"
        );
    }
    Ok(())
}

/// Removes all data access from the supplied account: collaborator entries,
/// object ACLs, stored permissions, and upload-bucket access.
pub async fn deactivate_account(eve: &EveClient, config: &Config, user: &Account) -> Result<()> {
    let matched_trials = get_user_trials(eve, &user.email).await?;

    let mut trial_names = Vec::new();
    for trial in &matched_trials {
        let new_collaborators: Vec<&String> = trial
            .collaborators
            .iter()
            .filter(|email| *email != &user.email)
            .collect();
        trial_names.push(trial.trial_name.clone());
        let etag = trial.etag.as_deref().unwrap_or_default();
        if let Err(err) = eve
            .patch(
                "trials",
                &trial.id,
                etag,
                &json!({ "collaborators": new_collaborators }),
            )
            .await
        {
            error!(
                category = "ERROR-ACCOUNTS",
                "Error trying to delete {} from collaborators for trial {}: {err}",
                user.email,
                trial.id
            );
        }
    }

    info!(
        category = "FAIR-PERMISSIONS",
        "User: {} removed as a collaborator from the following trials: {}",
        user.email,
        trial_names.join(", ")
    );

    let gs_uri_list = get_user_records(eve, &user.permissions).await;
    storage::revoke_access(&gs_uri_list, std::slice::from_ref(&user.email)).await?;
    clear_permissions(eve, &user.id).await?;
    storage::change_upload_permission(
        &config.google_upload_bucket,
        std::slice::from_ref(&user.email),
        false,
    )
    .await
}

/// Fills in the fields of a newly registered account.
pub async fn add_new_user(eve: &EveClient, new_user: &Account) -> Result<()> {
    let found: Result<Vec<Account>, _> = eve
        .get_where("accounts", &json!({ "email": new_user.email }))
        .await;

    let outcome = async {
        let record = found?
            .into_iter()
            .next()
            .ok_or_else(|| EveError::NotFound {
                endpoint: "accounts".into(),
            })?;
        let etag = record.etag.as_deref().unwrap_or_default();
        eve.patch("accounts", &record.id, etag, new_user).await
    }
    .await;

    match outcome {
        Ok(_) => {
            info!(
                category = "FAIR-NEWUSER",
                "Created a new user: {}", new_user.email
            );
            Ok(())
        }
        Err(err) => {
            error!(
                category = "ERROR-FAIR-NEWUSER",
                "Failed to add new user: {}\nError Message: {err}", new_user.email
            );
            Ok(())
        }
    }
}

/// Deletes a user account from the accounts collection.
pub async fn delete_user_account(eve: &EveClient, user: &Account) -> Result<()> {
    // Re-fetch for a current etag.
    let record: Account = eve.get_item("accounts", &user.id).await?;
    let etag = record.etag.as_deref().unwrap_or_default();
    eve.delete("accounts", &record.id, etag).await?;
    info!(
        category = "FAIR-ACCOUNTS",
        "Deleted user account: {}", user.email
    );
    Ok(())
}

/// Queue entry point for account management.
pub async fn manage_account(
    eve: &EveClient,
    config: &Config,
    email: &str,
    method: AccountAction,
) -> Result<()> {
    let accounts: Vec<Account> = eve
        .get_where("accounts", &json!({ "email": email }))
        .await?;
    let user = accounts
        .into_iter()
        .next()
        .with_context(|| format!("No account found for {email}"))?;

    match method {
        AccountAction::Deactivate => deactivate_account(eve, config, &user).await,
        AccountAction::Delete => delete_user_account(eve, &user).await,
        AccountAction::Purge => {
            deactivate_account(eve, config, &user).await?;
            delete_user_account(eve, &user).await
        }
    }
}

/// Scans the accounts collection for inactive accounts; deactivates after
/// ninety days, deletes after a year.
pub async fn check_last_login(eve: &EveClient, config: &Config) -> Result<()> {
    let users: Vec<Account> = eve.get_all("last_access").await?;
    let now = Utc::now();

    for user in users {
        let Some(last_access) = user.last_access else {
            continue;
        };
        match sweep_action(last_access, now) {
            Some(SweepAction::Deactivate) => deactivate_account(eve, config, &user).await?,
            Some(SweepAction::Delete) => delete_user_account(eve, &user).await?,
            None => {}
        }
    }
    Ok(())
}

/// Adds a list of users as readers on a trial.
pub async fn grant_trial_access(
    eve: &EveClient,
    users: &[String],
    admin: &str,
    trial: &Trial,
) -> Result<()> {
    for user in users {
        let accounts: Vec<Account> = eve
            .get_where("accounts", &json!({ "email": user }))
            .await?;
        let Some(mut account) = accounts.into_iter().next() else {
            warn!(
                category = "WARNING-PERMISSIONS",
                "No account found for {user} while granting trial access"
            );
            continue;
        };

        account.permissions.push(Permission {
            trial: Some(trial.id.clone()),
            assay: None,
            role: "trial_r".to_string(),
        });
        let etag = account.etag.as_deref().unwrap_or_default();
        match eve
            .patch(
                "accounts",
                &account.id,
                etag,
                &json!({ "permissions": account.permissions }),
            )
            .await
        {
            Ok(_) => info!(
                category = "FAIR-PERMISSIONS",
                "Administrator {admin} added permissions for trial {}, to user {user}",
                trial.trial_name
            ),
            Err(err) => error!(
                category = "ERROR-PERMISSIONS",
                "Error: Administrator {admin} failed to update permissions for user {user}: {err}"
            ),
        }
    }
    Ok(())
}

/// Every user whose permissions allow reading records of (trial, assay).
pub async fn get_authorized_users(
    eve: &EveClient,
    trial: &str,
    assay: &str,
) -> Result<Vec<String>, EveError> {
    let query = json!({
        "$or": [
            { "permissions": { "trial": trial, "role": "trial_r" } },
            { "permissions": { "trial": trial, "role": "trial_w" } },
            { "permissions": { "assay": assay, "role": "assay_r" } },
            { "permissions": { "assay": assay, "role": "assay_w" } },
            { "permissions": { "trial": trial, "assay": assay, "role": "read" } },
            { "permissions": { "trial": trial, "assay": assay, "role": "write" } },
        ]
    });
    let accounts: Vec<Account> = eve.get_where("accounts", &query).await?;
    Ok(accounts.into_iter().map(|account| account.email).collect())
}

fn logstore_path(config: &Config) -> String {
    format!("gs://{}/auth0", config.logstore)
}

async fn fetch_last_log_id(config: &Config) -> Result<String> {
    let local: PathBuf = std::env::temp_dir().join(format!("lastid-{}.json", Uuid::new_v4()));
    let local_str = local.to_string_lossy().into_owned();
    storage::gsutil_cp(
        &format!("{}/lastid.json", logstore_path(config)),
        &local_str,
        "Fetching last log id",
    )
    .await?;

    let contents = std::fs::read_to_string(&local).context("Failed to read lastid.json")?;
    std::fs::remove_file(&local).ok();
    let doc: Value = serde_json::from_str(&contents).context("Malformed lastid.json")?;
    doc.get("_id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .context("lastid.json has no _id")
}

async fn update_last_id(config: &Config, last_log: &Value) -> Result<()> {
    let local: PathBuf = std::env::temp_dir().join(format!("lastid-{}.json", Uuid::new_v4()));
    let local_str = local.to_string_lossy().into_owned();
    std::fs::write(&local, serde_json::to_vec(last_log)?)
        .context("Failed to write lastid.json")?;
    let dest = format!("{}/lastid.json", logstore_path(config));
    storage::gsutil_cp(&local_str, &dest, "Updating last log id").await?;
    std::fs::remove_file(&local).ok();
    Ok(())
}

/// Polls the auth provider's management API for new activity logs and
/// copies each entry into the log store bucket.
pub async fn poll_auth0_logs(
    config: &Config,
    tokens: &TokenProvider,
    http: &reqwest::Client,
) -> Result<()> {
    let last_log_id = fetch_last_log_id(config).await?;
    let token = tokens.token(&config.management_api).await?;

    let endpoint = format!("{}logs", config.management_api);
    let response = http
        .get(&endpoint)
        .query(&[("from", last_log_id.as_str()), ("sort", "date:1")])
        .bearer_auth(token)
        .send()
        .await
        .context("Log fetch failed")?;

    if !response.status().is_success() {
        warn!(
            category = "WARNING-LOGGING",
            "Failed to fetch auth0 logs, Status Code: {}",
            response.status()
        );
        return Ok(());
    }

    let logs: Vec<Value> = response.json().await.context("Malformed log response")?;
    let Some(last_log) = logs.last() else {
        return Ok(());
    };
    update_last_id(config, last_log).await?;

    let gs_path = logstore_path(config);
    for log_entry in &logs {
        let name = log_entry
            .get("date")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let local = std::env::temp_dir().join(&name);
        std::fs::write(&local, serde_json::to_vec(log_entry)?)
            .context("Failed to write log entry")?;
        storage::gsutil_cp(
            &local.to_string_lossy(),
            &gs_path,
            "Copying auth log to bucket",
        )
        .await?;
        std::fs::remove_file(&local).ok();
    }

    info!(
        category = "FAIR-LOGGING",
        "Logging operation successful, logs written to: {gs_path}"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sweep_action_thresholds() {
        let now = Utc::now();
        assert_eq!(sweep_action(now - Duration::days(10), now), None);
        assert_eq!(
            sweep_action(now - Duration::days(91), now),
            Some(SweepAction::Deactivate)
        );
        assert_eq!(
            sweep_action(now - Duration::days(366), now),
            Some(SweepAction::Delete)
        );
    }

    #[test]
    fn test_permissions_filter_shapes() {
        let perms = vec![
            Permission {
                trial: Some("t1".into()),
                assay: None,
                role: "trial_r".into(),
            },
            Permission {
                trial: None,
                assay: Some("a1".into()),
                role: "assay_w".into(),
            },
            Permission {
                trial: Some("t2".into()),
                assay: Some("a2".into()),
                role: "read".into(),
            },
        ];
        let filter = permissions_filter(&perms);
        let conditions = filter["$or"].as_array().unwrap();
        assert_eq!(conditions.len(), 3);
        assert_eq!(conditions[0], json!({ "trial": "t1" }));
        assert_eq!(conditions[1], json!({ "assay": "a1" }));
        assert_eq!(conditions[2], json!({ "trial": "t2", "assay": "a2" }));
    }
}
