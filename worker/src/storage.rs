// ==============================================================================
// storage.rs - Cloud Storage Helpers
// ==============================================================================
// Description: gsutil wrappers, object ACL reconciliation, staging moves
// Author: Matt Barham
// Created: 2026-05-26
// Modified: 2026-08-03
// Version: 1.1.0
// ==============================================================================
// All bucket interaction goes through the gsutil CLI. Object ACLs are
// reconciled against the authorized-user list: missing users gain read,
// stale users lose read and write.
// ==============================================================================

use anyhow::{bail, Context, Result};
use chrono::Utc;
use ingestion_core::models::DataRecord;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{error, info, warn};

use crate::admin;
use crate::config::Config;
use crate::eve::EveClient;

/// One staged file inside an ingestion upload record. The staging object is
/// keyed by `uuid_alias`; the wrapped record becomes the permanent document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagedFile {
    pub uuid_alias: String,

    #[serde(flatten)]
    pub record: DataRecord,
}

/// Ingestion collection record listing files to be moved out of staging.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadRecord {
    #[serde(rename = "_id")]
    pub id: String,

    pub files: Vec<StagedFile>,
}

/// Runs a subprocess command and logs the invocation.
pub async fn run_subprocess_with_logs(program: &str, args: &[&str], message: &str) -> Result<()> {
    info!(category = "DEBUG", "{message}");
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .with_context(|| format!("Failed to spawn {program}"))?;

    if !output.status.success() {
        error!(
            category = "ERROR-STORAGE",
            stderr = %String::from_utf8_lossy(&output.stderr),
            "Subprocess failed"
        );
        bail!("{program} exited with {}", output.status);
    }
    Ok(())
}

/// Runs a subprocess and returns its stdout.
pub async fn run_subprocess_capture(program: &str, args: &[&str], message: &str) -> Result<String> {
    info!(category = "DEBUG", "{message}");
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .with_context(|| format!("Failed to spawn {program}"))?;

    if !output.status.success() {
        error!(
            category = "ERROR-STORAGE",
            stderr = %String::from_utf8_lossy(&output.stderr),
            "Subprocess failed"
        );
        bail!("{program} exited with {}", output.status);
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

pub async fn gsutil_cp(from: &str, to: &str, message: &str) -> Result<()> {
    run_subprocess_with_logs("gsutil", &["cp", from, to], message).await
}

pub async fn gsutil_mv(from: &str, to: &str, message: &str) -> Result<()> {
    run_subprocess_with_logs("gsutil", &["mv", from, to], message).await
}

#[derive(Debug, Deserialize)]
struct AclEntry {
    entity: String,
}

/// Extracts user emails from a `gsutil acl get` JSON document. Entries
/// without a `user-` entity (project teams, allUsers) are ignored.
pub fn parse_acl_emails(acl_json: &str) -> Result<Vec<String>> {
    let entries: Vec<AclEntry> =
        serde_json::from_str(acl_json).context("Malformed ACL document")?;
    Ok(entries
        .into_iter()
        .filter_map(|entry| entry.entity.strip_prefix("user-").map(str::to_string))
        .collect())
}

/// Computes the (grant, revoke) sets reconciling an object's current user
/// ACL entries against the authorized list.
pub fn acl_changes(existing: &[String], authorized: &[String]) -> (Vec<String>, Vec<String>) {
    let to_add = authorized
        .iter()
        .filter(|user| !existing.contains(user))
        .cloned()
        .collect();
    let to_revoke = existing
        .iter()
        .filter(|user| !authorized.contains(user))
        .cloned()
        .collect();
    (to_add, to_revoke)
}

/// Reconciles a stored object's ACL against the list of users authorized to
/// see it: grants read to missing users, revokes read and write from users
/// no longer on the list.
pub async fn manage_bucket_acl(gs_uri: &str, authorized_users: &[String]) -> Result<()> {
    if authorized_users.is_empty() {
        warn!(
            category = "WARNING-PERMISSIONS",
            "Manage bucket acl called with empty collaborators list"
        );
        return Ok(());
    }

    let acl_json =
        run_subprocess_capture("gsutil", &["acl", "get", gs_uri], "Fetching object ACL").await?;
    let existing = parse_acl_emails(&acl_json)?;
    let (to_add, to_revoke) = acl_changes(&existing, authorized_users);

    for person in &to_add {
        info!(
            category = "FAIR-PERMISSIONS",
            "Gave read access to {person} for object: {gs_uri}"
        );
        let grant = format!("{person}:R");
        run_subprocess_with_logs(
            "gsutil",
            &["acl", "ch", "-u", &grant, gs_uri],
            "Granting object read access",
        )
        .await?;
    }

    for person in &to_revoke {
        warn!(
            category = "FAIR-PERMISSIONS",
            "Revoking access for {person} for object: {gs_uri}"
        );
        run_subprocess_with_logs(
            "gsutil",
            &["acl", "ch", "-d", person, gs_uri],
            "Revoking object access",
        )
        .await?;
    }

    Ok(())
}

/// Revokes object access for a list of people across a list of objects.
pub async fn revoke_access(gs_uris: &[String], emails: &[String]) -> Result<()> {
    for uri in gs_uris {
        for person in emails {
            run_subprocess_with_logs(
                "gsutil",
                &["acl", "ch", "-d", person, uri],
                "Revoking object access",
            )
            .await?;
        }
    }
    info!(
        category = "FAIR-PERMISSIONS",
        "Access to objects: {}. Revoked for users: {}",
        gs_uris.join(", "),
        emails.join(", ")
    );
    Ok(())
}

/// Grants or revokes upload access on a bucket for a list of users.
pub async fn change_upload_permission(
    bucket_name: &str,
    user_emails: &[String],
    grant: bool,
) -> Result<()> {
    let bucket_uri = format!("gs://{bucket_name}");
    for email in user_emails {
        if grant {
            let grant_arg = format!("{email}:W");
            run_subprocess_with_logs(
                "gsutil",
                &["acl", "ch", "-u", &grant_arg, &bucket_uri],
                "Granting bucket write access",
            )
            .await?;
        } else {
            run_subprocess_with_logs(
                "gsutil",
                &["acl", "ch", "-d", email, &bucket_uri],
                "Revoking bucket access",
            )
            .await?;
        }
    }
    info!(
        category = "FAIR-PERMISSIONS",
        "Access {} to bucket {bucket_name} for users: {}",
        if grant { "granted" } else { "revoked" },
        user_emails.join(", ")
    );
    Ok(())
}

/// Moves staged uploads into permanent storage, reconciles their ACLs, and
/// registers the resulting data records.
pub async fn move_files_from_staging(
    eve: &EveClient,
    config: &Config,
    mut upload_record: UploadRecord,
    google_path: &str,
) -> Result<()> {
    let staging_id = upload_record.id.clone();

    for staged in &mut upload_record.files {
        let record = &mut staged.record;
        record.date_created = Some(Utc::now());
        record.gs_uri = format!(
            "{google_path}{}/{}/{}",
            record.trial, record.assay, staged.uuid_alias
        );

        let old_uri = format!(
            "gs://{}/{}/{}",
            config.google_upload_bucket, staging_id, staged.uuid_alias
        );
        gsutil_mv(&old_uri, &record.gs_uri, "Moving files: ").await?;
        info!(
            category = "FAIR-RECORD",
            "Moved record: {} from {} to {}", record.file_name, old_uri, record.gs_uri
        );

        let authorized_users =
            admin::get_authorized_users(eve, &record.trial, &record.assay).await?;
        manage_bucket_acl(&record.gs_uri, &authorized_users).await?;
    }

    let records: Vec<&DataRecord> = upload_record.files.iter().map(|f| &f.record).collect();
    if let Err(err) = eve.post("data_edit", &records).await {
        error!(
            category = "ERROR-MOVEFILES",
            "Error creating records for uploaded files: {err}"
        );
        return Err(err.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acl_changes_computes_grant_and_revoke_sets() {
        let existing = vec!["ada@lab.org".to_string(), "old@lab.org".to_string()];
        let authorized = vec!["ada@lab.org".to_string(), "bo@clinic.org".to_string()];

        let (to_add, to_revoke) = acl_changes(&existing, &authorized);
        assert_eq!(to_add, vec!["bo@clinic.org"]);
        assert_eq!(to_revoke, vec!["old@lab.org"]);
    }

    #[test]
    fn test_acl_changes_with_no_existing_entries() {
        let (to_add, to_revoke) = acl_changes(&[], &["ada@lab.org".to_string()]);
        assert_eq!(to_add, vec!["ada@lab.org"]);
        assert!(to_revoke.is_empty());
    }

    #[test]
    fn test_parse_acl_emails_ignores_non_user_entities() {
        let acl = r#"[
            {"entity": "user-ada@lab.org", "role": "READER"},
            {"entity": "project-owners-12345", "role": "OWNER"},
            {"entity": "user-bo@clinic.org", "role": "WRITER"}
        ]"#;
        let emails = parse_acl_emails(acl).unwrap();
        assert_eq!(emails, vec!["ada@lab.org", "bo@clinic.org"]);
    }
}
