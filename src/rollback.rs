use crate::commit::{now_rfc3339, STATUS_FAILED};
use crate::history;
use log::info;
use rusqlite::{Connection, OptionalExtension};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RollbackError {
    #[error("upload manifest not found")]
    ManifestNotFound,
    #[error("upload has already been rolled back")]
    AlreadyRolledBack,
    #[error("rollback not permitted: {reason}")]
    NotPermitted {
        reason: String,
        conflicts: Vec<String>,
    },
    #[error("rollback confirmation token is invalid or expired")]
    InvalidToken,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl RollbackError {
    pub fn code(&self) -> &'static str {
        match self {
            RollbackError::ManifestNotFound => "manifest_not_found",
            RollbackError::AlreadyRolledBack => "already_rolled_back",
            RollbackError::NotPermitted { .. } => "rollback_not_permitted",
            RollbackError::InvalidToken => "invalid_token",
            RollbackError::Internal(_) => "db_query_failed",
        }
    }
}

impl From<rusqlite::Error> for RollbackError {
    fn from(e: rusqlite::Error) -> Self {
        RollbackError::Internal(e.into())
    }
}

#[derive(Debug, Clone)]
pub struct RollbackChange {
    pub student_id: String,
    /// "restore" for records that existed before the upload, "delete"
    /// for records the upload created.
    pub action: &'static str,
}

struct LedgerEntry {
    student_id: String,
    prior_json: Option<String>,
    prior_version: Option<i64>,
    new_version: i64,
}

fn load_ledger(conn: &Connection, manifest_id: &str) -> Result<Vec<LedgerEntry>, RollbackError> {
    let mut stmt = conn.prepare(
        "SELECT student_id, prior_json, prior_version, new_version
         FROM manifest_records WHERE manifest_id = ? ORDER BY rowid",
    )?;
    let entries = stmt
        .query_map([manifest_id], |r| {
            Ok(LedgerEntry {
                student_id: r.get(0)?,
                prior_json: r.get(1)?,
                prior_version: r.get(2)?,
                new_version: r.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(entries)
}

/// Guard checks shared by the preview and the execution: the manifest
/// must exist, must not be rolled back yet, must have committed
/// something, and every record it touched must still be exactly as this
/// upload left it.
fn validate_rollback(conn: &Connection, manifest_id: &str) -> Result<Vec<LedgerEntry>, RollbackError> {
    let manifest: Option<(String, i64)> = conn
        .query_row(
            "SELECT status, rolled_back FROM upload_manifests WHERE id = ?",
            [manifest_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;
    let Some((status, rolled_back)) = manifest else {
        return Err(RollbackError::ManifestNotFound);
    };
    if rolled_back != 0 {
        return Err(RollbackError::AlreadyRolledBack);
    }
    if status == STATUS_FAILED {
        return Err(RollbackError::NotPermitted {
            reason: "upload committed no rows, there is nothing to reverse".to_string(),
            conflicts: Vec::new(),
        });
    }

    let ledger = load_ledger(conn, manifest_id)?;
    let mut conflicts = Vec::new();
    for entry in &ledger {
        let current_version: Option<i64> = conn
            .query_row(
                "SELECT version FROM students WHERE id = ?",
                [&entry.student_id],
                |r| r.get(0),
            )
            .optional()?;
        if current_version != Some(entry.new_version) {
            conflicts.push(entry.student_id.clone());
        }
    }
    if !conflicts.is_empty() {
        return Err(RollbackError::NotPermitted {
            reason: "records were modified by a later upload".to_string(),
            conflicts,
        });
    }
    Ok(ledger)
}

/// What a rollback would do, without doing it. Drives the confirmation
/// step shown to the operator.
pub fn preview(conn: &Connection, manifest_id: &str) -> Result<Vec<RollbackChange>, RollbackError> {
    let ledger = validate_rollback(conn, manifest_id)?;
    Ok(ledger
        .iter()
        .map(|entry| RollbackChange {
            student_id: entry.student_id.clone(),
            action: if entry.prior_json.is_some() {
                "restore"
            } else {
                "delete"
            },
        })
        .collect())
}

/// Reverse exactly what the upload committed, atomically: every touched
/// record is restored to its prior state (or deleted if the upload
/// created it) and the manifest is marked rolled back, or nothing
/// changes at all.
pub fn execute(conn: &Connection, manifest_id: &str) -> Result<Vec<RollbackChange>, RollbackError> {
    let tx = conn.unchecked_transaction()?;

    // Re-validate inside the transaction; the preview may be stale.
    let ledger = validate_rollback(&tx, manifest_id)?;
    let mut changes = Vec::new();
    for entry in &ledger {
        match &entry.prior_json {
            None => {
                tx.execute("DELETE FROM students WHERE id = ?", [&entry.student_id])?;
                changes.push(RollbackChange {
                    student_id: entry.student_id.clone(),
                    action: "delete",
                });
            }
            Some(prior_json) => {
                let prior: Value = serde_json::from_str(prior_json)
                    .map_err(|e| RollbackError::Internal(e.into()))?;
                tx.execute(
                    "UPDATE students
                     SET name = ?, email = ?, phone = ?, attendance_percent = ?, test_score = ?,
                         fee_status = ?, version = ?, source_upload_id = ?, updated_at = ?
                     WHERE id = ?",
                    (
                        prior["name"].as_str().unwrap_or_default(),
                        prior["email"].as_str(),
                        prior["phone"].as_str(),
                        prior["attendance_percent"].as_f64(),
                        prior["test_score"].as_f64(),
                        prior["fee_status"].as_str(),
                        entry.prior_version,
                        prior["source_upload_id"].as_str(),
                        prior["updated_at"].as_str(),
                        &entry.student_id,
                    ),
                )?;
                changes.push(RollbackChange {
                    student_id: entry.student_id.clone(),
                    action: "restore",
                });
            }
        }
    }

    history::mark_rolled_back(&tx, manifest_id, &now_rfc3339())?;
    tx.commit()?;

    info!("upload {manifest_id} rolled back: {} records reverted", changes.len());
    Ok(changes)
}
