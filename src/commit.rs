use crate::validate::{RowResult, RowStatus};
use anyhow::Context;
use chrono::{SecondsFormat, Utc};
use log::{info, warn};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

pub const STATUS_PROCESSING: &str = "processing";
pub const STATUS_SUCCESS: &str = "success";
pub const STATUS_PARTIAL: &str = "partial";
pub const STATUS_FAILED: &str = "failed";

/// Which validated rows a commit admits. Error rows are never admitted.
#[derive(Debug, Clone, Copy)]
pub struct CommitPolicy {
    pub admit_warnings: bool,
    pub abort_on_first_failure: bool,
}

impl Default for CommitPolicy {
    fn default() -> Self {
        CommitPolicy {
            admit_warnings: true,
            abort_on_first_failure: false,
        }
    }
}

/// Cooperative cancellation seam for embedders with their own task
/// runtime. Checked between rows; cancelling never discards rows already
/// persisted, it finalizes them into a partial manifest instead.
pub trait CancelToken {
    fn is_cancelled(&self) -> bool;
}

pub struct NeverCancel;

impl CancelToken for NeverCancel {
    fn is_cancelled(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone)]
pub struct UploadMeta {
    pub file_name: String,
    pub file_size_bytes: u64,
    pub sha256: String,
    pub uploaded_by: String,
}

#[derive(Debug, Clone)]
pub struct CommitSummary {
    pub manifest_id: String,
    pub status: &'static str,
    pub total_rows: usize,
    pub successful_rows: usize,
    pub failed_rows: usize,
    pub cancelled: bool,
}

pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

struct PriorState {
    json: Option<String>,
    version: Option<i64>,
}

/// A numeric field's value for persistence: absent fields keep whatever
/// the registry already holds, blank cells clear it, anything else must
/// parse.
fn numeric_payload(value: Option<&str>, prior: Option<f64>) -> Result<Option<f64>, String> {
    match value {
        None => Ok(prior),
        Some(v) if v.is_empty() => Ok(None),
        Some(v) => v
            .parse::<f64>()
            .map(Some)
            .map_err(|_| format!("not a number: {v}")),
    }
}

fn text_payload(value: Option<&str>, prior: Option<String>) -> Option<String> {
    match value {
        None => prior,
        Some(v) if v.is_empty() => None,
        Some(v) => Some(v.to_string()),
    }
}

/// Persist the admitted rows of one upload and record the manifest, all
/// inside a single transaction. The prior-state read and the write share
/// that transaction, so concurrent commits touching the same student
/// serialize and never lose a snapshot.
pub fn commit_upload(
    conn: &Connection,
    meta: &UploadMeta,
    results: &[RowResult],
    policy: &CommitPolicy,
    cancel: &dyn CancelToken,
) -> anyhow::Result<CommitSummary> {
    let tx = conn.unchecked_transaction()?;
    let manifest_id = Uuid::new_v4().to_string();
    let now = now_rfc3339();

    tx.execute(
        "INSERT INTO upload_manifests(
            id, file_name, file_size_bytes, sha256, uploaded_by, uploaded_at,
            total_rows, successful_rows, failed_rows, status)
         VALUES(?, ?, ?, ?, ?, ?, ?, 0, 0, ?)",
        (
            &manifest_id,
            &meta.file_name,
            meta.file_size_bytes as i64,
            &meta.sha256,
            &meta.uploaded_by,
            &now,
            results.len() as i64,
            STATUS_PROCESSING,
        ),
    )?;

    let mut successful = 0usize;
    let mut cancelled = false;
    let mut aborted = false;

    for row in results {
        let mut admitted = false;
        let mut row_error: Option<String> = None;

        if aborted {
            row_error = Some("skipped after earlier failure".to_string());
        } else if cancelled || cancel.is_cancelled() {
            cancelled = true;
            row_error = Some("upload cancelled".to_string());
        } else {
            let admissible = match row.status {
                RowStatus::Valid => true,
                RowStatus::Warning => policy.admit_warnings,
                RowStatus::Error => false,
            };
            if admissible {
                match persist_row(&tx, &manifest_id, row, &now) {
                    Ok(()) => {
                        admitted = true;
                        successful += 1;
                    }
                    Err(e) => {
                        warn!(
                            "upload {}: row {} failed to persist: {e}",
                            manifest_id, row.source_row
                        );
                        row_error = Some(e);
                        if policy.abort_on_first_failure {
                            aborted = true;
                        }
                    }
                }
            }
        }

        tx.execute(
            "INSERT INTO upload_rows(
                manifest_id, source_row, status, admitted, triggered_rules, error, record_json)
             VALUES(?, ?, ?, ?, ?, ?, ?)",
            (
                &manifest_id,
                row.source_row as i64,
                row.status.as_str(),
                if admitted { 1 } else { 0 },
                serde_json::to_string(&row.triggered)?,
                &row_error,
                serde_json::to_string(&row.record)?,
            ),
        )?;
    }

    let failed = results.len() - successful;
    let status = if successful == 0 {
        STATUS_FAILED
    } else if failed > 0 {
        STATUS_PARTIAL
    } else {
        STATUS_SUCCESS
    };
    tx.execute(
        "UPDATE upload_manifests SET successful_rows = ?, failed_rows = ?, status = ? WHERE id = ?",
        (successful as i64, failed as i64, status, &manifest_id),
    )?;
    tx.commit()?;

    info!(
        "upload {} ({}) committed: {status}, {successful}/{} rows{}",
        manifest_id,
        meta.file_name,
        results.len(),
        if cancelled { ", cancelled" } else { "" }
    );

    Ok(CommitSummary {
        manifest_id,
        status,
        total_rows: results.len(),
        successful_rows: successful,
        failed_rows: failed,
        cancelled,
    })
}

/// Upsert one student and append the manifest ledger entry. Errors are
/// per-row: the caller records them without abandoning the upload.
fn persist_row(
    tx: &Connection,
    manifest_id: &str,
    row: &RowResult,
    now: &str,
) -> Result<(), String> {
    let student_id = row
        .record
        .student_id
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| "missing student id".to_string())?
        .to_string();

    let prior = read_prior(tx, &student_id).map_err(|e| e.to_string())?;
    let prior_fields: Option<serde_json::Value> = prior
        .json
        .as_deref()
        .map(serde_json::from_str)
        .transpose()
        .map_err(|e| e.to_string())?;
    let pf = |key: &str| -> Option<f64> {
        prior_fields.as_ref().and_then(|v| v.get(key)).and_then(|v| v.as_f64())
    };
    let ps = |key: &str| -> Option<String> {
        prior_fields
            .as_ref()
            .and_then(|v| v.get(key))
            .and_then(|v| v.as_str())
            .map(str::to_string)
    };

    let name = text_payload(row.record.name.as_deref(), ps("name"))
        .ok_or_else(|| "missing student name".to_string())?;
    let email = text_payload(row.record.email.as_deref(), ps("email"));
    let phone = text_payload(row.record.phone.as_deref(), ps("phone"));
    let fee_status = text_payload(row.record.fee_status.as_deref(), ps("fee_status"));
    let attendance = numeric_payload(row.record.attendance_percent.as_deref(), pf("attendance_percent"))
        .map_err(|e| format!("attendance_percent: {e}"))?;
    let test_score = numeric_payload(row.record.test_score.as_deref(), pf("test_score"))
        .map_err(|e| format!("test_score: {e}"))?;

    let new_version = prior.version.unwrap_or(0) + 1;
    let write = if prior.version.is_some() {
        tx.execute(
            "UPDATE students
             SET name = ?, email = ?, phone = ?, attendance_percent = ?, test_score = ?,
                 fee_status = ?, version = ?, source_upload_id = ?, updated_at = ?
             WHERE id = ?",
            (
                &name,
                &email,
                &phone,
                attendance,
                test_score,
                &fee_status,
                new_version,
                manifest_id,
                now,
                &student_id,
            ),
        )
    } else {
        tx.execute(
            "INSERT INTO students(
                id, name, email, phone, attendance_percent, test_score, fee_status,
                version, source_upload_id, updated_at)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            (
                &student_id,
                &name,
                &email,
                &phone,
                attendance,
                test_score,
                &fee_status,
                new_version,
                manifest_id,
                now,
            ),
        )
    };
    write.map_err(|e| e.to_string())?;

    // One ledger entry per record per upload. A later duplicate row in
    // the same file keeps the first prior (the true pre-upload state)
    // and advances the final version.
    let already_touched: Option<i64> = tx
        .query_row(
            "SELECT new_version FROM manifest_records WHERE manifest_id = ? AND student_id = ?",
            (&manifest_id, &student_id),
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| e.to_string())?;
    if already_touched.is_some() {
        tx.execute(
            "UPDATE manifest_records SET new_version = ? WHERE manifest_id = ? AND student_id = ?",
            (new_version, &manifest_id, &student_id),
        )
        .map_err(|e| e.to_string())?;
    } else {
        tx.execute(
            "INSERT INTO manifest_records(manifest_id, student_id, prior_json, prior_version, new_version)
             VALUES(?, ?, ?, ?, ?)",
            (&manifest_id, &student_id, &prior.json, prior.version, new_version),
        )
        .map_err(|e| e.to_string())?;
    }
    Ok(())
}

fn read_prior(tx: &Connection, student_id: &str) -> anyhow::Result<PriorState> {
    let found = tx
        .query_row(
            "SELECT name, email, phone, attendance_percent, test_score, fee_status,
                    version, source_upload_id, updated_at
             FROM students WHERE id = ?",
            [student_id],
            |r| {
                Ok(json!({
                    "name": r.get::<_, String>(0)?,
                    "email": r.get::<_, Option<String>>(1)?,
                    "phone": r.get::<_, Option<String>>(2)?,
                    "attendance_percent": r.get::<_, Option<f64>>(3)?,
                    "test_score": r.get::<_, Option<f64>>(4)?,
                    "fee_status": r.get::<_, Option<String>>(5)?,
                    "version": r.get::<_, i64>(6)?,
                    "source_upload_id": r.get::<_, Option<String>>(7)?,
                    "updated_at": r.get::<_, Option<String>>(8)?,
                }))
            },
        )
        .optional()
        .context("reading prior student state")?;
    match found {
        None => Ok(PriorState {
            json: None,
            version: None,
        }),
        Some(v) => {
            let version = v["version"].as_i64();
            Ok(PriorState {
                json: Some(serde_json::to_string(&v)?),
                version,
            })
        }
    }
}
