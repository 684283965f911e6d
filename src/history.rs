use anyhow::anyhow;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, ToSql};
use serde_json::{json, Value};

pub const DEFAULT_PAGE_SIZE: i64 = 10;
pub const MAX_PAGE_SIZE: i64 = 200;

/// Filters for the upload-history listing. Time bounds are RFC 3339;
/// they are validated and normalized to UTC before being compared.
#[derive(Debug, Default, Clone)]
pub struct ManifestFilter {
    pub status: Option<String>,
    pub uploaded_by: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct Page {
    pub page: i64,
    pub page_size: i64,
}

impl Default for Page {
    fn default() -> Self {
        Page {
            page: 1,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl Page {
    pub fn clamped(self) -> Page {
        Page {
            page: self.page.max(1),
            page_size: self.page_size.clamp(1, MAX_PAGE_SIZE),
        }
    }
}

fn normalize_time_bound(raw: &str) -> anyhow::Result<String> {
    let parsed: DateTime<Utc> = raw
        .parse()
        .map_err(|_| anyhow!("invalid RFC 3339 timestamp: {raw}"))?;
    Ok(parsed.to_rfc3339_opts(SecondsFormat::Secs, true))
}

fn manifest_json(row: &rusqlite::Row<'_>) -> rusqlite::Result<Value> {
    Ok(json!({
        "id": row.get::<_, String>(0)?,
        "fileName": row.get::<_, String>(1)?,
        "fileSizeBytes": row.get::<_, i64>(2)?,
        "sha256": row.get::<_, String>(3)?,
        "uploadedBy": row.get::<_, String>(4)?,
        "uploadedAt": row.get::<_, String>(5)?,
        "totalRows": row.get::<_, i64>(6)?,
        "successfulRows": row.get::<_, i64>(7)?,
        "failedRows": row.get::<_, i64>(8)?,
        "status": row.get::<_, String>(9)?,
        "rolledBack": row.get::<_, i64>(10)? != 0,
        "rolledBackAt": row.get::<_, Option<String>>(11)?,
        "sourcePath": row.get::<_, Option<String>>(12)?,
    }))
}

const MANIFEST_COLUMNS: &str = "id, file_name, file_size_bytes, sha256, uploaded_by, uploaded_at,
     total_rows, successful_rows, failed_rows, status, rolled_back, rolled_back_at, source_path";

pub fn get_manifest(conn: &Connection, id: &str) -> anyhow::Result<Option<Value>> {
    let sql = format!("SELECT {MANIFEST_COLUMNS} FROM upload_manifests WHERE id = ?");
    Ok(conn.query_row(&sql, [id], |r| manifest_json(r)).optional()?)
}

/// Newest-first listing with status/uploader/time-range filters and
/// pagination. Returns the page plus the unpaginated total.
pub fn list_manifests(
    conn: &Connection,
    filter: &ManifestFilter,
    page: Page,
) -> anyhow::Result<(Vec<Value>, i64)> {
    let page = page.clamped();
    let mut clauses: Vec<&'static str> = Vec::new();
    let mut args: Vec<Box<dyn ToSql>> = Vec::new();

    if let Some(status) = &filter.status {
        clauses.push("status = ?");
        args.push(Box::new(status.clone()));
    }
    if let Some(uploader) = &filter.uploaded_by {
        clauses.push("uploaded_by = ?");
        args.push(Box::new(uploader.clone()));
    }
    if let Some(from) = &filter.from {
        clauses.push("uploaded_at >= ?");
        args.push(Box::new(normalize_time_bound(from)?));
    }
    if let Some(to) = &filter.to {
        clauses.push("uploaded_at <= ?");
        args.push(Box::new(normalize_time_bound(to)?));
    }

    let where_clause = if clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", clauses.join(" AND "))
    };

    let count_sql = format!("SELECT COUNT(*) FROM upload_manifests {where_clause}");
    let total: i64 = conn.query_row(
        &count_sql,
        rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
        |r| r.get(0),
    )?;

    let list_sql = format!(
        "SELECT {MANIFEST_COLUMNS} FROM upload_manifests {where_clause}
         ORDER BY uploaded_at DESC, id DESC LIMIT ? OFFSET ?"
    );
    args.push(Box::new(page.page_size));
    args.push(Box::new((page.page - 1) * page.page_size));
    let mut stmt = conn.prepare(&list_sql)?;
    let items = stmt
        .query_map(
            rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
            |r| manifest_json(r),
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok((items, total))
}

/// Per-row outcomes of one upload, in source order, for the review UI.
pub fn list_rows(
    conn: &Connection,
    manifest_id: &str,
    page: Page,
) -> anyhow::Result<(Vec<Value>, i64)> {
    let page = page.clamped();
    let total: i64 = conn.query_row(
        "SELECT COUNT(*) FROM upload_rows WHERE manifest_id = ?",
        [manifest_id],
        |r| r.get(0),
    )?;
    let mut stmt = conn.prepare(
        "SELECT source_row, status, admitted, triggered_rules, error, record_json
         FROM upload_rows WHERE manifest_id = ?
         ORDER BY source_row LIMIT ? OFFSET ?",
    )?;
    let items = stmt
        .query_map(
            (manifest_id, page.page_size, (page.page - 1) * page.page_size),
            |r| {
                let triggered: String = r.get(3)?;
                let record: String = r.get(5)?;
                Ok(json!({
                    "sourceRow": r.get::<_, i64>(0)?,
                    "status": r.get::<_, String>(1)?,
                    "admitted": r.get::<_, i64>(2)? != 0,
                    "triggeredRules": serde_json::from_str::<Value>(&triggered).unwrap_or_else(|_| json!([])),
                    "error": r.get::<_, Option<String>>(4)?,
                    "record": serde_json::from_str::<Value>(&record).unwrap_or(Value::Null),
                }))
            },
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok((items, total))
}

pub fn mark_rolled_back(conn: &Connection, id: &str, at: &str) -> anyhow::Result<()> {
    let changed = conn.execute(
        "UPDATE upload_manifests SET rolled_back = 1, rolled_back_at = ? WHERE id = ?",
        (at, id),
    )?;
    if changed != 1 {
        return Err(anyhow!("manifest {id} not found"));
    }
    Ok(())
}

pub fn set_source_path(conn: &Connection, id: &str, path: &str) -> anyhow::Result<()> {
    conn.execute(
        "UPDATE upload_manifests SET source_path = ? WHERE id = ?",
        (path, id),
    )?;
    Ok(())
}
