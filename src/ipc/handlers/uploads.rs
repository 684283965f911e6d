use crate::commit::{commit_upload, CommitPolicy, NeverCancel, UploadMeta};
use crate::db;
use crate::decode::{self, DecodeLimits, DecodedFile};
use crate::history;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{get_opt_bool, get_opt_str, get_required_str, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::mapping::{ColumnMapping, Field};
use crate::validate::{evaluate_row, RowResult, RowStatus};
use log::{info, warn};
use rusqlite::Connection;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::path::Path;

const PREVIEW_ROW_LIMIT: usize = 10;

/// Everything the decode, mapping and validation phases produce, before
/// any commit decision is made. Preview stops here; commit carries on.
struct FrontPipeline {
    file_name: String,
    file_size_bytes: u64,
    sha256: String,
    decoded: DecodedFile,
    mapping: ColumnMapping,
    results: Vec<RowResult>,
}

fn decode_limits(conn: &Connection) -> DecodeLimits {
    let mut limits = DecodeLimits::default();
    if let Ok(Some(section)) = db::settings_get_json(conn, "setup.uploads") {
        if let Some(n) = section.get("maxFileSizeBytes").and_then(|v| v.as_u64()) {
            limits.max_file_size_bytes = n;
        }
        if let Some(n) = section.get("maxRows").and_then(|v| v.as_u64()) {
            limits.max_rows = n as usize;
        }
    }
    limits
}

/// The caller-confirmed column mapping: an object from original header
/// text to a canonical field key or the "ignore" sentinel.
fn parse_explicit_mapping(
    headers: &[String],
    raw: Option<&Map<String, Value>>,
) -> Result<Vec<(usize, Option<Field>)>, HandlerErr> {
    let Some(raw) = raw else {
        return Ok(Vec::new());
    };
    let mut explicit = Vec::new();
    for (header, target) in raw {
        let Some(col) = headers.iter().position(|h| h == header) else {
            return Err(HandlerErr::bad_params(format!(
                "mapping references unknown column: {header}"
            )));
        };
        let Some(target) = target.as_str() else {
            return Err(HandlerErr::bad_params(format!(
                "mapping for {header} must be a string"
            )));
        };
        if target == "ignore" {
            explicit.push((col, None));
            continue;
        }
        let Some(field) = Field::parse(target) else {
            return Err(HandlerErr::bad_params(format!(
                "unknown canonical field: {target}"
            )));
        };
        explicit.push((col, Some(field)));
    }
    Ok(explicit)
}

fn run_front_pipeline(conn: &Connection, params: &Value) -> Result<FrontPipeline, HandlerErr> {
    let path = get_required_str(params, "path")?;
    let file_name = get_opt_str(params, "fileName").unwrap_or_else(|| {
        Path::new(&path)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.clone())
    });

    let bytes = std::fs::read(&path).map_err(|e| HandlerErr {
        code: "read_failed",
        message: e.to_string(),
        details: Some(json!({ "path": path })),
    })?;
    let sha256 = format!("{:x}", Sha256::digest(&bytes));

    let limits = decode_limits(conn);
    let decoded = decode::decode(&file_name, &bytes, &limits).map_err(|e| HandlerErr {
        code: e.code(),
        message: e.to_string(),
        details: None,
    })?;

    let explicit = parse_explicit_mapping(
        &decoded.headers,
        params.get("mapping").and_then(|v| v.as_object()),
    )?;
    let required = db::required_fields(conn).map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    })?;
    let mapping = ColumnMapping::build(&decoded.headers, &explicit, &required).map_err(|e| HandlerErr {
        code: e.code(),
        message: e.to_string(),
        details: None,
    })?;

    let rules = db::load_active_rules(conn).map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    })?;
    let results = decoded
        .rows
        .iter()
        .map(|row| evaluate_row(row.source_row, mapping.apply(row), &rules))
        .collect();

    Ok(FrontPipeline {
        file_name,
        file_size_bytes: bytes.len() as u64,
        sha256,
        decoded,
        mapping,
        results,
    })
}

fn mapping_json(pipeline: &FrontPipeline) -> (Value, Vec<String>) {
    let mut mapped = Map::new();
    for (col, field) in pipeline.mapping.mapped_fields() {
        mapped.insert(
            pipeline.decoded.headers[col].clone(),
            Value::String(field.key().to_string()),
        );
    }
    let unmapped = pipeline
        .mapping
        .unmapped_columns(pipeline.decoded.headers.len())
        .into_iter()
        .map(|col| pipeline.decoded.headers[col].clone())
        .collect();
    (Value::Object(mapped), unmapped)
}

fn status_counts(results: &[RowResult]) -> (usize, usize, usize) {
    let mut valid = 0;
    let mut warning = 0;
    let mut error = 0;
    for r in results {
        match r.status {
            RowStatus::Valid => valid += 1,
            RowStatus::Warning => warning += 1,
            RowStatus::Error => error += 1,
        }
    }
    (valid, warning, error)
}

fn row_json(result: &RowResult) -> Value {
    json!({
        "sourceRow": result.source_row,
        "status": result.status.as_str(),
        "triggeredRules": result.triggered,
        "record": result.record,
    })
}

fn handle_upload_preview(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let pipeline = match run_front_pipeline(conn, &req.params) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let (mapping, unmapped) = mapping_json(&pipeline);
    let (valid, warning, error) = status_counts(&pipeline.results);
    let preview_limit = req
        .params
        .get("previewRows")
        .and_then(|v| v.as_u64())
        .map(|n| n as usize)
        .unwrap_or(PREVIEW_ROW_LIMIT);
    let rows: Vec<Value> = pipeline
        .results
        .iter()
        .take(preview_limit)
        .map(row_json)
        .collect();

    ok(
        &req.id,
        json!({
            "fileName": pipeline.file_name,
            "fileSizeBytes": pipeline.file_size_bytes,
            "sha256": pipeline.sha256,
            "headers": pipeline.decoded.headers,
            "totalRows": pipeline.results.len(),
            "validRows": valid,
            "warningRows": warning,
            "errorRows": error,
            "mapping": mapping,
            "unmappedHeaders": unmapped,
            "rows": rows,
        }),
    )
}

fn commit_policy(conn: &Connection, params: &Value) -> CommitPolicy {
    let mut policy = CommitPolicy::default();
    if let Ok(Some(section)) = db::settings_get_json(conn, "setup.uploads") {
        if let Some(b) = section.get("defaultAdmitWarnings").and_then(|v| v.as_bool()) {
            policy.admit_warnings = b;
        }
        if let Some(b) = section
            .get("defaultAbortOnFirstFailure")
            .and_then(|v| v.as_bool())
        {
            policy.abort_on_first_failure = b;
        }
    }
    if let Some(b) = get_opt_bool(params, "admitWarnings") {
        policy.admit_warnings = b;
    }
    if let Some(b) = get_opt_bool(params, "abortOnFirstFailure") {
        policy.abort_on_first_failure = b;
    }
    policy
}

/// Keep the original bytes next to the workspace so the dashboard can
/// offer the source file for download later. Best-effort: a copy failure
/// must not undo an already-committed upload.
fn stash_source_file(
    state: &AppState,
    conn: &Connection,
    manifest_id: &str,
    src_path: &str,
    file_name: &str,
) {
    let Some(workspace) = state.workspace.as_ref() else {
        return;
    };
    let ext = Path::new(file_name)
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    let dir = workspace.join("uploads");
    if let Err(e) = std::fs::create_dir_all(&dir) {
        warn!("upload {manifest_id}: could not create uploads dir: {e}");
        return;
    }
    let dest = dir.join(format!("{manifest_id}{ext}"));
    if let Err(e) = std::fs::copy(src_path, &dest) {
        warn!("upload {manifest_id}: could not stash source file: {e}");
        return;
    }
    if let Err(e) = history::set_source_path(conn, manifest_id, &dest.to_string_lossy()) {
        warn!("upload {manifest_id}: could not record source path: {e}");
    }
}

fn handle_upload_commit(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let uploaded_by = match get_required_str(&req.params, "uploadedBy") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let src_path = match get_required_str(&req.params, "path") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let pipeline = match run_front_pipeline(conn, &req.params) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let policy = commit_policy(conn, &req.params);

    info!(
        "committing upload {} ({} rows) for {}",
        pipeline.file_name,
        pipeline.results.len(),
        uploaded_by
    );
    let meta = UploadMeta {
        file_name: pipeline.file_name.clone(),
        file_size_bytes: pipeline.file_size_bytes,
        sha256: pipeline.sha256.clone(),
        uploaded_by,
    };
    let summary = match commit_upload(conn, &meta, &pipeline.results, &policy, &NeverCancel) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_update_failed", e.to_string(), None),
    };

    stash_source_file(state, conn, &summary.manifest_id, &src_path, &pipeline.file_name);

    match history::get_manifest(conn, &summary.manifest_id) {
        Ok(Some(manifest)) => ok(&req.id, json!({ "manifest": manifest })),
        Ok(None) => err(&req.id, "db_query_failed", "manifest vanished after commit", None),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "upload.preview" => Some(handle_upload_preview(state, req)),
        "upload.commit" => Some(handle_upload_commit(state, req)),
        _ => None,
    }
}
