use crate::history::{self, ManifestFilter};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{get_opt_str, get_page, get_required_str};
use crate::ipc::types::{AppState, Request};
use serde_json::{json, Value};

const STATUSES: [&str; 4] = ["processing", "success", "partial", "failed"];

fn handle_history_list(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let status = get_opt_str(&req.params, "status");
    if let Some(s) = &status {
        if !STATUSES.contains(&s.as_str()) {
            return err(
                &req.id,
                "bad_params",
                format!("status must be one of: {}", STATUSES.join(", ")),
                None,
            );
        }
    }
    let filter = ManifestFilter {
        status,
        uploaded_by: get_opt_str(&req.params, "uploadedBy"),
        from: get_opt_str(&req.params, "from"),
        to: get_opt_str(&req.params, "to"),
    };
    let page = get_page(&req.params);
    match history::list_manifests(conn, &filter, page) {
        Ok((items, total)) => ok(
            &req.id,
            json!({
                "uploads": items,
                "total": total,
                "page": page.page,
                "pageSize": page.page_size,
            }),
        ),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_uploads_get(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let upload_id = match get_required_str(&req.params, "uploadId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    match history::get_manifest(conn, &upload_id) {
        Ok(Some(manifest)) => ok(&req.id, json!({ "manifest": manifest })),
        Ok(None) => err(&req.id, "manifest_not_found", "upload manifest not found", None),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_uploads_rows_list(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let upload_id = match get_required_str(&req.params, "uploadId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    match history::get_manifest(conn, &upload_id) {
        Ok(Some(_)) => {}
        Ok(None) => return err(&req.id, "manifest_not_found", "upload manifest not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }
    let page = get_page(&req.params);
    match history::list_rows(conn, &upload_id, page) {
        Ok((rows, total)) => ok(
            &req.id,
            json!({
                "rows": rows,
                "total": total,
                "page": page.page,
                "pageSize": page.page_size,
            }),
        ),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "uploads.history.list" => Some(handle_history_list(state, req)),
        "uploads.get" => Some(handle_uploads_get(state, req)),
        "uploads.rows.list" => Some(handle_uploads_rows_list(state, req)),
        _ => None,
    }
}
