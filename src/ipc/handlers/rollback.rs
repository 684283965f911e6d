use crate::commit::now_rfc3339;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::get_required_str;
use crate::ipc::types::{AppState, PendingRollback, Request};
use crate::rollback::{self, RollbackChange, RollbackError};
use serde_json::{json, Value};
use uuid::Uuid;

fn rollback_error_response(id: &str, e: RollbackError) -> Value {
    let details = match &e {
        RollbackError::NotPermitted { conflicts, .. } if !conflicts.is_empty() => {
            Some(json!({ "conflictingStudentIds": conflicts }))
        }
        _ => None,
    };
    err(id, e.code(), e.to_string(), details)
}

fn changes_json(changes: &[RollbackChange]) -> Vec<Value> {
    changes
        .iter()
        .map(|c| json!({ "studentId": c.student_id, "action": c.action }))
        .collect()
}

/// Phase one of the destructive flow: validate, describe what would
/// change, and hand out a one-shot confirmation token.
fn handle_request_rollback(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let upload_id = match get_required_str(&req.params, "uploadId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let changes = match rollback::preview(conn, &upload_id) {
        Ok(v) => v,
        Err(e) => return rollback_error_response(&req.id, e),
    };

    let token = Uuid::new_v4().to_string();
    state.pending_rollbacks.insert(
        upload_id.clone(),
        PendingRollback {
            token: token.clone(),
            requested_at: now_rfc3339(),
        },
    );

    ok(
        &req.id,
        json!({
            "uploadId": upload_id,
            "token": token,
            "totalChanges": changes.len(),
            "changes": changes_json(&changes),
        }),
    )
}

/// Phase two: the token must match the outstanding request for this
/// manifest. Guards are re-checked inside the transaction, so a stale
/// preview can still be refused here.
fn handle_confirm_rollback(state: &mut AppState, req: &Request) -> Value {
    let upload_id = match get_required_str(&req.params, "uploadId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let token = match get_required_str(&req.params, "token") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let token_matches = state
        .pending_rollbacks
        .get(&upload_id)
        .map(|p| p.token == token)
        .unwrap_or(false);
    if !token_matches {
        return rollback_error_response(&req.id, RollbackError::InvalidToken);
    }
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let changes = match rollback::execute(conn, &upload_id) {
        Ok(v) => v,
        Err(e) => return rollback_error_response(&req.id, e),
    };
    state.pending_rollbacks.remove(&upload_id);

    let restored = changes.iter().filter(|c| c.action == "restore").count();
    let deleted = changes.iter().filter(|c| c.action == "delete").count();
    ok(
        &req.id,
        json!({
            "uploadId": upload_id,
            "restored": restored,
            "deleted": deleted,
            "changes": changes_json(&changes),
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "uploads.requestRollback" => Some(handle_request_rollback(state, req)),
        "uploads.confirmRollback" => Some(handle_confirm_rollback(state, req)),
        _ => None,
    }
}
