use crate::db;
use crate::decode::{DEFAULT_MAX_FILE_SIZE_BYTES, DEFAULT_MAX_ROWS};
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::mapping::Field;
use serde_json::{json, Map, Value};

#[derive(Clone, Copy)]
enum SetupSection {
    Uploads,
}

impl SetupSection {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "uploads" => Some(Self::Uploads),
            _ => None,
        }
    }

    fn key(self) -> &'static str {
        match self {
            Self::Uploads => "setup.uploads",
        }
    }
}

fn default_section(section: SetupSection) -> Value {
    match section {
        SetupSection::Uploads => json!({
            "maxFileSizeBytes": DEFAULT_MAX_FILE_SIZE_BYTES,
            "maxRows": DEFAULT_MAX_ROWS,
            "requiredFields": ["student_id", "name"],
            "defaultAdmitWarnings": true,
            "defaultAbortOnFirstFailure": false
        }),
    }
}

fn merge_section_patch(
    section: SetupSection,
    current: &mut Value,
    patch: &Map<String, Value>,
) -> Result<(), String> {
    for (k, v) in patch {
        match section {
            SetupSection::Uploads => match k.as_str() {
                "maxFileSizeBytes" | "maxRows" => {
                    let Some(n) = v.as_u64().filter(|n| *n > 0) else {
                        return Err(format!("{k} must be a positive integer"));
                    };
                    current[k] = json!(n);
                }
                "requiredFields" => {
                    let Some(list) = v.as_array() else {
                        return Err("requiredFields must be an array".to_string());
                    };
                    for entry in list {
                        let valid = entry.as_str().and_then(Field::parse).is_some();
                        if !valid {
                            return Err(format!("unknown canonical field: {entry}"));
                        }
                    }
                    current[k] = v.clone();
                }
                "defaultAdmitWarnings" | "defaultAbortOnFirstFailure" => {
                    let Some(b) = v.as_bool() else {
                        return Err(format!("{k} must be a boolean"));
                    };
                    current[k] = json!(b);
                }
                _ => return Err(format!("unknown uploads field: {k}")),
            },
        }
    }
    Ok(())
}

fn load_section(conn: &rusqlite::Connection, section: SetupSection) -> anyhow::Result<Value> {
    let mut current = default_section(section);
    if let Some(saved) = db::settings_get_json(conn, section.key())? {
        if let Some(saved_obj) = saved.as_object() {
            // Best-effort apply: malformed historical values should not
            // block the setup surface.
            let _ = merge_section_patch(section, &mut current, saved_obj);
        }
    }
    Ok(current)
}

fn handle_setup_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let uploads = match load_section(conn, SetupSection::Uploads) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    ok(&req.id, json!({ "uploads": uploads }))
}

fn handle_setup_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(section_raw) = req.params.get("section").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing section", None);
    };
    let Some(section) = SetupSection::parse(section_raw) else {
        return err(&req.id, "bad_params", "unknown section", None);
    };
    let Some(patch_obj) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "patch must be an object", None);
    };

    let mut current = match load_section(conn, section) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Err(msg) = merge_section_patch(section, &mut current, patch_obj) {
        return err(&req.id, "bad_params", msg, None);
    }
    if let Err(e) = db::settings_set_json(conn, section.key(), &current) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "setup.get" => Some(handle_setup_get(state, req)),
        "setup.update" => Some(handle_setup_update(state, req)),
        _ => None,
    }
}
