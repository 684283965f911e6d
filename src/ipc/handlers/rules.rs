use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{get_opt_str, get_required_str};
use crate::ipc::types::{AppState, Request};
use crate::mapping::Field;
use crate::validate::{Rule, RuleKind, Severity};
use serde_json::{json, Value};
use uuid::Uuid;

fn rule_json(rule: &Rule) -> Value {
    json!({
        "id": rule.id,
        "name": rule.name,
        "field": rule.field.key(),
        "kind": rule.kind.kind_key(),
        "params": rule.kind.params_json(),
        "severity": rule.severity.as_str(),
        "active": rule.active,
    })
}

fn handle_rules_list(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match db::load_all_rules(conn) {
        Ok(rules) => ok(
            &req.id,
            json!({ "rules": rules.iter().map(rule_json).collect::<Vec<_>>() }),
        ),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_rules_create(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let name = match get_required_str(&req.params, "name") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let field_raw = match get_required_str(&req.params, "field") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let Some(field) = Field::parse(&field_raw) else {
        return err(&req.id, "bad_params", format!("unknown canonical field: {field_raw}"), None);
    };
    let kind_raw = match get_required_str(&req.params, "kind") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let params = req.params.get("params").cloned().unwrap_or_else(|| json!({}));
    let kind = match RuleKind::from_parts(&kind_raw, &params) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "bad_params", e.to_string(), None),
    };
    let severity_raw = get_opt_str(&req.params, "severity").unwrap_or_else(|| "error".to_string());
    let Some(severity) = Severity::parse(&severity_raw) else {
        return err(&req.id, "bad_params", "severity must be error or warning", None);
    };

    let rule = Rule {
        id: Uuid::new_v4().to_string(),
        name,
        field,
        kind,
        severity,
        active: req
            .params
            .get("active")
            .and_then(|v| v.as_bool())
            .unwrap_or(true),
    };
    let sort_order = match db::next_rule_sort_order(conn) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Err(e) = db::save_rule(conn, &rule, sort_order) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "rule": rule_json(&rule) }))
}

fn handle_rules_update(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let rule_id = match get_required_str(&req.params, "id") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let rules = match db::load_all_rules(conn) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(mut rule) = rules.into_iter().find(|r| r.id == rule_id) else {
        return err(&req.id, "rule_not_found", format!("no rule with id {rule_id}"), None);
    };

    if let Some(name) = get_opt_str(&req.params, "name") {
        rule.name = name;
    }
    if let Some(severity_raw) = get_opt_str(&req.params, "severity") {
        let Some(severity) = Severity::parse(&severity_raw) else {
            return err(&req.id, "bad_params", "severity must be error or warning", None);
        };
        rule.severity = severity;
    }
    if let Some(active) = req.params.get("active").and_then(|v| v.as_bool()) {
        rule.active = active;
    }
    // Params changes re-validate against the rule's kind (or a new kind
    // when the caller re-categorizes the rule).
    let kind_raw = get_opt_str(&req.params, "kind");
    let params_patch = req.params.get("params").cloned();
    if kind_raw.is_some() || params_patch.is_some() {
        let kind_key = kind_raw.unwrap_or_else(|| rule.kind.kind_key().to_string());
        let params = params_patch.unwrap_or_else(|| rule.kind.params_json());
        rule.kind = match RuleKind::from_parts(&kind_key, &params) {
            Ok(v) => v,
            Err(e) => return err(&req.id, "bad_params", e.to_string(), None),
        };
    }

    // sort_order only applies on insert; updating an existing id keeps
    // its declared position.
    if let Err(e) = db::save_rule(conn, &rule, 0) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "rule": rule_json(&rule) }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "rules.list" => Some(handle_rules_list(state, req)),
        "rules.create" => Some(handle_rules_create(state, req)),
        "rules.update" => Some(handle_rules_update(state, req)),
        _ => None,
    }
}
