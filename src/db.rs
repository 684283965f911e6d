use crate::mapping::Field;
use crate::validate::{Rule, RuleKind, Severity};
use anyhow::anyhow;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::path::Path;

pub const DB_FILE_NAME: &str = "edurisk.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            email TEXT,
            phone TEXT,
            attendance_percent REAL,
            test_score REAL,
            fee_status TEXT,
            version INTEGER NOT NULL,
            source_upload_id TEXT,
            updated_at TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS upload_manifests(
            id TEXT PRIMARY KEY,
            file_name TEXT NOT NULL,
            file_size_bytes INTEGER NOT NULL,
            sha256 TEXT NOT NULL,
            uploaded_by TEXT NOT NULL,
            uploaded_at TEXT NOT NULL,
            total_rows INTEGER NOT NULL,
            successful_rows INTEGER NOT NULL,
            failed_rows INTEGER NOT NULL,
            status TEXT NOT NULL,
            rolled_back INTEGER NOT NULL DEFAULT 0,
            rolled_back_at TEXT,
            source_path TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_upload_manifests_status ON upload_manifests(status)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_upload_manifests_uploader ON upload_manifests(uploaded_by)",
        [],
    )?;

    // Per-record commit ledger: what each upload wrote and what was there
    // before. prior_json NULL means the record did not exist before this
    // upload; rollback deletes it.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS manifest_records(
            manifest_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            prior_json TEXT,
            prior_version INTEGER,
            new_version INTEGER NOT NULL,
            PRIMARY KEY(manifest_id, student_id),
            FOREIGN KEY(manifest_id) REFERENCES upload_manifests(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_manifest_records_student ON manifest_records(student_id)",
        [],
    )?;

    // Row-level outcomes for the review UI, one per source row.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS upload_rows(
            manifest_id TEXT NOT NULL,
            source_row INTEGER NOT NULL,
            status TEXT NOT NULL,
            admitted INTEGER NOT NULL,
            triggered_rules TEXT NOT NULL,
            error TEXT,
            record_json TEXT NOT NULL,
            PRIMARY KEY(manifest_id, source_row),
            FOREIGN KEY(manifest_id) REFERENCES upload_manifests(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS validation_rules(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            field TEXT NOT NULL,
            kind TEXT NOT NULL,
            params TEXT NOT NULL,
            severity TEXT NOT NULL,
            active INTEGER NOT NULL DEFAULT 1,
            sort_order INTEGER NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )",
        [],
    )?;

    seed_default_rules(&conn)?;

    Ok(conn)
}

pub fn settings_get_json(conn: &Connection, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row("SELECT value FROM settings WHERE key = ?", [key], |r| r.get(0))
        .optional()?;
    match raw {
        None => Ok(None),
        Some(s) => Ok(Some(serde_json::from_str(&s)?)),
    }
}

pub fn settings_set_json(conn: &Connection, key: &str, value: &serde_json::Value) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        (key, serde_json::to_string(value)?),
    )?;
    Ok(())
}

/// Active rules in declaration (sort) order, ready for the validation
/// engine. A row with an unknown kind or malformed params aborts the
/// load; a broken rule must not silently vanish from enforcement.
pub fn load_active_rules(conn: &Connection) -> anyhow::Result<Vec<Rule>> {
    load_rules_where(conn, "WHERE active = 1")
}

pub fn load_all_rules(conn: &Connection) -> anyhow::Result<Vec<Rule>> {
    load_rules_where(conn, "")
}

fn load_rules_where(conn: &Connection, clause: &str) -> anyhow::Result<Vec<Rule>> {
    let sql = format!(
        "SELECT id, name, field, kind, params, severity, active
         FROM validation_rules {clause} ORDER BY sort_order"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], |r| {
        Ok((
            r.get::<_, String>(0)?,
            r.get::<_, String>(1)?,
            r.get::<_, String>(2)?,
            r.get::<_, String>(3)?,
            r.get::<_, String>(4)?,
            r.get::<_, String>(5)?,
            r.get::<_, i64>(6)?,
        ))
    })?;

    let mut rules = Vec::new();
    for row in rows {
        let (id, name, field, kind, params, severity, active) = row?;
        let field = Field::parse(&field).ok_or_else(|| anyhow!("rule {id}: unknown field {field}"))?;
        let params: serde_json::Value = serde_json::from_str(&params)?;
        let kind = RuleKind::from_parts(&kind, &params).map_err(|e| anyhow!("rule {id}: {e}"))?;
        let severity =
            Severity::parse(&severity).ok_or_else(|| anyhow!("rule {id}: unknown severity {severity}"))?;
        rules.push(Rule {
            id,
            name,
            field,
            kind,
            severity,
            active: active != 0,
        });
    }
    Ok(rules)
}

pub fn save_rule(conn: &Connection, rule: &Rule, sort_order: i64) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO validation_rules(id, name, field, kind, params, severity, active, sort_order)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET
            name = excluded.name,
            field = excluded.field,
            kind = excluded.kind,
            params = excluded.params,
            severity = excluded.severity,
            active = excluded.active",
        (
            &rule.id,
            &rule.name,
            rule.field.key(),
            rule.kind.kind_key(),
            serde_json::to_string(&rule.kind.params_json())?,
            rule.severity.as_str(),
            if rule.active { 1 } else { 0 },
            sort_order,
        ),
    )?;
    Ok(())
}

pub fn next_rule_sort_order(conn: &Connection) -> anyhow::Result<i64> {
    let max: Option<i64> =
        conn.query_row("SELECT MAX(sort_order) FROM validation_rules", [], |r| r.get(0))?;
    Ok(max.map(|m| m + 1).unwrap_or(0))
}

/// The dashboard's built-in rule set, written once into fresh workspaces.
/// Administrators edit or retire them afterwards; ids stay stable.
fn seed_default_rules(conn: &Connection) -> anyhow::Result<()> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM validation_rules", [], |r| r.get(0))?;
    if count > 0 {
        return Ok(());
    }

    let defaults: Vec<Rule> = vec![
        Rule {
            id: "rule-student-id-required".to_string(),
            name: "Student ID is required".to_string(),
            field: Field::StudentId,
            kind: RuleKind::Required,
            severity: Severity::Error,
            active: true,
        },
        Rule {
            id: "rule-name-required".to_string(),
            name: "Full name is required".to_string(),
            field: Field::Name,
            kind: RuleKind::Required,
            severity: Severity::Error,
            active: true,
        },
        Rule {
            id: "rule-email-format".to_string(),
            name: "Invalid email format".to_string(),
            field: Field::Email,
            kind: RuleKind::EmailFormat,
            severity: Severity::Error,
            active: true,
        },
        Rule {
            id: "rule-phone-digits".to_string(),
            name: "Phone number must have 10 digits".to_string(),
            field: Field::Phone,
            kind: RuleKind::PhoneDigits {
                min_digits: 10,
                max_digits: 10,
            },
            severity: Severity::Error,
            active: true,
        },
        Rule {
            id: "rule-attendance-range".to_string(),
            name: "Attendance must be between 0 and 100".to_string(),
            field: Field::AttendancePercent,
            kind: RuleKind::NumericRange { min: 0.0, max: 100.0 },
            severity: Severity::Error,
            active: true,
        },
        Rule {
            id: "rule-attendance-minimum".to_string(),
            name: "Low attendance".to_string(),
            field: Field::AttendancePercent,
            kind: RuleKind::MinNumeric { min: 75.0 },
            severity: Severity::Warning,
            active: true,
        },
        Rule {
            id: "rule-test-score-range".to_string(),
            name: "Test score must be between 0 and 100".to_string(),
            field: Field::TestScore,
            kind: RuleKind::NumericRange { min: 0.0, max: 100.0 },
            severity: Severity::Error,
            active: true,
        },
        Rule {
            id: "rule-fee-status-values".to_string(),
            name: "Unknown fee status".to_string(),
            field: Field::FeeStatus,
            kind: RuleKind::OneOf {
                allowed: vec![
                    "paid".to_string(),
                    "unpaid".to_string(),
                    "partial".to_string(),
                    "yes".to_string(),
                    "no".to_string(),
                ],
            },
            severity: Severity::Warning,
            active: true,
        },
        Rule {
            id: "rule-unpaid-fee-contact".to_string(),
            name: "Unpaid fees need a contact number".to_string(),
            field: Field::FeeStatus,
            kind: RuleKind::RequiresField {
                when_equals: "unpaid".to_string(),
                required: Field::Phone,
            },
            severity: Severity::Warning,
            active: true,
        },
    ];

    for (i, rule) in defaults.iter().enumerate() {
        save_rule(conn, rule, i as i64)?;
    }
    Ok(())
}

/// Required canonical fields for uploads, from `setup.uploads`; defaults
/// to student id + name.
pub fn required_fields(conn: &Connection) -> anyhow::Result<Vec<Field>> {
    let section = settings_get_json(conn, "setup.uploads")?.unwrap_or_else(|| json!({}));
    let Some(list) = section.get("requiredFields").and_then(|v| v.as_array()) else {
        return Ok(crate::mapping::DEFAULT_REQUIRED_FIELDS.to_vec());
    };
    let mut fields = Vec::new();
    for entry in list {
        let key = entry
            .as_str()
            .ok_or_else(|| anyhow!("requiredFields entries must be strings"))?;
        let field = Field::parse(key).ok_or_else(|| anyhow!("unknown canonical field: {key}"))?;
        if !fields.contains(&field) {
            fields.push(field);
        }
    }
    Ok(fields)
}
