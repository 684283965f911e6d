use crate::mapping::{CanonicalRecord, Field};
use anyhow::{anyhow, bail};
use regex::Regex;
use serde_json::{json, Value};
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Error => "error",
            Severity::Warning => "warning",
        }
    }

    pub fn parse(s: &str) -> Option<Severity> {
        match s {
            "error" => Some(Severity::Error),
            "warning" => Some(Severity::Warning),
            _ => None,
        }
    }
}

/// Strict parameter schema per rule category. The administrative surface
/// stores `kind` plus a JSON params object; malformed params fail at rule
/// load, before any row is processed.
#[derive(Debug, Clone, PartialEq)]
pub enum RuleKind {
    Required,
    NumericRange { min: f64, max: f64 },
    MinNumeric { min: f64 },
    EmailFormat,
    PhoneDigits { min_digits: usize, max_digits: usize },
    OneOf { allowed: Vec<String> },
    RequiresField { when_equals: String, required: Field },
}

impl RuleKind {
    pub fn kind_key(&self) -> &'static str {
        match self {
            RuleKind::Required => "required",
            RuleKind::NumericRange { .. } => "numeric_range",
            RuleKind::MinNumeric { .. } => "min_numeric",
            RuleKind::EmailFormat => "email_format",
            RuleKind::PhoneDigits { .. } => "phone_digits",
            RuleKind::OneOf { .. } => "one_of",
            RuleKind::RequiresField { .. } => "requires_field",
        }
    }

    pub fn params_json(&self) -> Value {
        match self {
            RuleKind::Required | RuleKind::EmailFormat => json!({}),
            RuleKind::NumericRange { min, max } => json!({ "min": min, "max": max }),
            RuleKind::MinNumeric { min } => json!({ "min": min }),
            RuleKind::PhoneDigits {
                min_digits,
                max_digits,
            } => json!({ "minDigits": min_digits, "maxDigits": max_digits }),
            RuleKind::OneOf { allowed } => json!({ "allowed": allowed }),
            RuleKind::RequiresField {
                when_equals,
                required,
            } => json!({ "whenEquals": when_equals, "requiredField": required.key() }),
        }
    }

    pub fn from_parts(kind: &str, params: &Value) -> anyhow::Result<RuleKind> {
        let num = |key: &str| -> anyhow::Result<f64> {
            params
                .get(key)
                .and_then(|v| v.as_f64())
                .ok_or_else(|| anyhow!("rule params missing numeric {key}"))
        };
        match kind {
            "required" => Ok(RuleKind::Required),
            "email_format" => Ok(RuleKind::EmailFormat),
            "numeric_range" => {
                let (min, max) = (num("min")?, num("max")?);
                if min > max {
                    bail!("numeric_range min must not exceed max");
                }
                Ok(RuleKind::NumericRange { min, max })
            }
            "min_numeric" => Ok(RuleKind::MinNumeric { min: num("min")? }),
            "phone_digits" => {
                let min_digits = num("minDigits")? as usize;
                let max_digits = num("maxDigits")? as usize;
                if min_digits > max_digits {
                    bail!("phone_digits minDigits must not exceed maxDigits");
                }
                Ok(RuleKind::PhoneDigits {
                    min_digits,
                    max_digits,
                })
            }
            "one_of" => {
                let allowed = params
                    .get("allowed")
                    .and_then(|v| v.as_array())
                    .ok_or_else(|| anyhow!("one_of params missing allowed list"))?
                    .iter()
                    .map(|v| {
                        v.as_str()
                            .map(|s| s.to_ascii_lowercase())
                            .ok_or_else(|| anyhow!("one_of allowed entries must be strings"))
                    })
                    .collect::<anyhow::Result<Vec<_>>>()?;
                if allowed.is_empty() {
                    bail!("one_of allowed list must not be empty");
                }
                Ok(RuleKind::OneOf { allowed })
            }
            "requires_field" => {
                let when_equals = params
                    .get("whenEquals")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| anyhow!("requires_field params missing whenEquals"))?
                    .to_string();
                let required = params
                    .get("requiredField")
                    .and_then(|v| v.as_str())
                    .and_then(Field::parse)
                    .ok_or_else(|| anyhow!("requires_field params missing requiredField"))?;
                Ok(RuleKind::RequiresField {
                    when_equals,
                    required,
                })
            }
            other => bail!("unknown rule kind: {other}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Rule {
    pub id: String,
    pub name: String,
    pub field: Field,
    pub kind: RuleKind,
    pub severity: Severity,
    pub active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowStatus {
    Valid,
    Warning,
    Error,
}

impl RowStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RowStatus::Valid => "valid",
            RowStatus::Warning => "warning",
            RowStatus::Error => "error",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RowResult {
    pub source_row: usize,
    pub record: CanonicalRecord,
    pub status: RowStatus,
    pub triggered: Vec<String>,
}

fn email_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("email regex"))
}

fn digit_count(s: &str) -> usize {
    s.chars().filter(|c| c.is_ascii_digit()).count()
}

/// Whether one rule fires against one record. Pure; never mutates the
/// record. Every kind except `required` skips absent or blank values so
/// "not provided" never masquerades as "invalid".
fn rule_triggers(rule: &Rule, record: &CanonicalRecord) -> bool {
    let value = record.get(rule.field);
    if let RuleKind::Required = rule.kind {
        return value.map(|v| v.trim().is_empty()).unwrap_or(true);
    }
    let Some(value) = value.map(str::trim).filter(|v| !v.is_empty()) else {
        return false;
    };
    match &rule.kind {
        RuleKind::Required => false,
        RuleKind::NumericRange { min, max } => match value.parse::<f64>() {
            Ok(v) => v < *min || v > *max,
            Err(_) => true,
        },
        RuleKind::MinNumeric { min } => match value.parse::<f64>() {
            Ok(v) => v < *min,
            Err(_) => true,
        },
        RuleKind::EmailFormat => !email_regex().is_match(value),
        RuleKind::PhoneDigits {
            min_digits,
            max_digits,
        } => {
            let digits = digit_count(value);
            digits < *min_digits || digits > *max_digits
        }
        RuleKind::OneOf { allowed } => {
            let normalized = value.to_ascii_lowercase();
            !allowed.iter().any(|a| *a == normalized)
        }
        RuleKind::RequiresField {
            when_equals,
            required,
        } => {
            value.eq_ignore_ascii_case(when_equals)
                && record
                    .get(*required)
                    .map(|v| v.trim().is_empty())
                    .unwrap_or(true)
        }
    }
}

/// Evaluate the active rule set against one record. Rules are evaluated
/// independently; `triggered` lists rule ids in declaration order, and
/// the status aggregation is: error if any error-severity rule fired,
/// else warning if any warning fired, else valid.
pub fn evaluate_row(source_row: usize, record: CanonicalRecord, rules: &[Rule]) -> RowResult {
    let mut triggered = Vec::new();
    let mut status = RowStatus::Valid;
    for rule in rules.iter().filter(|r| r.active) {
        if !rule_triggers(rule, &record) {
            continue;
        }
        triggered.push(rule.id.clone());
        match rule.severity {
            Severity::Error => status = RowStatus::Error,
            Severity::Warning => {
                if status == RowStatus::Valid {
                    status = RowStatus::Warning;
                }
            }
        }
    }
    RowResult {
        source_row,
        record,
        status,
        triggered,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(id: &str, field: Field, kind: RuleKind, severity: Severity) -> Rule {
        Rule {
            id: id.to_string(),
            name: id.to_string(),
            field,
            kind,
            severity,
            active: true,
        }
    }

    fn record(email: Option<&str>, attendance: Option<&str>) -> CanonicalRecord {
        CanonicalRecord {
            student_id: Some("STU001".to_string()),
            name: Some("Rahul Sharma".to_string()),
            email: email.map(str::to_string),
            attendance_percent: attendance.map(str::to_string),
            ..CanonicalRecord::default()
        }
    }

    #[test]
    fn required_fires_on_absent_and_blank() {
        let r = rule("req", Field::Email, RuleKind::Required, Severity::Error);
        assert!(rule_triggers(&r, &record(None, None)));
        assert!(rule_triggers(&r, &record(Some("  "), None)));
        assert!(!rule_triggers(&r, &record(Some("a@b.co"), None)));
    }

    #[test]
    fn non_required_rules_skip_absent_and_blank() {
        let r = rule("email", Field::Email, RuleKind::EmailFormat, Severity::Error);
        assert!(!rule_triggers(&r, &record(None, None)));
        assert!(!rule_triggers(&r, &record(Some(""), None)));
        assert!(rule_triggers(&r, &record(Some("invalid-email"), None)));
    }

    #[test]
    fn numeric_range_fires_on_out_of_range_and_unparseable() {
        let r = rule(
            "range",
            Field::AttendancePercent,
            RuleKind::NumericRange { min: 0.0, max: 100.0 },
            Severity::Error,
        );
        assert!(!rule_triggers(&r, &record(None, Some("85"))));
        assert!(rule_triggers(&r, &record(None, Some("120"))));
        assert!(rule_triggers(&r, &record(None, Some("-1"))));
        assert!(rule_triggers(&r, &record(None, Some("eighty"))));
    }

    #[test]
    fn min_numeric_fires_below_threshold() {
        let r = rule(
            "low",
            Field::AttendancePercent,
            RuleKind::MinNumeric { min: 75.0 },
            Severity::Warning,
        );
        assert!(rule_triggers(&r, &record(None, Some("67"))));
        assert!(!rule_triggers(&r, &record(None, Some("75"))));
    }

    #[test]
    fn phone_digit_count_ignores_separators() {
        let r = rule(
            "phone",
            Field::Phone,
            RuleKind::PhoneDigits {
                min_digits: 10,
                max_digits: 10,
            },
            Severity::Error,
        );
        let mut rec = record(None, None);
        rec.phone = Some("98765-43210".to_string());
        assert!(!rule_triggers(&r, &rec));
        rec.phone = Some("98765".to_string());
        assert!(rule_triggers(&r, &rec));
    }

    #[test]
    fn one_of_is_case_insensitive() {
        let r = rule(
            "fee",
            Field::FeeStatus,
            RuleKind::OneOf {
                allowed: vec!["paid".to_string(), "unpaid".to_string(), "partial".to_string()],
            },
            Severity::Warning,
        );
        let mut rec = record(None, None);
        rec.fee_status = Some("Paid".to_string());
        assert!(!rule_triggers(&r, &rec));
        rec.fee_status = Some("overdue".to_string());
        assert!(rule_triggers(&r, &rec));
    }

    #[test]
    fn requires_field_fires_only_when_condition_holds() {
        let r = rule(
            "cross",
            Field::FeeStatus,
            RuleKind::RequiresField {
                when_equals: "unpaid".to_string(),
                required: Field::Phone,
            },
            Severity::Warning,
        );
        let mut rec = record(None, None);
        rec.fee_status = Some("unpaid".to_string());
        assert!(rule_triggers(&r, &rec));
        rec.phone = Some("9876543210".to_string());
        assert!(!rule_triggers(&r, &rec));
        rec.fee_status = Some("paid".to_string());
        rec.phone = None;
        assert!(!rule_triggers(&r, &rec));
    }

    #[test]
    fn status_aggregation_law() {
        let rules = vec![
            rule("email", Field::Email, RuleKind::EmailFormat, Severity::Error),
            rule(
                "low",
                Field::AttendancePercent,
                RuleKind::MinNumeric { min: 75.0 },
                Severity::Warning,
            ),
        ];
        let valid = evaluate_row(0, record(Some("a@b.co"), Some("90")), &rules);
        assert_eq!(valid.status, RowStatus::Valid);
        assert!(valid.triggered.is_empty());

        let warn = evaluate_row(1, record(Some("a@b.co"), Some("60")), &rules);
        assert_eq!(warn.status, RowStatus::Warning);
        assert_eq!(warn.triggered, vec!["low"]);

        let err = evaluate_row(2, record(Some("bad"), Some("60")), &rules);
        assert_eq!(err.status, RowStatus::Error);
        assert_eq!(err.triggered, vec!["email", "low"]);
    }

    #[test]
    fn evaluation_order_does_not_change_status() {
        let mut rules = vec![
            rule("email", Field::Email, RuleKind::EmailFormat, Severity::Error),
            rule(
                "low",
                Field::AttendancePercent,
                RuleKind::MinNumeric { min: 75.0 },
                Severity::Warning,
            ),
        ];
        let forward = evaluate_row(0, record(Some("bad"), Some("60")), &rules);
        rules.reverse();
        let reversed = evaluate_row(0, record(Some("bad"), Some("60")), &rules);
        assert_eq!(forward.status, reversed.status);
        // Only the listing order follows declaration order.
        assert_eq!(reversed.triggered, vec!["low", "email"]);
    }

    #[test]
    fn inactive_rules_are_skipped() {
        let mut r = rule("email", Field::Email, RuleKind::EmailFormat, Severity::Error);
        r.active = false;
        let result = evaluate_row(0, record(Some("bad"), None), &[r]);
        assert_eq!(result.status, RowStatus::Valid);
    }

    #[test]
    fn kind_round_trips_through_parts() {
        let kinds = vec![
            RuleKind::Required,
            RuleKind::EmailFormat,
            RuleKind::NumericRange { min: 0.0, max: 100.0 },
            RuleKind::MinNumeric { min: 75.0 },
            RuleKind::PhoneDigits {
                min_digits: 10,
                max_digits: 12,
            },
            RuleKind::OneOf {
                allowed: vec!["paid".to_string()],
            },
            RuleKind::RequiresField {
                when_equals: "unpaid".to_string(),
                required: Field::Phone,
            },
        ];
        for kind in kinds {
            let parsed = RuleKind::from_parts(kind.kind_key(), &kind.params_json()).expect("parse");
            assert_eq!(parsed, kind);
        }
    }

    #[test]
    fn malformed_params_fail_at_load() {
        assert!(RuleKind::from_parts("numeric_range", &json!({ "min": 5 })).is_err());
        assert!(RuleKind::from_parts("one_of", &json!({ "allowed": [] })).is_err());
        assert!(RuleKind::from_parts("sparkle", &json!({})).is_err());
    }
}
