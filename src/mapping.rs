use crate::decode::RawRow;
use serde::Serialize;
use thiserror::Error;

/// Canonical student-registry fields, in declaration order. Declaration
/// order is also the inference order, so it is part of the mapping
/// contract: reordering variants changes which header wins a tie.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    StudentId,
    Name,
    Email,
    Phone,
    AttendancePercent,
    TestScore,
    FeeStatus,
}

pub const ALL_FIELDS: [Field; 7] = [
    Field::StudentId,
    Field::Name,
    Field::Email,
    Field::Phone,
    Field::AttendancePercent,
    Field::TestScore,
    Field::FeeStatus,
];

pub const DEFAULT_REQUIRED_FIELDS: [Field; 2] = [Field::StudentId, Field::Name];

impl Field {
    pub fn key(self) -> &'static str {
        match self {
            Field::StudentId => "student_id",
            Field::Name => "name",
            Field::Email => "email",
            Field::Phone => "phone",
            Field::AttendancePercent => "attendance_percent",
            Field::TestScore => "test_score",
            Field::FeeStatus => "fee_status",
        }
    }

    pub fn parse(s: &str) -> Option<Field> {
        match s {
            "student_id" => Some(Field::StudentId),
            "name" => Some(Field::Name),
            "email" => Some(Field::Email),
            "phone" => Some(Field::Phone),
            "attendance_percent" => Some(Field::AttendancePercent),
            "test_score" => Some(Field::TestScore),
            "fee_status" => Some(Field::FeeStatus),
            _ => None,
        }
    }

    // Normalized substrings recognized when inferring a mapping from
    // header names. These cover the header dialects the dashboard has
    // seen in the wild (Student_ID, Full_Name, Email_ID, Contact,
    // Attendance_Percent, Average_Score, Fee_Paid, ...).
    fn synonyms(self) -> &'static [&'static str] {
        match self {
            Field::StudentId => &["studentid", "studentno", "admissionno", "rollno"],
            Field::Name => &["name"],
            Field::Email => &["email", "mail"],
            Field::Phone => &["phone", "contact", "mobile"],
            Field::AttendancePercent => &["attendance"],
            Field::TestScore => &["testscore", "score", "marks"],
            Field::FeeStatus => &["fee"],
        }
    }
}

#[derive(Debug, Error)]
pub enum MappingError {
    #[error("two columns are mapped to the {} field", .0.key())]
    DuplicateMapping(Field),
    #[error("required field {} has no mapped column", .0.key())]
    MissingRequiredField(Field),
}

impl MappingError {
    pub fn code(&self) -> &'static str {
        match self {
            MappingError::DuplicateMapping(_) => "duplicate_mapping",
            MappingError::MissingRequiredField(_) => "missing_required_field",
        }
    }
}

/// A student data row expressed in canonical fields. `None` means the
/// field had no mapped column; `Some` holds the trimmed cell text, which
/// may be empty when the column was present but the cell was blank.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CanonicalRecord {
    pub student_id: Option<String>,
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub attendance_percent: Option<String>,
    pub test_score: Option<String>,
    pub fee_status: Option<String>,
}

impl CanonicalRecord {
    pub fn get(&self, field: Field) -> Option<&str> {
        match field {
            Field::StudentId => self.student_id.as_deref(),
            Field::Name => self.name.as_deref(),
            Field::Email => self.email.as_deref(),
            Field::Phone => self.phone.as_deref(),
            Field::AttendancePercent => self.attendance_percent.as_deref(),
            Field::TestScore => self.test_score.as_deref(),
            Field::FeeStatus => self.fee_status.as_deref(),
        }
    }

    fn set(&mut self, field: Field, value: String) {
        let slot = match field {
            Field::StudentId => &mut self.student_id,
            Field::Name => &mut self.name,
            Field::Email => &mut self.email,
            Field::Phone => &mut self.phone,
            Field::AttendancePercent => &mut self.attendance_percent,
            Field::TestScore => &mut self.test_score,
            Field::FeeStatus => &mut self.fee_status,
        };
        *slot = Some(value);
    }
}

/// Reconciliation of original column headers to canonical fields. At most
/// one column per field; columns mapped to the ignore sentinel or left
/// unmapped do not appear.
#[derive(Debug, Clone)]
pub struct ColumnMapping {
    entries: Vec<(usize, Field)>,
}

fn normalize_header(h: &str) -> String {
    h.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

impl ColumnMapping {
    /// Build the mapping for one upload. `explicit` holds the caller's
    /// confirmed choices as (header index, target) pairs, where `None`
    /// is the ignore sentinel; inference fills every canonical field the
    /// caller left open. `required` fields must end up mapped.
    pub fn build(
        headers: &[String],
        explicit: &[(usize, Option<Field>)],
        required: &[Field],
    ) -> Result<ColumnMapping, MappingError> {
        let mut entries: Vec<(usize, Field)> = Vec::new();
        let mut claimed_columns = vec![false; headers.len()];

        for &(col, target) in explicit {
            claimed_columns[col] = true;
            let Some(field) = target else {
                continue;
            };
            if entries.iter().any(|&(_, f)| f == field) {
                return Err(MappingError::DuplicateMapping(field));
            }
            entries.push((col, field));
        }

        // Inference: per canonical field, first unclaimed header whose
        // normalized form contains a synonym; header order breaks ties.
        for field in ALL_FIELDS {
            if entries.iter().any(|&(_, f)| f == field) {
                continue;
            }
            let found = headers.iter().enumerate().find(|(col, header)| {
                if claimed_columns[*col] {
                    return false;
                }
                let normalized = normalize_header(header);
                !normalized.is_empty()
                    && field.synonyms().iter().any(|syn| normalized.contains(syn))
            });
            if let Some((col, _)) = found {
                claimed_columns[col] = true;
                entries.push((col, field));
            }
        }

        for &field in required {
            if !entries.iter().any(|&(_, f)| f == field) {
                return Err(MappingError::MissingRequiredField(field));
            }
        }

        entries.sort_by_key(|&(col, _)| col);
        Ok(ColumnMapping { entries })
    }

    pub fn field_for_column(&self, col: usize) -> Option<Field> {
        self.entries
            .iter()
            .find(|&&(c, _)| c == col)
            .map(|&(_, f)| f)
    }

    pub fn mapped_fields(&self) -> impl Iterator<Item = (usize, Field)> + '_ {
        self.entries.iter().copied()
    }

    /// Header indexes no canonical field claimed.
    pub fn unmapped_columns(&self, header_count: usize) -> Vec<usize> {
        (0..header_count)
            .filter(|col| self.field_for_column(*col).is_none())
            .collect()
    }

    /// Pure projection of a raw row onto the canonical fields.
    pub fn apply(&self, row: &RawRow) -> CanonicalRecord {
        let mut record = CanonicalRecord::default();
        for &(col, field) in &self.entries {
            if let Some(cell) = row.cells.get(col) {
                record.set(field, cell.trim().to_string());
            }
        }
        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn row(cells: &[&str]) -> RawRow {
        RawRow {
            source_row: 0,
            cells: cells.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn infers_dashboard_header_dialect() {
        let hdrs = headers(&[
            "Student_ID",
            "Full_Name",
            "Email_ID",
            "Contact",
            "Attendance_Percent",
            "Average_Score",
            "Fee_Paid",
        ]);
        let mapping = ColumnMapping::build(&hdrs, &[], &DEFAULT_REQUIRED_FIELDS).expect("build");
        assert_eq!(mapping.field_for_column(0), Some(Field::StudentId));
        assert_eq!(mapping.field_for_column(1), Some(Field::Name));
        assert_eq!(mapping.field_for_column(2), Some(Field::Email));
        assert_eq!(mapping.field_for_column(3), Some(Field::Phone));
        assert_eq!(mapping.field_for_column(4), Some(Field::AttendancePercent));
        assert_eq!(mapping.field_for_column(5), Some(Field::TestScore));
        assert_eq!(mapping.field_for_column(6), Some(Field::FeeStatus));
    }

    #[test]
    fn inference_is_deterministic() {
        let hdrs = headers(&["Roll_No", "Student Name", "E-Mail", "Score"]);
        let a = ColumnMapping::build(&hdrs, &[], &[]).expect("build");
        let b = ColumnMapping::build(&hdrs, &[], &[]).expect("build");
        let pairs_a: Vec<_> = a.mapped_fields().collect();
        let pairs_b: Vec<_> = b.mapped_fields().collect();
        assert_eq!(pairs_a, pairs_b);
    }

    #[test]
    fn email_id_header_does_not_capture_student_id() {
        let hdrs = headers(&["Email_ID", "Student_ID", "Full_Name"]);
        let mapping = ColumnMapping::build(&hdrs, &[], &DEFAULT_REQUIRED_FIELDS).expect("build");
        assert_eq!(mapping.field_for_column(0), Some(Field::Email));
        assert_eq!(mapping.field_for_column(1), Some(Field::StudentId));
    }

    #[test]
    fn explicit_entries_win_over_inference() {
        let hdrs = headers(&["Student_ID", "Full_Name", "Backup_Email", "Email_ID"]);
        // Caller maps column 3 to email and ignores column 2 outright.
        let explicit = vec![(3, Some(Field::Email)), (2, None)];
        let mapping = ColumnMapping::build(&hdrs, &explicit, &DEFAULT_REQUIRED_FIELDS).expect("build");
        assert_eq!(mapping.field_for_column(3), Some(Field::Email));
        assert_eq!(mapping.field_for_column(2), None);
    }

    #[test]
    fn duplicate_explicit_target_is_rejected() {
        let hdrs = headers(&["Student_ID", "Alt_ID"]);
        let explicit = vec![(0, Some(Field::StudentId)), (1, Some(Field::StudentId))];
        let e = ColumnMapping::build(&hdrs, &explicit, &[]).unwrap_err();
        assert_eq!(e.code(), "duplicate_mapping");
    }

    #[test]
    fn missing_required_field_is_rejected() {
        let hdrs = headers(&["Email_ID", "Contact"]);
        let e = ColumnMapping::build(&hdrs, &[], &DEFAULT_REQUIRED_FIELDS).unwrap_err();
        assert_eq!(e.code(), "missing_required_field");
    }

    #[test]
    fn unmatched_optional_fields_stay_absent() {
        let hdrs = headers(&["Student_ID", "Full_Name"]);
        let mapping = ColumnMapping::build(&hdrs, &[], &DEFAULT_REQUIRED_FIELDS).expect("build");
        let record = mapping.apply(&row(&["STU001", "Rahul Sharma"]));
        assert_eq!(record.student_id.as_deref(), Some("STU001"));
        assert_eq!(record.email, None);
        assert_eq!(record.attendance_percent, None);
    }

    #[test]
    fn blank_cell_is_present_but_empty() {
        let hdrs = headers(&["Student_ID", "Full_Name", "Email_ID"]);
        let mapping = ColumnMapping::build(&hdrs, &[], &DEFAULT_REQUIRED_FIELDS).expect("build");
        let record = mapping.apply(&row(&["STU001", "Rahul Sharma", "  "]));
        // Mapped-but-blank is Some(""), distinct from an unmapped None.
        assert_eq!(record.email.as_deref(), Some(""));
    }

    #[test]
    fn unmapped_columns_are_reported() {
        let hdrs = headers(&["Student_ID", "Full_Name", "House", "Bus_Route"]);
        let mapping = ColumnMapping::build(&hdrs, &[], &DEFAULT_REQUIRED_FIELDS).expect("build");
        assert_eq!(mapping.unmapped_columns(hdrs.len()), vec![2, 3]);
    }
}
