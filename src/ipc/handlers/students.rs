use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{get_page, get_required_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::{json, Value};

fn student_json(row: &rusqlite::Row<'_>) -> rusqlite::Result<Value> {
    Ok(json!({
        "id": row.get::<_, String>(0)?,
        "name": row.get::<_, String>(1)?,
        "email": row.get::<_, Option<String>>(2)?,
        "phone": row.get::<_, Option<String>>(3)?,
        "attendancePercent": row.get::<_, Option<f64>>(4)?,
        "testScore": row.get::<_, Option<f64>>(5)?,
        "feeStatus": row.get::<_, Option<String>>(6)?,
        "version": row.get::<_, i64>(7)?,
        "sourceUploadId": row.get::<_, Option<String>>(8)?,
        "updatedAt": row.get::<_, Option<String>>(9)?,
    }))
}

const STUDENT_COLUMNS: &str = "id, name, email, phone, attendance_percent, test_score, fee_status,
     version, source_upload_id, updated_at";

fn handle_students_list(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let page = get_page(&req.params);
    let total: i64 = match conn.query_row("SELECT COUNT(*) FROM students", [], |r| r.get(0)) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let sql = format!("SELECT {STUDENT_COLUMNS} FROM students ORDER BY id LIMIT ? OFFSET ?");
    let mut stmt = match conn.prepare(&sql) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let students = stmt
        .query_map((page.page_size, (page.page - 1) * page.page_size), |r| {
            student_json(r)
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match students {
        Ok(students) => ok(
            &req.id,
            json!({
                "students": students,
                "total": total,
                "page": page.page,
                "pageSize": page.page_size,
            }),
        ),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_students_get(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let student_id = match get_required_str(&req.params, "studentId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let sql = format!("SELECT {STUDENT_COLUMNS} FROM students WHERE id = ?");
    match conn
        .query_row(&sql, [&student_id], |r| student_json(r))
        .optional()
    {
        Ok(Some(student)) => ok(&req.id, json!({ "student": student })),
        Ok(None) => err(&req.id, "student_not_found", format!("no student {student_id}"), None),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "students.list" => Some(handle_students_list(state, req)),
        "students.get" => Some(handle_students_get(state, req)),
        _ => None,
    }
}
