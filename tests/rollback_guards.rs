
use serde_json::json;
use test_support::{error_code, request, request_ok, spawn_sidecar, temp_workspace, write_file};

#[test]
fn failed_uploads_have_nothing_to_reverse() {
    let workspace = temp_workspace();
    let (_sidecar, mut stdin, mut reader) = spawn_sidecar();

    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.path().to_string_lossy() }),
    );
    let csv = write_file(
        workspace.path(),
        "bad.csv",
        "Student_ID,Full_Name,Email_ID\nSTU001,Rahul Sharma,not-an-email\n",
    );
    let committed = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "upload.commit",
        json!({ "path": csv.to_string_lossy(), "uploadedBy": "admin@school.edu" }),
    );
    assert_eq!(committed["manifest"]["status"], "failed");
    let upload_id = committed["manifest"]["id"].as_str().expect("id").to_string();

    let refused = request(
        &mut stdin,
        &mut reader,
        "3",
        "uploads.requestRollback",
        json!({ "uploadId": upload_id }),
    );
    assert_eq!(error_code(&refused), Some("rollback_not_permitted"));

    // Storage is untouched: no students, manifest unflagged.
    let students = request_ok(&mut stdin, &mut reader, "4", "students.list", json!({}));
    assert_eq!(students["total"], 0);
    let manifest = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "uploads.get",
        json!({ "uploadId": upload_id }),
    );
    assert_eq!(manifest["manifest"]["rolledBack"], false);
}

#[test]
fn unknown_manifest_is_not_found() {
    let workspace = temp_workspace();
    let (_sidecar, mut stdin, mut reader) = spawn_sidecar();

    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.path().to_string_lossy() }),
    );
    let resp = request(
        &mut stdin,
        &mut reader,
        "2",
        "uploads.requestRollback",
        json!({ "uploadId": "no-such-upload" }),
    );
    assert_eq!(error_code(&resp), Some("manifest_not_found"));
}

#[test]
fn a_later_upload_blocks_rolling_back_an_earlier_one() {
    let workspace = temp_workspace();
    let (_sidecar, mut stdin, mut reader) = spawn_sidecar();

    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.path().to_string_lossy() }),
    );
    let first_csv = write_file(
        workspace.path(),
        "first.csv",
        "Student_ID,Full_Name,Attendance_Percent\nSTU001,Rahul Sharma,50\n",
    );
    let first = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "upload.commit",
        json!({ "path": first_csv.to_string_lossy(), "uploadedBy": "admin@school.edu" }),
    );
    let first_id = first["manifest"]["id"].as_str().expect("id").to_string();

    let second_csv = write_file(
        workspace.path(),
        "second.csv",
        "Student_ID,Full_Name,Attendance_Percent\nSTU001,Rahul Sharma,90\n",
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "upload.commit",
        json!({ "path": second_csv.to_string_lossy(), "uploadedBy": "mentor@school.edu" }),
    );

    // The later upload owns STU001's current state now; the conflict is
    // surfaced, never silently overridden.
    let refused = request(
        &mut stdin,
        &mut reader,
        "4",
        "uploads.requestRollback",
        json!({ "uploadId": first_id }),
    );
    assert_eq!(error_code(&refused), Some("rollback_not_permitted"));
    let conflicts = refused
        .pointer("/error/details/conflictingStudentIds")
        .and_then(|v| v.as_array())
        .expect("conflict details");
    assert_eq!(conflicts, &vec![json!("STU001")]);

    let student = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "students.get",
        json!({ "studentId": "STU001" }),
    );
    assert_eq!(student["student"]["attendancePercent"], 90.0);
}

#[test]
fn a_stale_preview_cannot_confirm_past_fresh_guards() {
    let workspace = temp_workspace();
    let (_sidecar, mut stdin, mut reader) = spawn_sidecar();

    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.path().to_string_lossy() }),
    );
    let first_csv = write_file(
        workspace.path(),
        "first.csv",
        "Student_ID,Full_Name,Attendance_Percent\nSTU001,Rahul Sharma,50\n",
    );
    let first = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "upload.commit",
        json!({ "path": first_csv.to_string_lossy(), "uploadedBy": "admin@school.edu" }),
    );
    let first_id = first["manifest"]["id"].as_str().expect("id").to_string();

    // Token issued while the rollback was still legal...
    let preview = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "uploads.requestRollback",
        json!({ "uploadId": first_id }),
    );
    let token = preview["token"].as_str().expect("token").to_string();

    // ...then another upload touches the same student.
    let second_csv = write_file(
        workspace.path(),
        "second.csv",
        "Student_ID,Full_Name,Attendance_Percent\nSTU001,Rahul Sharma,90\n",
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "upload.commit",
        json!({ "path": second_csv.to_string_lossy(), "uploadedBy": "admin@school.edu" }),
    );

    let refused = request(
        &mut stdin,
        &mut reader,
        "5",
        "uploads.confirmRollback",
        json!({ "uploadId": first_id, "token": token }),
    );
    assert_eq!(error_code(&refused), Some("rollback_not_permitted"));
    let student = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "students.get",
        json!({ "studentId": "STU001" }),
    );
    assert_eq!(student["student"]["attendancePercent"], 90.0);
}
