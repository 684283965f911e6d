
use serde_json::json;
use std::io::BufReader;
use std::process::{ChildStdin, ChildStdout};
use test_support::{error_code, request, request_ok, spawn_sidecar, temp_workspace, write_file};

fn commit_roster(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    path: &std::path::Path,
    uploader: &str,
) -> serde_json::Value {
    request_ok(
        stdin,
        reader,
        id,
        "upload.commit",
        json!({ "path": path.to_string_lossy(), "uploadedBy": uploader }),
    )
}

#[test]
fn history_filters_by_status_and_uploader_with_pagination() {
    let workspace = temp_workspace();
    let (_sidecar, mut stdin, mut reader) = spawn_sidecar();

    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.path().to_string_lossy() }),
    );

    let good = write_file(
        workspace.path(),
        "good.csv",
        "Student_ID,Full_Name\nSTU001,Rahul Sharma\n",
    );
    let bad = write_file(
        workspace.path(),
        "bad.csv",
        "Student_ID,Full_Name,Email_ID\nSTU002,Priya Patel,not-an-email\n",
    );

    commit_roster(&mut stdin, &mut reader, "2", &good, "admin@school.edu");
    commit_roster(&mut stdin, &mut reader, "3", &good, "mentor@school.edu");
    commit_roster(&mut stdin, &mut reader, "4", &bad, "admin@school.edu");

    let all = request_ok(&mut stdin, &mut reader, "5", "uploads.history.list", json!({}));
    assert_eq!(all["total"], 3);

    let successes = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "uploads.history.list",
        json!({ "status": "success" }),
    );
    assert_eq!(successes["total"], 2);

    let failures = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "uploads.history.list",
        json!({ "status": "failed" }),
    );
    assert_eq!(failures["total"], 1);
    assert_eq!(failures["uploads"][0]["fileName"], "bad.csv");

    let by_mentor = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "uploads.history.list",
        json!({ "uploadedBy": "mentor@school.edu" }),
    );
    assert_eq!(by_mentor["total"], 1);

    // Page size 2: totals stay unpaginated, pages partition the list.
    let page1 = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "uploads.history.list",
        json!({ "page": 1, "pageSize": 2 }),
    );
    assert_eq!(page1["total"], 3);
    assert_eq!(page1["uploads"].as_array().expect("uploads").len(), 2);
    let page2 = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "uploads.history.list",
        json!({ "page": 2, "pageSize": 2 }),
    );
    assert_eq!(page2["uploads"].as_array().expect("uploads").len(), 1);

    // A time window starting now excludes everything already written.
    let future_only = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "uploads.history.list",
        json!({ "from": "2099-01-01T00:00:00Z" }),
    );
    assert_eq!(future_only["total"], 0);
    let until_now = request_ok(
        &mut stdin,
        &mut reader,
        "12",
        "uploads.history.list",
        json!({ "from": "2000-01-01T00:00:00Z", "to": "2099-01-01T00:00:00Z" }),
    );
    assert_eq!(until_now["total"], 3);
}

#[test]
fn history_rejects_bad_filter_values() {
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
        "uploads.history.list",
        json!({ "status": "sideways" }),
    );
    assert_eq!(error_code(&resp), Some("bad_params"));

    let resp = request(
        &mut stdin,
        &mut reader,
        "3",
        "uploads.history.list",
        json!({ "from": "last tuesday" }),
    );
    assert_eq!(error_code(&resp), Some("db_query_failed"));
}

#[test]
fn manifests_survive_rollback_in_history() {
    let workspace = temp_workspace();
    let (_sidecar, mut stdin, mut reader) = spawn_sidecar();

    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.path().to_string_lossy() }),
    );
    let good = write_file(
        workspace.path(),
        "good.csv",
        "Student_ID,Full_Name\nSTU001,Rahul Sharma\n",
    );
    let committed = commit_roster(&mut stdin, &mut reader, "2", &good, "admin@school.edu");
    let upload_id = committed["manifest"]["id"].as_str().expect("id").to_string();

    let preview = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "uploads.requestRollback",
        json!({ "uploadId": upload_id }),
    );
    let token = preview["token"].as_str().expect("token").to_string();
    request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "uploads.confirmRollback",
        json!({ "uploadId": upload_id, "token": token }),
    );

    // Rollback marks, never deletes.
    let all = request_ok(&mut stdin, &mut reader, "5", "uploads.history.list", json!({}));
    assert_eq!(all["total"], 1);
    assert_eq!(all["uploads"][0]["rolledBack"], true);
    assert!(all["uploads"][0]["rolledBackAt"].is_string());
}
