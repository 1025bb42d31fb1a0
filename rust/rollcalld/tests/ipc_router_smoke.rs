mod test_support;

use serde_json::json;
use test_support::{spawn_sidecar, temp_dir};

#[test]
fn health_works_without_a_workspace() {
    let mut s = spawn_sidecar();
    let health = s.request_ok("health", json!({}));
    assert!(health.get("version").and_then(|v| v.as_str()).is_some());
    assert!(health["workspacePath"].is_null());
    assert!(health["session"].is_null());
    assert_eq!(health["pushConfigured"], json!(false));
    assert_eq!(health["telegramConfigured"], json!(false));
}

#[test]
fn malformed_lines_and_unknown_methods_get_error_envelopes() {
    let mut s = spawn_sidecar();
    let bad = s.send_raw("{not json");
    assert_eq!(bad["ok"], json!(false));
    assert_eq!(bad["error"]["code"], json!("bad_json"));

    assert_eq!(s.request_err("grades.compute", json!({})), "not_implemented");
    // The daemon keeps serving after both.
    s.request_ok("health", json!({}));
}

#[test]
fn router_dispatch_smoke_covers_handler_families() {
    let workspace = temp_dir("rollcall-router-smoke");
    let mut s = spawn_sidecar();

    // Before a workspace is selected, data calls report it.
    assert_eq!(s.request_err("session.signIn", json!({ "email": "a@b.c", "password": "x" })), "no_workspace");
    s.select_workspace(&workspace);

    // Every family answers with a real error rather than not_implemented.
    for method in [
        "session.get",
        "schools.list",
        "teachers.list",
        "classes.list",
        "students.list",
        "students.import",
        "attendance.mark",
        "attendance.day",
        "attendance.studentHistory",
        "attendance.notifyParents",
        "notifications.push",
        "notifications.telegram",
        "notifications.history",
        "setup.get",
        "setup.update",
        "reports.attendance",
        "reports.exportCsv",
        "backup.exportWorkspaceBundle",
        "backup.importWorkspaceBundle",
    ] {
        let resp = s.request(method, json!({}));
        if method == "session.get" {
            assert_eq!(resp["result"]["session"], serde_json::Value::Null);
            continue;
        }
        assert_eq!(
            resp.pointer("/error/code").and_then(|v| v.as_str()),
            Some("unauthenticated"),
            "{} -> {}",
            method,
            resp
        );
    }
}
