mod test_support;

use serde_json::{json, Value};
use test_support::{
    create_school, create_student, spawn_sidecar, spawn_sidecar_with_env, str_field, temp_dir,
    FakeHttp, Recorded, SchoolFixture, Sidecar,
};

const BOT_TOKEN: &str = "123:test-token";

/// Push calls live under `/onesignal`, bot calls under `/tg`.
fn upstream(req: &Recorded) -> (u16, Value) {
    if req.path.starts_with("/tg/") {
        let body = req.json();
        if body["chat_id"] == json!("999") {
            return (200, json!({ "ok": false, "description": "Bad Request: chat not found" }));
        }
        return (200, json!({ "ok": true, "result": { "message_id": 1 } }));
    }
    match (req.method.as_str(), req.path.as_str()) {
        ("POST", "/onesignal/notifications") => (200, json!({ "id": "n-1", "recipients": 1 })),
        ("GET", p) if p.starts_with("/onesignal/notifications?") => {
            (200, json!({ "total_count": 0, "notifications": [] }))
        }
        _ => (400, json!({ "errors": ["Notification not found"] })),
    }
}

fn configured_sidecar(fake: &FakeHttp) -> Sidecar {
    let push_url = format!("{}/onesignal", fake.base);
    let tg_url = format!("{}/tg", fake.base);
    spawn_sidecar_with_env(&[
        ("ONESIGNAL_APP_ID", "app-1"),
        ("ONESIGNAL_API_KEY", "key-1"),
        ("ONESIGNAL_API_URL", push_url.as_str()),
        ("TELEGRAM_BOT_TOKEN", BOT_TOKEN),
        ("TELEGRAM_API_URL", tg_url.as_str()),
    ])
}

fn admin_session(s: &mut Sidecar, prefix: &str) -> SchoolFixture {
    let workspace = temp_dir(prefix);
    s.select_workspace(&workspace);
    s.sign_in_super_admin();
    let school = create_school(s, "Notify School", "head@notify.test", None);
    s.sign_in(&school.admin_email, &school.admin_password);
    school
}

#[test]
fn missing_credentials_are_reported_per_channel() {
    let mut s = spawn_sidecar();
    admin_session(&mut s, "rollcall-notify-unconfigured");
    assert_eq!(
        s.request_err("notifications.push", json!({ "action": "list" })),
        "notifications_not_configured"
    );
    assert_eq!(
        s.request_err("notifications.telegram", json!({ "chatId": "1", "text": "hi" })),
        "notifications_not_configured"
    );
}

#[test]
fn push_actions_map_to_the_three_endpoints() {
    let fake = FakeHttp::start(upstream);
    let mut s = configured_sidecar(&fake);
    admin_session(&mut s, "rollcall-notify-push");

    let health = s.request_ok("health", json!({}));
    assert_eq!(health["pushConfigured"], json!(true));

    let sent = s.request_ok(
        "notifications.push",
        json!({
            "action": "send",
            "notification": { "included_segments": ["All"], "contents": { "en": "School closed" } }
        }),
    );
    assert_eq!(sent["status"], json!(200));
    assert_eq!(sent["body"]["id"], json!("n-1"));

    s.request_ok("notifications.push", json!({ "action": "list", "limit": 500 }));

    let cancel = s.request(
        "notifications.push",
        json!({ "action": "cancel", "notificationId": "missing-1" }),
    );
    assert_eq!(cancel.pointer("/error/code"), Some(&json!("upstream_error")));
    assert_eq!(cancel.pointer("/error/details/status"), Some(&json!(400)));
    assert_eq!(
        cancel.pointer("/error/details/body/errors/0"),
        Some(&json!("Notification not found"))
    );

    assert_eq!(
        s.request_err("notifications.push", json!({ "action": "broadcast" })),
        "bad_params"
    );

    let seen = fake.recorded();
    assert_eq!(seen.len(), 3, "rejected actions never reach upstream");
    assert_eq!(seen[0].method, "POST");
    assert_eq!(seen[0].path, "/onesignal/notifications");
    assert_eq!(seen[0].authorization.as_deref(), Some("Basic key-1"));
    assert_eq!(seen[0].json()["app_id"], json!("app-1"));
    assert_eq!(seen[1].method, "GET");
    assert_eq!(seen[1].path, "/onesignal/notifications?app_id=app-1&limit=50&offset=0");
    assert_eq!(seen[2].method, "DELETE");
    assert_eq!(seen[2].path, "/onesignal/notifications/missing-1?app_id=app-1");

    // Only the send is a delivery worth logging.
    let history = s.request_ok("notifications.history", json!({}));
    let entries = history["entries"].as_array().expect("entries");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["channel"], json!("push"));
}

#[test]
fn telegram_route_checks_the_bot_reply() {
    let fake = FakeHttp::start(upstream);
    let mut s = configured_sidecar(&fake);
    admin_session(&mut s, "rollcall-notify-telegram");

    let ok = s.request_ok("notifications.telegram", json!({ "chatId": 4242, "text": "Hello" }));
    assert_eq!(ok["body"]["ok"], json!(true));
    assert_eq!(
        s.request_err("notifications.telegram", json!({ "chatId": "999", "text": "Hello" })),
        "upstream_error"
    );
    assert_eq!(
        s.request_err("notifications.telegram", json!({ "chatId": "1", "text": "   " })),
        "bad_params"
    );

    let seen = fake.recorded();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0].path, format!("/tg/bot{}/sendMessage", BOT_TOKEN));
    assert_eq!(seen[0].json(), json!({ "chat_id": "4242", "text": "Hello" }));

    let history = s.request_ok("notifications.history", json!({ "limit": 10 }));
    let entries = history["entries"].as_array().expect("entries");
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0]["ok"], json!(false), "newest first");
    assert_eq!(entries[0]["target"], json!("999"));
}

#[test]
fn notify_parents_uses_templates_and_available_channels() {
    let fake = FakeHttp::start(upstream);
    let mut s = configured_sidecar(&fake);
    let school = admin_session(&mut s, "rollcall-notify-parents");
    let class_id = str_field(&s.request_ok("classes.create", json!({ "name": "A" })), "classId");
    let ann = create_student(
        &mut s,
        &class_id,
        "Ann",
        "Lee",
        json!({ "parentName": "Mia", "telegramChatId": "111", "pushPlayerId": "p-ann" }),
    );
    let bo = create_student(&mut s, &class_id, "Bo", "Kim", json!({ "telegramChatId": "999" }));
    let cy = create_student(&mut s, &class_id, "Cy", "Diaz", json!({}));
    let dee = create_student(&mut s, &class_id, "Dee", "Ng", json!({ "telegramChatId": "222" }));
    s.request_ok(
        "attendance.mark",
        json!({
            "classId": class_id,
            "date": "2026-03-02",
            "entries": [
                { "studentId": ann, "status": "absent" },
                { "studentId": bo, "status": "late" },
                { "studentId": cy, "status": "absent" },
                { "studentId": dee, "status": "present" }
            ]
        }),
    );

    let result = s.request_ok(
        "attendance.notifyParents",
        json!({ "classId": class_id, "date": "2026-03-02" }),
    );
    assert_eq!(result["sent"], json!(2), "{}", result);
    assert_eq!(result["failed"], json!(1));
    assert_eq!(result["skipped"], json!(1));
    let failed: Vec<&Value> = result["results"]
        .as_array()
        .expect("results")
        .iter()
        .filter(|r| r["ok"] == json!(false))
        .collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0]["studentId"], json!(bo));
    assert_eq!(failed[0]["error"]["code"], json!("upstream_error"));

    let seen = fake.recorded();
    let to_ann = seen
        .iter()
        .find(|r| r.path.starts_with("/tg/") && r.json()["chat_id"] == json!("111"))
        .expect("telegram to Ann's parent");
    assert_eq!(
        to_ann.json()["text"],
        json!("Dear Mia, Ann Lee (A) was absent on 2026-03-02. Notify School")
    );
    let push = seen
        .iter()
        .find(|r| r.path == "/onesignal/notifications")
        .expect("push to Ann's device");
    assert_eq!(push.json()["include_player_ids"], json!(["p-ann"]));
    assert!(seen.iter().all(|r| r.json()["chat_id"] != json!("222")));

    let history = s.request_ok("notifications.history", json!({}));
    assert_eq!(history["entries"].as_array().map(|e| e.len()), Some(3));
    assert_eq!(history["entries"][0]["schoolId"], json!(school.school_id));

    // Disabled channels are skipped; explicit statuses override the setting.
    s.request_ok(
        "setup.update",
        json!({
            "section": "notifications",
            "patch": { "telegramEnabled": false, "lateTemplate": "{studentName} late {date}" }
        }),
    );
    let late_only = s.request_ok(
        "attendance.notifyParents",
        json!({ "classId": class_id, "date": "2026-03-02", "statuses": ["late"] }),
    );
    assert_eq!(late_only["sent"], json!(0));
    assert_eq!(late_only["skipped"], json!(1));
    assert_eq!(fake.recorded().len(), seen.len());
}
