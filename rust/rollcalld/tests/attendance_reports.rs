mod test_support;

use serde_json::{json, Value};
use test_support::{create_school, create_student, spawn_sidecar, str_field, temp_dir, Sidecar};

struct Fixture {
    s: Sidecar,
    workspace: std::path::PathBuf,
    class_a: String,
    class_b: String,
    ann: String,
    bo: String,
    cy: String,
}

/// Admin signed in; Tess teaches class A (Ann, Bo), class B has Cy.
fn fixture(prefix: &str) -> Fixture {
    let workspace = temp_dir(prefix);
    let mut s = spawn_sidecar();
    s.select_workspace(&workspace);
    s.sign_in_super_admin();
    let school = create_school(&mut s, "Report School", "head@report.test", None);
    s.sign_in(&school.admin_email, &school.admin_password);
    let teacher = s.request_ok(
        "teachers.create",
        json!({ "email": "tess@report.test", "password": "teach-pass", "displayName": "Tess" }),
    );
    let teacher_id = str_field(&teacher["teacher"], "id");
    let class_a = str_field(
        &s.request_ok("classes.create", json!({ "name": "A", "teacherId": teacher_id })),
        "classId",
    );
    let class_b = str_field(&s.request_ok("classes.create", json!({ "name": "B" })), "classId");
    let ann = create_student(&mut s, &class_a, "Ann", "Lee", json!({ "parentPhone": "555-1" }));
    let bo = create_student(&mut s, &class_a, "Bo", "Kim", json!({}));
    let cy = create_student(&mut s, &class_b, "Cy", "Diaz", json!({}));
    Fixture {
        s,
        workspace,
        class_a,
        class_b,
        ann,
        bo,
        cy,
    }
}

fn mark(s: &mut Sidecar, class_id: &str, date: &str, entries: Value) {
    s.request_ok(
        "attendance.mark",
        json!({ "classId": class_id, "date": date, "entries": entries }),
    );
}

#[test]
fn marking_upserts_one_record_per_student_and_day() {
    let Fixture { mut s, class_a, class_b, ann, bo, cy, .. } = fixture("rollcall-attendance-mark");

    mark(&mut s, &class_a, "2026-03-02", json!([{ "studentId": ann, "status": "absent" }]));
    mark(
        &mut s,
        &class_a,
        "2026-03-02",
        json!([{ "studentId": ann, "status": "LATE", "note": "bus" }]),
    );
    let day = s.request_ok("attendance.day", json!({ "classId": class_a, "date": "2026-03-02" }));
    let students = day["students"].as_array().expect("students");
    // Last-name order: Kim before Lee.
    assert_eq!(students[0]["studentId"], json!(bo));
    assert!(students[0]["status"].is_null());
    assert_eq!(students[1]["status"], json!("late"));
    assert_eq!(students[1]["note"], json!("bus"));
    assert_eq!(day["counts"]["late"], json!(1));
    assert_eq!(day["counts"]["unmarked"], json!(1));

    let history = s.request_ok("attendance.studentHistory", json!({ "studentId": ann }));
    assert_eq!(history["records"].as_array().map(|r| r.len()), Some(1));

    // A student from another class rejects the whole batch.
    let code = s.request_err(
        "attendance.mark",
        json!({
            "classId": class_a,
            "date": "2026-03-03",
            "entries": [
                { "studentId": bo, "status": "present" },
                { "studentId": cy, "status": "present" }
            ]
        }),
    );
    assert_eq!(code, "bad_params");
    let next_day = s.request_ok("attendance.day", json!({ "classId": class_a, "date": "2026-03-03" }));
    assert_eq!(next_day["counts"]["unmarked"], json!(2));

    for bad in [
        json!({ "classId": class_b, "date": "03/03/2026", "entries": [] }),
        json!({ "classId": class_b, "date": "2026-03-03", "entries": [{ "studentId": cy, "status": "sick" }] }),
    ] {
        assert_eq!(s.request_err("attendance.mark", bad), "bad_params");
    }
}

#[test]
fn teachers_mark_only_assigned_classes() {
    let Fixture { mut s, class_a, class_b, ann, cy, .. } = fixture("rollcall-attendance-teacher");
    s.sign_in("tess@report.test", "teach-pass");
    mark(&mut s, &class_a, "2026-03-02", json!([{ "studentId": ann, "status": "present" }]));
    assert_eq!(
        s.request_err(
            "attendance.mark",
            json!({ "classId": class_b, "date": "2026-03-02", "entries": [{ "studentId": cy, "status": "present" }] }),
        ),
        "forbidden"
    );
    assert_eq!(
        s.request_err("attendance.studentHistory", json!({ "studentId": cy })),
        "forbidden"
    );

    // Reports for a teacher only cover assigned classes.
    let report = s.request_ok(
        "reports.attendance",
        json!({ "from": "2026-03-01", "to": "2026-03-31", "fields": ["studentName"] }),
    );
    let names: Vec<&str> = report["rows"]
        .as_array()
        .expect("rows")
        .iter()
        .filter_map(|r| r[0].as_str())
        .collect();
    assert_eq!(names, vec!["Bo Kim", "Ann Lee"]);
}

#[test]
fn summary_and_daily_reports_follow_field_order() {
    let Fixture { mut s, workspace, class_a, class_b, ann, bo, cy } = fixture("rollcall-reports");
    mark(
        &mut s,
        &class_a,
        "2026-03-02",
        json!([{ "studentId": ann, "status": "present" }, { "studentId": bo, "status": "absent" }]),
    );
    mark(
        &mut s,
        &class_a,
        "2026-03-03",
        json!([{ "studentId": ann, "status": "late" }, { "studentId": bo, "status": "excused", "note": "dentist, 9am" }]),
    );
    mark(&mut s, &class_a, "2026-03-04", json!([{ "studentId": ann, "status": "absent" }]));
    mark(&mut s, &class_b, "2026-04-01", json!([{ "studentId": cy, "status": "present" }]));

    let summary = s.request_ok(
        "reports.attendance",
        json!({
            "classId": class_a,
            "from": "2026-03-01",
            "to": "2026-03-31",
            "fields": ["attendanceRate", "studentName", "total", "studentName"]
        }),
    );
    assert_eq!(summary["template"], json!("summary"));
    assert_eq!(
        summary["columns"],
        json!([
            { "key": "attendanceRate", "label": "Attendance %" },
            { "key": "studentName", "label": "Student" },
            { "key": "total", "label": "Total" }
        ])
    );
    assert_eq!(
        summary["rows"],
        json!([[0.0, "Bo Kim", 2], [66.7, "Ann Lee", 3]])
    );

    // The whole school without class filter; Cy has no records in range.
    let school_wide = s.request_ok(
        "reports.attendance",
        json!({ "from": "2026-03-01", "to": "2026-03-31", "fields": ["studentName", "attendanceRate"] }),
    );
    assert_eq!(school_wide["rows"].as_array().map(|r| r.len()), Some(3));
    assert_eq!(school_wide["rows"][2], json!(["Cy Diaz", null]));

    // Saved field order applies when the call does not pass one.
    s.request_ok(
        "setup.update",
        json!({ "section": "reports", "patch": { "dailyFields": ["status", "studentName", "note"] } }),
    );
    let daily = s.request_ok(
        "reports.attendance",
        json!({ "classId": class_a, "template": "daily", "from": "2026-03-03", "to": "2026-03-03" }),
    );
    assert_eq!(
        daily["rows"],
        json!([["excused", "Bo Kim", "dentist, 9am"], ["late", "Ann Lee", null]])
    );

    assert_eq!(
        s.request_err(
            "reports.attendance",
            json!({ "from": "2026-03-01", "to": "2026-03-31", "fields": ["status"] }),
        ),
        "bad_params"
    );
    assert_eq!(
        s.request_err(
            "reports.attendance",
            json!({ "from": "2026-03-31", "to": "2026-03-01" }),
        ),
        "bad_params"
    );

    let out = workspace.join("exports").join("daily.csv");
    let exported = s.request_ok(
        "reports.exportCsv",
        json!({
            "classId": class_a,
            "template": "daily",
            "from": "2026-03-03",
            "to": "2026-03-03",
            "outPath": out.to_string_lossy()
        }),
    );
    assert_eq!(exported["rowCount"], json!(2));
    let text = std::fs::read_to_string(&out).expect("read csv");
    assert_eq!(
        text,
        "Status,Student,Note\nexcused,Bo Kim,\"dentist, 9am\"\nlate,Ann Lee,\n"
    );
}

#[test]
fn inactive_students_are_hidden_unless_configured() {
    let Fixture { mut s, class_a, ann, bo, .. } = fixture("rollcall-reports-inactive");
    mark(&mut s, &class_a, "2026-03-02", json!([{ "studentId": bo, "status": "present" }]));
    s.request_ok("students.setActive", json!({ "studentId": bo, "isActive": false }));

    let params = json!({ "classId": class_a, "from": "2026-03-01", "to": "2026-03-31", "fields": ["studentName"] });
    let hidden = s.request_ok("reports.attendance", params.clone());
    assert_eq!(hidden["rows"], json!([["Ann Lee"]]));

    s.request_ok(
        "setup.update",
        json!({ "section": "reports", "patch": { "includeInactiveStudents": true } }),
    );
    let shown = s.request_ok("reports.attendance", params);
    assert_eq!(shown["rows"], json!([["Bo Kim"], ["Ann Lee"]]));

    let day = s.request_ok("attendance.day", json!({ "classId": class_a, "date": "2026-03-02" }));
    assert_eq!(day["students"].as_array().map(|a| a.len()), Some(1));
    assert_eq!(day["students"][0]["studentId"], json!(ann));
}
