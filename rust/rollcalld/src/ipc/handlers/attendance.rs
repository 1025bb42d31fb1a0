use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use std::collections::HashMap;
use tracing::info;
use uuid::Uuid;

use crate::ipc::handlers::notifications::{log_delivery, Delivery, CHANNEL_PUSH, CHANNEL_TELEGRAM};
use crate::ipc::handlers::setup::{load_section_or_err, SetupSection, ATTENDANCE_STATUSES};
use crate::ipc::handlers::students::student_access;
use crate::ipc::helpers::{
    authorize, class_access, db_conn, insert_failed, now_iso, optional_date, optional_str,
    query_failed, required_date, required_str, respond, tx_failed, ClassRef, HandlerErr, ANY_ROLE,
};
use crate::ipc::types::{AppState, Request};
use crate::notify::{onesignal, telegram, template, HttpResponse, NotifyError};
use crate::report::StatusCounts;

fn parse_status(raw: &str) -> Result<String, HandlerErr> {
    let s = raw.trim().to_ascii_lowercase();
    if !ATTENDANCE_STATUSES.contains(&s.as_str()) {
        return Err(HandlerErr::bad_params(format!(
            "status must be one of: {}",
            ATTENDANCE_STATUSES.join(", ")
        )));
    }
    Ok(s)
}

struct MarkEntry {
    student_id: String,
    status: String,
    note: Option<String>,
}

fn parse_entries(params: &Value) -> Result<Vec<MarkEntry>, HandlerErr> {
    let arr = params
        .get("entries")
        .and_then(|v| v.as_array())
        .ok_or_else(|| HandlerErr::bad_params("entries must be an array"))?;
    let mut out = Vec::with_capacity(arr.len());
    for (i, e) in arr.iter().enumerate() {
        let student_id = required_str(e, "studentId")
            .map_err(|err| err.with_details(json!({ "index": i })))?;
        let status = required_str(e, "status")
            .and_then(|s| parse_status(&s))
            .map_err(|err| err.with_details(json!({ "index": i, "studentId": student_id })))?;
        let note = optional_str(e, "note")?;
        out.push(MarkEntry {
            student_id,
            status,
            note,
        });
    }
    Ok(out)
}

fn class_of_student(conn: &Connection, student_id: &str) -> Result<Option<String>, HandlerErr> {
    conn.query_row(
        "SELECT class_id FROM students WHERE id = ?",
        [student_id],
        |r| r.get(0),
    )
    .optional()
    .map_err(query_failed)
}

fn attendance_mark(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let session = authorize(state, ANY_ROLE)?;
    let conn = db_conn(state)?;
    let class_id = required_str(params, "classId")?;
    let class = class_access(conn, &session, &class_id)?;
    let date = required_date(params, "date")?;
    let entries = parse_entries(params)?;

    for e in &entries {
        if class_of_student(conn, &e.student_id)?.as_deref() != Some(class.id.as_str()) {
            return Err(HandlerErr::bad_params("student is not in this class")
                .with_details(json!({ "studentId": e.student_id })));
        }
    }

    let now = now_iso();
    let tx = conn.unchecked_transaction().map_err(tx_failed)?;
    for e in &entries {
        tx.execute(
            "INSERT INTO attendance(id, school_id, class_id, student_id, date, status, note, marked_by, updated_at)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(student_id, date) DO UPDATE SET
               class_id = excluded.class_id,
               status = excluded.status,
               note = excluded.note,
               marked_by = excluded.marked_by,
               updated_at = excluded.updated_at",
            (
                Uuid::new_v4().to_string(),
                &class.school_id,
                &class.id,
                &e.student_id,
                &date,
                &e.status,
                &e.note,
                &session.user_id,
                &now,
            ),
        )
        .map_err(insert_failed("attendance"))?;
    }
    tx.commit().map_err(tx_failed)?;

    info!(class_id = %class.id, date = %date, count = entries.len(), "attendance marked");
    Ok(json!({ "ok": true, "marked": entries.len() }))
}

fn attendance_day(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let session = authorize(state, ANY_ROLE)?;
    let conn = db_conn(state)?;
    let class_id = required_str(params, "classId")?;
    let class = class_access(conn, &session, &class_id)?;
    let date = required_date(params, "date")?;

    let mut stmt = conn
        .prepare(
            "SELECT s.id, s.first_name, s.last_name, a.status, a.note
             FROM students s
             LEFT JOIN attendance a ON a.student_id = s.id AND a.date = ?2
             WHERE s.class_id = ?1 AND s.is_active = 1
             ORDER BY s.last_name COLLATE NOCASE, s.first_name COLLATE NOCASE",
        )
        .map_err(query_failed)?;
    let mut counts = StatusCounts::default();
    let mut unmarked = 0_i64;
    let students = stmt
        .query_map((&class.id, &date), |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, Option<String>>(3)?,
                r.get::<_, Option<String>>(4)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_failed)?
        .into_iter()
        .map(|(id, first, last, status, note)| {
            match status.as_deref() {
                Some(s) => counts.add(s),
                None => unmarked += 1,
            }
            json!({
                "studentId": id,
                "firstName": first,
                "lastName": last,
                "displayName": format!("{} {}", first, last),
                "status": status,
                "note": note,
            })
        })
        .collect::<Vec<_>>();

    let mut summary = counts.to_json();
    summary["unmarked"] = json!(unmarked);
    Ok(json!({
        "classId": class.id,
        "className": class.name,
        "date": date,
        "students": students,
        "counts": summary,
    }))
}

fn attendance_student_history(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let session = authorize(state, ANY_ROLE)?;
    let conn = db_conn(state)?;
    let student_id = required_str(params, "studentId")?;
    let student = student_access(conn, &session, &student_id)?;
    let from = optional_date(params, "from")?;
    let to = optional_date(params, "to")?;

    let mut stmt = conn
        .prepare(
            "SELECT a.date, a.status, a.note, a.class_id, c.name
             FROM attendance a
             LEFT JOIN classes c ON c.id = a.class_id
             WHERE a.student_id = ?1
               AND (?2 IS NULL OR a.date >= ?2)
               AND (?3 IS NULL OR a.date <= ?3)
             ORDER BY a.date",
        )
        .map_err(query_failed)?;
    let mut counts = StatusCounts::default();
    let records = stmt
        .query_map((&student.id, &from, &to), |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, Option<String>>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, Option<String>>(4)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_failed)?
        .into_iter()
        .map(|(date, status, note, class_id, class_name)| {
            counts.add(&status);
            json!({
                "date": date,
                "status": status,
                "note": note,
                "classId": class_id,
                "className": class_name,
            })
        })
        .collect::<Vec<_>>();

    Ok(json!({
        "studentId": student.id,
        "records": records,
        "counts": counts.to_json(),
        "attendanceRate": counts.attendance_rate(),
    }))
}

struct Recipient {
    student_id: String,
    student_name: String,
    parent_name: Option<String>,
    telegram_chat_id: Option<String>,
    push_player_id: Option<String>,
    status: String,
}

fn recipients(
    conn: &Connection,
    class: &ClassRef,
    date: &str,
    statuses: &[String],
) -> Result<Vec<Recipient>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT s.id, s.first_name, s.last_name, s.parent_name, s.telegram_chat_id,
                    s.push_player_id, a.status
             FROM attendance a
             JOIN students s ON s.id = a.student_id
             WHERE a.class_id = ? AND a.date = ? AND s.is_active = 1
             ORDER BY s.last_name COLLATE NOCASE, s.first_name COLLATE NOCASE",
        )
        .map_err(query_failed)?;
    let rows = stmt
        .query_map((&class.id, date), |r| {
            Ok(Recipient {
                student_id: r.get(0)?,
                student_name: format!("{} {}", r.get::<_, String>(1)?, r.get::<_, String>(2)?),
                parent_name: r.get(3)?,
                telegram_chat_id: r.get(4)?,
                push_player_id: r.get(5)?,
                status: r.get(6)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_failed)?;
    Ok(rows
        .into_iter()
        .filter(|r| statuses.contains(&r.status))
        .collect())
}

fn requested_statuses(params: &Value, settings: &Value) -> Result<Vec<String>, HandlerErr> {
    let source = match params.get("statuses") {
        None | Some(Value::Null) => settings.get("notifyStatuses").cloned().unwrap_or(Value::Null),
        Some(v) => v.clone(),
    };
    let arr = source
        .as_array()
        .ok_or_else(|| HandlerErr::bad_params("statuses must be an array of strings"))?;
    arr.iter()
        .map(|v| {
            v.as_str()
                .ok_or_else(|| HandlerErr::bad_params("statuses must be an array of strings"))
                .and_then(parse_status)
        })
        .collect()
}

fn attendance_notify_parents(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let session = authorize(state, ANY_ROLE)?;
    let conn = db_conn(state)?;
    let class_id = required_str(params, "classId")?;
    let class = class_access(conn, &session, &class_id)?;
    let date = required_date(params, "date")?;
    let settings = load_section_or_err(conn, SetupSection::Notifications, &class.school_id)?;
    let statuses = requested_statuses(params, &settings)?;

    let telegram_on = settings["telegramEnabled"].as_bool().unwrap_or(false)
        && state.config.telegram_configured();
    let push_on = settings["pushEnabled"].as_bool().unwrap_or(false)
        && state.config.push_configured();
    let school_name: String = conn
        .query_row(
            "SELECT name FROM schools WHERE id = ?",
            [&class.school_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(query_failed)?
        .unwrap_or_default();

    let mut sent = 0_i64;
    let mut failed = 0_i64;
    let mut skipped = 0_i64;
    let mut results = Vec::new();

    for r in recipients(conn, &class, &date, &statuses)? {
        let vars: HashMap<&str, String> = HashMap::from([
            ("studentName", r.student_name.clone()),
            ("parentName", r.parent_name.clone().unwrap_or_else(|| "parent".into())),
            ("className", class.name.clone()),
            ("date", date.clone()),
            ("status", r.status.clone()),
            ("schoolName", school_name.clone()),
        ]);
        let tpl = settings
            .get(format!("{}Template", r.status).as_str())
            .and_then(|v| v.as_str())
            .unwrap_or("{studentName}: {status} on {date}");
        let message = template::render(tpl, &vars);

        let mut attempted = false;
        if let Some(chat_id) = r.telegram_chat_id.as_deref().filter(|_| telegram_on) {
            attempted = true;
            let result = telegram::send_message(state.sender.as_ref(), &state.config, chat_id, &message);
            log_delivery(
                conn,
                &Delivery {
                    school_id: Some(&class.school_id),
                    channel: CHANNEL_TELEGRAM,
                    target: chat_id,
                    student_id: Some(&r.student_id),
                    message: &message,
                },
                &result,
            );
            results.push(delivery_result(&r.student_id, CHANNEL_TELEGRAM, &result));
            if result.is_ok() {
                sent += 1;
            } else {
                failed += 1;
            }
        }
        if let Some(player_id) = r.push_player_id.as_deref().filter(|_| push_on) {
            attempted = true;
            let action = onesignal::PushAction::Send {
                notification: onesignal::player_notification(player_id, &school_name, &message),
            };
            let result = onesignal::dispatch(state.sender.as_ref(), &state.config, &action);
            log_delivery(
                conn,
                &Delivery {
                    school_id: Some(&class.school_id),
                    channel: CHANNEL_PUSH,
                    target: player_id,
                    student_id: Some(&r.student_id),
                    message: &message,
                },
                &result,
            );
            results.push(delivery_result(&r.student_id, CHANNEL_PUSH, &result));
            if result.is_ok() {
                sent += 1;
            } else {
                failed += 1;
            }
        }
        if !attempted {
            skipped += 1;
        }
    }

    info!(class_id = %class.id, date = %date, sent, failed, skipped, "parent notifications sent");
    Ok(json!({
        "sent": sent,
        "failed": failed,
        "skipped": skipped,
        "results": results,
    }))
}

fn delivery_result(
    student_id: &str,
    channel: &str,
    result: &Result<HttpResponse, NotifyError>,
) -> Value {
    match result {
        Ok(_) => json!({ "studentId": student_id, "channel": channel, "ok": true }),
        Err(e) => json!({
            "studentId": student_id,
            "channel": channel,
            "ok": false,
            "error": { "code": e.code(), "message": e.to_string() },
        }),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "attendance.mark" => attendance_mark(state, &req.params),
        "attendance.day" => attendance_day(state, &req.params),
        "attendance.studentHistory" => attendance_student_history(state, &req.params),
        "attendance.notifyParents" => attendance_notify_parents(state, &req.params),
        _ => return None,
    };
    Some(respond(req, result))
}
