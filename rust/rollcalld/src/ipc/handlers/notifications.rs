use rusqlite::Connection;
use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

use crate::auth::Role;
use crate::ipc::helpers::{
    authorize, db_conn, now_iso, optional_str, query_failed, required_str, respond, HandlerErr,
    ADMINS,
};
use crate::ipc::types::{AppState, Request};
use crate::notify::{onesignal, telegram, HttpResponse, NotifyError};

pub const CHANNEL_PUSH: &str = "push";
pub const CHANNEL_TELEGRAM: &str = "telegram";

pub struct Delivery<'a> {
    pub school_id: Option<&'a str>,
    pub channel: &'static str,
    pub target: &'a str,
    pub student_id: Option<&'a str>,
    pub message: &'a str,
}

/// Records an outbound send. Logging failures never fail the send itself.
pub fn log_delivery(conn: &Connection, d: &Delivery<'_>, result: &Result<HttpResponse, NotifyError>) {
    let (ok, status, error) = match result {
        Ok(resp) => (true, Some(resp.status), None),
        Err(e) => (false, e.status(), Some(e.to_string())),
    };
    if let Some(e) = error.as_deref() {
        warn!(channel = d.channel, error = %e, "notification delivery failed");
    }
    if let Err(e) = conn.execute(
        "INSERT INTO notification_log(id, school_id, channel, target, student_id, message, ok, status, error, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            Uuid::new_v4().to_string(),
            d.school_id,
            d.channel,
            d.target,
            d.student_id,
            d.message,
            i64::from(ok),
            status.map(i64::from),
            &error,
            now_iso(),
        ),
    ) {
        warn!("failed to write notification log: {e}");
    }
}

pub fn notify_err(e: NotifyError) -> HandlerErr {
    let details = e.details();
    let mut out = HandlerErr::new(e.code(), e.to_string());
    out.details = details;
    out
}

fn push(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let session = authorize(state, ADMINS)?;
    let conn = db_conn(state)?;
    let action = onesignal::PushAction::parse(params).map_err(notify_err)?;
    info!(action = action.name(), "push proxy request");

    let result = onesignal::dispatch(state.sender.as_ref(), &state.config, &action);
    if let onesignal::PushAction::Send { notification } = &action {
        let message = notification
            .get("contents")
            .map(|c| c.to_string())
            .unwrap_or_default();
        log_delivery(
            conn,
            &Delivery {
                school_id: session.school_id.as_deref(),
                channel: CHANNEL_PUSH,
                target: "segment",
                student_id: None,
                message: &message,
            },
            &result,
        );
    }
    let resp = result.map_err(notify_err)?;
    Ok(json!({ "action": action.name(), "status": resp.status, "body": resp.body }))
}

fn telegram_send(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let session = authorize(state, ADMINS)?;
    let conn = db_conn(state)?;
    let chat_id = optional_str(params, "chatId")?
        .ok_or_else(|| HandlerErr::bad_params("missing chatId"))?;
    let text = required_str(params, "text")?;

    let result = telegram::send_message(state.sender.as_ref(), &state.config, &chat_id, &text);
    log_delivery(
        conn,
        &Delivery {
            school_id: session.school_id.as_deref(),
            channel: CHANNEL_TELEGRAM,
            target: &chat_id,
            student_id: None,
            message: &text,
        },
        &result,
    );
    let resp = result.map_err(notify_err)?;
    Ok(json!({ "status": resp.status, "body": resp.body }))
}

fn history(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let session = authorize(state, ADMINS)?;
    let conn = db_conn(state)?;
    let limit = params
        .get("limit")
        .and_then(|v| v.as_i64())
        .unwrap_or(100)
        .clamp(1, 1000);
    // Super-admins see everything; admins only their school.
    let school_filter = match session.role {
        Role::SuperAdmin => optional_str(params, "schoolId")?,
        _ => session.school_id.clone(),
    };

    let mut stmt = conn
        .prepare(
            "SELECT id, school_id, channel, target, student_id, message, ok, status, error, created_at
             FROM notification_log
             WHERE (?1 IS NULL OR school_id = ?1)
             ORDER BY created_at DESC, rowid DESC
             LIMIT ?2",
        )
        .map_err(query_failed)?;
    let entries = stmt
        .query_map((school_filter, limit), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "schoolId": r.get::<_, Option<String>>(1)?,
                "channel": r.get::<_, String>(2)?,
                "target": r.get::<_, String>(3)?,
                "studentId": r.get::<_, Option<String>>(4)?,
                "message": r.get::<_, String>(5)?,
                "ok": r.get::<_, i64>(6)? != 0,
                "status": r.get::<_, Option<i64>>(7)?,
                "error": r.get::<_, Option<String>>(8)?,
                "createdAt": r.get::<_, String>(9)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_failed)?;
    Ok(json!({ "entries": entries }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "notifications.push" => push(state, &req.params),
        "notifications.telegram" => telegram_send(state, &req.params),
        "notifications.history" => history(state, &req.params),
        _ => return None,
    };
    Some(respond(req, result))
}
