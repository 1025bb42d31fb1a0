use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};

use super::error::{err, ok};
use super::handlers::session;
use super::types::{AppState, Request};
use crate::auth::{self, Role, Session};

pub const ANY_ROLE: &[Role] = &[Role::SuperAdmin, Role::Admin, Role::Teacher];
pub const ADMINS: &[Role] = &[Role::SuperAdmin, Role::Admin];
pub const SUPER_ADMIN: &[Role] = &[Role::SuperAdmin];

#[derive(Debug)]
pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<Value>,
}

impl HandlerErr {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn bad_params(message: impl Into<String>) -> Self {
        Self::new("bad_params", message)
    }

    pub fn not_found(what: &str) -> Self {
        Self::new("not_found", format!("{} not found", what))
    }

    pub fn response(self, id: &str) -> Value {
        err(id, self.code, self.message, self.details)
    }
}

pub fn respond(req: &Request, result: Result<Value, HandlerErr>) -> Value {
    match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

pub fn query_failed(e: rusqlite::Error) -> HandlerErr {
    HandlerErr::new("db_query_failed", e.to_string())
}

pub fn insert_failed(table: &'static str) -> impl Fn(rusqlite::Error) -> HandlerErr {
    move |e| {
        if is_unique_violation(&e) {
            return HandlerErr::new("conflict", format!("duplicate {}", table))
                .with_details(json!({ "table": table }));
        }
        HandlerErr::new("db_insert_failed", e.to_string()).with_details(json!({ "table": table }))
    }
}

pub fn update_failed(table: &'static str) -> impl Fn(rusqlite::Error) -> HandlerErr {
    move |e| {
        if is_unique_violation(&e) {
            return HandlerErr::new("conflict", format!("duplicate {}", table))
                .with_details(json!({ "table": table }));
        }
        HandlerErr::new("db_update_failed", e.to_string()).with_details(json!({ "table": table }))
    }
}

pub fn delete_failed(table: &'static str) -> impl Fn(rusqlite::Error) -> HandlerErr {
    move |e| {
        HandlerErr::new("db_delete_failed", e.to_string()).with_details(json!({ "table": table }))
    }
}

pub fn tx_failed(e: rusqlite::Error) -> HandlerErr {
    HandlerErr::new("db_tx_failed", e.to_string())
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(f, _)
            if f.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

pub fn db_conn(state: &AppState) -> Result<&Connection, HandlerErr> {
    state
        .db
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))
}

/// Re-validates the signed-in account and checks its role.
/// A failed account check signs the caller out.
pub fn authorize(state: &mut AppState, allowed: &[Role]) -> Result<Session, HandlerErr> {
    let Some(current) = state.session.clone() else {
        return Err(HandlerErr::new("unauthenticated", "sign in first"));
    };
    let checked = {
        let conn = db_conn(state)?;
        session::revalidate(conn, &state.config, &current)
    };
    let session = match checked {
        Ok(s) => s,
        Err(e) => {
            session::clear(state);
            return Err(e);
        }
    };
    if !allowed.contains(&session.role) {
        return Err(HandlerErr::new(
            "forbidden",
            format!("{} accounts cannot do this", session.role.as_str()),
        ));
    }
    state.session = Some(session.clone());
    Ok(session)
}

/// Resolves the school an operation applies to. Super-admins name it;
/// everyone else is pinned to their own school.
pub fn school_scope(conn: &Connection, session: &Session, params: &Value) -> Result<String, HandlerErr> {
    let school_id = match session.role {
        Role::SuperAdmin => required_str(params, "schoolId")?,
        _ => session
            .school_id
            .clone()
            .ok_or_else(|| HandlerErr::new("forbidden", "account has no school"))?,
    };
    if !exists(conn, "SELECT 1 FROM schools WHERE id = ?", &school_id)? {
        return Err(HandlerErr::not_found("school"));
    }
    Ok(school_id)
}

pub fn exists(conn: &Connection, sql: &str, id: &str) -> Result<bool, HandlerErr> {
    conn.query_row(sql, [id], |r| r.get::<_, i64>(0))
        .optional()
        .map(|v| v.is_some())
        .map_err(query_failed)
}

#[derive(Debug, Clone)]
pub struct ClassRef {
    pub id: String,
    pub school_id: String,
    pub name: String,
    pub teacher_id: Option<String>,
}

/// Loads a class the caller may act on. Teachers are limited to their own classes.
pub fn class_access(
    conn: &Connection,
    session: &Session,
    class_id: &str,
) -> Result<ClassRef, HandlerErr> {
    let class = conn
        .query_row(
            "SELECT id, school_id, name, teacher_id FROM classes WHERE id = ?",
            [class_id],
            |r| {
                Ok(ClassRef {
                    id: r.get(0)?,
                    school_id: r.get(1)?,
                    name: r.get(2)?,
                    teacher_id: r.get(3)?,
                })
            },
        )
        .optional()
        .map_err(query_failed)?
        .ok_or_else(|| HandlerErr::not_found("class"))?;

    match session.role {
        Role::SuperAdmin => {}
        _ if session.school_id.as_deref() != Some(class.school_id.as_str()) => {
            // Other schools' classes are invisible rather than forbidden.
            return Err(HandlerErr::not_found("class"));
        }
        Role::Teacher if class.teacher_id.as_deref() != Some(session.user_id.as_str()) => {
            return Err(HandlerErr::new("forbidden", "class is not assigned to you"));
        }
        _ => {}
    }
    Ok(class)
}

pub fn required_str(params: &Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

/// `Ok(None)` for absent, null, or blank strings.
pub fn optional_str(params: &Value, key: &str) -> Result<Option<String>, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => {
            let t = s.trim();
            Ok((!t.is_empty()).then(|| t.to_string()))
        }
        // Chat ids are often sent as numbers.
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(_) => Err(HandlerErr::bad_params(format!("{} must be a string", key))),
    }
}

pub fn optional_bool(params: &Value, key: &str) -> Result<Option<bool>, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(_) => Err(HandlerErr::bad_params(format!("{} must be boolean", key))),
    }
}

pub fn required_bool(params: &Value, key: &str) -> Result<bool, HandlerErr> {
    optional_bool(params, key)?.ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

pub fn required_date(params: &Value, key: &str) -> Result<String, HandlerErr> {
    let raw = required_str(params, key)?;
    parse_date_param(&raw, key)
}

pub fn optional_date(params: &Value, key: &str) -> Result<Option<String>, HandlerErr> {
    optional_str(params, key)?
        .map(|raw| parse_date_param(&raw, key))
        .transpose()
}

fn parse_date_param(raw: &str, key: &str) -> Result<String, HandlerErr> {
    auth::parse_date(raw)
        .map(|d| d.format("%Y-%m-%d").to_string())
        .ok_or_else(|| HandlerErr::bad_params(format!("{} must be YYYY-MM-DD", key)))
}

pub fn patch_object<'a>(params: &'a Value) -> Result<&'a serde_json::Map<String, Value>, HandlerErr> {
    params
        .get("patch")
        .and_then(|v| v.as_object())
        .ok_or_else(|| HandlerErr::bad_params("patch must be an object"))
}

pub fn like_pattern(query: &str) -> String {
    let escaped = query
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{}%", escaped)
}

pub fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}
