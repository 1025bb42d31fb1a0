use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

use crate::auth::{self, AccountState, Role, SchoolState, Session};
use crate::config::{normalize_email, Config};
use crate::db;
use crate::ipc::helpers::{
    authorize, db_conn, insert_failed, now_iso, query_failed, required_str, respond,
    update_failed, HandlerErr, ANY_ROLE,
};
use crate::ipc::types::{AppState, Request};

const SESSION_KEY: &str = "session.current";

struct UserRow {
    id: String,
    email: String,
    display_name: String,
    role: String,
    school_id: Option<String>,
    password_hash: String,
    is_active: bool,
    school_active: Option<bool>,
    school_expires_at: Option<String>,
}

const USER_SELECT: &str = "SELECT u.id, u.email, u.display_name, u.role, u.school_id,
        u.password_hash, u.is_active, s.is_active, s.expires_at
     FROM users u
     LEFT JOIN schools s ON s.id = u.school_id";

fn load_user(conn: &Connection, filter: &str, value: &str) -> Result<Option<UserRow>, HandlerErr> {
    conn.query_row(&format!("{} WHERE {}", USER_SELECT, filter), [value], |r| {
        Ok(UserRow {
            id: r.get(0)?,
            email: r.get(1)?,
            display_name: r.get(2)?,
            role: r.get(3)?,
            school_id: r.get(4)?,
            password_hash: r.get(5)?,
            is_active: r.get::<_, i64>(6)? != 0,
            school_active: r.get::<_, Option<i64>>(7)?.map(|v| v != 0),
            school_expires_at: r.get(8)?,
        })
    })
    .optional()
    .map_err(query_failed)
}

/// Runs the account checks against current rows and rebuilds the session.
fn check_user(cfg: &Config, user: &UserRow) -> Result<Session, HandlerErr> {
    let role = auth::resolve_role(&user.role, cfg.is_super_admin(&user.email))
        .map_err(|e| HandlerErr::new(e.code(), e.message()))?;
    let state = AccountState {
        role,
        user_active: user.is_active,
        school: user.school_active.map(|is_active| SchoolState {
            is_active,
            expires_at: user.school_expires_at.clone(),
        }),
    };
    auth::check_account(&state, auth::today())
        .map_err(|e| HandlerErr::new(e.code(), e.message()))?;

    Ok(Session {
        user_id: user.id.clone(),
        email: user.email.clone(),
        display_name: user.display_name.clone(),
        role,
        school_id: if role == Role::SuperAdmin {
            None
        } else {
            user.school_id.clone()
        },
    })
}

pub fn revalidate(conn: &Connection, cfg: &Config, current: &Session) -> Result<Session, HandlerErr> {
    let user = load_user(conn, "u.id = ?", &current.user_id)?.ok_or_else(|| {
        HandlerErr::new(
            auth::AccountError::Disabled.code(),
            "this account no longer exists",
        )
    })?;
    check_user(cfg, &user)
}

pub fn clear(state: &mut AppState) {
    state.session = None;
    if let Some(conn) = state.db.as_ref() {
        if let Err(e) = db::settings_delete(conn, SESSION_KEY) {
            warn!("failed to clear persisted session: {e}");
        }
    }
}

fn persist(conn: &Connection, session: &Session) -> Result<(), HandlerErr> {
    let value = serde_json::to_value(session)
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    db::settings_set_json(conn, SESSION_KEY, &value)
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))
}

/// Picks up a session persisted by an earlier run, if it still passes the checks.
pub fn restore(state: &mut AppState) {
    let Some(conn) = state.db.as_ref() else {
        return;
    };
    let saved = match db::settings_get_json(conn, SESSION_KEY) {
        Ok(v) => v.and_then(|v| serde_json::from_value::<Session>(v).ok()),
        Err(e) => {
            warn!("failed to read persisted session: {e}");
            None
        }
    };
    let Some(saved) = saved else {
        state.session = None;
        return;
    };
    match revalidate(conn, &state.config, &saved) {
        Ok(fresh) => {
            info!(role = fresh.role.as_str(), "restored session");
            if let Err(e) = persist(conn, &fresh) {
                warn!("failed to refresh persisted session: {}", e.message);
            }
            state.session = Some(fresh);
        }
        Err(e) => {
            info!(code = e.code, "persisted session no longer valid");
            clear(state);
        }
    }
}

pub fn session_json(session: Option<&Session>) -> Value {
    session
        .and_then(|s| serde_json::to_value(s).ok())
        .unwrap_or(Value::Null)
}

fn sign_in(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let email = normalize_email(&required_str(params, "email")?);
    let password = params
        .get("password")
        .and_then(|v| v.as_str())
        .ok_or_else(|| HandlerErr::bad_params("missing password"))?;

    let conn = db_conn(state)?;
    let bad = || HandlerErr::new("bad_credentials", "wrong email or password");
    let user = load_user(conn, "u.email = ?", &email)?.ok_or_else(bad)?;
    if !auth::verify_password(password, &user.password_hash) {
        info!("sign-in rejected");
        return Err(bad());
    }
    let session = check_user(&state.config, &user)?;
    persist(conn, &session)?;
    info!(role = session.role.as_str(), "signed in");
    state.session = Some(session.clone());
    Ok(json!({ "session": session }))
}

fn handle_sign_in(state: &mut AppState, req: &Request) -> Value {
    let result = sign_in(state, &req.params);
    if result.is_err() {
        clear(state);
    }
    respond(req, result)
}

fn handle_get(state: &mut AppState, req: &Request) -> Value {
    if state.session.is_none() {
        return respond(req, Ok(json!({ "session": null })));
    }
    let result = authorize(state, ANY_ROLE).map(|s| json!({ "session": s }));
    respond(req, result)
}

fn handle_sign_out(state: &mut AppState, req: &Request) -> Value {
    clear(state);
    respond(req, Ok(json!({ "ok": true })))
}

fn change_password(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let session = authorize(state, ANY_ROLE)?;
    let current = params
        .get("currentPassword")
        .and_then(|v| v.as_str())
        .ok_or_else(|| HandlerErr::bad_params("missing currentPassword"))?;
    let next = validate_new_password(params, "newPassword")?;

    let conn = db_conn(state)?;
    let user = load_user(conn, "u.id = ?", &session.user_id)?
        .ok_or_else(|| HandlerErr::not_found("user"))?;
    if !auth::verify_password(current, &user.password_hash) {
        return Err(HandlerErr::new("bad_credentials", "current password is wrong"));
    }
    conn.execute(
        "UPDATE users SET password_hash = ? WHERE id = ?",
        (auth::hash_password(&next), &session.user_id),
    )
    .map_err(update_failed("users"))?;
    Ok(json!({ "ok": true }))
}

pub fn validate_new_password(params: &Value, key: &str) -> Result<String, HandlerErr> {
    let p = params
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))?;
    if p.chars().count() < auth::MIN_PASSWORD_LEN {
        return Err(HandlerErr::bad_params(format!(
            "{} must be at least {} characters",
            key,
            auth::MIN_PASSWORD_LEN
        )));
    }
    Ok(p.to_string())
}

fn bootstrap_super_admin(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let email = normalize_email(&required_str(params, "email")?);
    let password = validate_new_password(params, "password")?;
    if !state.config.is_super_admin(&email) {
        return Err(HandlerErr::new(
            "forbidden",
            "email is not a configured super-admin",
        ));
    }
    let conn = db_conn(state)?;
    if load_user(conn, "u.email = ?", &email)?.is_some() {
        return Err(HandlerErr::new("conflict", "account already exists"));
    }
    let user_id = Uuid::new_v4().to_string();
    let display_name = params
        .get("displayName")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| email.clone());
    conn.execute(
        "INSERT INTO users(id, email, display_name, role, school_id, password_hash, is_active, created_at)
         VALUES(?, ?, ?, 'superadmin', NULL, ?, 1, ?)",
        (
            &user_id,
            &email,
            &display_name,
            auth::hash_password(&password),
            now_iso(),
        ),
    )
    .map_err(insert_failed("users"))?;
    info!("super-admin account created");
    Ok(json!({ "userId": user_id, "email": email }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "session.signIn" => Some(handle_sign_in(state, req)),
        "session.get" => Some(handle_get(state, req)),
        "session.signOut" => Some(handle_sign_out(state, req)),
        "session.changePassword" => Some(respond(req, change_password(state, &req.params))),
        "users.bootstrapSuperAdmin" => {
            Some(respond(req, bootstrap_super_admin(state, &req.params)))
        }
        _ => None,
    }
}
