use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

use crate::auth;
use crate::config::normalize_email;
use crate::ipc::handlers::session::validate_new_password;
use crate::ipc::helpers::{
    authorize, db_conn, delete_failed, insert_failed, like_pattern, now_iso, optional_bool,
    optional_str, patch_object, query_failed, required_bool, required_str, respond,
    school_scope, tx_failed, update_failed, HandlerErr, ADMINS,
};
use crate::ipc::types::{AppState, Request};

const TEACHER_SELECT: &str = "SELECT
       u.id, u.email, u.display_name, u.phone, u.is_active, u.created_at,
       (SELECT COUNT(*) FROM classes c WHERE c.teacher_id = u.id) AS class_count
     FROM users u";

fn teacher_json(r: &rusqlite::Row<'_>) -> rusqlite::Result<Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "email": r.get::<_, String>(1)?,
        "displayName": r.get::<_, String>(2)?,
        "phone": r.get::<_, Option<String>>(3)?,
        "isActive": r.get::<_, i64>(4)? != 0,
        "createdAt": r.get::<_, String>(5)?,
        "classCount": r.get::<_, i64>(6)?,
    }))
}

fn load_teacher(conn: &Connection, school_id: &str, teacher_id: &str) -> Result<Value, HandlerErr> {
    conn.query_row(
        &format!(
            "{} WHERE u.id = ? AND u.school_id = ? AND u.role = 'teacher'",
            TEACHER_SELECT
        ),
        [teacher_id, school_id],
        teacher_json,
    )
    .optional()
    .map_err(query_failed)?
    .ok_or_else(|| HandlerErr::not_found("teacher"))
}

fn teachers_list(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let session = authorize(state, ADMINS)?;
    let conn = db_conn(state)?;
    let school_id = school_scope(conn, &session, params)?;
    let query = optional_str(params, "query")?.map(|q| like_pattern(&q));
    let active = optional_bool(params, "active")?.map(i64::from);

    let mut stmt = conn
        .prepare(&format!(
            "{} WHERE u.school_id = ?1 AND u.role = 'teacher'
               AND (?2 IS NULL OR u.display_name LIKE ?2 ESCAPE '\\' OR u.email LIKE ?2 ESCAPE '\\')
               AND (?3 IS NULL OR u.is_active = ?3)
             ORDER BY u.display_name COLLATE NOCASE",
            TEACHER_SELECT
        ))
        .map_err(query_failed)?;
    let teachers = stmt
        .query_map((&school_id, query, active), teacher_json)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_failed)?;
    Ok(json!({ "teachers": teachers }))
}

fn teachers_create(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let session = authorize(state, ADMINS)?;
    let conn = db_conn(state)?;
    let school_id = school_scope(conn, &session, params)?;
    let email = normalize_email(&required_str(params, "email")?);
    if !email.contains('@') {
        return Err(HandlerErr::bad_params("email must be an email address"));
    }
    let password = validate_new_password(params, "password")?;
    let display_name = required_str(params, "displayName")?;
    let phone = optional_str(params, "phone")?;

    let teacher_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO users(id, email, display_name, phone, role, school_id, password_hash, is_active, created_at)
         VALUES(?, ?, ?, ?, 'teacher', ?, ?, 1, ?)",
        (
            &teacher_id,
            &email,
            &display_name,
            &phone,
            &school_id,
            auth::hash_password(&password),
            now_iso(),
        ),
    )
    .map_err(insert_failed("users"))?;
    info!(school_id = %school_id, "teacher created");
    Ok(json!({ "teacher": load_teacher(conn, &school_id, &teacher_id)? }))
}

fn teachers_update(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let session = authorize(state, ADMINS)?;
    let conn = db_conn(state)?;
    let school_id = school_scope(conn, &session, params)?;
    let teacher_id = required_str(params, "teacherId")?;
    let current = load_teacher(conn, &school_id, &teacher_id)?;
    let patch = Value::Object(patch_object(params)?.clone());

    let mut display_name = current["displayName"].as_str().unwrap_or_default().to_string();
    let mut phone = current["phone"].as_str().map(str::to_string);
    for key in patch.as_object().into_iter().flat_map(|m| m.keys()) {
        match key.as_str() {
            "displayName" => display_name = required_str(&patch, key)?,
            "phone" => phone = optional_str(&patch, key)?,
            other => {
                return Err(HandlerErr::bad_params(format!(
                    "unknown teacher field: {}",
                    other
                )))
            }
        }
    }
    conn.execute(
        "UPDATE users SET display_name = ?, phone = ? WHERE id = ?",
        (&display_name, &phone, &teacher_id),
    )
    .map_err(update_failed("users"))?;
    Ok(json!({ "teacher": load_teacher(conn, &school_id, &teacher_id)? }))
}

fn teachers_set_active(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let session = authorize(state, ADMINS)?;
    let conn = db_conn(state)?;
    let school_id = school_scope(conn, &session, params)?;
    let teacher_id = required_str(params, "teacherId")?;
    let is_active = required_bool(params, "isActive")?;
    load_teacher(conn, &school_id, &teacher_id)?;
    conn.execute(
        "UPDATE users SET is_active = ? WHERE id = ?",
        (i64::from(is_active), &teacher_id),
    )
    .map_err(update_failed("users"))?;
    Ok(json!({ "teacherId": teacher_id, "isActive": is_active }))
}

fn teachers_delete(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let session = authorize(state, ADMINS)?;
    let conn = db_conn(state)?;
    let school_id = school_scope(conn, &session, params)?;
    let teacher_id = required_str(params, "teacherId")?;
    load_teacher(conn, &school_id, &teacher_id)?;

    let tx = conn.unchecked_transaction().map_err(tx_failed)?;
    let unassigned = tx
        .execute(
            "UPDATE classes SET teacher_id = NULL WHERE teacher_id = ?",
            [&teacher_id],
        )
        .map_err(update_failed("classes"))?;
    tx.execute("DELETE FROM users WHERE id = ?", [&teacher_id])
        .map_err(delete_failed("users"))?;
    tx.commit().map_err(tx_failed)?;
    Ok(json!({ "ok": true, "unassignedClasses": unassigned }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "teachers.list" => teachers_list(state, &req.params),
        "teachers.create" => teachers_create(state, &req.params),
        "teachers.update" => teachers_update(state, &req.params),
        "teachers.setActive" => teachers_set_active(state, &req.params),
        "teachers.delete" => teachers_delete(state, &req.params),
        _ => return None,
    };
    Some(respond(req, result))
}
