use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

use crate::auth;
use crate::config::normalize_email;
use crate::ipc::handlers::session::validate_new_password;
use crate::ipc::handlers::setup;
use crate::ipc::helpers::{
    authorize, db_conn, delete_failed, insert_failed, like_pattern, now_iso, optional_bool,
    optional_date, optional_str, patch_object, query_failed, required_bool, required_str,
    respond, school_scope, tx_failed, update_failed, HandlerErr, ANY_ROLE, SUPER_ADMIN,
};
use crate::ipc::types::{AppState, Request};

const SCHOOL_SELECT: &str = "SELECT
       s.id, s.name, s.address, s.phone, s.is_active, s.expires_at, s.created_at,
       u.email, u.display_name,
       (SELECT COUNT(*) FROM classes c WHERE c.school_id = s.id) AS class_count,
       (SELECT COUNT(*) FROM students st WHERE st.school_id = s.id) AS student_count,
       (SELECT COUNT(*) FROM users t WHERE t.school_id = s.id AND t.role = 'teacher') AS teacher_count
     FROM schools s
     LEFT JOIN users u ON u.id = s.id";

fn school_json(r: &rusqlite::Row<'_>) -> rusqlite::Result<Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "name": r.get::<_, String>(1)?,
        "address": r.get::<_, Option<String>>(2)?,
        "phone": r.get::<_, Option<String>>(3)?,
        "isActive": r.get::<_, i64>(4)? != 0,
        "expiresAt": r.get::<_, Option<String>>(5)?,
        "createdAt": r.get::<_, String>(6)?,
        "adminEmail": r.get::<_, Option<String>>(7)?,
        "adminName": r.get::<_, Option<String>>(8)?,
        "classCount": r.get::<_, i64>(9)?,
        "studentCount": r.get::<_, i64>(10)?,
        "teacherCount": r.get::<_, i64>(11)?,
    }))
}

fn load_school(conn: &Connection, school_id: &str) -> Result<Value, HandlerErr> {
    conn.query_row(
        &format!("{} WHERE s.id = ?", SCHOOL_SELECT),
        [school_id],
        school_json,
    )
    .optional()
    .map_err(query_failed)?
    .ok_or_else(|| HandlerErr::not_found("school"))
}

fn schools_list(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    authorize(state, SUPER_ADMIN)?;
    let conn = db_conn(state)?;
    let query = optional_str(params, "query")?.map(|q| like_pattern(&q));
    let active = optional_bool(params, "active")?.map(i64::from);

    let mut stmt = conn
        .prepare(&format!(
            "{} WHERE (?1 IS NULL OR s.name LIKE ?1 ESCAPE '\\' OR u.email LIKE ?1 ESCAPE '\\')
               AND (?2 IS NULL OR s.is_active = ?2)
             ORDER BY s.name COLLATE NOCASE",
            SCHOOL_SELECT
        ))
        .map_err(query_failed)?;
    let schools = stmt
        .query_map((query, active), school_json)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_failed)?;
    Ok(json!({ "schools": schools }))
}

fn schools_create(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    authorize(state, SUPER_ADMIN)?;
    let name = required_str(params, "name")?;
    let admin_email = normalize_email(&required_str(params, "adminEmail")?);
    if !admin_email.contains('@') {
        return Err(HandlerErr::bad_params("adminEmail must be an email address"));
    }
    let admin_password = validate_new_password(params, "adminPassword")?;
    let admin_name = optional_str(params, "adminName")?.unwrap_or_else(|| name.clone());
    let address = optional_str(params, "address")?;
    let phone = optional_str(params, "phone")?;
    let expires_at = optional_date(params, "expiresAt")?;

    let conn = db_conn(state)?;
    let school_id = Uuid::new_v4().to_string();
    let now = now_iso();
    let tx = conn.unchecked_transaction().map_err(tx_failed)?;
    tx.execute(
        "INSERT INTO users(id, email, display_name, role, school_id, password_hash, is_active, created_at)
         VALUES(?, ?, ?, 'admin', ?, ?, 1, ?)",
        (
            &school_id,
            &admin_email,
            &admin_name,
            &school_id,
            auth::hash_password(&admin_password),
            &now,
        ),
    )
    .map_err(insert_failed("users"))?;
    tx.execute(
        "INSERT INTO schools(id, name, address, phone, is_active, expires_at, created_at)
         VALUES(?, ?, ?, ?, 1, ?, ?)",
        (&school_id, &name, &address, &phone, &expires_at, &now),
    )
    .map_err(insert_failed("schools"))?;
    tx.commit().map_err(tx_failed)?;

    info!(school_id = %school_id, "school created");
    Ok(json!({ "schoolId": school_id, "adminUserId": school_id, "school": load_school(conn, &school_id)? }))
}

fn schools_get(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let session = authorize(state, ANY_ROLE)?;
    let conn = db_conn(state)?;
    let school_id = school_scope(conn, &session, params)?;
    Ok(json!({ "school": load_school(conn, &school_id)? }))
}

fn schools_update(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    authorize(state, SUPER_ADMIN)?;
    let conn = db_conn(state)?;
    let school_id = required_str(params, "schoolId")?;
    let patch = Value::Object(patch_object(params)?.clone());

    let (mut name, mut address, mut phone) = conn
        .query_row(
            "SELECT name, address, phone FROM schools WHERE id = ?",
            [&school_id],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, Option<String>>(1)?,
                    r.get::<_, Option<String>>(2)?,
                ))
            },
        )
        .optional()
        .map_err(query_failed)?
        .ok_or_else(|| HandlerErr::not_found("school"))?;

    for key in patch.as_object().into_iter().flat_map(|m| m.keys()) {
        match key.as_str() {
            "name" => name = required_str(&patch, key)?,
            "address" => address = optional_str(&patch, key)?,
            "phone" => phone = optional_str(&patch, key)?,
            other => return Err(HandlerErr::bad_params(format!("unknown school field: {}", other))),
        }
    }
    conn.execute(
        "UPDATE schools SET name = ?, address = ?, phone = ? WHERE id = ?",
        (&name, &address, &phone, &school_id),
    )
    .map_err(update_failed("schools"))?;
    Ok(json!({ "school": load_school(conn, &school_id)? }))
}

fn schools_set_active(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    authorize(state, SUPER_ADMIN)?;
    let conn = db_conn(state)?;
    let school_id = required_str(params, "schoolId")?;
    let is_active = required_bool(params, "isActive")?;
    let changed = conn
        .execute(
            "UPDATE schools SET is_active = ? WHERE id = ?",
            (i64::from(is_active), &school_id),
        )
        .map_err(update_failed("schools"))?;
    if changed == 0 {
        return Err(HandlerErr::not_found("school"));
    }
    info!(school_id = %school_id, is_active, "school active flag changed");
    Ok(json!({ "schoolId": school_id, "isActive": is_active }))
}

fn schools_set_expiry(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    authorize(state, SUPER_ADMIN)?;
    let conn = db_conn(state)?;
    let school_id = required_str(params, "schoolId")?;
    if params.get("expiresAt").is_none() {
        return Err(HandlerErr::bad_params("missing expiresAt (use null to clear)"));
    }
    let expires_at = optional_date(params, "expiresAt")?;
    let changed = conn
        .execute(
            "UPDATE schools SET expires_at = ? WHERE id = ?",
            (&expires_at, &school_id),
        )
        .map_err(update_failed("schools"))?;
    if changed == 0 {
        return Err(HandlerErr::not_found("school"));
    }
    Ok(json!({ "schoolId": school_id, "expiresAt": expires_at }))
}

fn schools_delete(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    authorize(state, SUPER_ADMIN)?;
    let conn = db_conn(state)?;
    let school_id = required_str(params, "schoolId")?;
    load_school(conn, &school_id)?;

    let tx = conn.unchecked_transaction().map_err(tx_failed)?;
    // Dependency order; there is no ON DELETE CASCADE.
    for (table, sql) in [
        ("notification_log", "DELETE FROM notification_log WHERE school_id = ?"),
        ("attendance", "DELETE FROM attendance WHERE school_id = ?"),
        ("students", "DELETE FROM students WHERE school_id = ?"),
        ("classes", "DELETE FROM classes WHERE school_id = ?"),
        ("users", "DELETE FROM users WHERE school_id = ?"),
        ("schools", "DELETE FROM schools WHERE id = ?"),
    ] {
        tx.execute(sql, [&school_id]).map_err(delete_failed(table))?;
    }
    setup::delete_school_sections(&tx, &school_id).map_err(|e| {
        HandlerErr::new("db_delete_failed", e.to_string()).with_details(json!({ "table": "settings" }))
    })?;
    tx.commit().map_err(tx_failed)?;

    info!(school_id = %school_id, "school deleted");
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "schools.list" => schools_list(state, &req.params),
        "schools.create" => schools_create(state, &req.params),
        "schools.get" => schools_get(state, &req.params),
        "schools.update" => schools_update(state, &req.params),
        "schools.setActive" => schools_set_active(state, &req.params),
        "schools.setExpiry" => schools_set_expiry(state, &req.params),
        "schools.delete" => schools_delete(state, &req.params),
        _ => return None,
    };
    Some(respond(req, result))
}
