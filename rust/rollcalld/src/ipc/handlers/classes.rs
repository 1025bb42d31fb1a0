use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

use crate::auth::{Role, Session};
use crate::ipc::helpers::{
    authorize, class_access, db_conn, delete_failed, insert_failed, now_iso, optional_str,
    patch_object, query_failed, required_str, respond, school_scope, tx_failed, update_failed,
    HandlerErr, ADMINS, ANY_ROLE,
};
use crate::ipc::types::{AppState, Request};

const CLASS_SELECT: &str = "SELECT
       c.id, c.name, c.grade, c.teacher_id, t.display_name, c.created_at,
       (SELECT COUNT(*) FROM students s WHERE s.class_id = c.id) AS student_count,
       (SELECT COUNT(*) FROM students s WHERE s.class_id = c.id AND s.is_active = 1) AS active_count
     FROM classes c
     LEFT JOIN users t ON t.id = c.teacher_id";

fn class_json(r: &rusqlite::Row<'_>) -> rusqlite::Result<Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "name": r.get::<_, String>(1)?,
        "grade": r.get::<_, Option<String>>(2)?,
        "teacherId": r.get::<_, Option<String>>(3)?,
        "teacherName": r.get::<_, Option<String>>(4)?,
        "createdAt": r.get::<_, String>(5)?,
        "studentCount": r.get::<_, i64>(6)?,
        "activeStudentCount": r.get::<_, i64>(7)?,
    }))
}

fn load_class(conn: &Connection, class_id: &str) -> Result<Value, HandlerErr> {
    conn.query_row(&format!("{} WHERE c.id = ?", CLASS_SELECT), [class_id], class_json)
        .optional()
        .map_err(query_failed)?
        .ok_or_else(|| HandlerErr::not_found("class"))
}

/// Assigned teachers must belong to the class's school.
fn check_teacher(conn: &Connection, school_id: &str, teacher_id: &str) -> Result<(), HandlerErr> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM users WHERE id = ? AND school_id = ? AND role = 'teacher'",
            [teacher_id, school_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(query_failed)?;
    if found.is_none() {
        return Err(HandlerErr::bad_params("teacherId is not a teacher of this school")
            .with_details(json!({ "teacherId": teacher_id })));
    }
    Ok(())
}

fn classes_list(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let session = authorize(state, ANY_ROLE)?;
    let conn = db_conn(state)?;
    let school_id = school_scope(conn, &session, params)?;
    let teacher_filter = teacher_filter(&session);

    let mut stmt = conn
        .prepare(&format!(
            "{} WHERE c.school_id = ?1 AND (?2 IS NULL OR c.teacher_id = ?2)
             ORDER BY c.name COLLATE NOCASE",
            CLASS_SELECT
        ))
        .map_err(query_failed)?;
    let classes = stmt
        .query_map((&school_id, teacher_filter), class_json)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_failed)?;
    Ok(json!({ "classes": classes }))
}

pub fn teacher_filter(session: &Session) -> Option<String> {
    (session.role == Role::Teacher).then(|| session.user_id.clone())
}

fn classes_create(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let session = authorize(state, ADMINS)?;
    let conn = db_conn(state)?;
    let school_id = school_scope(conn, &session, params)?;
    let name = required_str(params, "name")?;
    let grade = optional_str(params, "grade")?;
    let teacher_id = optional_str(params, "teacherId")?;
    if let Some(t) = teacher_id.as_deref() {
        check_teacher(conn, &school_id, t)?;
    }

    let class_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO classes(id, school_id, name, grade, teacher_id, created_at)
         VALUES(?, ?, ?, ?, ?, ?)",
        (&class_id, &school_id, &name, &grade, &teacher_id, now_iso()),
    )
    .map_err(insert_failed("classes"))?;
    info!(school_id = %school_id, "class created");
    Ok(json!({ "classId": class_id, "class": load_class(conn, &class_id)? }))
}

fn classes_update(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let session = authorize(state, ADMINS)?;
    let conn = db_conn(state)?;
    let class_id = required_str(params, "classId")?;
    let class = class_access(conn, &session, &class_id)?;
    let patch = Value::Object(patch_object(params)?.clone());

    let (mut name, mut grade) = conn
        .query_row(
            "SELECT name, grade FROM classes WHERE id = ?",
            [&class.id],
            |r| Ok((r.get::<_, String>(0)?, r.get::<_, Option<String>>(1)?)),
        )
        .map_err(query_failed)?;
    for key in patch.as_object().into_iter().flat_map(|m| m.keys()) {
        match key.as_str() {
            "name" => name = required_str(&patch, key)?,
            "grade" => grade = optional_str(&patch, key)?,
            other => return Err(HandlerErr::bad_params(format!("unknown class field: {}", other))),
        }
    }
    conn.execute(
        "UPDATE classes SET name = ?, grade = ? WHERE id = ?",
        (&name, &grade, &class.id),
    )
    .map_err(update_failed("classes"))?;
    Ok(json!({ "class": load_class(conn, &class.id)? }))
}

fn classes_assign_teacher(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let session = authorize(state, ADMINS)?;
    let conn = db_conn(state)?;
    let class_id = required_str(params, "classId")?;
    let class = class_access(conn, &session, &class_id)?;
    if params.get("teacherId").is_none() {
        return Err(HandlerErr::bad_params("missing teacherId (use null to unassign)"));
    }
    let teacher_id = optional_str(params, "teacherId")?;
    if let Some(t) = teacher_id.as_deref() {
        check_teacher(conn, &class.school_id, t)?;
    }
    conn.execute(
        "UPDATE classes SET teacher_id = ? WHERE id = ?",
        (&teacher_id, &class.id),
    )
    .map_err(update_failed("classes"))?;
    Ok(json!({ "class": load_class(conn, &class.id)? }))
}

fn classes_delete(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let session = authorize(state, ADMINS)?;
    let conn = db_conn(state)?;
    let class_id = required_str(params, "classId")?;
    let class = class_access(conn, &session, &class_id)?;

    let tx = conn.unchecked_transaction().map_err(tx_failed)?;
    // Explicitly delete in dependency order (no ON DELETE CASCADE).
    let attendance = tx
        .execute("DELETE FROM attendance WHERE class_id = ?", [&class.id])
        .map_err(delete_failed("attendance"))?;
    let students = tx
        .execute("DELETE FROM students WHERE class_id = ?", [&class.id])
        .map_err(delete_failed("students"))?;
    tx.execute("DELETE FROM classes WHERE id = ?", [&class.id])
        .map_err(delete_failed("classes"))?;
    tx.commit().map_err(tx_failed)?;

    info!(class_id = %class.id, students, attendance, "class deleted");
    Ok(json!({ "ok": true, "deletedStudents": students, "deletedAttendance": attendance }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "classes.list" => classes_list(state, &req.params),
        "classes.create" => classes_create(state, &req.params),
        "classes.update" => classes_update(state, &req.params),
        "classes.assignTeacher" => classes_assign_teacher(state, &req.params),
        "classes.delete" => classes_delete(state, &req.params),
        _ => return None,
    };
    Some(respond(req, result))
}
