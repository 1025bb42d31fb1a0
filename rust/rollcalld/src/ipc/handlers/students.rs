use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::{info, warn};
use uuid::Uuid;

use crate::auth::Session;
use crate::import::{self, StudentDraft};
use crate::ipc::handlers::classes::teacher_filter;
use crate::ipc::helpers::{
    authorize, class_access, db_conn, delete_failed, insert_failed, like_pattern, now_iso,
    optional_bool, optional_str, patch_object, query_failed, required_bool, required_str,
    respond, school_scope, tx_failed, update_failed, HandlerErr, ADMINS, ANY_ROLE,
};
use crate::ipc::types::{AppState, Request};

const STUDENT_SELECT: &str = "SELECT
       s.id, s.class_id, c.name, s.first_name, s.last_name, s.parent_name, s.parent_phone,
       s.telegram_chat_id, s.push_player_id, s.is_active, s.created_at
     FROM students s
     JOIN classes c ON c.id = s.class_id";

fn student_json(r: &rusqlite::Row<'_>) -> rusqlite::Result<Value> {
    let first: String = r.get(3)?;
    let last: String = r.get(4)?;
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "classId": r.get::<_, String>(1)?,
        "className": r.get::<_, String>(2)?,
        "firstName": first,
        "lastName": last,
        "displayName": format!("{} {}", first, last),
        "parentName": r.get::<_, Option<String>>(5)?,
        "parentPhone": r.get::<_, Option<String>>(6)?,
        "telegramChatId": r.get::<_, Option<String>>(7)?,
        "pushPlayerId": r.get::<_, Option<String>>(8)?,
        "isActive": r.get::<_, i64>(9)? != 0,
        "createdAt": r.get::<_, String>(10)?,
    }))
}

#[derive(Debug, Clone)]
pub struct StudentRef {
    pub id: String,
    pub class_id: String,
}

/// Loads a student through its class so the caller's class access applies.
pub fn student_access(
    conn: &Connection,
    session: &Session,
    student_id: &str,
) -> Result<StudentRef, HandlerErr> {
    let class_id: String = conn
        .query_row(
            "SELECT class_id FROM students WHERE id = ?",
            [student_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(query_failed)?
        .ok_or_else(|| HandlerErr::not_found("student"))?;
    class_access(conn, session, &class_id).map_err(|e| {
        if e.code == "not_found" {
            HandlerErr::not_found("student")
        } else {
            e
        }
    })?;
    Ok(StudentRef {
        id: student_id.to_string(),
        class_id,
    })
}

fn load_student(conn: &Connection, student_id: &str) -> Result<Value, HandlerErr> {
    conn.query_row(
        &format!("{} WHERE s.id = ?", STUDENT_SELECT),
        [student_id],
        student_json,
    )
    .optional()
    .map_err(query_failed)?
    .ok_or_else(|| HandlerErr::not_found("student"))
}

fn insert_student(conn: &Connection, school_id: &str, d: &StudentDraft) -> rusqlite::Result<String> {
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO students(
            id, school_id, class_id, first_name, last_name, parent_name, parent_phone,
            telegram_chat_id, push_player_id, is_active, created_at
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, 1, ?)",
        (
            &id,
            school_id,
            &d.class_id,
            &d.first_name,
            &d.last_name,
            &d.parent_name,
            &d.parent_phone,
            &d.telegram_chat_id,
            &d.push_player_id,
            now_iso(),
        ),
    )?;
    Ok(id)
}

fn students_list(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let session = authorize(state, ANY_ROLE)?;
    let conn = db_conn(state)?;
    let school_id = school_scope(conn, &session, params)?;
    let class_id = match optional_str(params, "classId")? {
        Some(id) => Some(class_access(conn, &session, &id)?.id),
        None => None,
    };
    let query = optional_str(params, "query")?.map(|q| like_pattern(&q));
    let active = optional_bool(params, "active")?.map(i64::from);

    let mut stmt = conn
        .prepare(&format!(
            "{} WHERE s.school_id = ?1
               AND (?2 IS NULL OR s.class_id = ?2)
               AND (?3 IS NULL OR c.teacher_id = ?3)
               AND (?4 IS NULL
                    OR s.first_name LIKE ?4 ESCAPE '\\'
                    OR s.last_name LIKE ?4 ESCAPE '\\'
                    OR (s.first_name || ' ' || s.last_name) LIKE ?4 ESCAPE '\\'
                    OR s.parent_name LIKE ?4 ESCAPE '\\'
                    OR s.parent_phone LIKE ?4 ESCAPE '\\')
               AND (?5 IS NULL OR s.is_active = ?5)
             ORDER BY c.name COLLATE NOCASE, s.last_name COLLATE NOCASE, s.first_name COLLATE NOCASE",
            STUDENT_SELECT
        ))
        .map_err(query_failed)?;
    let students = stmt
        .query_map(
            (&school_id, class_id, teacher_filter(&session), query, active),
            student_json,
        )
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_failed)?;
    Ok(json!({ "students": students }))
}

fn students_create(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let session = authorize(state, ADMINS)?;
    let conn = db_conn(state)?;
    let class = class_access(conn, &session, &required_str(params, "classId")?)?;
    let draft = StudentDraft {
        row: 0,
        class_id: class.id.clone(),
        first_name: required_str(params, "firstName")?,
        last_name: required_str(params, "lastName")?,
        parent_name: optional_str(params, "parentName")?,
        parent_phone: optional_str(params, "parentPhone")?,
        telegram_chat_id: optional_str(params, "telegramChatId")?,
        push_player_id: optional_str(params, "pushPlayerId")?,
    };
    let student_id =
        insert_student(conn, &class.school_id, &draft).map_err(insert_failed("students"))?;
    Ok(json!({ "studentId": student_id, "student": load_student(conn, &student_id)? }))
}

fn students_update(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let session = authorize(state, ADMINS)?;
    let conn = db_conn(state)?;
    let student = student_access(conn, &session, &required_str(params, "studentId")?)?;
    let patch = Value::Object(patch_object(params)?.clone());

    let (school_id, mut d) = conn
        .query_row(
            "SELECT school_id, class_id, first_name, last_name, parent_name, parent_phone,
                    telegram_chat_id, push_player_id
             FROM students WHERE id = ?",
            [&student.id],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    StudentDraft {
                        row: 0,
                        class_id: r.get(1)?,
                        first_name: r.get(2)?,
                        last_name: r.get(3)?,
                        parent_name: r.get(4)?,
                        parent_phone: r.get(5)?,
                        telegram_chat_id: r.get(6)?,
                        push_player_id: r.get(7)?,
                    },
                ))
            },
        )
        .map_err(query_failed)?;

    for key in patch.as_object().into_iter().flat_map(|m| m.keys()) {
        match key.as_str() {
            "firstName" => d.first_name = required_str(&patch, key)?,
            "lastName" => d.last_name = required_str(&patch, key)?,
            "parentName" => d.parent_name = optional_str(&patch, key)?,
            "parentPhone" => d.parent_phone = optional_str(&patch, key)?,
            "telegramChatId" => d.telegram_chat_id = optional_str(&patch, key)?,
            "pushPlayerId" => d.push_player_id = optional_str(&patch, key)?,
            "classId" => {
                let target = class_access(conn, &session, &required_str(&patch, key)?)?;
                if target.school_id != school_id {
                    return Err(HandlerErr::bad_params("classId belongs to another school"));
                }
                d.class_id = target.id;
            }
            other => {
                return Err(HandlerErr::bad_params(format!(
                    "unknown student field: {}",
                    other
                )))
            }
        }
    }

    let tx = conn.unchecked_transaction().map_err(tx_failed)?;
    tx.execute(
        "UPDATE students SET class_id = ?, first_name = ?, last_name = ?, parent_name = ?,
                parent_phone = ?, telegram_chat_id = ?, push_player_id = ?, updated_at = ?
         WHERE id = ?",
        (
            &d.class_id,
            &d.first_name,
            &d.last_name,
            &d.parent_name,
            &d.parent_phone,
            &d.telegram_chat_id,
            &d.push_player_id,
            now_iso(),
            &student.id,
        ),
    )
    .map_err(update_failed("students"))?;
    if d.class_id != student.class_id {
        // Attendance history follows the student.
        tx.execute(
            "UPDATE attendance SET class_id = ? WHERE student_id = ?",
            (&d.class_id, &student.id),
        )
        .map_err(update_failed("attendance"))?;
    }
    tx.commit().map_err(tx_failed)?;
    Ok(json!({ "student": load_student(conn, &student.id)? }))
}

fn students_set_active(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let session = authorize(state, ADMINS)?;
    let conn = db_conn(state)?;
    let student = student_access(conn, &session, &required_str(params, "studentId")?)?;
    let is_active = required_bool(params, "isActive")?;
    conn.execute(
        "UPDATE students SET is_active = ?, updated_at = ? WHERE id = ?",
        (i64::from(is_active), now_iso(), &student.id),
    )
    .map_err(update_failed("students"))?;
    Ok(json!({ "studentId": student.id, "isActive": is_active }))
}

fn students_delete(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let session = authorize(state, ADMINS)?;
    let conn = db_conn(state)?;
    let student = student_access(conn, &session, &required_str(params, "studentId")?)?;

    let tx = conn.unchecked_transaction().map_err(tx_failed)?;
    tx.execute("DELETE FROM attendance WHERE student_id = ?", [&student.id])
        .map_err(delete_failed("attendance"))?;
    tx.execute("DELETE FROM students WHERE id = ?", [&student.id])
        .map_err(delete_failed("students"))?;
    tx.commit().map_err(tx_failed)?;
    Ok(json!({ "ok": true }))
}

fn class_name_index(conn: &Connection, school_id: &str) -> Result<HashMap<String, String>, HandlerErr> {
    let mut stmt = conn
        .prepare("SELECT id, name FROM classes WHERE school_id = ?")
        .map_err(query_failed)?;
    let rows = stmt
        .query_map([school_id], |r| {
            Ok((r.get::<_, String>(1)?.trim().to_lowercase(), r.get::<_, String>(0)?))
        })
        .and_then(|it| it.collect::<Result<HashMap<_, _>, _>>())
        .map_err(query_failed)?;
    Ok(rows)
}

fn students_import(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let session = authorize(state, ADMINS)?;
    let conn = db_conn(state)?;
    let school_id = school_scope(conn, &session, params)?;
    let path = PathBuf::from(required_str(params, "path")?);
    let dry_run = optional_bool(params, "dryRun")?.unwrap_or(false);
    if !import::is_supported(&path) {
        return Err(HandlerErr::bad_params(format!(
            "path must be one of: {}",
            import::SUPPORTED_EXTENSIONS.map(|e| format!(".{}", e)).join(", ")
        )));
    }

    let (header, rows) = import::read_sheet(&path).map_err(|e| {
        HandlerErr::new("import_failed", format!("{e:#}"))
            .with_details(json!({ "path": path.to_string_lossy() }))
    })?;
    let columns = import::map_header(&header).map_err(|msg| {
        HandlerErr::new("import_failed", msg).with_details(json!({ "row": header.row }))
    })?;
    let classes = class_name_index(conn, &school_id)?;

    let mut created = 0usize;
    let mut errors: Vec<Value> = Vec::new();
    let tx = conn.unchecked_transaction().map_err(tx_failed)?;
    for row in &rows {
        let draft = match import::validate_row(row, &columns, &classes) {
            Ok(d) => d,
            Err(e) => {
                errors.push(json!({ "row": e.row, "code": e.code, "message": e.message }));
                continue;
            }
        };
        if dry_run {
            created += 1;
            continue;
        }
        match insert_student(&tx, &school_id, &draft) {
            Ok(_) => created += 1,
            Err(e) => {
                warn!(row = draft.row, "student import row failed: {e}");
                errors.push(json!({
                    "row": draft.row,
                    "code": "db_insert_failed",
                    "message": e.to_string()
                }));
            }
        }
    }
    if dry_run {
        drop(tx);
    } else {
        tx.commit().map_err(tx_failed)?;
    }

    info!(
        school_id = %school_id,
        total = rows.len(),
        created,
        failed = errors.len(),
        dry_run,
        "student import finished"
    );
    Ok(json!({
        "total": rows.len(),
        "created": created,
        "failed": errors.len(),
        "dryRun": dry_run,
        "errors": errors,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "students.list" => students_list(state, &req.params),
        "students.create" => students_create(state, &req.params),
        "students.update" => students_update(state, &req.params),
        "students.setActive" => students_set_active(state, &req.params),
        "students.delete" => students_delete(state, &req.params),
        "students.import" => students_import(state, &req.params),
        _ => return None,
    };
    Some(respond(req, result))
}
