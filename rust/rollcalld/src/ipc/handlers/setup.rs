use crate::db;
use crate::ipc::helpers::{
    authorize, db_conn, respond, school_scope, HandlerErr, ADMINS, ANY_ROLE,
};
use crate::ipc::types::{AppState, Request};
use crate::notify::template::PLACEHOLDERS;
use crate::report::{resolve_fields, Template};
use serde_json::{json, Map, Value};

pub const ATTENDANCE_STATUSES: [&str; 4] = ["present", "absent", "late", "excused"];

#[derive(Clone, Copy)]
pub enum SetupSection {
    Notifications,
    Reports,
}

impl SetupSection {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "notifications" => Some(Self::Notifications),
            "reports" => Some(Self::Reports),
            _ => None,
        }
    }

    fn prefix(self) -> &'static str {
        match self {
            Self::Notifications => "setup.notifications",
            Self::Reports => "setup.reports",
        }
    }

    /// Settings rows are kept per school.
    fn key(self, school_id: &str) -> String {
        format!("{}:{}", self.prefix(), school_id)
    }
}

pub const SECTIONS: [SetupSection; 2] = [SetupSection::Notifications, SetupSection::Reports];

/// Drops every saved section of a school.
pub fn delete_school_sections(conn: &rusqlite::Connection, school_id: &str) -> anyhow::Result<()> {
    for section in SECTIONS {
        db::settings_delete(conn, &section.key(school_id))?;
    }
    Ok(())
}

fn default_section(section: SetupSection) -> Value {
    match section {
        SetupSection::Notifications => json!({
            "telegramEnabled": true,
            "pushEnabled": true,
            "notifyStatuses": ["absent", "late"],
            "absentTemplate": "Dear {parentName}, {studentName} ({className}) was absent on {date}. {schoolName}",
            "lateTemplate": "Dear {parentName}, {studentName} ({className}) arrived late on {date}. {schoolName}",
            "excusedTemplate": "Dear {parentName}, {studentName} ({className}) was excused on {date}. {schoolName}"
        }),
        SetupSection::Reports => json!({
            "summaryFields": Template::Summary.default_order(),
            "dailyFields": Template::Daily.default_order(),
            "includeInactiveStudents": false
        }),
    }
}

fn as_object_mut(value: &mut Value) -> Result<&mut Map<String, Value>, String> {
    value
        .as_object_mut()
        .ok_or_else(|| "internal setup object must be a JSON object".to_string())
}

fn parse_bool(v: &Value, key: &str) -> Result<bool, String> {
    v.as_bool()
        .ok_or_else(|| format!("{} must be boolean", key))
}

fn parse_string_list(v: &Value, key: &str) -> Result<Vec<String>, String> {
    let arr = v
        .as_array()
        .ok_or_else(|| format!("{} must be an array of strings", key))?;
    arr.iter()
        .map(|item| {
            item.as_str()
                .map(|s| s.trim().to_string())
                .ok_or_else(|| format!("{} must be an array of strings", key))
        })
        .collect()
}

fn parse_template(v: &Value, key: &str) -> Result<String, String> {
    let s = v.as_str().ok_or_else(|| format!("{} must be string", key))?;
    let s = s.trim();
    if s.is_empty() || s.chars().count() > 1000 {
        return Err(format!("{} length must be in 1..=1000", key));
    }
    Ok(s.to_string())
}

fn merge_section_patch(
    section: SetupSection,
    current: &mut Value,
    patch: &Map<String, Value>,
) -> Result<(), String> {
    let obj = as_object_mut(current)?;
    for (k, v) in patch {
        match section {
            SetupSection::Notifications => match k.as_str() {
                "telegramEnabled" | "pushEnabled" => {
                    obj.insert(k.clone(), Value::Bool(parse_bool(v, k)?));
                }
                "notifyStatuses" => {
                    let mut statuses = parse_string_list(v, k)?;
                    for s in &mut statuses {
                        *s = s.to_ascii_lowercase();
                        if !ATTENDANCE_STATUSES.contains(&s.as_str()) || s == "present" {
                            return Err(
                                "notifyStatuses may contain: absent, late, excused".into(),
                            );
                        }
                    }
                    let mut seen: Vec<String> = Vec::new();
                    statuses.retain(|s| {
                        if seen.contains(s) {
                            return false;
                        }
                        seen.push(s.clone());
                        true
                    });
                    obj.insert(k.clone(), json!(statuses));
                }
                "absentTemplate" | "lateTemplate" | "excusedTemplate" => {
                    obj.insert(k.clone(), Value::String(parse_template(v, k)?));
                }
                _ => return Err(format!("unknown notifications field: {}", k)),
            },
            SetupSection::Reports => match k.as_str() {
                "summaryFields" | "dailyFields" => {
                    let template = if k == "summaryFields" {
                        Template::Summary
                    } else {
                        Template::Daily
                    };
                    let cols = resolve_fields(template, &parse_string_list(v, k)?)?;
                    let keys: Vec<String> = cols.into_iter().map(|c| c.key).collect();
                    obj.insert(k.clone(), json!(keys));
                }
                "includeInactiveStudents" => {
                    obj.insert(k.clone(), Value::Bool(parse_bool(v, k)?));
                }
                _ => return Err(format!("unknown reports field: {}", k)),
            },
        }
    }
    Ok(())
}

pub fn load_section(
    conn: &rusqlite::Connection,
    section: SetupSection,
    school_id: &str,
) -> anyhow::Result<Value> {
    let mut current = default_section(section);
    if let Some(saved) = db::settings_get_json(conn, &section.key(school_id))? {
        if let Some(saved_obj) = saved.as_object() {
            // Best-effort apply: malformed historical values should not block setup UI.
            let _ = merge_section_patch(section, &mut current, saved_obj);
        }
    }
    Ok(current)
}

pub fn load_section_or_err(
    conn: &rusqlite::Connection,
    section: SetupSection,
    school_id: &str,
) -> Result<Value, HandlerErr> {
    load_section(conn, section, school_id).map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))
}

fn setup_get(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let session = authorize(state, ANY_ROLE)?;
    let conn = db_conn(state)?;
    let school_id = school_scope(conn, &session, params)?;
    Ok(json!({
        "schoolId": school_id,
        "notifications": load_section_or_err(conn, SetupSection::Notifications, &school_id)?,
        "reports": load_section_or_err(conn, SetupSection::Reports, &school_id)?,
        "placeholders": PLACEHOLDERS,
    }))
}

fn setup_update(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let session = authorize(state, ADMINS)?;
    let conn = db_conn(state)?;
    let school_id = school_scope(conn, &session, params)?;
    let section = params
        .get("section")
        .and_then(|v| v.as_str())
        .ok_or_else(|| HandlerErr::bad_params("missing section"))?;
    let section =
        SetupSection::parse(section).ok_or_else(|| HandlerErr::bad_params("unknown section"))?;
    let patch = params
        .get("patch")
        .and_then(|v| v.as_object())
        .ok_or_else(|| HandlerErr::bad_params("patch must be an object"))?;

    let mut current = load_section_or_err(conn, section, &school_id)?;
    merge_section_patch(section, &mut current, patch).map_err(HandlerErr::bad_params)?;
    db::settings_set_json(conn, &section.key(&school_id), &current)
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    Ok(json!({ "ok": true, "section": current }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "setup.get" => Some(respond(req, setup_get(state, &req.params))),
        "setup.update" => Some(respond(req, setup_update(state, &req.params))),
        _ => None,
    }
}
