use rusqlite::Connection;
use serde_json::{json, Value};
use std::path::PathBuf;
use tracing::info;

use crate::auth::Session;
use crate::import::csv_quote;
use crate::ipc::handlers::classes::teacher_filter;
use crate::ipc::handlers::setup::{load_section_or_err, SetupSection};
use crate::ipc::helpers::{
    authorize, class_access, db_conn, optional_str, query_failed, required_date, required_str,
    respond, school_scope, HandlerErr, ANY_ROLE,
};
use crate::ipc::types::{AppState, Request};
use crate::report::{cell_text, resolve_fields, shape_row, ColumnSpec, StatusCounts, Template};

struct ReportModel {
    template: Template,
    columns: Vec<ColumnSpec>,
    rows: Vec<Vec<Value>>,
}

struct ReportScope {
    school_id: String,
    class_id: Option<String>,
    teacher_id: Option<String>,
    from: String,
    to: String,
    include_inactive: bool,
}

fn requested_fields(params: &Value, settings: &Value, template: Template) -> Result<Vec<String>, HandlerErr> {
    let setting_key = match template {
        Template::Summary => "summaryFields",
        Template::Daily => "dailyFields",
    };
    let source = match params.get("fields") {
        None | Some(Value::Null) => settings.get(setting_key).cloned().unwrap_or(Value::Null),
        Some(v) if v.is_array() => v.clone(),
        Some(_) => return Err(HandlerErr::bad_params("fields must be an array of strings")),
    };
    let Some(arr) = source.as_array() else {
        return Ok(template.default_order());
    };
    arr.iter()
        .map(|v| {
            v.as_str()
                .map(str::to_string)
                .ok_or_else(|| HandlerErr::bad_params("fields must be an array of strings"))
        })
        .collect()
}

/// `include_inactive` starts false; it comes from the school's settings.
fn resolve_scope(conn: &Connection, session: &Session, params: &Value) -> Result<ReportScope, HandlerErr> {
    let from = required_date(params, "from")?;
    let to = required_date(params, "to")?;
    if from > to {
        return Err(HandlerErr::bad_params("from must not be after to")
            .with_details(json!({ "from": from, "to": to })));
    }
    let (school_id, class_id) = match optional_str(params, "classId")? {
        Some(id) => {
            let class = class_access(conn, session, &id)?;
            (class.school_id, Some(class.id))
        }
        None => (school_scope(conn, session, params)?, None),
    };
    Ok(ReportScope {
        school_id,
        class_id,
        teacher_id: teacher_filter(session),
        from,
        to,
        include_inactive: false,
    })
}

fn summary_rows(conn: &Connection, scope: &ReportScope, columns: &[ColumnSpec]) -> Result<Vec<Vec<Value>>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT s.first_name, s.last_name, c.name, s.parent_phone,
                    COALESCE(SUM(a.status = 'present'), 0),
                    COALESCE(SUM(a.status = 'absent'), 0),
                    COALESCE(SUM(a.status = 'late'), 0),
                    COALESCE(SUM(a.status = 'excused'), 0)
             FROM students s
             JOIN classes c ON c.id = s.class_id
             LEFT JOIN attendance a
               ON a.student_id = s.id AND a.date >= ?4 AND a.date <= ?5
             WHERE s.school_id = ?1
               AND (?2 IS NULL OR s.class_id = ?2)
               AND (?3 IS NULL OR c.teacher_id = ?3)
               AND (?6 = 1 OR s.is_active = 1)
             GROUP BY s.id
             ORDER BY c.name COLLATE NOCASE, s.last_name COLLATE NOCASE, s.first_name COLLATE NOCASE",
        )
        .map_err(query_failed)?;
    let raw = stmt
        .query_map(
            (
                &scope.school_id,
                &scope.class_id,
                &scope.teacher_id,
                &scope.from,
                &scope.to,
                i64::from(scope.include_inactive),
            ),
            |r| {
                Ok((
                    format!("{} {}", r.get::<_, String>(0)?, r.get::<_, String>(1)?),
                    r.get::<_, String>(2)?,
                    r.get::<_, Option<String>>(3)?,
                    StatusCounts {
                        present: r.get(4)?,
                        absent: r.get(5)?,
                        late: r.get(6)?,
                        excused: r.get(7)?,
                    },
                ))
            },
        )
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_failed)?;

    Ok(raw
        .into_iter()
        .map(|(student_name, class_name, parent_phone, counts)| {
            shape_row(columns, |key| match key {
                "studentName" => json!(student_name),
                "className" => json!(class_name),
                "parentPhone" => json!(parent_phone),
                "present" => json!(counts.present),
                "absent" => json!(counts.absent),
                "late" => json!(counts.late),
                "excused" => json!(counts.excused),
                "total" => json!(counts.total()),
                "attendanceRate" => json!(counts.attendance_rate()),
                _ => Value::Null,
            })
        })
        .collect())
}

fn daily_rows(conn: &Connection, scope: &ReportScope, columns: &[ColumnSpec]) -> Result<Vec<Vec<Value>>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT a.date, s.first_name, s.last_name, c.name, a.status, a.note
             FROM attendance a
             JOIN students s ON s.id = a.student_id
             JOIN classes c ON c.id = a.class_id
             WHERE a.school_id = ?1
               AND (?2 IS NULL OR a.class_id = ?2)
               AND (?3 IS NULL OR c.teacher_id = ?3)
               AND a.date >= ?4 AND a.date <= ?5
               AND (?6 = 1 OR s.is_active = 1)
             ORDER BY a.date, s.last_name COLLATE NOCASE, s.first_name COLLATE NOCASE",
        )
        .map_err(query_failed)?;
    let raw = stmt
        .query_map(
            (
                &scope.school_id,
                &scope.class_id,
                &scope.teacher_id,
                &scope.from,
                &scope.to,
                i64::from(scope.include_inactive),
            ),
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    format!("{} {}", r.get::<_, String>(1)?, r.get::<_, String>(2)?),
                    r.get::<_, String>(3)?,
                    r.get::<_, String>(4)?,
                    r.get::<_, Option<String>>(5)?,
                ))
            },
        )
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_failed)?;

    Ok(raw
        .into_iter()
        .map(|(date, student_name, class_name, status, note)| {
            shape_row(columns, |key| match key {
                "date" => json!(date),
                "studentName" => json!(student_name),
                "className" => json!(class_name),
                "status" => json!(status),
                "note" => json!(note),
                _ => Value::Null,
            })
        })
        .collect())
}

fn build_report(state: &mut AppState, params: &Value) -> Result<ReportModel, HandlerErr> {
    let session = authorize(state, ANY_ROLE)?;
    let conn = db_conn(state)?;
    let template = match optional_str(params, "template")? {
        None => Template::Summary,
        Some(t) => Template::parse(&t).ok_or_else(|| {
            HandlerErr::bad_params("template must be one of: summary, daily")
                .with_details(json!({ "template": t }))
        })?,
    };
    let mut scope = resolve_scope(conn, &session, params)?;
    let settings = load_section_or_err(conn, SetupSection::Reports, &scope.school_id)?;
    scope.include_inactive = settings["includeInactiveStudents"].as_bool().unwrap_or(false);
    let fields = requested_fields(params, &settings, template)?;
    let columns = resolve_fields(template, &fields).map_err(HandlerErr::bad_params)?;

    let rows = match template {
        Template::Summary => summary_rows(conn, &scope, &columns)?,
        Template::Daily => daily_rows(conn, &scope, &columns)?,
    };
    Ok(ReportModel {
        template,
        columns,
        rows,
    })
}

fn reports_attendance(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let model = build_report(state, params)?;
    Ok(json!({
        "template": model.template.as_str(),
        "columns": model.columns,
        "rows": model.rows,
    }))
}

fn to_csv(model: &ReportModel) -> String {
    let mut csv = model
        .columns
        .iter()
        .map(|c| csv_quote(&c.label))
        .collect::<Vec<_>>()
        .join(",");
    csv.push('\n');
    for row in &model.rows {
        let line = row
            .iter()
            .map(|v| csv_quote(&cell_text(v)))
            .collect::<Vec<_>>()
            .join(",");
        csv.push_str(&line);
        csv.push('\n');
    }
    csv
}

fn reports_export_csv(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let model = build_report(state, params)?;
    let out_path = required_str(params, "outPath")?;
    let csv = to_csv(&model);

    let out = PathBuf::from(&out_path);
    let io_failed = |e: std::io::Error| {
        HandlerErr::new("io_failed", e.to_string()).with_details(json!({ "path": out_path }))
    };
    if let Some(parent) = out.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(io_failed)?;
    }
    std::fs::write(&out, csv).map_err(io_failed)?;

    info!(template = model.template.as_str(), rows = model.rows.len(), "report exported");
    Ok(json!({ "path": out_path, "rowCount": model.rows.len() }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "reports.attendance" => reports_attendance(state, &req.params),
        "reports.exportCsv" => reports_export_csv(state, &req.params),
        _ => return None,
    };
    Some(respond(req, result))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csv_uses_labels_and_quotes_cells() {
        let columns = resolve_fields(Template::Daily, &["studentName".into(), "note".into()])
            .expect("columns");
        let model = ReportModel {
            template: Template::Daily,
            columns,
            rows: vec![
                vec![json!("Ann Lee"), json!("sick, \"flu\"")],
                vec![json!("Bo Kim"), Value::Null],
            ],
        };
        assert_eq!(
            to_csv(&model),
            "Student,Note\nAnn Lee,\"sick, \"\"flu\"\"\"\nBo Kim,\n"
        );
    }

    #[test]
    fn explicit_fields_override_settings() {
        let settings = json!({ "summaryFields": ["absent"] });
        let from_settings =
            requested_fields(&json!({}), &settings, Template::Summary).expect("settings order");
        assert_eq!(from_settings, vec!["absent".to_string()]);
        let explicit = requested_fields(&json!({ "fields": ["late"] }), &settings, Template::Summary)
            .expect("explicit order");
        assert_eq!(explicit, vec!["late".to_string()]);
        let fallback = requested_fields(&json!({}), &json!({}), Template::Daily).expect("default order");
        assert_eq!(fallback, Template::Daily.default_order());
        assert!(requested_fields(&json!({ "fields": [1] }), &settings, Template::Summary).is_err());
    }

    #[test]
    fn fields_must_be_an_array_when_given() {
        for bad in [json!("absent"), json!({ "absent": true }), json!(3)] {
            let e = requested_fields(&json!({ "fields": bad }), &json!({}), Template::Summary)
                .expect_err("non-array fields");
            assert_eq!(e.code, "bad_params");
        }
        // A malformed saved order still falls back to the default.
        let saved = json!({ "summaryFields": "oops" });
        let got = requested_fields(&json!({}), &saved, Template::Summary).expect("fallback");
        assert_eq!(got, Template::Summary.default_order());
    }
}
