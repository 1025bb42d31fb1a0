//! Attendance report models: templates, field ordering, and row shaping.

use serde::Serialize;
use serde_json::{json, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Template {
    Summary,
    Daily,
}

impl Template {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "summary" => Some(Self::Summary),
            "daily" => Some(Self::Daily),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Summary => "summary",
            Self::Daily => "daily",
        }
    }

    /// Known fields with their column labels, in default order.
    pub fn fields(self) -> &'static [(&'static str, &'static str)] {
        match self {
            Self::Summary => &[
                ("studentName", "Student"),
                ("className", "Class"),
                ("parentPhone", "Parent phone"),
                ("present", "Present"),
                ("absent", "Absent"),
                ("late", "Late"),
                ("excused", "Excused"),
                ("total", "Total"),
                ("attendanceRate", "Attendance %"),
            ],
            Self::Daily => &[
                ("date", "Date"),
                ("studentName", "Student"),
                ("className", "Class"),
                ("status", "Status"),
                ("note", "Note"),
            ],
        }
    }

    pub fn default_order(self) -> Vec<String> {
        match self {
            Self::Summary => [
                "studentName",
                "className",
                "present",
                "absent",
                "late",
                "excused",
                "attendanceRate",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            Self::Daily => self.fields().iter().map(|(k, _)| k.to_string()).collect(),
        }
    }

    fn label(self, key: &str) -> Option<&'static str> {
        self.fields().iter().find(|(k, _)| *k == key).map(|(_, l)| *l)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColumnSpec {
    pub key: String,
    pub label: String,
}

/// Validates a requested field order. Duplicates keep their first position.
pub fn resolve_fields(template: Template, requested: &[String]) -> Result<Vec<ColumnSpec>, String> {
    let mut out: Vec<ColumnSpec> = Vec::new();
    for key in requested {
        let key = key.trim();
        let Some(label) = template.label(key) else {
            return Err(format!(
                "unknown {} field: {}",
                template.as_str(),
                key
            ));
        };
        if out.iter().any(|c| c.key == key) {
            continue;
        }
        out.push(ColumnSpec {
            key: key.to_string(),
            label: label.to_string(),
        });
    }
    if out.is_empty() {
        return Err("at least one field is required".to_string());
    }
    Ok(out)
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusCounts {
    pub present: i64,
    pub absent: i64,
    pub late: i64,
    pub excused: i64,
}

impl StatusCounts {
    pub fn add(&mut self, status: &str) {
        match status {
            "present" => self.present += 1,
            "absent" => self.absent += 1,
            "late" => self.late += 1,
            "excused" => self.excused += 1,
            _ => {}
        }
    }

    pub fn total(&self) -> i64 {
        self.present + self.absent + self.late + self.excused
    }

    /// Late arrivals count as attended. One decimal place; `None` without records.
    pub fn attendance_rate(&self) -> Option<f64> {
        let total = self.total();
        if total == 0 {
            return None;
        }
        let pct = (self.present + self.late) as f64 * 100.0 / total as f64;
        Some((pct * 10.0).round() / 10.0)
    }

    pub fn to_json(&self) -> Value {
        json!({
            "present": self.present,
            "absent": self.absent,
            "late": self.late,
            "excused": self.excused,
            "total": self.total(),
        })
    }
}

/// Projects a row's named values onto the column order.
pub fn shape_row(columns: &[ColumnSpec], value_of: impl Fn(&str) -> Value) -> Vec<Value> {
    columns.iter().map(|c| value_of(&c.key)).collect()
}

pub fn cell_text(v: &Value) -> String {
    match v {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
