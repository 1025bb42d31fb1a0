//! Spreadsheet roster reading for `students.import`.
//!
//! Sheets are read into plain string grids first; header mapping and row
//! validation work on the grid so csv and workbook inputs behave the same.

use anyhow::{anyhow, Context};
use calamine::{open_workbook_auto, Data, Reader};
use std::collections::HashMap;
use std::path::Path;

/// One non-blank sheet row, keeping its 1-based position in the sheet.
#[derive(Debug, Clone, PartialEq)]
pub struct SheetRow {
    pub row: usize,
    pub cells: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Column {
    FirstName,
    LastName,
    ClassName,
    ParentName,
    ParentPhone,
    TelegramChatId,
    PushPlayerId,
}

impl Column {
    fn from_header(raw: &str) -> Option<Self> {
        let key: String = raw
            .trim()
            .chars()
            .filter(|c| !c.is_whitespace() && *c != '_' && *c != '-')
            .collect::<String>()
            .to_ascii_lowercase();
        match key.as_str() {
            "firstname" | "first" | "name" => Some(Self::FirstName),
            "lastname" | "last" | "surname" => Some(Self::LastName),
            "classname" | "class" => Some(Self::ClassName),
            "parentname" | "parent" => Some(Self::ParentName),
            "parentphone" | "phone" => Some(Self::ParentPhone),
            "telegramchatid" | "telegram" | "chatid" => Some(Self::TelegramChatId),
            "pushplayerid" | "playerid" => Some(Self::PushPlayerId),
            _ => None,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::FirstName => "firstName",
            Self::LastName => "lastName",
            Self::ClassName => "className",
            Self::ParentName => "parentName",
            Self::ParentPhone => "parentPhone",
            Self::TelegramChatId => "telegramChatId",
            Self::PushPlayerId => "pushPlayerId",
        }
    }
}

const REQUIRED: [Column; 3] = [Column::FirstName, Column::LastName, Column::ClassName];

#[derive(Debug, Clone, PartialEq)]
pub struct StudentDraft {
    pub row: usize,
    pub class_id: String,
    pub first_name: String,
    pub last_name: String,
    pub parent_name: Option<String>,
    pub parent_phone: Option<String>,
    pub telegram_chat_id: Option<String>,
    pub push_player_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RowError {
    pub row: usize,
    pub code: &'static str,
    pub message: String,
}

pub const SUPPORTED_EXTENSIONS: [&str; 5] = ["csv", "xlsx", "xlsm", "xls", "ods"];

fn extension(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default()
}

pub fn is_supported(path: &Path) -> bool {
    SUPPORTED_EXTENSIONS.contains(&extension(path).as_str())
}

/// Reads the first sheet of a workbook, or a csv file, into rows.
/// The header row is returned separately.
pub fn read_sheet(path: &Path) -> anyhow::Result<(SheetRow, Vec<SheetRow>)> {
    let ext = extension(path);
    let grid = match ext.as_str() {
        "csv" => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.to_string_lossy()))?;
            csv_grid(&text)
        }
        "xlsx" | "xlsm" | "xls" | "ods" => workbook_grid(path)?,
        other => return Err(anyhow!("unsupported spreadsheet type: .{}", other)),
    };

    let mut rows = grid
        .into_iter()
        .enumerate()
        .map(|(i, cells)| SheetRow { row: i + 1, cells })
        .filter(|r| r.cells.iter().any(|c| !c.trim().is_empty()));
    let header = rows.next().ok_or_else(|| anyhow!("spreadsheet has no header row"))?;
    Ok((header, rows.collect()))
}

fn workbook_grid(path: &Path) -> anyhow::Result<Vec<Vec<String>>> {
    let mut workbook = open_workbook_auto(path)
        .with_context(|| format!("failed to open workbook {}", path.to_string_lossy()))?;
    let range = workbook
        .worksheet_range_at(0)
        .ok_or_else(|| anyhow!("workbook has no sheets"))?
        .context("failed to read first sheet")?;

    // Ranges start at the first used cell; pad so row numbers match the sheet.
    let (start_row, start_col) = range.start().unwrap_or((0, 0));
    let mut grid: Vec<Vec<String>> = vec![Vec::new(); start_row as usize];
    for r in range.rows() {
        let mut cells = vec![String::new(); start_col as usize];
        cells.extend(r.iter().map(cell_text));
        grid.push(cells);
    }
    Ok(grid)
}

fn cell_text(cell: &Data) -> String {
    match cell {
        Data::String(s) => s.trim().to_string(),
        Data::Int(i) => i.to_string(),
        // Phone numbers and chat ids come through as floats.
        Data::Float(f) if f.fract() == 0.0 && f.abs() < 1e15 => format!("{}", *f as i64),
        Data::Float(f) => f.to_string(),
        Data::Bool(b) => b.to_string(),
        Data::DateTimeIso(s) | Data::DurationIso(s) => s.clone(),
        Data::DateTime(dt) => dt.as_f64().to_string(),
        Data::Error(_) | Data::Empty => String::new(),
    }
}

/// Splits csv text into records. A quoted field may span lines; each record
/// sits at the index of its first line, with blank rows filling the lines it
/// consumed so row numbers keep matching the file.
fn csv_grid(text: &str) -> Vec<Vec<String>> {
    let mut grid: Vec<Vec<String>> = Vec::new();
    let mut record: Vec<String> = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut spanned_lines = 0usize;
    let mut chars = text.trim_start_matches('\u{feff}').chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '"' if in_quotes && chars.peek() == Some(&'"') => {
                chars.next();
                field.push('"');
            }
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => record.push(finish_field(&mut field)),
            '\r' if !in_quotes && chars.peek() == Some(&'\n') => {}
            '\n' if !in_quotes => {
                record.push(finish_field(&mut field));
                grid.push(std::mem::take(&mut record));
                grid.extend(std::iter::repeat(Vec::new()).take(spanned_lines));
                spanned_lines = 0;
            }
            '\n' => {
                spanned_lines += 1;
                field.push('\n');
            }
            _ => field.push(ch),
        }
    }
    if !field.is_empty() || !record.is_empty() {
        record.push(finish_field(&mut field));
        grid.push(record);
    }
    grid
}

fn finish_field(field: &mut String) -> String {
    let out = field.trim().to_string();
    field.clear();
    out
}

pub fn csv_quote(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') || s.contains('\r') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

/// Maps header cells to columns. Fails when a required column is absent.
pub fn map_header(header: &SheetRow) -> Result<HashMap<Column, usize>, String> {
    let mut idx = HashMap::new();
    for (i, cell) in header.cells.iter().enumerate() {
        if let Some(col) = Column::from_header(cell) {
            idx.entry(col).or_insert(i);
        }
    }
    let missing: Vec<&str> = REQUIRED
        .iter()
        .filter(|c| !idx.contains_key(c))
        .map(|c| c.label())
        .collect();
    if !missing.is_empty() {
        return Err(format!("missing required columns: {}", missing.join(", ")));
    }
    Ok(idx)
}

/// `classes` maps lowercased class names to class ids.
pub fn validate_row(
    row: &SheetRow,
    columns: &HashMap<Column, usize>,
    classes: &HashMap<String, String>,
) -> Result<StudentDraft, RowError> {
    let get = |col: Column| -> Option<String> {
        columns
            .get(&col)
            .and_then(|i| row.cells.get(*i))
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    };

    for col in REQUIRED {
        if get(col).is_none() {
            return Err(RowError {
                row: row.row,
                code: "missing_field",
                message: format!("{} is required", col.label()),
            });
        }
    }
    let class_name = get(Column::ClassName).unwrap_or_default();
    let Some(class_id) = classes.get(&class_name.to_lowercase()) else {
        return Err(RowError {
            row: row.row,
            code: "unknown_class",
            message: format!("class not found: {}", class_name),
        });
    };

    Ok(StudentDraft {
        row: row.row,
        class_id: class_id.clone(),
        first_name: get(Column::FirstName).unwrap_or_default(),
        last_name: get(Column::LastName).unwrap_or_default(),
        parent_name: get(Column::ParentName),
        parent_phone: get(Column::ParentPhone),
        telegram_chat_id: get(Column::TelegramChatId),
        push_player_id: get(Column::PushPlayerId),
    })
}
