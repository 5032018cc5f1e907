//! Reads the first sheet of a spreadsheet file into a rectangular grid of
//! strings. No type coercion beyond turning cells into display text.

use crate::import::ImportError;
use calamine::{open_workbook_auto, Data, Reader};
use std::path::Path;

pub type Rows = Vec<Vec<String>>;

pub fn read_rows(path: &Path) -> Result<Rows, ImportError> {
    let is_csv = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("csv"))
        .unwrap_or(false);
    let rows = if is_csv {
        read_csv(path)?
    } else {
        read_workbook(path)?
    };
    Ok(rectangular(rows))
}

fn read_workbook(path: &Path) -> Result<Rows, ImportError> {
    let mut workbook = open_workbook_auto(path)
        .map_err(|e| ImportError::Unreadable(format!("{}: {}", path.display(), e)))?;
    let Some(first) = workbook.sheet_names().first().cloned() else {
        return Ok(Vec::new());
    };
    let range = workbook
        .worksheet_range(&first)
        .map_err(|e| ImportError::Unreadable(format!("sheet {}: {}", first, e)))?;

    // Ranges start at the first used cell; re-anchor at A1.
    let (row_offset, col_offset) = range.start().unwrap_or((0, 0));
    let row_offset = row_offset as usize;
    let col_offset = col_offset as usize;
    let mut rows: Rows = vec![Vec::new(); row_offset];
    for row in range.rows() {
        let mut out = vec![String::new(); col_offset];
        out.extend(row.iter().map(cell_text));
        rows.push(out);
    }
    Ok(rows)
}

fn cell_text(cell: &Data) -> String {
    match cell {
        Data::Empty | Data::Error(_) => String::new(),
        Data::String(s) => s.clone(),
        Data::Float(f) => number_text(*f),
        Data::Int(i) => i.to_string(),
        Data::Bool(b) => b.to_string(),
        Data::DateTime(dt) => number_text(dt.as_f64()),
        Data::DateTimeIso(s) | Data::DurationIso(s) => s.clone(),
    }
}

fn number_text(f: f64) -> String {
    if f.is_finite() && f.fract() == 0.0 && f.abs() < 1e15 {
        format!("{}", f as i64)
    } else {
        f.to_string()
    }
}

/// Comma-separated records with quoted cells, which may span lines. Rows keep
/// whatever width they have; `rectangular` evens them out afterwards.
fn read_csv(path: &Path) -> Result<Rows, ImportError> {
    let bytes = std::fs::read(path)
        .map_err(|e| ImportError::Unreadable(format!("{}: {}", path.display(), e)))?;
    parse_csv(&bytes).map_err(|e| ImportError::Unreadable(format!("{}: {}", path.display(), e)))
}

fn parse_csv(bytes: &[u8]) -> Result<Rows, csv::Error> {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(bytes);
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        rows.push(record.iter().map(str::to_string).collect());
    }
    Ok(rows)
}

/// Pads every row to the widest row so column indices line up.
pub fn rectangular(mut rows: Rows) -> Rows {
    let width = rows.iter().map(Vec::len).max().unwrap_or(0);
    for r in rows.iter_mut() {
        r.resize(width, String::new());
    }
    rows
}
