//! Workspace settings, stored as one JSON document under the `settings` key
//! `classbook.settings`. Missing fields fall back to defaults.

use crate::db;
use crate::ledger::SameDayTieBreak;
use anyhow::Context;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const SETTINGS_KEY: &str = "classbook.settings";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StudentMatch {
    /// Reuse a student only if the same import already created it.
    #[default]
    PerImport,
    /// Reuse any existing student of the owner with the same name.
    Owner,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ColumnFailure {
    #[default]
    Drop,
    Abort,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ImportSettings {
    pub header_scan_rows: usize,
    pub title_max_chars: usize,
    pub student_match: StudentMatch,
    pub column_failure: ColumnFailure,
    pub banner_tokens: Vec<String>,
    pub default_module_name: String,
    pub fallback_course_name: String,
}

impl Default for ImportSettings {
    fn default() -> Self {
        Self {
            header_scan_rows: 40,
            title_max_chars: 50,
            student_match: StudentMatch::default(),
            column_failure: ColumnFailure::default(),
            banner_tokens: vec![
                "TRIMESTRE".to_string(),
                "TEOLOGIA".to_string(),
                "IBICAMP".to_string(),
            ],
            default_module_name: "Dados Gerais".to_string(),
            fallback_course_name: "Nova Turma Importada".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GridSettings {
    pub save_debounce_ms: u64,
}

impl Default for GridSettings {
    fn default() -> Self {
        Self {
            save_debounce_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LedgerSettings {
    pub same_day_tie_break: SameDayTieBreak,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AttendanceSettings {
    pub low_attendance_percent: i64,
}

impl Default for AttendanceSettings {
    fn default() -> Self {
        Self {
            low_attendance_percent: 75,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub import: ImportSettings,
    pub grid: GridSettings,
    pub ledger: LedgerSettings,
    pub attendance: AttendanceSettings,
}

pub fn load(conn: &Connection) -> anyhow::Result<Settings> {
    match db::settings_get_json(conn, SETTINGS_KEY)? {
        Some(v) => serde_json::from_value(v).context("stored settings are malformed"),
        None => Ok(Settings::default()),
    }
}

/// Merges `patch` over the effective settings, validates the result and
/// persists it.
pub fn update(conn: &Connection, patch: &Value) -> anyhow::Result<Settings> {
    let current = load(conn)?;
    let mut doc = serde_json::to_value(&current)?;
    merge(&mut doc, patch);
    let next: Settings = serde_json::from_value(doc.clone()).context("invalid settings")?;
    db::settings_set_json(conn, SETTINGS_KEY, &serde_json::to_value(&next)?)?;
    Ok(next)
}

fn merge(base: &mut Value, patch: &Value) {
    match (base, patch) {
        (Value::Object(b), Value::Object(p)) => {
            for (k, v) in p {
                match b.get_mut(k) {
                    Some(slot) => merge(slot, v),
                    None => {
                        b.insert(k.clone(), v.clone());
                    }
                }
            }
        }
        (slot, v) => *slot = v.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn partial_document_keeps_other_defaults() {
        let s: Settings =
            serde_json::from_value(json!({"import": {"headerScanRows": 30}})).expect("parse");
        assert_eq!(s.import.header_scan_rows, 30);
        assert_eq!(s.import.title_max_chars, 50);
        assert_eq!(s.attendance.low_attendance_percent, 75);
        assert_eq!(s.ledger.same_day_tie_break, SameDayTieBreak::InsertionOrder);
    }

    #[test]
    fn merge_replaces_leaves_and_keeps_siblings() {
        let mut base = json!({"grid": {"saveDebounceMs": 500}, "import": {"a": 1, "b": [1]}});
        merge(&mut base, &json!({"import": {"b": [2, 3]}}));
        assert_eq!(
            base,
            json!({"grid": {"saveDebounceMs": 500}, "import": {"a": 1, "b": [2, 3]}})
        );
    }
}
