//! Sparse academic-records grid: materialization from the store, the
//! optimistic per-cell edit path and the flat CSV export.

use crate::catalog;
use crate::model::{Course, Enrollment, Module};
use rusqlite::Connection;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};
use thiserror::Error;
use uuid::Uuid;

pub const CELL_KEY_SEPARATOR: char = '_';

pub fn cell_key(enrollment_id: &str, column_id: &str) -> String {
    format!("{}{}{}", enrollment_id, CELL_KEY_SEPARATOR, column_id)
}

#[derive(Debug, Error)]
pub enum GridError {
    #[error("{0} not found in the open grid")]
    NotFound(&'static str),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GridSnapshot {
    pub course: Course,
    pub modules: Vec<Module>,
    pub enrollments: Vec<Enrollment>,
    pub records: BTreeMap<String, String>,
}

impl GridSnapshot {
    fn has_enrollment(&self, enrollment_id: &str) -> bool {
        self.enrollments.iter().any(|e| e.id == enrollment_id)
    }

    fn has_column(&self, column_id: &str) -> bool {
        self.modules
            .iter()
            .flat_map(|m| m.columns.iter())
            .any(|c| c.id == column_id)
    }

    pub fn value(&self, enrollment_id: &str, column_id: &str) -> Option<&str> {
        self.records
            .get(&cell_key(enrollment_id, column_id))
            .map(String::as_str)
    }
}

/// Reads the whole grid of a course. Returns `None` when the course does not
/// exist; a course without modules or enrollments is a valid empty grid.
pub fn materialize(conn: &Connection, course_id: &str) -> anyhow::Result<Option<GridSnapshot>> {
    let Some(course) = catalog::get_course(conn, course_id)? else {
        return Ok(None);
    };
    let modules = catalog::list_modules(conn, course_id)?;

    // Display order is by student name, not enrollment order.
    let mut enrollments = catalog::list_enrollments(conn, course_id)?;
    enrollments.sort_by(|a, b| {
        a.student
            .name
            .to_lowercase()
            .cmp(&b.student.name.to_lowercase())
            .then_with(|| a.student.name.cmp(&b.student.name))
    });

    let mut records = BTreeMap::new();
    let mut stmt = conn.prepare(
        "SELECT r.enrollment_id, r.column_id, r.value
         FROM academic_records r
         JOIN enrollments e ON e.id = r.enrollment_id
         WHERE e.course_id = ?",
    )?;
    let rows = stmt.query_map([course_id], |r| {
        Ok((
            r.get::<_, String>(0)?,
            r.get::<_, String>(1)?,
            r.get::<_, Option<String>>(2)?,
        ))
    })?;
    for row in rows {
        let (enrollment_id, column_id, value) = row?;
        records.insert(cell_key(&enrollment_id, &column_id), value.unwrap_or_default());
    }

    Ok(Some(GridSnapshot {
        course,
        modules,
        enrollments,
        records,
    }))
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryColumn {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: crate::model::ColumnType,
    pub value: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryModule {
    pub id: String,
    pub name: String,
    pub columns: Vec<HistoryColumn>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CourseHistory {
    pub enrollment_id: String,
    pub course_id: String,
    pub course_name: String,
    pub term_id: String,
    pub term_name: String,
    pub modules: Vec<HistoryModule>,
}

/// Every course a student is enrolled in with that student's row of the grid.
pub fn student_history(conn: &Connection, student_id: &str) -> anyhow::Result<Vec<CourseHistory>> {
    let mut out = Vec::new();
    for enrollment in catalog::list_student_enrollments(conn, student_id)? {
        let Some(snapshot) = materialize(conn, &enrollment.course_id)? else {
            continue;
        };
        let term_name = catalog::get_term(conn, &snapshot.course.term_id)?
            .map(|t| t.name)
            .unwrap_or_default();
        let modules = snapshot
            .modules
            .iter()
            .map(|m| HistoryModule {
                id: m.id.clone(),
                name: m.name.clone(),
                columns: m
                    .columns
                    .iter()
                    .map(|c| HistoryColumn {
                        id: c.id.clone(),
                        name: c.name.clone(),
                        column_type: c.column_type,
                        value: snapshot.value(&enrollment.id, &c.id).map(str::to_string),
                    })
                    .collect(),
            })
            .collect();
        out.push(CourseHistory {
            enrollment_id: enrollment.id,
            course_id: snapshot.course.id.clone(),
            course_name: snapshot.course.name.clone(),
            term_id: snapshot.course.term_id.clone(),
            term_name,
            modules,
        });
    }
    Ok(out)
}

/// One cell write as it travels to the store.
#[derive(Debug, Clone)]
pub struct CellWrite {
    pub enrollment_id: String,
    pub column_id: String,
    pub value: String,
    pub updated_at: String,
}

impl CellWrite {
    pub fn new(enrollment_id: &str, column_id: &str, value: &str) -> Self {
        Self {
            enrollment_id: enrollment_id.to_string(),
            column_id: column_id.to_string(),
            value: value.to_string(),
            updated_at: crate::db::now_timestamp(),
        }
    }

    pub fn key(&self) -> String {
        cell_key(&self.enrollment_id, &self.column_id)
    }
}

/// Overwrites the cell when a record exists, creates it otherwise.
pub fn upsert_record(conn: &Connection, write: &CellWrite) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO academic_records(id, enrollment_id, column_id, value, updated_at)
         VALUES(?, ?, ?, ?, ?)
         ON CONFLICT(enrollment_id, column_id) DO UPDATE SET
           value = excluded.value,
           updated_at = excluded.updated_at",
        (
            Uuid::new_v4().to_string(),
            &write.enrollment_id,
            &write.column_id,
            &write.value,
            &write.updated_at,
        ),
    )?;
    Ok(())
}

/// Writes a batch of cells in one transaction.
pub fn upsert_records_batch(conn: &Connection, writes: &[CellWrite]) -> anyhow::Result<usize> {
    let tx = conn.unchecked_transaction()?;
    for w in writes {
        upsert_record(&tx, w)?;
    }
    tx.commit()?;
    Ok(writes.len())
}

#[derive(Debug, Default)]
struct SaveState {
    pending: usize,
    settled_at: Option<Instant>,
}

impl SaveState {
    fn is_saving(&self, debounce: Duration, now: Instant) -> bool {
        if self.pending > 0 {
            return true;
        }
        match self.settled_at {
            Some(at) => now.saturating_duration_since(at) < debounce,
            None => false,
        }
    }
}

/// UI-side "saving" indicator per cell. A key counts as saving while any write
/// is unconfirmed and for `debounce` after the last confirmation, success or
/// not.
#[derive(Debug)]
pub struct SavingTracker {
    debounce: Duration,
    states: HashMap<String, SaveState>,
}

impl SavingTracker {
    pub fn new(debounce: Duration) -> Self {
        Self {
            debounce,
            states: HashMap::new(),
        }
    }

    pub fn begin(&mut self, key: &str) {
        let st = self.states.entry(key.to_string()).or_default();
        st.pending += 1;
        st.settled_at = None;
    }

    pub fn settle(&mut self, key: &str, now: Instant) {
        if let Some(st) = self.states.get_mut(key) {
            st.pending = st.pending.saturating_sub(1);
            if st.pending == 0 {
                st.settled_at = Some(now);
            }
        }
    }

    /// Saving keys in sorted order; expired entries are dropped.
    pub fn saving_keys(&mut self, now: Instant) -> Vec<String> {
        let debounce = self.debounce;
        self.states.retain(|_, st| st.is_saving(debounce, now));
        let mut keys: Vec<String> = self.states.keys().cloned().collect();
        keys.sort();
        keys
    }
}

/// The open, optimistically edited view of one course grid.
#[derive(Debug)]
pub struct GridSession {
    pub snapshot: GridSnapshot,
    saving: SavingTracker,
    failed_saves: usize,
}

impl GridSession {
    pub fn new(snapshot: GridSnapshot, debounce: Duration) -> Self {
        Self {
            snapshot,
            saving: SavingTracker::new(debounce),
            failed_saves: 0,
        }
    }

    /// Applies the value locally and returns the write to persist. Keys are
    /// only built from enrollments and columns of this course's grid.
    pub fn set_cell(
        &mut self,
        enrollment_id: &str,
        column_id: &str,
        value: &str,
    ) -> Result<CellWrite, GridError> {
        if !self.snapshot.has_enrollment(enrollment_id) {
            return Err(GridError::NotFound("enrollment"));
        }
        if !self.snapshot.has_column(column_id) {
            return Err(GridError::NotFound("column"));
        }
        let write = CellWrite::new(enrollment_id, column_id, value);
        let key = write.key();
        self.snapshot.records.insert(key.clone(), write.value.clone());
        self.saving.begin(&key);
        Ok(write)
    }

    /// Swaps in a freshly materialized grid. Saving indicators carry over.
    pub fn replace_snapshot(&mut self, snapshot: GridSnapshot) {
        self.snapshot = snapshot;
    }

    /// Records the store's answer for a write. The local value is kept either way.
    pub fn confirm(&mut self, key: &str, ok: bool, now: Instant) {
        if !ok {
            self.failed_saves += 1;
        }
        self.saving.settle(key, now);
    }

    pub fn saving_keys(&mut self, now: Instant) -> Vec<String> {
        self.saving.saving_keys(now)
    }

    pub fn failed_saves(&self) -> usize {
        self.failed_saves
    }
}

/// Flat export: one row per enrollment, one column per (module, column) in
/// display order. Commas inside values become spaces; nothing is quoted except
/// the student name.
pub fn export_csv(snapshot: &GridSnapshot) -> String {
    let mut csv = String::from("Aluno");
    for m in &snapshot.modules {
        for c in &m.columns {
            csv.push_str(&format!(",{} - {}", m.name, c.name));
        }
    }
    csv.push('\n');

    for e in &snapshot.enrollments {
        csv.push_str(&format!("\"{}\"", e.student.name));
        for m in &snapshot.modules {
            for c in &m.columns {
                let val = snapshot.value(&e.id, &c.id).unwrap_or("");
                csv.push(',');
                csv.push_str(&val.replace(',', " "));
            }
        }
        csv.push('\n');
    }
    csv
}
