//! Per-(student, course, date) attendance marks. Absence of a row is
//! "unmarked"; cycling back to unmarked deletes the row.

use crate::db::now_timestamp;
use crate::model::{column_from_sql, AttendanceStatus, Enrollment};
use rusqlite::Connection;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceKey {
    pub course_id: String,
    pub student_id: String,
    pub date: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceMark {
    #[serde(flatten)]
    pub key: AttendanceKey,
    pub status: AttendanceStatus,
}

/// `unmarked -> present -> absent -> excused -> unmarked`
pub fn next_status(current: Option<AttendanceStatus>) -> Option<AttendanceStatus> {
    match current {
        None => Some(AttendanceStatus::Present),
        Some(AttendanceStatus::Present) => Some(AttendanceStatus::Absent),
        Some(AttendanceStatus::Absent) => Some(AttendanceStatus::Excused),
        Some(AttendanceStatus::Excused) => None,
    }
}

#[derive(Debug, Clone)]
pub enum MarkWrite {
    Upsert {
        key: AttendanceKey,
        status: AttendanceStatus,
    },
    Delete {
        key: AttendanceKey,
    },
}

impl MarkWrite {
    pub fn key(&self) -> &AttendanceKey {
        match self {
            MarkWrite::Upsert { key, .. } | MarkWrite::Delete { key } => key,
        }
    }
}

#[derive(Debug)]
pub enum Toggle {
    Applied {
        next: Option<AttendanceStatus>,
        write: MarkWrite,
    },
    /// A toggle on this key has not been confirmed yet.
    InFlight,
}

/// Session view of attendance marks with per-key single flight.
#[derive(Debug, Default)]
pub struct AttendanceBook {
    loaded_courses: HashSet<String>,
    marks: HashMap<AttendanceKey, AttendanceStatus>,
    in_flight: HashSet<AttendanceKey>,
}

impl AttendanceBook {
    pub fn is_loaded(&self, course_id: &str) -> bool {
        self.loaded_courses.contains(course_id)
    }

    /// Replaces the session view of a course with what the store holds.
    pub fn load_course(&mut self, course_id: &str, marks: Vec<AttendanceMark>) {
        self.marks.retain(|k, _| k.course_id != course_id);
        for m in marks {
            self.marks.insert(m.key, m.status);
        }
        self.loaded_courses.insert(course_id.to_string());
    }

    pub fn status(&self, key: &AttendanceKey) -> Option<AttendanceStatus> {
        self.marks.get(key).copied()
    }

    pub fn toggle(&mut self, key: AttendanceKey) -> Toggle {
        if self.in_flight.contains(&key) {
            return Toggle::InFlight;
        }
        let next = next_status(self.status(&key));
        let write = match next {
            Some(status) => {
                self.marks.insert(key.clone(), status);
                MarkWrite::Upsert {
                    key: key.clone(),
                    status,
                }
            }
            None => {
                self.marks.remove(&key);
                MarkWrite::Delete { key: key.clone() }
            }
        };
        self.in_flight.insert(key);
        Toggle::Applied { next, write }
    }

    pub fn confirm(&mut self, key: &AttendanceKey) {
        self.in_flight.remove(key);
    }

    pub fn course_marks(&self, course_id: &str) -> Vec<AttendanceMark> {
        let mut out: Vec<AttendanceMark> = self
            .marks
            .iter()
            .filter(|(k, _)| k.course_id == course_id)
            .map(|(k, s)| AttendanceMark {
                key: k.clone(),
                status: *s,
            })
            .collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        out
    }

    /// Drops every mark and pending flag of a deleted course. The course has
    /// to be loaded again from the store before it answers.
    pub fn forget_course(&mut self, course_id: &str) {
        self.loaded_courses.remove(course_id);
        self.marks.retain(|k, _| k.course_id != course_id);
        self.in_flight.retain(|k| k.course_id != course_id);
    }

    pub fn forget_student(&mut self, student_id: &str) {
        self.marks.retain(|k, _| k.student_id != student_id);
        self.in_flight.retain(|k| k.student_id != student_id);
    }

    pub fn clear(&mut self) {
        self.loaded_courses.clear();
        self.marks.clear();
        self.in_flight.clear();
    }
}

pub fn load_course_marks(conn: &Connection, course_id: &str) -> anyhow::Result<Vec<AttendanceMark>> {
    let mut stmt = conn.prepare(
        "SELECT course_id, student_id, date, status
         FROM attendance
         WHERE course_id = ?
         ORDER BY date, student_id",
    )?;
    let rows = stmt
        .query_map([course_id], |r| {
            Ok(AttendanceMark {
                key: AttendanceKey {
                    course_id: r.get(0)?,
                    student_id: r.get(1)?,
                    date: r.get(2)?,
                },
                status: column_from_sql(3, r.get(3)?)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn apply_mark_write(conn: &Connection, write: &MarkWrite) -> anyhow::Result<()> {
    match write {
        MarkWrite::Upsert { key, status } => {
            conn.execute(
                "INSERT INTO attendance(id, student_id, course_id, date, status, created_at)
                 VALUES(?, ?, ?, ?, ?, ?)
                 ON CONFLICT(student_id, course_id, date) DO UPDATE SET
                   status = excluded.status",
                (
                    Uuid::new_v4().to_string(),
                    &key.student_id,
                    &key.course_id,
                    &key.date,
                    status.as_str(),
                    now_timestamp(),
                ),
            )?;
        }
        MarkWrite::Delete { key } => {
            conn.execute(
                "DELETE FROM attendance WHERE student_id = ? AND course_id = ? AND date = ?",
                (&key.student_id, &key.course_id, &key.date),
            )?;
        }
    }
    Ok(())
}

/// `round(100 * present / max(1, scheduled))`
pub fn attendance_percent(present: usize, scheduled: usize) -> i64 {
    let denom = scheduled.max(1) as f64;
    ((present as f64 / denom) * 100.0).round() as i64
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentAttendance {
    pub student_id: String,
    pub student_name: String,
    pub present: usize,
    pub absent: usize,
    pub excused: usize,
    pub percent: i64,
    pub low: bool,
}

/// Derived per-student statistics against the class calendar. An empty
/// calendar still counts as one class so the percent stays defined.
pub fn summarize(
    enrollments: &[Enrollment],
    marks: &[AttendanceMark],
    schedule: &[String],
    low_threshold: i64,
) -> Vec<StudentAttendance> {
    let scheduled = schedule.iter().collect::<BTreeSet<_>>().len();

    enrollments
        .iter()
        .map(|e| {
            let mut present = 0;
            let mut absent = 0;
            let mut excused = 0;
            for m in marks.iter().filter(|m| m.key.student_id == e.student_id) {
                match m.status {
                    AttendanceStatus::Present => present += 1,
                    AttendanceStatus::Absent => absent += 1,
                    AttendanceStatus::Excused => excused += 1,
                }
            }
            let percent = attendance_percent(present, scheduled);
            StudentAttendance {
                student_id: e.student_id.clone(),
                student_name: e.student.name.clone(),
                present,
                absent,
                excused,
                percent,
                low: percent < low_threshold,
            }
        })
        .collect()
}
