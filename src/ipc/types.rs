use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use rusqlite::Connection;
use serde::Deserialize;

use crate::attendance::AttendanceBook;
use crate::config::Settings;
use crate::grid::GridSession;
use crate::persist::{Confirmation, Persister};

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

#[derive(Default)]
pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
    pub persister: Option<Persister>,
    pub current_user: Option<String>,
    pub settings: Settings,
    /// Open grids by course id.
    pub grids: HashMap<String, GridSession>,
    pub attendance: AttendanceBook,
}

impl AppState {
    pub fn save_debounce(&self) -> Duration {
        Duration::from_millis(self.settings.grid.save_debounce_ms)
    }

    /// Applies whatever the writer has finished since the last request.
    pub fn drain_confirmations(&mut self) {
        let confirmations = match self.persister.as_ref() {
            Some(p) => p.drain(),
            None => return,
        };
        self.apply_confirmations(confirmations);
    }

    /// Blocks until every queued write has been applied.
    pub fn flush_writes(&mut self) -> anyhow::Result<()> {
        let confirmations = match self.persister.as_ref() {
            Some(p) => p.flush()?,
            None => return Ok(()),
        };
        self.apply_confirmations(confirmations);
        Ok(())
    }

    fn apply_confirmations(&mut self, confirmations: Vec<Confirmation>) {
        let now = Instant::now();
        for c in confirmations {
            match c {
                Confirmation::Cell { course_id, key, ok } => {
                    if let Some(session) = self.grids.get_mut(&course_id) {
                        session.confirm(&key, ok, now);
                    }
                }
                Confirmation::Attendance { key, ok } => {
                    if !ok {
                        tracing::debug!(course_id = %key.course_id, "attendance write confirmed as failed");
                    }
                    self.attendance.confirm(&key);
                }
            }
        }
    }

    /// Drops the writer (which drains its queue), the connection and all
    /// session views.
    pub fn close_workspace(&mut self) {
        self.persister = None;
        self.db = None;
        self.workspace = None;
        self.grids.clear();
        self.attendance.clear();
        self.settings = Settings::default();
    }
}
