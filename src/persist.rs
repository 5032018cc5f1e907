//! Background writer for optimistic edits. One worker thread owns its own
//! store connection and applies jobs in submission order, so writes to the
//! same key land last-write-wins.

use crate::attendance::{self, AttendanceKey, MarkWrite};
use crate::db;
use crate::grid::{self, CellWrite};
use std::path::Path;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::JoinHandle;

#[derive(Debug, Clone)]
pub enum WriteOp {
    Cell { course_id: String, write: CellWrite },
    Attendance(MarkWrite),
}

#[derive(Debug, Clone)]
pub enum Confirmation {
    Cell {
        course_id: String,
        key: String,
        ok: bool,
    },
    Attendance {
        key: AttendanceKey,
        ok: bool,
    },
}

enum Job {
    Write(WriteOp),
    Barrier(Sender<()>),
}

pub struct Persister {
    jobs: Option<Sender<Job>>,
    done: Receiver<Confirmation>,
    worker: Option<JoinHandle<()>>,
}

impl Persister {
    pub fn start(db_path: &Path) -> anyhow::Result<Self> {
        let conn = db::connect(db_path)?;
        let (job_tx, job_rx) = mpsc::channel::<Job>();
        let (done_tx, done_rx) = mpsc::channel::<Confirmation>();

        let worker = std::thread::Builder::new()
            .name("classbook-writer".to_string())
            .spawn(move || {
                for job in job_rx {
                    match job {
                        Job::Write(op) => {
                            let confirmation = apply(&conn, op);
                            if done_tx.send(confirmation).is_err() {
                                break;
                            }
                        }
                        Job::Barrier(reply) => {
                            let _ = reply.send(());
                        }
                    }
                }
            })?;

        Ok(Self {
            jobs: Some(job_tx),
            done: done_rx,
            worker: Some(worker),
        })
    }

    pub fn submit(&self, op: WriteOp) -> anyhow::Result<()> {
        let Some(jobs) = self.jobs.as_ref() else {
            anyhow::bail!("writer is shut down");
        };
        jobs.send(Job::Write(op))
            .map_err(|_| anyhow::anyhow!("writer thread has stopped"))
    }

    /// Confirmations that have arrived so far, without waiting.
    pub fn drain(&self) -> Vec<Confirmation> {
        self.done.try_iter().collect()
    }

    /// Waits until everything submitted before this call has been applied.
    pub fn flush(&self) -> anyhow::Result<Vec<Confirmation>> {
        let Some(jobs) = self.jobs.as_ref() else {
            return Ok(self.drain());
        };
        let (tx, rx) = mpsc::channel();
        jobs.send(Job::Barrier(tx))
            .map_err(|_| anyhow::anyhow!("writer thread has stopped"))?;
        rx.recv()
            .map_err(|_| anyhow::anyhow!("writer thread has stopped"))?;
        Ok(self.drain())
    }
}

impl Drop for Persister {
    fn drop(&mut self) {
        // Closing the queue lets the worker finish what it has and exit.
        self.jobs.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn apply(conn: &rusqlite::Connection, op: WriteOp) -> Confirmation {
    match op {
        WriteOp::Cell { course_id, write } => {
            let key = write.key();
            let ok = match grid::upsert_record(conn, &write) {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(course_id = %course_id, key = %key, error = %e, "cell save failed");
                    false
                }
            };
            Confirmation::Cell { course_id, key, ok }
        }
        WriteOp::Attendance(write) => {
            let ok = match attendance::apply_mark_write(conn, &write) {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(
                        course_id = %write.key().course_id,
                        student_id = %write.key().student_id,
                        date = %write.key().date,
                        error = %e,
                        "attendance save failed"
                    );
                    false
                }
            };
            Confirmation::Attendance {
                key: write.key().clone(),
                ok,
            }
        }
    }
}
