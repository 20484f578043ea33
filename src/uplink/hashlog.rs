//! Per-resource change-log persistence.
//!
//! The change-log records, per payload fingerprint, when that payload was
//! last dispatched and what status the API returned. It is what makes
//! repeated runs idempotent: a fingerprint already present and not matching
//! any resend criterion is skipped without an HTTP call.
//!
//! Storage is one SQLite file per resource under the state directory
//! (`<resource>.dat`). The whole table is read into memory before a resource
//! is processed; concurrent tasks each touch only their own fingerprint's
//! entry; the table is rewritten once after every in-flight task for the
//! resource has completed. A crash therefore loses at most one resource's
//! progress.

use std::fs;
use std::path::{Path, PathBuf};

use dashmap::DashMap;
use rusqlite::{Connection, params};
use thiserror::Error;

use crate::uplink::payload::Fingerprint;

#[derive(Error, Debug)]
pub enum HashlogError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("corrupt change-log entry in {0}")]
    Corrupt(String),
}

pub type HashlogResult<T> = Result<T, HashlogError>;

/// Outcome of the last dispatch of one payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogEntry {
    /// Unix timestamp of the last attempt.
    pub last_sent: i64,
    /// HTTP status the API returned for that attempt.
    pub status: u16,
}

/// In-memory view of one resource's change-log, backed by a SQLite file.
pub struct ChangeLog {
    path: PathBuf,
    entries: DashMap<Fingerprint, LogEntry>,
}

impl ChangeLog {
    /// Loads the change-log for a resource. A missing file is an empty log,
    /// not an error.
    pub fn load(state_dir: &Path, resource: &str) -> HashlogResult<Self> {
        let path = state_dir.join(format!("{resource}.dat"));
        let entries = DashMap::new();

        if path.is_file() {
            let conn = Connection::open(&path)?;
            let mut stmt =
                conn.prepare("SELECT fingerprint, last_sent, status FROM hashlog")?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let blob: Vec<u8> = row.get(0)?;
                let fingerprint: Fingerprint = blob
                    .try_into()
                    .map_err(|_| HashlogError::Corrupt(path.display().to_string()))?;
                let last_sent: i64 = row.get(1)?;
                let status: u16 = row.get::<_, i64>(2)? as u16;
                entries.insert(fingerprint, LogEntry { last_sent, status });
            }
        }

        Ok(Self { path, entries })
    }

    pub fn get(&self, fingerprint: &Fingerprint) -> Option<LogEntry> {
        self.entries.get(fingerprint).map(|e| *e.value())
    }

    /// Records the outcome of a dispatch. Tasks only ever write their own
    /// fingerprint's entry, so concurrent writes never contend on a key.
    pub fn record(&self, fingerprint: Fingerprint, entry: LogEntry) {
        self.entries.insert(fingerprint, entry);
    }

    /// Drops a fingerprint after its remote record was deleted.
    pub fn remove(&self, fingerprint: &Fingerprint) {
        self.entries.remove(fingerprint);
    }

    /// Empties the log (used by truncate, after which nothing the log
    /// tracked still exists remotely).
    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Rewrites the SQLite file from the in-memory map in one transaction.
    /// Called once per resource, after all tasks have completed.
    pub fn save(&self) -> HashlogResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut conn = Connection::open(&self.path)?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS hashlog (
                fingerprint BLOB PRIMARY KEY,
                last_sent   INTEGER NOT NULL,
                status      INTEGER NOT NULL
            )",
            [],
        )?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM hashlog", [])?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO hashlog (fingerprint, last_sent, status) VALUES (?1, ?2, ?3)",
            )?;
            for item in self.entries.iter() {
                stmt.execute(params![
                    item.key().as_slice(),
                    item.value().last_sent,
                    item.value().status as i64
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }
}
