/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Shared, append-only observability log.
//!
//! Every run writes `Started`, then best-effort `Progress` entries, and
//! exactly one of `Completed` or `Failed`. On startup, a `Started` with no
//! matching terminal entry means the previous run died mid-flight; a
//! `Resuming` entry records that we noticed. Entries live in the shared
//! lock store so any workstation (or a support engineer) can see the
//! cluster's recent history.

use crate::db::StoreDb;
use crate::error::{Error, Result};
use rusqlite::named_params;
use sql_support::ConnExt;
use types::Timestamp;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogStatus {
    Started,
    Progress,
    Completed,
    Failed,
    Resuming,
}

impl LogStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            LogStatus::Started => "Started",
            LogStatus::Progress => "Progress",
            LogStatus::Completed => "Completed",
            LogStatus::Failed => "Failed",
            LogStatus::Resuming => "Resuming",
        }
    }
}

/// One stored log entry.
#[derive(Clone, Debug)]
pub struct SyncLogEntry {
    pub id: i64,
    pub operation: String,
    pub status: String,
    pub details: Option<String>,
    pub timestamp: Timestamp,
}

pub struct SyncLog {
    db: StoreDb,
}

impl SyncLog {
    pub fn new(db: StoreDb) -> Self {
        SyncLog { db }
    }

    pub fn append(&self, operation: &str, status: LogStatus, details: &str) -> Result<()> {
        self.db.with_timeout(|db| {
            db.execute_cached(
                "INSERT INTO SyncLog (operation, status, details, timestamp)
                 VALUES (:op, :status, :details, :ts)",
                named_params! {
                    ":op": operation,
                    ":status": status.as_str(),
                    ":details": details,
                    ":ts": Timestamp::now(),
                },
            )?;
            Ok(())
        })
    }

    /// Append without letting a log failure abort the caller. Progress
    /// entries use this - observability must never break the sync itself.
    pub fn append_best_effort(&self, operation: &str, status: LogStatus, details: &str) {
        if let Err(e) = self.append(operation, status, details) {
            log::warn!("Couldn't write sync log entry ({}): {}", status.as_str(), e);
        }
    }

    /// If the most recent entry for `operation` is a dangling `Started`,
    /// record `Resuming` and report true.
    pub fn note_resumed_if_dangling(&self, operation: &str) -> Result<bool> {
        let last_status: Option<String> = self.db.with_timeout(|db| {
            db.try_query_row(
                "SELECT status FROM SyncLog WHERE operation = :op
                 ORDER BY timestamp DESC, id DESC LIMIT 1",
                named_params! { ":op": operation },
                |row| row.get(0).map_err(Error::from),
                true,
            )
        })?;
        if last_status.as_deref() == Some(LogStatus::Started.as_str()) {
            self.append(operation, LogStatus::Resuming, "previous run did not finish")?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Most recent entries, newest first. For diagnostics and tests.
    pub fn recent(&self, operation: &str, limit: u32) -> Result<Vec<SyncLogEntry>> {
        self.db.with_timeout(|db| {
            db.query_rows_and_then(
                "SELECT id, operation, status, details, timestamp FROM SyncLog
                 WHERE operation = :op ORDER BY timestamp DESC, id DESC LIMIT :limit",
                named_params! { ":op": operation, ":limit": limit },
                |row| {
                    Ok(SyncLogEntry {
                        id: row.get("id")?,
                        operation: row.get("operation")?,
                        status: row.get("status")?,
                        details: row.get("details")?,
                        timestamp: row.get("timestamp")?,
                    })
                },
            )
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::db::StoreDb;
    use crate::schema::StoreRole;

    fn sync_log() -> SyncLog {
        SyncLog::new(StoreDb::open_in_memory("synclog-test", StoreRole::Lock).unwrap())
    }

    #[test]
    fn test_append_and_recent() {
        let log = sync_log();
        log.append("Sync", LogStatus::Started, "{}").unwrap();
        log.append("Sync", LogStatus::Completed, r#"{"pushed":1}"#).unwrap();
        let entries = log.recent("Sync", 10).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].status, "Completed");
        assert_eq!(entries[1].status, "Started");
    }

    #[test]
    fn test_dangling_started_resumes() {
        let log = sync_log();
        log.append("Sync", LogStatus::Started, "{}").unwrap();
        assert!(log.note_resumed_if_dangling("Sync").unwrap());
        let entries = log.recent("Sync", 1).unwrap();
        assert_eq!(entries[0].status, "Resuming");
        // The Resuming entry itself isn't a dangling start.
        assert!(!log.note_resumed_if_dangling("Sync").unwrap());
    }

    #[test]
    fn test_finished_run_does_not_resume() {
        let log = sync_log();
        log.append("Sync", LogStatus::Started, "{}").unwrap();
        log.append("Sync", LogStatus::Failed, "boom").unwrap();
        assert!(!log.note_resumed_if_dangling("Sync").unwrap());
        // Nothing for an operation we've never logged.
        assert!(!log.note_resumed_if_dangling("Import").unwrap());
    }
}
