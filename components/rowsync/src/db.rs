/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Store connections.
//!
//! A `StoreDb` wraps one rusqlite connection to one of the engine's four
//! logical stores. Opening bootstraps the engine-owned tables for the
//! store's role and applies pragmas suited to where the file lives: local
//! replicas get WAL, shared network files get rollback journaling plus a
//! generous busy timeout and an IMMEDIATE-transaction habit in callers.
//!
//! Every operation the engine runs through a `StoreDb` is bounded by a
//! wall-clock budget, independent of SQLite's own lock timeout: see
//! [`StoreDb::with_timeout`].

use crate::error::{Error, Result};
use crate::schema::{self, StoreRole};
use rusqlite::Connection;
use sql_support::{ConnExt, TimeoutGuard};
use std::ops::Deref;
use std::path::Path;
use std::time::Duration;

/// Default wall-clock budget for a single store operation.
pub const DEFAULT_OP_BUDGET: Duration = Duration::from_secs(60);

/// How long SQLite itself waits on a locked database before failing with
/// SQLITE_BUSY (which the retry layer treats as transient).
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpenLocation {
    /// A file owned by this process (local replica, change log).
    Local,
    /// A file on a shared path written by many clients.
    Shared,
}

pub struct StoreDb {
    pub db: Connection,
    /// Identifies this store in the per-process schema cache.
    tag: String,
    op_budget: Duration,
}

impl StoreDb {
    pub fn open(path: impl AsRef<Path>, role: StoreRole, location: OpenLocation) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        let tag = path.to_string_lossy().into_owned();
        Self::init_connection(conn, tag, role, location)
    }

    /// Wrap an already-open connection; used by tests and by callers that
    /// manage their own connection lifetimes.
    pub fn with_connection(conn: Connection, tag: impl Into<String>, role: StoreRole) -> Result<Self> {
        Self::init_connection(conn, tag.into(), role, OpenLocation::Local)
    }

    pub fn open_in_memory(tag: impl Into<String>, role: StoreRole) -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?, tag, role)
    }

    fn init_connection(
        conn: Connection,
        tag: String,
        role: StoreRole,
        location: OpenLocation,
    ) -> Result<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        // Keep temp structures in memory; some deployments have no usable
        // tmp partition.
        conn.pragma_update(None, "temp_store", 2)?;
        if !conn.is_readonly(rusqlite::DatabaseName::Main)? {
            match location {
                OpenLocation::Local => {
                    // journal_mode returns the resulting mode as a row.
                    conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
                }
                OpenLocation::Shared => {
                    // WAL requires coherent shared memory, which network
                    // filesystems don't reliably provide.
                    conn.query_row("PRAGMA journal_mode = TRUNCATE", [], |_| Ok(()))?;
                }
            }
            schema::init(&conn, role)?;
        }
        Ok(StoreDb {
            db: conn,
            tag,
            op_budget: DEFAULT_OP_BUDGET,
        })
    }

    pub fn set_op_budget(&mut self, budget: Duration) {
        self.op_budget = budget;
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Run `op` under the store's wall-clock budget. If the watchdog
    /// interrupts the in-flight statement, the resulting SQLITE_INTERRUPT
    /// is reported as [`Error::Timeout`].
    pub fn with_timeout<T>(&self, op: impl FnOnce(&Self) -> Result<T>) -> Result<T> {
        let guard = TimeoutGuard::arm(&self.db, self.op_budget);
        let result = op(self);
        match result {
            Err(Error::Sql(ref e)) if guard.fired() && sql_support::is_interrupt_error(e) => {
                Err(Error::Timeout(self.op_budget))
            }
            other => other,
        }
    }

    // Scalar parameters in the reserved `_SyncConfig` table. Values are
    // textual; callers own any further parsing.

    pub fn get_parameter(&self, key: &str) -> Result<Option<String>> {
        self.with_timeout(|db| {
            Ok(db.try_query_row(
                "SELECT configValue FROM _SyncConfig WHERE configKey = :key",
                rusqlite::named_params! { ":key": key },
                |row| row.get(0).map_err(Error::from),
                true,
            )?)
        })
    }

    pub fn set_parameter(&self, key: &str, value: &str) -> Result<()> {
        self.with_timeout(|db| {
            db.execute_cached(
                "REPLACE INTO _SyncConfig (configKey, configValue) VALUES (:key, :value)",
                rusqlite::named_params! { ":key": key, ":value": value },
            )?;
            Ok(())
        })
    }

    pub fn delete_parameter(&self, key: &str) -> Result<()> {
        self.with_timeout(|db| {
            db.execute_cached(
                "DELETE FROM _SyncConfig WHERE configKey = :key",
                rusqlite::named_params! { ":key": key },
            )?;
            Ok(())
        })
    }

}

impl ConnExt for StoreDb {
    #[inline]
    fn conn(&self) -> &Connection {
        &self.db
    }
}

impl Deref for StoreDb {
    type Target = Connection;
    #[inline]
    fn deref(&self) -> &Connection {
        &self.db
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parameters() {
        let db = StoreDb::open_in_memory("param-test", StoreRole::Data).unwrap();
        assert_eq!(db.get_parameter("LastSyncTimestamp").unwrap(), None);
        db.set_parameter("LastSyncTimestamp", "2022-01-01T00:00:00.000Z")
            .unwrap();
        assert_eq!(
            db.get_parameter("LastSyncTimestamp").unwrap().as_deref(),
            Some("2022-01-01T00:00:00.000Z")
        );
        db.set_parameter("LastSyncTimestamp", "2023-01-01T00:00:00.000Z")
            .unwrap();
        assert_eq!(
            db.get_parameter("LastSyncTimestamp").unwrap().as_deref(),
            Some("2023-01-01T00:00:00.000Z")
        );
        db.delete_parameter("LastSyncTimestamp").unwrap();
        assert_eq!(db.get_parameter("LastSyncTimestamp").unwrap(), None);
    }

    #[test]
    fn test_open_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("local.db");
        {
            let db = StoreDb::open(&path, StoreRole::Data, OpenLocation::Local).unwrap();
            db.set_parameter("k", "v").unwrap();
        }
        let db = StoreDb::open(&path, StoreRole::Data, OpenLocation::Shared).unwrap();
        assert_eq!(db.get_parameter("k").unwrap().as_deref(), Some("v"));
    }

    #[test]
    fn test_timeout_maps_to_timeout_error() {
        let mut db = StoreDb::open_in_memory("timeout-test", StoreRole::Data).unwrap();
        db.set_op_budget(Duration::from_millis(50));
        let res: Result<i64> = db.with_timeout(|db| {
            Ok(db.query_one(
                "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x+1 FROM c)
                 SELECT COUNT(*) FROM c",
            )?)
        });
        assert!(matches!(res, Err(Error::Timeout(_))), "{:?}", res);
    }
}
