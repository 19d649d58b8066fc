/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Engine-owned tables.
//!
//! Three store roles, each bootstrapped on first open:
//!
//! - `Data` (local replica and the shared canonical copy): just the
//!   `_SyncConfig` parameter table. User tables belong to the caller.
//! - `ChangeLog`: `_SyncConfig` plus the append-only `ChangeLog` table.
//! - `Lock` (shared): `_SyncConfig`, `SyncLocks`, and the `SyncLog`
//!   observability table.
//!
//! The schema version lives in `PRAGMA user_version` per store; version 0
//! means a fresh database.

use crate::error::Result;
use rusqlite::Connection;
use sql_support::ConnExt;

pub(crate) const VERSION: u32 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreRole {
    Data,
    ChangeLog,
    Lock,
}

const CREATE_CONFIG_TABLE_SQL: &str = "
    CREATE TABLE IF NOT EXISTS _SyncConfig (
        configKey     TEXT NOT NULL PRIMARY KEY,
        configValue   TEXT
    )";

const CREATE_CHANGE_LOG_TABLE_SQL: &str = "
    CREATE TABLE IF NOT EXISTS ChangeLog (
        changeId      INTEGER PRIMARY KEY AUTOINCREMENT,
        tableName     TEXT NOT NULL,
        recordId      TEXT NOT NULL,
        operation     TEXT NOT NULL,
        timestamp     INTEGER NOT NULL,
        synchronized  INTEGER NOT NULL DEFAULT 0
    )";

// get_unsynced scans this constantly; mark_synced updates by rowid.
const CREATE_CHANGE_LOG_INDEX_SQL: &str = "
    CREATE INDEX IF NOT EXISTS idx_changelog_unsynced
        ON ChangeLog(synchronized, timestamp)";

const CREATE_LOCKS_TABLE_SQL: &str = "
    CREATE TABLE IF NOT EXISTS SyncLocks (
        lockId        TEXT NOT NULL PRIMARY KEY,
        reason        TEXT,
        createdAt     INTEGER NOT NULL,
        expiresAt     INTEGER NOT NULL,
        machineName   TEXT,
        processId     INTEGER
    )";

const CREATE_SYNC_LOG_TABLE_SQL: &str = "
    CREATE TABLE IF NOT EXISTS SyncLog (
        id            INTEGER PRIMARY KEY AUTOINCREMENT,
        operation     TEXT NOT NULL,
        status        TEXT NOT NULL,
        details       TEXT,
        timestamp     INTEGER NOT NULL
    )";

pub(crate) fn init(conn: &Connection, role: StoreRole) -> Result<()> {
    let user_version: u32 = conn.query_one("PRAGMA user_version")?;
    if user_version == VERSION {
        return Ok(());
    }
    let tx = conn.unchecked_transaction()?;
    if user_version == 0 {
        create(&tx, role)?;
    } else if user_version < VERSION {
        upgrade(&tx, role, user_version)?;
    } else {
        log::warn!(
            "Store schema version {} is newer than this engine ({}); continuing",
            user_version,
            VERSION
        );
        return Ok(());
    }
    tx.execute_batch(&format!("PRAGMA user_version = {}", VERSION))?;
    tx.commit()?;
    Ok(())
}

fn create(conn: &Connection, role: StoreRole) -> Result<()> {
    log::debug!("Creating {:?} store schema v{}", role, VERSION);
    conn.execute(CREATE_CONFIG_TABLE_SQL, [])?;
    match role {
        StoreRole::Data => {}
        StoreRole::ChangeLog => {
            conn.execute_all(&[CREATE_CHANGE_LOG_TABLE_SQL, CREATE_CHANGE_LOG_INDEX_SQL])?;
        }
        StoreRole::Lock => {
            conn.execute_all(&[CREATE_LOCKS_TABLE_SQL, CREATE_SYNC_LOG_TABLE_SQL])?;
        }
    }
    Ok(())
}

fn upgrade(_conn: &Connection, role: StoreRole, from: u32) -> Result<()> {
    log::debug!("Upgrading {:?} store schema from v{}", role, from);
    // v1 is the first versioned schema; nothing to migrate yet.
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_init_data_store() {
        let conn = Connection::open_in_memory().unwrap();
        init(&conn, StoreRole::Data).unwrap();
        let n: i64 = conn
            .query_one("SELECT COUNT(*) FROM sqlite_master WHERE name = '_SyncConfig'")
            .unwrap();
        assert_eq!(n, 1);
        let v: u32 = conn.query_one("PRAGMA user_version").unwrap();
        assert_eq!(v, VERSION);
    }

    #[test]
    fn test_init_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init(&conn, StoreRole::ChangeLog).unwrap();
        init(&conn, StoreRole::ChangeLog).unwrap();
        let n: i64 = conn
            .query_one("SELECT COUNT(*) FROM sqlite_master WHERE name = 'ChangeLog'")
            .unwrap();
        assert_eq!(n, 1);
    }

    #[test]
    fn test_lock_store_tables() {
        let conn = Connection::open_in_memory().unwrap();
        init(&conn, StoreRole::Lock).unwrap();
        for table in ["SyncLocks", "SyncLog", "_SyncConfig"] {
            let n: i64 = conn
                .query_one(&format!(
                    "SELECT COUNT(*) FROM sqlite_master WHERE name = '{}'",
                    table
                ))
                .unwrap();
            assert_eq!(n, 1, "missing {}", table);
        }
    }
}
