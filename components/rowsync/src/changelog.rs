/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The durable, append-only change log.
//!
//! Every local row mutation lands here as `(table, recordId, operation,
//! timestamp, synchronized)`. Entries are never rewritten; the only mutation
//! ever applied is flipping `synchronized` from 0 to 1 once the change has
//! been pushed. Compaction, if any, belongs to an external tool.

use crate::db::StoreDb;
use crate::error::{Error, Result};
use rusqlite::{named_params, CachedStatement};
use sql_support::{ConnExt, TimeoutGuard, UncheckedTransaction};
use std::collections::BTreeSet;
use std::time::Duration;
use types::Timestamp;

const INSERT_SQL: &str = "
    INSERT INTO ChangeLog (tableName, recordId, operation, timestamp, synchronized)
    VALUES (:table, :id, :op, :ts, 0)";

/// A change-log operation.
///
/// The stored grammar is `INSERT`, `DELETE`, or `UPDATE(col1,col2,...)`. An
/// `UPDATE` with no column list (or an empty one) means "no column info,
/// treat as a full-row update". Anything unrecognized reads as that same
/// full-row `UPDATE`, so old or foreign writers can't wedge the push.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Operation {
    Insert,
    Delete,
    Update(Vec<String>),
}

impl Operation {
    pub fn parse(s: &str) -> Operation {
        let t = s.trim();
        if t.eq_ignore_ascii_case("INSERT") {
            return Operation::Insert;
        }
        if t.eq_ignore_ascii_case("DELETE") {
            return Operation::Delete;
        }
        if t.len() >= 6 && t[..6].eq_ignore_ascii_case("UPDATE") {
            let rest = t[6..].trim();
            if let Some(inner) = rest.strip_prefix('(').and_then(|r| r.strip_suffix(')')) {
                let cols: Vec<String> = inner
                    .split(',')
                    .map(str::trim)
                    .filter(|c| !c.is_empty())
                    .map(str::to_string)
                    .collect();
                return Operation::Update(cols);
            }
            return Operation::Update(Vec::new());
        }
        Operation::Update(Vec::new())
    }

    /// Fold `next` (observed later in time) onto `self` for the same record.
    /// DELETE overrides everything before it, INSERT overrides UPDATEs, and
    /// UPDATEs union their column sets - where an empty set means "full
    /// row" and absorbs any union.
    pub fn merge(self, next: Operation) -> Operation {
        match next {
            Operation::Delete => Operation::Delete,
            Operation::Insert => Operation::Insert,
            Operation::Update(cols) => match self {
                Operation::Insert => Operation::Insert,
                // An update for a record we saw deleted; push the full row.
                Operation::Delete => Operation::Update(Vec::new()),
                Operation::Update(prev) => {
                    if prev.is_empty() || cols.is_empty() {
                        Operation::Update(Vec::new())
                    } else {
                        let mut union = prev;
                        for col in cols {
                            if !union.iter().any(|c| c.eq_ignore_ascii_case(&col)) {
                                union.push(col);
                            }
                        }
                        Operation::Update(union)
                    }
                }
            },
        }
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, Operation::Delete)
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operation::Insert => write!(f, "INSERT"),
            Operation::Delete => write!(f, "DELETE"),
            Operation::Update(cols) if cols.is_empty() => write!(f, "UPDATE"),
            Operation::Update(cols) => write!(f, "UPDATE({})", cols.join(",")),
        }
    }
}

/// A change to record; see [`ChangeTracker::record_batch`].
#[derive(Clone, Debug)]
pub struct Change {
    pub table: String,
    pub record_id: String,
    pub operation: Operation,
}

impl Change {
    pub fn new(table: impl Into<String>, record_id: impl Into<String>, operation: Operation) -> Self {
        Change {
            table: table.into(),
            record_id: record_id.into(),
            operation,
        }
    }
}

/// One stored change-log entry.
#[derive(Clone, Debug, PartialEq)]
pub struct ChangeLogEntry {
    pub id: i64,
    pub table_name: String,
    pub record_id: String,
    pub operation: Operation,
    pub timestamp: Timestamp,
    pub synced: bool,
}

pub struct ChangeTracker {
    db: StoreDb,
}

impl ChangeTracker {
    pub fn new(db: StoreDb) -> Self {
        ChangeTracker { db }
    }

    pub fn db(&self) -> &StoreDb {
        &self.db
    }

    /// Record a single mutation. For more than a handful of rows prefer
    /// `record_batch` or a [`Session`].
    pub fn record(&self, table: &str, record_id: &str, operation: &Operation) -> Result<()> {
        self.db.with_timeout(|db| {
            db.execute_cached(
                INSERT_SQL,
                named_params! {
                    ":table": table,
                    ":id": record_id,
                    ":op": operation.to_string(),
                    ":ts": Timestamp::now(),
                },
            )?;
            Ok(())
        })
    }

    /// Record many mutations in one transaction with one prepared statement.
    pub fn record_batch(&self, changes: &[Change]) -> Result<()> {
        if changes.is_empty() {
            return Ok(());
        }
        self.db.with_timeout(|db| {
            let tx = db.unchecked_transaction()?;
            {
                let mut stmt = tx.prepare_cached(INSERT_SQL)?;
                for change in changes {
                    stmt.execute(named_params! {
                        ":table": change.table,
                        ":id": change.record_id,
                        ":op": change.operation.to_string(),
                        ":ts": Timestamp::now(),
                    })?;
                }
            }
            tx.commit()?;
            Ok(())
        })
    }

    /// Open a session holding a live transaction and prepared insert, so
    /// that per-row cost is just a statement execution. Dropping the session
    /// without committing rolls everything back.
    pub fn begin_session(&self) -> Result<Session<'_>> {
        let tx = self.db.unchecked_transaction()?;
        let stmt = self.db.prepare_cached(INSERT_SQL)?;
        Ok(Session {
            tx: Some(tx),
            stmt,
            budget: crate::db::DEFAULT_OP_BUDGET,
            added: 0,
        })
    }

    /// Unsynced entries in the order they happened.
    pub fn get_unsynced(&self) -> Result<Vec<ChangeLogEntry>> {
        self.db.with_timeout(|db| {
            db.query_rows_and_then(
                "SELECT changeId, tableName, recordId, operation, timestamp, synchronized
                 FROM ChangeLog
                 WHERE synchronized = 0
                 ORDER BY timestamp ASC, changeId ASC",
                [],
                |row| {
                    Ok(ChangeLogEntry {
                        id: row.get("changeId")?,
                        table_name: row.get("tableName")?,
                        record_id: row.get("recordId")?,
                        operation: Operation::parse(&row.get::<_, String>("operation")?),
                        timestamp: row.get("timestamp")?,
                        synced: row.get("synchronized")?,
                    })
                },
            )
        })
    }

    /// Flip `synchronized` for the given entries. Duplicate and non-positive
    /// ids are discarded; updates run in bounded chunks.
    pub fn mark_synced(&self, ids: &[i64]) -> Result<()> {
        let ids: Vec<i64> = ids
            .iter()
            .copied()
            .filter(|id| *id > 0)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if ids.is_empty() {
            return Ok(());
        }
        self.db.with_timeout(|db| {
            sql_support::each_chunk(&ids, |chunk, _| -> Result<()> {
                db.execute(
                    &format!(
                        "UPDATE ChangeLog SET synchronized = 1 WHERE changeId IN ({})",
                        sql_support::repeat_sql_vars(chunk.len())
                    ),
                    chunk,
                )?;
                Ok(())
            })
        })
    }
}

/// A scoped handle over an open change-log transaction. `commit` is
/// idempotent; a session dropped without commit rolls back.
pub struct Session<'a> {
    tx: Option<UncheckedTransaction<'a>>,
    stmt: CachedStatement<'a>,
    budget: Duration,
    added: usize,
}

impl Session<'_> {
    pub fn add(&mut self, table: &str, record_id: &str, operation: &Operation) -> Result<()> {
        if self.tx.is_none() {
            return Err(Error::InvariantViolation(
                "add() on a committed session".to_string(),
            ));
        }
        self.stmt.execute(named_params! {
            ":table": table,
            ":id": record_id,
            ":op": operation.to_string(),
            ":ts": Timestamp::now(),
        })?;
        self.added += 1;
        Ok(())
    }

    /// Number of entries added so far.
    pub fn len(&self) -> usize {
        self.added
    }

    pub fn is_empty(&self) -> bool {
        self.added == 0
    }

    pub fn commit(&mut self) -> Result<()> {
        if let Some(tx) = self.tx.take() {
            let guard = TimeoutGuard::arm(tx.conn, self.budget);
            let res = tx.commit();
            if let Err(ref e) = res {
                if guard.fired() && sql_support::is_interrupt_error(e) {
                    return Err(Error::Timeout(self.budget));
                }
            }
            res?;
        }
        Ok(())
    }
}
