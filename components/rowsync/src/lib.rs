/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Offline-first synchronization for row-oriented tabular data.
//!
//! Each workstation holds a local replica of its dataset, accumulates
//! mutations into a durable change log while disconnected, and periodically
//! reconciles with a shared canonical copy: push local changes as upserts,
//! pull remote changes since the anchor, resolve conflicts (last writer
//! wins by default), and advance the anchor. Convergence is eventual; the
//! engine guarantees no lost local edits across crashes, no duplicated
//! application of remote rows, and safe concurrent writers against the
//! shared copy.
//!
//! [`SyncStore`] is the front door. The pieces underneath - change
//! tracker, data provider, conflict resolver, global lock, sync log - are
//! public for callers that need finer control.

pub mod changelog;
pub mod codec;
pub mod config;
pub mod conflict;
pub mod db;
pub mod engine;
pub mod error;
pub mod lock;
pub mod provider;
pub mod retry;
pub mod row;
pub mod schema;
pub mod store;
pub mod synclog;
mod util;

pub use changelog::{Change, ChangeLogEntry, ChangeTracker, Operation, Session};
pub use config::SyncConfig;
pub use conflict::{Conflict, ConflictResolver, ConflictType, ResolutionPolicy};
pub use db::{OpenLocation, StoreDb};
pub use engine::{SyncOrchestrator, SyncResult, LAST_SYNC_PARAMETER};
pub use error::{Error, Result, SchemaError};
pub use lock::{GlobalLock, LockHandle, LockRecord, GLOBAL_LOCK_ID};
pub use provider::DataProvider;
pub use retry::{with_retry, RetryPolicy};
pub use row::{ColumnSchema, LogicalType, Row, Value};
pub use schema::StoreRole;
pub use store::SyncStore;
pub use synclog::{LogStatus, SyncLog, SyncLogEntry};
