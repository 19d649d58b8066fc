/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The public entry point.
//!
//! `SyncStore` owns every store connection and serializes intra-process use
//! behind a mutex, so the UI shell and background jobs can share one
//! instance without touching raw connections. Cross-process coordination
//! goes through [`SyncStore::acquire_global_lock`].

use crate::changelog::{Change, ChangeTracker, Operation, Session};
use crate::config::SyncConfig;
use crate::db::{OpenLocation, StoreDb};
use crate::engine::{SyncOrchestrator, SyncResult};
use crate::error::Result;
use crate::lock::{GlobalLock, LockHandle};
use crate::provider::DataProvider;
use crate::schema::StoreRole;
use crate::synclog::SyncLog;
use interrupt_support::Interruptee;
use parking_lot::Mutex;
use std::time::Duration;

pub struct SyncStore {
    engine: Mutex<SyncOrchestrator>,
    lock: GlobalLock,
    lock_wait: Duration,
}

impl SyncStore {
    /// Open all four stores and bootstrap their engine-owned tables. The
    /// caller's user tables are its own business.
    pub fn new(config: SyncConfig) -> Result<Self> {
        let local = StoreDb::open(&config.local_store, StoreRole::Data, OpenLocation::Local)?;
        let remote = StoreDb::open(&config.remote_store, StoreRole::Data, OpenLocation::Shared)?;
        let change_log = StoreDb::open(
            &config.change_log_store,
            StoreRole::ChangeLog,
            OpenLocation::Local,
        )?;
        // The lock and the sync log share a store but not a connection;
        // lock polling must never queue behind log writes.
        let lock_db = StoreDb::open(&config.lock_store, StoreRole::Lock, OpenLocation::Shared)?;
        let sync_log_db = StoreDb::open(&config.lock_store, StoreRole::Lock, OpenLocation::Shared)?;

        let lock_wait = config.lock_wait;
        let tracker = ChangeTracker::new(change_log);
        let sync_log = SyncLog::new(sync_log_db);
        let engine = SyncOrchestrator::new(
            config.clone(),
            DataProvider::new(local, &config),
            DataProvider::new(remote, &config),
            tracker,
            sync_log,
        );
        Ok(SyncStore {
            engine: Mutex::new(engine),
            lock: GlobalLock::new(lock_db),
            lock_wait,
        })
    }

    /// Run one sync. Blocks the calling thread; honor `interruptee` from
    /// another thread to cancel at phase/table boundaries.
    pub fn synchronize(
        &self,
        progress: &mut dyn FnMut(u8, &str),
        interruptee: &dyn Interruptee,
    ) -> SyncResult {
        self.engine.lock().synchronize(progress, interruptee)
    }

    /// Record one local mutation into the change log.
    pub fn record_change(&self, table: &str, record_id: &str, operation: &Operation) -> Result<()> {
        self.engine.lock().tracker().record(table, record_id, operation)
    }

    /// Record many mutations in one transaction.
    pub fn record_changes(&self, changes: &[Change]) -> Result<()> {
        self.engine.lock().tracker().record_batch(changes)
    }

    /// Run `f` against a change-log session (one open transaction and one
    /// prepared insert, so per-row cost stays flat for bulk imports). The
    /// session commits when `f` returns Ok and rolls back otherwise.
    pub fn with_session<R>(&self, f: impl FnOnce(&mut Session<'_>) -> Result<R>) -> Result<R> {
        let engine = self.engine.lock();
        let mut session = engine.tracker().begin_session()?;
        let out = f(&mut session)?;
        session.commit()?;
        Ok(out)
    }

    /// Take a named cluster-wide lock, typically [`crate::GLOBAL_LOCK_ID`]
    /// before a bulk import. Returns Ok(None) when the wait budget expires.
    pub fn acquire_global_lock(
        &self,
        name: &str,
        reason: &str,
        lease: Duration,
        interruptee: &dyn Interruptee,
    ) -> Result<Option<LockHandle<'_>>> {
        self.lock.acquire(name, reason, lease, self.lock_wait, interruptee)
    }
}
