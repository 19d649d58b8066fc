/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! A leased, named, cross-process mutex in the shared lock store.
//!
//! Acquisition is a single conditional upsert: insert the lock row, or
//! overwrite it if the existing lease has expired. Either way exactly one
//! writer can win, because the store serializes the statement. There is no
//! unbounded blocking - a wait budget caps the polling loop and expiry caps
//! how long a crashed holder can wedge the cluster.

use crate::db::StoreDb;
use crate::error::{Error, Result};
use interrupt_support::Interruptee;
use rand::Rng;
use rusqlite::named_params;
use sql_support::ConnExt;
use std::time::{Duration, Instant};
use types::Timestamp;

pub const MIN_WAIT: Duration = Duration::from_secs(30);
pub const MAX_WAIT: Duration = Duration::from_secs(600);
pub const MIN_LEASE: Duration = Duration::from_secs(120);
pub const MAX_LEASE: Duration = Duration::from_secs(1800);

/// The single lock id used to serialize cluster-wide bulk operations.
pub const GLOBAL_LOCK_ID: &str = "global";

const POLL_INTERVAL: Duration = Duration::from_millis(500);
const POLL_JITTER_MS: u64 = 250;

/// One row of the `SyncLocks` table.
#[derive(Clone, Debug, PartialEq)]
pub struct LockRecord {
    pub lock_id: String,
    pub reason: Option<String>,
    pub created_at: Timestamp,
    pub expires_at: Timestamp,
    pub machine_name: Option<String>,
    pub process_id: u32,
}

pub struct GlobalLock {
    db: StoreDb,
    machine_name: String,
    process_id: u32,
}

impl GlobalLock {
    pub fn new(db: StoreDb) -> Self {
        GlobalLock {
            db,
            machine_name: machine_name(),
            process_id: std::process::id(),
        }
    }

    /// Try to take `name` for `lease`, polling for at most `wait`. Returns
    /// Ok(None) when the wait budget runs out - never blocks forever. Both
    /// durations are clamped to the supported ranges.
    pub fn acquire(
        &self,
        name: &str,
        reason: &str,
        lease: Duration,
        wait: Duration,
        interruptee: &dyn Interruptee,
    ) -> Result<Option<LockHandle<'_>>> {
        self.acquire_inner(
            name,
            reason,
            lease.clamp(MIN_LEASE, MAX_LEASE),
            wait.clamp(MIN_WAIT, MAX_WAIT),
            interruptee,
        )
    }

    fn acquire_inner(
        &self,
        name: &str,
        reason: &str,
        lease: Duration,
        wait: Duration,
        interruptee: &dyn Interruptee,
    ) -> Result<Option<LockHandle<'_>>> {
        let deadline = Instant::now() + wait;
        loop {
            interruptee.err_if_interrupted()?;
            if self.try_acquire(name, reason, lease)? {
                log::debug!(
                    "Acquired lock {:?} for {:?} ({:?} lease)",
                    name,
                    reason,
                    lease
                );
                return Ok(Some(LockHandle {
                    lock: self,
                    lock_id: name.to_string(),
                    released: false,
                }));
            }
            let remaining = match deadline.checked_duration_since(Instant::now()) {
                Some(r) if !r.is_zero() => r,
                _ => {
                    log::warn!("Gave up waiting for lock {:?} after {:?}", name, wait);
                    return Ok(None);
                }
            };
            let nap = POLL_INTERVAL
                + Duration::from_millis(rand::thread_rng().gen_range(0..=POLL_JITTER_MS));
            std::thread::sleep(nap.min(remaining));
        }
    }

    /// One acquisition attempt: insert, or steal an expired lease. The
    /// WHERE clause on the upsert makes the steal conditional, so two
    /// concurrent stealers can't both win.
    fn try_acquire(&self, name: &str, reason: &str, lease: Duration) -> Result<bool> {
        self.db.with_timeout(|db| {
            let now = Timestamp::now();
            let expires = now
                .checked_add(lease)
                .ok_or_else(|| Error::InvariantViolation("lease overflows".to_string()))?;
            let changed = db.execute_cached(
                "INSERT INTO SyncLocks (lockId, reason, createdAt, expiresAt, machineName, processId)
                 VALUES (:id, :reason, :now, :expires, :machine, :pid)
                 ON CONFLICT(lockId) DO UPDATE SET
                     reason      = excluded.reason,
                     createdAt   = excluded.createdAt,
                     expiresAt   = excluded.expiresAt,
                     machineName = excluded.machineName,
                     processId   = excluded.processId
                 WHERE SyncLocks.expiresAt < :now",
                named_params! {
                    ":id": name,
                    ":reason": reason,
                    ":now": now,
                    ":expires": expires,
                    ":machine": self.machine_name,
                    ":pid": self.process_id,
                },
            )?;
            Ok(changed > 0)
        })
    }

    fn renew(&self, name: &str, lease: Duration) -> Result<()> {
        self.db.with_timeout(|db| {
            let now = Timestamp::now();
            let expires = now
                .checked_add(lease)
                .ok_or_else(|| Error::InvariantViolation("lease overflows".to_string()))?;
            let changed = db.execute_cached(
                "UPDATE SyncLocks SET expiresAt = :expires
                 WHERE lockId = :id AND machineName = :machine AND processId = :pid",
                named_params! {
                    ":expires": expires,
                    ":id": name,
                    ":machine": self.machine_name,
                    ":pid": self.process_id,
                },
            )?;
            if changed == 0 {
                // Someone stole an expired lease out from under us.
                return Err(Error::InvariantViolation(format!(
                    "lease on {:?} was lost before renewal",
                    name
                )));
            }
            Ok(())
        })
    }

    fn release(&self, name: &str) -> Result<()> {
        self.db.with_timeout(|db| {
            db.execute_cached(
                "DELETE FROM SyncLocks
                 WHERE lockId = :id AND machineName = :machine AND processId = :pid",
                named_params! {
                    ":id": name,
                    ":machine": self.machine_name,
                    ":pid": self.process_id,
                },
            )?;
            Ok(())
        })
    }

    /// The current record for `name`, expired or not.
    pub fn current_holder(&self, name: &str) -> Result<Option<LockRecord>> {
        self.db.with_timeout(|db| {
            db.try_query_row(
                "SELECT lockId, reason, createdAt, expiresAt, machineName, processId
                 FROM SyncLocks WHERE lockId = :id",
                named_params! { ":id": name },
                |row| {
                    Ok(LockRecord {
                        lock_id: row.get("lockId")?,
                        reason: row.get("reason")?,
                        created_at: row.get("createdAt")?,
                        expires_at: row.get("expiresAt")?,
                        machine_name: row.get("machineName")?,
                        process_id: row.get::<_, i64>("processId")? as u32,
                    })
                },
                true,
            )
        })
    }
}

/// Holding this means holding the lock. Dropping releases it; `release` may
/// also be called explicitly (idempotently) to observe errors.
pub struct LockHandle<'a> {
    lock: &'a GlobalLock,
    lock_id: String,
    released: bool,
}

impl LockHandle<'_> {
    pub fn lock_id(&self) -> &str {
        &self.lock_id
    }

    /// Extend the lease. Callers with a bounded operation usually just pick
    /// a long enough lease instead.
    pub fn renew(&self, lease: Duration) -> Result<()> {
        self.lock.renew(&self.lock_id, lease)
    }

    pub fn release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        self.lock.release(&self.lock_id)
    }
}

impl Drop for LockHandle<'_> {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = self.lock.release(&self.lock_id) {
                log::warn!("Failed to release lock {:?}: {}", self.lock_id, e);
            }
            self.released = true;
        }
    }
}

fn machine_name() -> String {
    std::env::var("COMPUTERNAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .ok()
        .or_else(|| {
            std::fs::read_to_string("/proc/sys/kernel/hostname")
                .ok()
                .map(|s| s.trim().to_string())
        })
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::schema::StoreRole;
    use crate::db::OpenLocation;
    use interrupt_support::{InterruptFlag, NeverInterrupts};

    struct LockStore {
        _dir: tempfile::TempDir,
        path: std::path::PathBuf,
    }

    impl LockStore {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("locks.db");
            LockStore { _dir: dir, path }
        }

        fn lock(&self) -> GlobalLock {
            GlobalLock::new(
                StoreDb::open(&self.path, StoreRole::Lock, OpenLocation::Shared).unwrap(),
            )
        }
    }

    const SHORT: Duration = Duration::from_millis(50);
    const LEASE: Duration = Duration::from_secs(300);

    #[test]
    fn test_acquire_and_release() {
        let store = LockStore::new();
        let a = store.lock();
        let mut handle = a
            .acquire_inner("global", "import", LEASE, SHORT, &NeverInterrupts)
            .unwrap()
            .expect("should acquire an uncontended lock");
        assert_eq!(handle.lock_id(), "global");
        let rec = a.current_holder("global").unwrap().unwrap();
        assert_eq!(rec.reason.as_deref(), Some("import"));
        assert_eq!(rec.process_id, std::process::id());
        handle.release().unwrap();
        handle.release().unwrap(); // idempotent
        assert!(a.current_holder("global").unwrap().is_none());
    }

    #[test]
    fn test_contention_times_out() {
        let store = LockStore::new();
        let a = store.lock();
        let b = store.lock();
        let _held = a
            .acquire_inner("global", "import", LEASE, SHORT, &NeverInterrupts)
            .unwrap()
            .unwrap();
        let started = Instant::now();
        let denied = b
            .acquire_inner("global", "report", LEASE, SHORT, &NeverInterrupts)
            .unwrap();
        assert!(denied.is_none());
        assert!(started.elapsed() >= SHORT);
    }

    #[test]
    fn test_drop_releases() {
        let store = LockStore::new();
        let a = store.lock();
        {
            let _handle = a
                .acquire_inner("global", "first", LEASE, SHORT, &NeverInterrupts)
                .unwrap()
                .unwrap();
        }
        // Released on drop, so a second acquire succeeds immediately.
        let again = a
            .acquire_inner("global", "second", LEASE, SHORT, &NeverInterrupts)
            .unwrap();
        assert!(again.is_some());
    }

    #[test]
    fn test_stale_lease_is_stolen() {
        let store = LockStore::new();
        let a = store.lock();
        {
            let mut handle = a
                .acquire_inner("global", "crashed", Duration::from_millis(1), SHORT, &NeverInterrupts)
                .unwrap()
                .unwrap();
            std::thread::sleep(Duration::from_millis(5));
            // Simulate the holder dying without releasing.
            handle.released = true;
        }
        let b = store.lock();
        let stolen = b
            .acquire_inner("global", "takeover", LEASE, SHORT, &NeverInterrupts)
            .unwrap();
        assert!(stolen.is_some(), "expired lease should be stealable");
        let rec = b.current_holder("global").unwrap().unwrap();
        assert_eq!(rec.reason.as_deref(), Some("takeover"));
        assert!(rec.expires_at > Timestamp::now());
    }

    #[test]
    fn test_live_lease_not_stolen() {
        let store = LockStore::new();
        let a = store.lock();
        let _held = a
            .acquire_inner("global", "live", LEASE, SHORT, &NeverInterrupts)
            .unwrap()
            .unwrap();
        let b = store.lock();
        assert!(b
            .acquire_inner("global", "thief", LEASE, SHORT, &NeverInterrupts)
            .unwrap()
            .is_none());
        // The original holder's record is untouched.
        let rec = a.current_holder("global").unwrap().unwrap();
        assert_eq!(rec.reason.as_deref(), Some("live"));
    }

    #[test]
    fn test_cancellation_stops_waiting() {
        let store = LockStore::new();
        let a = store.lock();
        let _held = a
            .acquire_inner("global", "import", LEASE, SHORT, &NeverInterrupts)
            .unwrap()
            .unwrap();
        let flag = InterruptFlag::new();
        flag.interrupt();
        let b = store.lock();
        let res = b.acquire_inner("global", "cancelled", LEASE, Duration::from_secs(60), &flag);
        assert!(matches!(res, Err(Error::Interrupted(_))));
    }

    #[test]
    fn test_renew_extends_lease() {
        let store = LockStore::new();
        let a = store.lock();
        let handle = a
            .acquire_inner("global", "long-job", LEASE, SHORT, &NeverInterrupts)
            .unwrap()
            .unwrap();
        let before = a.current_holder("global").unwrap().unwrap().expires_at;
        std::thread::sleep(Duration::from_millis(5));
        handle.renew(MAX_LEASE).unwrap();
        let after = a.current_holder("global").unwrap().unwrap().expires_at;
        assert!(after > before);
    }
}
