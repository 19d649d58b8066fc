/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Wall-clock budgets for store operations.
//!
//! SQLite's own busy timeout only bounds lock waits; a statement that is
//! simply slow (large scan over a network filesystem, say) runs forever.
//! `TimeoutGuard` arms a watchdog thread holding the connection's
//! `InterruptHandle`; when the budget expires the in-flight statement is
//! interrupted and fails with `SQLITE_INTERRUPT`, which the caller can map to
//! a timeout error via `fired()`.

use rusqlite::{Connection, InterruptHandle};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

struct GuardState {
    disarmed: Mutex<bool>,
    cvar: Condvar,
    fired: AtomicBool,
}

/// Interrupts the guarded connection if it's still running when the budget
/// expires. Dropping the guard disarms the watchdog.
pub struct TimeoutGuard {
    state: Arc<GuardState>,
    watchdog: Option<thread::JoinHandle<()>>,
}

impl TimeoutGuard {
    pub fn arm(conn: &Connection, budget: Duration) -> Self {
        let handle: InterruptHandle = conn.get_interrupt_handle();
        let state = Arc::new(GuardState {
            disarmed: Mutex::new(false),
            cvar: Condvar::new(),
            fired: AtomicBool::new(false),
        });
        let thread_state = Arc::clone(&state);
        let watchdog = thread::Builder::new()
            .name("sql-timeout-watchdog".into())
            .spawn(move || {
                let guard = thread_state
                    .disarmed
                    .lock()
                    .unwrap_or_else(|e| e.into_inner());
                let (guard, wait) = thread_state
                    .cvar
                    .wait_timeout_while(guard, budget, |disarmed| !*disarmed)
                    .unwrap_or_else(|e| e.into_inner());
                if wait.timed_out() && !*guard {
                    thread_state.fired.store(true, Ordering::SeqCst);
                    handle.interrupt();
                }
            })
            .expect("failed to spawn timeout watchdog");
        TimeoutGuard {
            state,
            watchdog: Some(watchdog),
        }
    }

    /// True if the budget expired and the connection was interrupted.
    pub fn fired(&self) -> bool {
        self.state.fired.load(Ordering::SeqCst)
    }
}

impl Drop for TimeoutGuard {
    fn drop(&mut self) {
        {
            let mut disarmed = self
                .state
                .disarmed
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            *disarmed = true;
        }
        self.state.cvar.notify_all();
        if let Some(watchdog) = self.watchdog.take() {
            let _ = watchdog.join();
        }
    }
}

/// Whether a rusqlite error is the SQLITE_INTERRUPT produced by an expired
/// `TimeoutGuard` (or an explicit `interrupt()` call).
pub fn is_interrupt_error(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(rusqlite::ErrorCode::OperationInterrupted)
    )
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_guard_fires_on_slow_statement() {
        let conn = Connection::open_in_memory().unwrap();
        let guard = TimeoutGuard::arm(&conn, Duration::from_millis(50));
        // Unbounded recursive CTE; only the interrupt stops it.
        let res: Result<i64, _> = conn.query_row(
            "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x+1 FROM c)
             SELECT COUNT(*) FROM c",
            [],
            |row| row.get(0),
        );
        let err = res.expect_err("statement should have been interrupted");
        assert!(is_interrupt_error(&err), "unexpected error {:?}", err);
        assert!(guard.fired());
    }

    #[test]
    fn test_guard_disarms_quietly() {
        let conn = Connection::open_in_memory().unwrap();
        {
            let guard = TimeoutGuard::arm(&conn, Duration::from_secs(600));
            conn.execute_batch("CREATE TABLE t (x)").unwrap();
            assert!(!guard.fired());
        }
        // The connection is still usable after the guard is gone.
        conn.execute_batch("DROP TABLE t").unwrap();
    }
}
