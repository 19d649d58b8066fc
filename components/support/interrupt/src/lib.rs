/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Cooperative cancellation for long-running sync operations.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// The error returned by `err_if_interrupted`.
#[derive(Debug, Clone, thiserror::Error)]
#[error("The operation was interrupted")]
pub struct Interrupted;

/// Represents the state of something that may be interrupted. Things which
/// want to check whether they've been asked to stop only need this trait and
/// don't need to know about the interrupt mechanics.
pub trait Interruptee {
    fn was_interrupted(&self) -> bool;

    fn err_if_interrupted(&self) -> Result<(), Interrupted> {
        if self.was_interrupted() {
            return Err(Interrupted);
        }
        Ok(())
    }
}

/// A shared cancellation token. Clones observe the same flag, so the caller
/// keeps one clone and hands the other to the operation it may want to stop.
/// Checks are explicit; in-flight store calls are not aborted, only the next
/// check notices the flag.
#[derive(Clone, Debug, Default)]
pub struct InterruptFlag {
    flag: Arc<AtomicBool>,
}

impl InterruptFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn interrupt(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }
}

impl Interruptee for InterruptFlag {
    #[inline]
    fn was_interrupted(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

/// A convenience implementation, should only be used in tests.
pub struct NeverInterrupts;

impl Interruptee for NeverInterrupts {
    #[inline]
    fn was_interrupted(&self) -> bool {
        false
    }
}
