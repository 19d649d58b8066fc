/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Retries for transient store failures.
//!
//! Network shares drop connections and shared SQLite files hit lock
//! contention; both resolve themselves quickly. Operations against the
//! stores are wrapped in `with_retry`, which re-attempts only errors the
//! classifier marks transient (see `Error::is_transient`).

use crate::error::Result;
use rand::Rng;
use std::thread;
use std::time::Duration;

const JITTER_MS: u64 = 100;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles per attempt after that.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

/// The state carried between attempts.
#[derive(Debug)]
pub struct RetryState {
    pub attempt: u32,
    pub next_delay: Duration,
}

impl RetryState {
    pub fn new(policy: &RetryPolicy) -> Self {
        RetryState {
            attempt: 1,
            next_delay: policy.base_delay,
        }
    }

    /// Record a failed attempt and return how long to back off before the
    /// next one (exponential, plus 0-100ms of jitter).
    pub fn backoff(&mut self) -> Duration {
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=JITTER_MS));
        let delay = self.next_delay + jitter;
        self.attempt += 1;
        self.next_delay *= 2;
        delay
    }
}

/// Run `op`, re-attempting transient failures up to `policy.max_attempts`
/// total tries. Non-transient errors propagate immediately.
pub fn with_retry<T>(
    policy: &RetryPolicy,
    label: &str,
    mut op: impl FnMut() -> Result<T>,
) -> Result<T> {
    let mut state = RetryState::new(policy);
    loop {
        match op() {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && state.attempt < policy.max_attempts => {
                let delay = state.backoff();
                log::warn!(
                    "{}: transient failure ({}), attempt {}/{}, backing off {:?}",
                    label,
                    e,
                    state.attempt - 1,
                    policy.max_attempts,
                    delay
                );
                thread::sleep(delay);
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::error::Error;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
        }
    }

    #[test]
    fn test_success_first_try() {
        let mut calls = 0;
        let res: Result<i32> = with_retry(&fast_policy(), "test", || {
            calls += 1;
            Ok(7)
        });
        assert_eq!(res.unwrap(), 7);
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_transient_then_success() {
        let mut calls = 0;
        let res: Result<i32> = with_retry(&fast_policy(), "test", || {
            calls += 1;
            if calls < 3 {
                Err(Error::Timeout(Duration::from_millis(1)))
            } else {
                Ok(9)
            }
        });
        assert_eq!(res.unwrap(), 9);
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_transient_exhausts_attempts() {
        let mut calls = 0;
        let res: Result<()> = with_retry(&fast_policy(), "test", || {
            calls += 1;
            Err(Error::Timeout(Duration::from_millis(1)))
        });
        assert!(matches!(res, Err(Error::Timeout(_))));
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_fatal_not_retried() {
        let mut calls = 0;
        let res: Result<()> = with_retry(&fast_policy(), "test", || {
            calls += 1;
            Err(Error::InvariantViolation("boom".into()))
        });
        assert!(matches!(res, Err(Error::InvariantViolation(_))));
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_backoff_doubles() {
        let policy = RetryPolicy {
            max_attempts: 4,
            base_delay: Duration::from_secs(1),
        };
        let mut state = RetryState::new(&policy);
        let first = state.backoff();
        let second = state.backoff();
        assert!(first >= Duration::from_secs(1) && first < Duration::from_millis(1101));
        assert!(second >= Duration::from_secs(2) && second < Duration::from_millis(2101));
        assert_eq!(state.attempt, 3);
    }
}
