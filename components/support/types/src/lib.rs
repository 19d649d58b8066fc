/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use rusqlite::types::{FromSql, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::Result as RusqliteResult;
use serde_derive::*;
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

mod anchor;

pub use anchor::{format_anchor, oadate_to_timestamp, parse_anchor, timestamp_to_oadate};

/// Typesafe way to manage UTC timestamps, stored as integer milliseconds
/// since the unix epoch.
#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize, Default,
)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub fn now() -> Self {
        SystemTime::now().into()
    }

    /// Returns None if `other` is later than `self` (Duration may not
    /// represent negative timespans in rust).
    #[inline]
    pub fn duration_since(self, other: Timestamp) -> Option<Duration> {
        if self.0 < other.0 {
            None
        } else {
            Some(Duration::from_millis(self.0 - other.0))
        }
    }

    #[inline]
    pub fn checked_sub(self, d: Duration) -> Option<Timestamp> {
        SystemTime::from(self).checked_sub(d).map(Timestamp::from)
    }

    #[inline]
    pub fn checked_add(self, d: Duration) -> Option<Timestamp> {
        SystemTime::from(self).checked_add(d).map(Timestamp::from)
    }

    pub fn as_millis(self) -> u64 {
        self.0
    }

    pub fn as_millis_i64(self) -> i64 {
        self.0 as i64
    }
}

impl From<Timestamp> for u64 {
    #[inline]
    fn from(ts: Timestamp) -> Self {
        ts.0
    }
}

impl From<SystemTime> for Timestamp {
    #[inline]
    fn from(st: SystemTime) -> Self {
        let d = st.duration_since(UNIX_EPOCH).unwrap_or_default();
        Timestamp((d.as_secs()) * 1000 + u64::from(d.subsec_nanos()) / 1_000_000)
    }
}

impl From<Timestamp> for SystemTime {
    #[inline]
    fn from(ts: Timestamp) -> Self {
        UNIX_EPOCH + Duration::from_millis(ts.into())
    }
}

impl From<u64> for Timestamp {
    #[inline]
    fn from(ts: u64) -> Self {
        Timestamp(ts)
    }
}

impl From<i64> for Timestamp {
    /// Negative values clamp to the epoch; the stores should never contain
    /// them, but a corrupt row must not panic the engine.
    #[inline]
    fn from(ts: i64) -> Self {
        Timestamp(u64::try_from(ts).unwrap_or(0))
    }
}

impl fmt::Display for Timestamp {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl ToSql for Timestamp {
    fn to_sql(&self) -> RusqliteResult<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.0 as i64)) // hrm - no u64 in rusqlite
    }
}

impl FromSql for Timestamp {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value.as_i64().map(Timestamp::from)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_duration_since() {
        let a = Timestamp(10_000);
        let b = Timestamp(12_500);
        assert_eq!(b.duration_since(a), Some(Duration::from_millis(2500)));
        assert_eq!(a.duration_since(b), None);
        assert_eq!(a.duration_since(a), Some(Duration::ZERO));
    }

    #[test]
    fn test_checked_arithmetic() {
        let t = Timestamp(1_000_000);
        assert_eq!(t.checked_add(Duration::from_millis(5)), Some(Timestamp(1_000_005)));
        assert_eq!(t.checked_sub(Duration::from_millis(5)), Some(Timestamp(999_995)));
    }

    #[test]
    fn test_negative_i64_clamps() {
        assert_eq!(Timestamp::from(-42i64), Timestamp(0));
    }

    #[test]
    fn test_sql_round_trip() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        let ts = Timestamp(1_234_567_890_123);
        let got: Timestamp = conn
            .query_row("SELECT ?", [&ts], |row| row.get(0))
            .unwrap();
        assert_eq!(got, ts);
    }
}
