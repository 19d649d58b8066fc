/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Serialization of the sync anchor and of date values generally.
//!
//! The engine always writes anchors as ISO-8601 UTC instants with millisecond
//! precision (`2024-05-01T12:30:00.123Z`). Older deployments stored them as
//! OLE-automation day offsets (fractional days since 1899-12-30); those are
//! accepted on read and rewritten in the modern format on the next run.

use crate::Timestamp;
use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, TimeZone, Utc};

/// Days between the OLE automation epoch (1899-12-30) and the unix epoch.
const OADATE_UNIX_OFFSET_DAYS: f64 = 25_569.0;
const MS_PER_DAY: f64 = 86_400_000.0;

// Plausibility window for day-offset values: 1970-01-01 .. ~2200. Anything
// outside is treated as not-an-oadate rather than silently producing a
// nonsense anchor.
const OADATE_MIN: f64 = OADATE_UNIX_OFFSET_DAYS;
const OADATE_MAX: f64 = 110_000.0;

/// Convert an OLE-automation day offset to a millisecond timestamp.
/// Returns None for values outside the plausible window.
pub fn oadate_to_timestamp(days: f64) -> Option<Timestamp> {
    if !days.is_finite() || !(OADATE_MIN..OADATE_MAX).contains(&days) {
        return None;
    }
    let ms = ((days - OADATE_UNIX_OFFSET_DAYS) * MS_PER_DAY).round();
    Some(Timestamp(ms as u64))
}

/// The inverse of `oadate_to_timestamp`, used when a numeric column expects
/// the legacy representation.
pub fn timestamp_to_oadate(ts: Timestamp) -> f64 {
    ts.0 as f64 / MS_PER_DAY + OADATE_UNIX_OFFSET_DAYS
}

/// Format an anchor in the round-trip format: ISO-8601 UTC with millisecond
/// precision and a trailing `Z`.
pub fn format_anchor(ts: Timestamp) -> String {
    let dt = Utc
        .timestamp_millis_opt(ts.as_millis_i64())
        .single()
        .unwrap_or_else(|| DateTime::<Utc>::from(std::time::UNIX_EPOCH));
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse an anchor value as read from the config table. Accepts the format we
/// write, any RFC-3339 instant, a handful of zone-less wall-clock formats
/// (assumed UTC), and legacy day-offset floats. Returns None when the value
/// is unrecognizable; callers treat that the same as an absent anchor.
pub fn parse_anchor(raw: &str) -> Option<Timestamp> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(Timestamp::from(dt.with_timezone(&Utc).timestamp_millis()));
    }
    // Zone-less wall clock, with or without fractional seconds.
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(utc_millis(naive));
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Some(utc_millis(date.and_hms_opt(0, 0, 0)?));
    }
    // Legacy day-offset floats.
    s.parse::<f64>().ok().and_then(oadate_to_timestamp)
}

fn utc_millis(naive: NaiveDateTime) -> Timestamp {
    Timestamp::from(Utc.from_utc_datetime(&naive).timestamp_millis())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_round_trip_millis() {
        for ms in [0u64, 1, 999, 1_640_995_200_000, 1_640_995_200_123] {
            let ts = Timestamp(ms);
            assert_eq!(parse_anchor(&format_anchor(ts)), Some(ts), "ms = {}", ms);
        }
    }

    #[test]
    fn test_format_shape() {
        assert_eq!(
            format_anchor(Timestamp(1_640_995_200_123)),
            "2022-01-01T00:00:00.123Z"
        );
    }

    #[test]
    fn test_parse_offset_form() {
        // Same instant written with an explicit offset.
        assert_eq!(
            parse_anchor("2022-01-01T01:00:00.000+01:00"),
            Some(Timestamp(1_640_995_200_000))
        );
    }

    #[test]
    fn test_parse_wall_clock() {
        assert_eq!(
            parse_anchor("2022-01-01 00:00:00"),
            Some(Timestamp(1_640_995_200_000))
        );
        assert_eq!(parse_anchor("2022-01-01"), Some(Timestamp(1_640_995_200_000)));
    }

    #[test]
    fn test_parse_legacy_oadate() {
        // 44562.0 days = 2022-01-01T00:00:00Z.
        assert_eq!(parse_anchor("44562"), Some(Timestamp(1_640_995_200_000)));
        assert_eq!(parse_anchor("44562.5"), Some(Timestamp(1_641_038_400_000)));
    }

    #[test]
    fn test_legacy_read_writes_iso() {
        let ts = parse_anchor("44562.25").unwrap();
        let rewritten = format_anchor(ts);
        assert!(rewritten.ends_with('Z'), "{}", rewritten);
        assert_eq!(parse_anchor(&rewritten), Some(ts));
    }

    #[test]
    fn test_parse_garbage() {
        assert_eq!(parse_anchor(""), None);
        assert_eq!(parse_anchor("   "), None);
        assert_eq!(parse_anchor("not a date"), None);
        // Out of the plausible day-offset window.
        assert_eq!(parse_anchor("12.5"), None);
        assert_eq!(parse_anchor("1e300"), None);
    }

    #[test]
    fn test_oadate_inverse() {
        let ts = Timestamp(1_640_995_200_000);
        assert_eq!(oadate_to_timestamp(timestamp_to_oadate(ts)), Some(ts));
    }
}
