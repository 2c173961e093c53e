//! Time partitioning helpers
//!
//! All partitions are UTC. Hour buckets are the epoch-millisecond start of
//! the hour; dates are `YYYY-MM-DD` strings.

use chrono::{DateTime, Duration, NaiveDate, Utc};

use crate::error::{EventError, Result};

pub const MS_PER_HOUR: i64 = 3_600_000;
pub const MS_PER_DAY: i64 = 24 * MS_PER_HOUR;

const DATE_FORMAT: &str = "%Y-%m-%d";

/// Start of the hour containing `timestamp_ms`.
pub fn hour_bucket(timestamp_ms: i64) -> i64 {
    timestamp_ms.div_euclid(MS_PER_HOUR) * MS_PER_HOUR
}

/// UTC calendar date of `timestamp_ms`.
pub fn date_of(timestamp_ms: i64) -> Result<String> {
    DateTime::<Utc>::from_timestamp_millis(timestamp_ms)
        .map(|dt| dt.format(DATE_FORMAT).to_string())
        .ok_or(EventError::TimestampOutOfRange(timestamp_ms))
}

/// Parse a `YYYY-MM-DD` date.
pub fn parse_date(date: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(date, DATE_FORMAT).ok()
}

/// Half-open millisecond range `[start, end)` covered by a date.
pub fn day_bounds(date: &str) -> Option<(i64, i64)> {
    let day = parse_date(date)?;
    let start = day.and_hms_opt(0, 0, 0)?.and_utc().timestamp_millis();
    Some((start, start + MS_PER_DAY))
}

/// Date `days` days before `now_ms`. Dates strictly before the result are
/// older than the window.
///
/// A window reaching past the earliest representable date clamps to it,
/// so nothing counts as older.
pub fn cutoff_date(now_ms: i64, days: u32) -> Result<String> {
    let now = DateTime::<Utc>::from_timestamp_millis(now_ms)
        .ok_or(EventError::TimestampOutOfRange(now_ms))?;
    let cutoff = Duration::try_days(i64::from(days))
        .and_then(|window| now.checked_sub_signed(window))
        .unwrap_or(DateTime::<Utc>::MIN_UTC);
    Ok(cutoff.format(DATE_FORMAT).to_string())
}

/// Current wall-clock time in epoch milliseconds.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}
