//! Local-calendar helpers: day keys, next midnight, and display formatting.
//!
//! Every helper takes the time zone explicitly. The daemon passes
//! `chrono::Local`; tests pass fixed offsets.

use std::fmt;

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::{DomainError, DomainResult};

const DAY_KEY_FORMAT: &str = "%Y-%m-%d";

/// Upper bound when searching past a DST gap for the first valid local instant.
const MAX_GAP_MINUTES: i64 = 180;

// ============================================================================
// Day Key
// ============================================================================

/// Local calendar date in `YYYY-MM-DD` form, used to key daily statistics.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DayKey(String);

impl DayKey {
    /// Creates a day key from a calendar date.
    pub fn from_date(date: NaiveDate) -> Self {
        Self(date.format(DAY_KEY_FORMAT).to_string())
    }

    /// Parses and validates a user-supplied day key.
    ///
    /// Only the zero-padded `YYYY-MM-DD` form is accepted, so the result
    /// always compares equal to keys produced by `day_key`.
    pub fn parse(value: &str) -> DomainResult<Self> {
        let value = value.trim();
        let date = NaiveDate::parse_from_str(value, DAY_KEY_FORMAT).map_err(|_| {
            DomainError::InvalidDayKey {
                value: value.to_string(),
            }
        })?;

        let key = Self::from_date(date);
        if key.0 != value {
            return Err(DomainError::InvalidDayKey {
                value: value.to_string(),
            });
        }
        Ok(key)
    }

    /// Returns the calendar date, if the key is well formed.
    pub fn date(&self) -> Option<NaiveDate> {
        NaiveDate::parse_from_str(&self.0, DAY_KEY_FORMAT).ok()
    }

    /// Returns the underlying string reference.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DayKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Calendar Arithmetic
// ============================================================================

/// Returns the local calendar day of `instant`.
pub fn day_key<Tz: TimeZone>(instant: DateTime<Utc>, tz: &Tz) -> DayKey {
    DayKey::from_date(instant.with_timezone(tz).date_naive())
}

/// Returns local 00:00:00.000 of the calendar day after `now`.
///
/// If that midnight falls in a DST gap, the first valid local minute after it
/// is returned. If it is ambiguous, the earlier instant wins.
pub fn next_midnight<Tz: TimeZone>(now: DateTime<Utc>, tz: &Tz) -> DateTime<Utc> {
    let fallback = now + Duration::hours(24);

    let Some(tomorrow) = now.with_timezone(tz).date_naive().succ_opt() else {
        return fallback;
    };
    let Some(midnight) = tomorrow.and_hms_opt(0, 0, 0) else {
        return fallback;
    };

    (0..=MAX_GAP_MINUTES)
        .find_map(|offset| {
            tz.from_local_datetime(&(midnight + Duration::minutes(offset)))
                .earliest()
        })
        .map(|local| local.with_timezone(&Utc))
        .unwrap_or(fallback)
}

// ============================================================================
// Formatting
// ============================================================================

/// Renders a millisecond duration as `"1h 2m 3s"`.
///
/// Leading zero units are omitted; seconds are always shown.
pub fn format_duration(ms: u64) -> String {
    let total_secs = ms / 1000;
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;

    if hours > 0 {
        format!("{hours}h {minutes}m {seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else {
        format!("{seconds}s")
    }
}

/// Renders `instant` as 24-hour local `HH:MM:SS`.
pub fn format_time<Tz: TimeZone>(instant: DateTime<Utc>, tz: &Tz) -> String {
    instant
        .with_timezone(tz)
        .naive_local()
        .format("%H:%M:%S")
        .to_string()
}

/// Renders `instant` as local `YYYY-MM-DDTHH:MM:SS.mmm` without an offset.
pub fn local_iso_string<Tz: TimeZone>(instant: DateTime<Utc>, tz: &Tz) -> String {
    instant
        .with_timezone(tz)
        .naive_local()
        .format("%Y-%m-%dT%H:%M:%S%.3f")
        .to_string()
}
