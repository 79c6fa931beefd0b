//! Persisted data model: completed sessions, per-site and per-day statistics.
//!
//! Field names serialize in camelCase so the stored JSON reads as
//! `{"currentSession": ..., "dailyStats": {"2024-06-01": {...}}}`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{DayKey, Domain};

// ============================================================================
// Sessions
// ============================================================================

/// A completed, immutable interval of time spent on one domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeSession {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    /// Milliseconds; always `end_time - start_time`.
    pub duration: u64,
}

impl TimeSession {
    /// Creates a session from its endpoints.
    ///
    /// An end before the start (clock skew) is clamped to the start, giving a
    /// zero-length session.
    pub fn new(start_time: DateTime<Utc>, end_time: DateTime<Utc>) -> Self {
        let end_time = end_time.max(start_time);
        let duration = u64::try_from((end_time - start_time).num_milliseconds()).unwrap_or(0);
        Self {
            start_time,
            end_time,
            duration,
        }
    }
}

/// The session currently being timed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentSession {
    pub domain: Domain,
    pub start_time: DateTime<Utc>,
}

// ============================================================================
// Aggregates
// ============================================================================

/// Accumulated time for one domain on one day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SiteTimeData {
    pub domain: Domain,
    /// Milliseconds.
    pub total_time: u64,
    /// Append-only, in insertion order.
    pub sessions: Vec<TimeSession>,
    pub last_visited: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub favicon: Option<String>,
}

impl SiteTimeData {
    /// Creates an empty record for `domain`, stamped with `first_seen`.
    pub fn new(domain: Domain, first_seen: DateTime<Utc>) -> Self {
        Self {
            domain,
            total_time: 0,
            sessions: Vec::new(),
            last_visited: first_seen,
            favicon: None,
        }
    }

    /// Checks `total_time == sum(durations)` and
    /// `last_visited == max(end_time)`.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        let sum: u64 = self.sessions.iter().map(|s| s.duration).sum();
        let last = self.sessions.iter().map(|s| s.end_time).max();
        sum == self.total_time && last.map_or(true, |last| last == self.last_visited)
    }
}

/// All tracked time for one local calendar day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyStats {
    pub date: DayKey,
    #[serde(default)]
    pub sites: BTreeMap<Domain, SiteTimeData>,
    /// Milliseconds; sum of every site's `total_time`.
    #[serde(default)]
    pub total_time: u64,
}

impl DailyStats {
    /// Creates an empty day.
    pub fn new(date: DayKey) -> Self {
        Self {
            date,
            sites: BTreeMap::new(),
            total_time: 0,
        }
    }

    /// Sites ordered by descending total time, ties broken by domain.
    pub fn sites_by_time(&self) -> Vec<&SiteTimeData> {
        let mut sites: Vec<&SiteTimeData> = self.sites.values().collect();
        sites.sort_by(|a, b| {
            b.total_time
                .cmp(&a.total_time)
                .then_with(|| a.domain.cmp(&b.domain))
        });
        sites
    }

    /// Checks the day and per-site sum invariants.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        let sum: u64 = self.sites.values().map(|s| s.total_time).sum();
        sum == self.total_time
            && self
                .sites
                .iter()
                .all(|(domain, site)| *domain == site.domain && site.is_consistent())
    }
}

/// Root of the persisted tracking data.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeTrackerStore {
    #[serde(default)]
    pub current_session: Option<CurrentSession>,
    #[serde(default)]
    pub daily_stats: BTreeMap<DayKey, DailyStats>,
}

impl TimeTrackerStore {
    /// Returns the stats for `day`, if any activity was recorded.
    pub fn day(&self, day: &DayKey) -> Option<&DailyStats> {
        self.daily_stats.get(day)
    }

    /// Day keys with recorded activity, oldest first.
    pub fn days(&self) -> Vec<DayKey> {
        self.daily_stats.keys().cloned().collect()
    }

    /// Checks every day's invariants.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.daily_stats
            .iter()
            .all(|(key, stats)| *key == stats.date && stats.is_consistent())
    }
}
