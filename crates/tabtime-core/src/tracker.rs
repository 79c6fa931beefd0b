//! The session-tracking state machine.
//!
//! `SessionTracker` owns the current session and the statistics store. Each
//! transition method takes `now` explicitly and returns a typed result, so the
//! machine can be driven deterministically in tests and by the daemon actor.
//!
//! States are `Idle` (no current session) and `Tracking(domain, start)`.
//! Callers run `roll_over(now)` before dispatching each event.
//!
//! # Panic-Free Guarantees
//!
//! No method panics. Out-of-order clocks produce zero-length sessions rather
//! than errors.

use std::collections::HashMap;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    day_key, main_domain, should_track, CurrentSession, DayKey, Domain, ExtensionOptions,
    Subdomains, TimeSession, TimeTrackerStore,
};

/// A checkpoint gap longer than this means the machine was asleep.
pub const DEFAULT_SLEEP_GAP_THRESHOLD_MS: u64 = 30_000;

// ============================================================================
// Transition Results
// ============================================================================

/// A session that was ended and handed to the aggregator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedSession {
    pub domain: Domain,
    /// Day the session was credited to (local day of its end).
    pub day: DayKey,
    pub session: TimeSession,
}

/// Why an event left the state machine untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnchangedReason {
    /// The classifier rejected the URL.
    Rejected,
    /// The URL resolves to the domain already being tracked.
    SameDomain,
    /// Focus was lost while nothing was tracked.
    AlreadyIdle,
    /// The update belongs to a tab that is not the active one.
    InactiveTab,
    /// No browser window has focus.
    Unfocused,
    /// Focus returned but no active tab could be found.
    NoActiveTab,
    /// A newer event arrived while this one was being resolved.
    Superseded,
}

/// Outcome of one tracker event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Unchanged(UnchangedReason),
    /// Idle -> Tracking.
    Started(CurrentSession),
    /// Tracking(a) -> Tracking(b).
    Switched {
        ended: CompletedSession,
        started: CurrentSession,
    },
    /// Tracking -> Idle.
    Ended(CompletedSession),
}

impl Transition {
    /// Returns true if the current session changed.
    #[must_use]
    pub fn is_change(&self) -> bool {
        !matches!(self, Transition::Unchanged(_))
    }

    /// The session that was recorded by this transition, if any.
    pub fn completed(&self) -> Option<&CompletedSession> {
        match self {
            Transition::Switched { ended, .. } | Transition::Ended(ended) => Some(ended),
            _ => None,
        }
    }
}

/// Outcome of a periodic system check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SystemCheck {
    /// No previous checkpoint existed; nothing to compare.
    FirstCheck,
    /// The gap since the previous checkpoint was within the threshold.
    NoGap,
    /// The machine was asleep; any session was ended at `checkpoint`.
    GapDetected {
        gap_ms: u64,
        checkpoint: DateTime<Utc>,
        ended: Option<CompletedSession>,
    },
}

/// Live view of the tracker for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TrackingStatus {
    Idle,
    Tracking {
        domain: Domain,
        started_at: DateTime<Utc>,
        elapsed_ms: u64,
    },
}

// ============================================================================
// Persisted Snapshot
// ============================================================================

/// Everything the tracker persists, one field per stored key.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackerSnapshot {
    #[serde(default)]
    pub time_tracker_data: TimeTrackerStore,
    #[serde(default)]
    pub today: Option<DayKey>,
    #[serde(default)]
    pub last_system_check: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ext_options: Option<ExtensionOptions>,
}

// ============================================================================
// Session Tracker
// ============================================================================

/// Session-tracking state machine over the statistics store.
#[derive(Debug)]
pub struct SessionTracker<Tz: TimeZone> {
    store: TimeTrackerStore,
    today: DayKey,
    last_checkpoint: Option<DateTime<Utc>>,
    /// Favicons observed on navigation, keyed by session domain.
    favicons: HashMap<Domain, String>,
    tz: Tz,
}

impl<Tz: TimeZone> SessionTracker<Tz> {
    /// Creates an idle tracker with an empty store.
    pub fn new(tz: Tz, now: DateTime<Utc>) -> Self {
        Self {
            store: TimeTrackerStore::default(),
            today: day_key(now, &tz),
            last_checkpoint: None,
            favicons: HashMap::new(),
            tz,
        }
    }

    /// Restores a tracker from a persisted snapshot.
    ///
    /// A persisted current session is discarded: nothing is assumed to have
    /// been running across a restart.
    pub fn from_snapshot(snapshot: TrackerSnapshot, tz: Tz, now: DateTime<Utc>) -> Self {
        let mut store = snapshot.time_tracker_data;
        if let Some(stale) = store.current_session.take() {
            warn!(
                domain = %stale.domain,
                started_at = %stale.start_time,
                "Discarding session left open by previous run"
            );
        }

        let today = snapshot.today.unwrap_or_else(|| day_key(now, &tz));
        debug!(
            today = %today,
            days = store.daily_stats.len(),
            "Tracker restored from snapshot"
        );

        Self {
            store,
            today,
            last_checkpoint: snapshot.last_system_check,
            favicons: HashMap::new(),
            tz,
        }
    }

    /// Captures the persistable state.
    pub fn snapshot(&self, options: &ExtensionOptions) -> TrackerSnapshot {
        TrackerSnapshot {
            time_tracker_data: self.store.clone(),
            today: Some(self.today.clone()),
            last_system_check: self.last_checkpoint,
            ext_options: Some(options.clone()),
        }
    }

    pub fn store(&self) -> &TimeTrackerStore {
        &self.store
    }

    pub fn today(&self) -> &DayKey {
        &self.today
    }

    pub fn current(&self) -> Option<&CurrentSession> {
        self.store.current_session.as_ref()
    }

    pub fn last_checkpoint(&self) -> Option<DateTime<Utc>> {
        self.last_checkpoint
    }

    pub fn timezone(&self) -> &Tz {
        &self.tz
    }

    /// Returns the live tracking status as of `now`.
    pub fn status(&self, now: DateTime<Utc>) -> TrackingStatus {
        match self.current() {
            Some(current) => TrackingStatus::Tracking {
                domain: current.domain.clone(),
                started_at: current.start_time,
                elapsed_ms: u64::try_from((now - current.start_time).num_milliseconds())
                    .unwrap_or(0),
            },
            None => TrackingStatus::Idle,
        }
    }

    // ------------------------------------------------------------------------
    // Transitions
    // ------------------------------------------------------------------------

    /// A tab became active or the active tab navigated to `url`.
    pub fn activate(
        &mut self,
        url: &str,
        options: &ExtensionOptions,
        now: DateTime<Utc>,
    ) -> Transition {
        if !should_track(url, options) {
            debug!(url = %url, "URL not tracked");
            return Transition::Unchanged(UnchangedReason::Rejected);
        }

        let domain = main_domain(url, Subdomains::Keep);
        if self
            .current()
            .is_some_and(|current| current.domain == domain)
        {
            return Transition::Unchanged(UnchangedReason::SameDomain);
        }

        let ended = self.end_current_session(now);
        let started = self.start_session(domain, now);

        match ended {
            Some(ended) => Transition::Switched { ended, started },
            None => Transition::Started(started),
        }
    }

    /// The browser window lost focus.
    pub fn focus_lost(&mut self, now: DateTime<Utc>) -> Transition {
        match self.end_current_session(now) {
            Some(ended) => Transition::Ended(ended),
            None => Transition::Unchanged(UnchangedReason::AlreadyIdle),
        }
    }

    /// The browser window regained focus; `active_url` is the active tab's URL.
    pub fn focus_gained(
        &mut self,
        active_url: Option<&str>,
        options: &ExtensionOptions,
        now: DateTime<Utc>,
    ) -> Transition {
        match active_url {
            Some(url) => self.activate(url, options, now),
            None => Transition::Unchanged(UnchangedReason::NoActiveTab),
        }
    }

    /// Remembers the favicon reported for the page at `url`.
    pub fn note_favicon(&mut self, url: &str, favicon: &str) {
        if favicon.is_empty() {
            return;
        }
        let domain = main_domain(url, Subdomains::Keep);
        if domain.is_unknown() {
            return;
        }
        self.favicons.insert(domain, favicon.to_string());
    }

    /// Records `now` as a checkpoint and detects a sleep gap.
    ///
    /// A gap longer than `threshold_ms` ends the current session at the
    /// previous checkpoint, not at `now`; the missed time is never credited.
    pub fn system_check(&mut self, now: DateTime<Utc>, threshold_ms: u64) -> SystemCheck {
        let Some(previous) = self.last_checkpoint.replace(now) else {
            return SystemCheck::FirstCheck;
        };

        let gap_ms = u64::try_from((now - previous).num_milliseconds()).unwrap_or(0);
        if gap_ms <= threshold_ms {
            return SystemCheck::NoGap;
        }

        let ended = self.end_current_session(previous);
        info!(
            gap_ms,
            checkpoint = %previous,
            ended_domain = ended.as_ref().map(|e| e.domain.as_str()),
            "Sleep gap detected"
        );

        SystemCheck::GapDetected {
            gap_ms,
            checkpoint: previous,
            ended,
        }
    }

    /// Updates the current day key if `now` falls on a new local day.
    ///
    /// Returns the new day key on rollover. In-flight sessions keep running
    /// and are credited to the day they end on.
    pub fn roll_over(&mut self, now: DateTime<Utc>) -> Option<DayKey> {
        let current = day_key(now, &self.tz);
        if current == self.today {
            return None;
        }

        info!(from = %self.today, to = %current, "Day rolled over");
        self.today = current.clone();
        Some(current)
    }

    /// Ends the current session at `end_time` and records it.
    ///
    /// No-op while idle. An end before the start is clamped to a zero-length
    /// session.
    pub fn end_current_session(&mut self, end_time: DateTime<Utc>) -> Option<CompletedSession> {
        let current = self.store.current_session.take()?;
        if current.domain.is_idle() {
            return None;
        }

        let session = TimeSession::new(current.start_time, end_time);
        let day = day_key(session.end_time, &self.tz);
        let favicon = self.favicons.get(&current.domain).map(String::as_str);

        self.store
            .record(&day, &current.domain, session.clone(), favicon);

        info!(
            domain = %current.domain,
            day = %day,
            duration_ms = session.duration,
            "Session ended"
        );

        Some(CompletedSession {
            domain: current.domain,
            day,
            session,
        })
    }

    fn start_session(&mut self, domain: Domain, now: DateTime<Utc>) -> CurrentSession {
        info!(domain = %domain, "Session started");
        let current = CurrentSession {
            domain,
            start_time: now,
        };
        self.store.current_session = Some(current.clone());
        current
    }
}
