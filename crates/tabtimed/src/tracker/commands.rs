//! Tracker actor commands, errors, and events.
//!
//! - `TrackerCommand`: commands sent to the actor
//! - `TrackerError`: errors surfaced to callers of browser-event commands
//! - `TrackerEvent`: events broadcast to subscribers

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::oneshot;

use tabtime_core::{
    CompletedSession, DailyStats, DayKey, ExtensionOptions, TrackingStatus, Transition,
};
use tabtime_protocol::{DaySummary, TabId};

use crate::tabs::{LookupError, TabInfo};

/// Response channel for browser-event commands.
pub type TransitionResponder = oneshot::Sender<Result<Transition, TrackerError>>;

// ============================================================================
// Tracker Commands
// ============================================================================

/// Commands sent to the tracker actor.
///
/// Request/response commands carry a oneshot sender. `SystemCheck` and
/// `MidnightCheck` are fire-and-forget and come from the scheduler.
#[derive(Debug)]
pub enum TrackerCommand {
    /// The user switched to `tab_id`.
    TabActivated {
        tab_id: TabId,
        respond_to: TransitionResponder,
    },

    /// `tab_id` navigated or finished loading.
    TabUpdated {
        tab_id: TabId,
        respond_to: TransitionResponder,
    },

    /// A browser window gained focus, or every window lost it.
    FocusChanged {
        focused: bool,
        respond_to: TransitionResponder,
    },

    /// Result of a tab lookup started by the actor itself.
    ///
    /// `seq` is the position of the originating event. The result is
    /// discarded if a later event already changed tracking, or if a later
    /// activation or focus change was submitted.
    Resolved {
        seq: u64,
        intent: Intent,
        lookup: Result<Option<TabInfo>, LookupError>,
        respond_to: TransitionResponder,
    },

    GetStatus {
        respond_to: oneshot::Sender<StatusReport>,
    },

    /// One day's statistics; `date` defaults to today.
    GetDailyStats {
        date: Option<DayKey>,
        respond_to: oneshot::Sender<(DayKey, Option<DailyStats>)>,
    },

    ListDays {
        respond_to: oneshot::Sender<Vec<DaySummary>>,
    },

    GetOptions {
        respond_to: oneshot::Sender<ExtensionOptions>,
    },

    SetOptions {
        options: ExtensionOptions,
        respond_to: oneshot::Sender<()>,
    },

    /// Periodic checkpoint for sleep-gap detection.
    SystemCheck,

    /// The midnight alarm fired.
    MidnightCheck,

    /// Next local midnight after the tracker's current time.
    NextMidnight {
        respond_to: oneshot::Sender<DateTime<Utc>>,
    },

    /// End the current session, flush persistence, then stop.
    Shutdown { respond_to: oneshot::Sender<()> },
}

/// A browser event as submitted to the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerInput {
    TabActivated(TabId),
    TabUpdated(TabId),
    FocusChanged(bool),
}

impl TrackerInput {
    pub(crate) fn into_command(self, respond_to: TransitionResponder) -> TrackerCommand {
        match self {
            Self::TabActivated(tab_id) => TrackerCommand::TabActivated { tab_id, respond_to },
            Self::TabUpdated(tab_id) => TrackerCommand::TabUpdated { tab_id, respond_to },
            Self::FocusChanged(focused) => TrackerCommand::FocusChanged {
                focused,
                respond_to,
            },
        }
    }
}

/// What a tab lookup was started for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Activate(TabId),
    Navigate(TabId),
    FocusGained,
}

/// Live status with the current day key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub status: TrackingStatus,
    pub today: DayKey,
}

// ============================================================================
// Tracker Errors
// ============================================================================

#[derive(Debug, Clone, Error)]
pub enum TrackerError {
    /// The actor stopped before answering.
    #[error("tracker channel closed")]
    ChannelClosed,

    #[error("tab lookup failed: {0}")]
    Lookup(#[from] LookupError),
}

impl TrackerError {
    /// Short machine-readable code used in protocol error replies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ChannelClosed => "tracker_unavailable",
            Self::Lookup(LookupError::TabNotFound(_)) => "tab_not_found",
            Self::Lookup(LookupError::NoUrl(_)) => "tab_without_url",
            Self::Lookup(LookupError::Unavailable(_)) => "lookup_unavailable",
        }
    }
}

// ============================================================================
// Tracker Events
// ============================================================================

/// Events broadcast by the tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerEvent {
    /// A session started, switched, or ended.
    TrackingChanged {
        status: TrackingStatus,
        ended: Option<CompletedSession>,
    },

    DayRolledOver { today: DayKey },

    OptionsChanged { options: ExtensionOptions },
}
