//! Client interface for interacting with the TrackerActor.
//!
//! The `TrackerHandle` is a cheap-to-clone interface for sending commands
//! to the tracker actor and subscribing to tracker events.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`
//! - Channel errors map to `TrackerError::ChannelClosed`, `None`, or empty
//!   results, depending on the method

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc, oneshot};

use tabtime_core::{DailyStats, DayKey, ExtensionOptions, Transition};
use tabtime_protocol::{DaySummary, TabId};

use super::commands::{StatusReport, TrackerCommand, TrackerError, TrackerEvent, TrackerInput};

/// Outcome of a submitted browser event, not yet applied.
#[derive(Debug)]
pub struct PendingTransition(oneshot::Receiver<Result<Transition, TrackerError>>);

impl PendingTransition {
    pub async fn wait(self) -> Result<Transition, TrackerError> {
        self.0.await.map_err(|_| TrackerError::ChannelClosed)?
    }
}

// ============================================================================
// Tracker Handle
// ============================================================================

/// Handle for interacting with the tracker actor.
///
/// ```ignore
/// let handle = tracker_handle.clone();
/// handle.tab_activated(TabId::new(3)).await?;
///
/// let mut rx = handle.subscribe();
/// while let Ok(event) = rx.recv().await {
///     // Handle event
/// }
/// ```
#[derive(Clone)]
pub struct TrackerHandle {
    sender: mpsc::Sender<TrackerCommand>,
    event_sender: broadcast::Sender<TrackerEvent>,
}

impl TrackerHandle {
    pub fn new(
        sender: mpsc::Sender<TrackerCommand>,
        event_sender: broadcast::Sender<TrackerEvent>,
    ) -> Self {
        Self {
            sender,
            event_sender,
        }
    }

    /// Enqueues a browser event without waiting for it to be applied.
    ///
    /// An event never overrides the effect of one submitted after it.
    /// Awaiting the returned `PendingTransition` yields the outcome, which is
    /// `Unchanged(Superseded)` if a newer event overtook this one.
    ///
    /// # Errors
    ///
    /// - `TrackerError::ChannelClosed` if the actor has shut down
    pub async fn submit(&self, input: TrackerInput) -> Result<PendingTransition, TrackerError> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(input.into_command(tx))
            .await
            .map_err(|_| TrackerError::ChannelClosed)?;

        Ok(PendingTransition(rx))
    }

    /// The user switched to `tab_id`.
    ///
    /// # Errors
    ///
    /// - `TrackerError::Lookup` if the tab cannot be resolved
    /// - `TrackerError::ChannelClosed` if the actor has shut down
    pub async fn tab_activated(&self, tab_id: TabId) -> Result<Transition, TrackerError> {
        self.submit(TrackerInput::TabActivated(tab_id))
            .await?
            .wait()
            .await
    }

    /// `tab_id` navigated or finished loading.
    ///
    /// # Errors
    ///
    /// Same as [`tab_activated`](Self::tab_activated).
    pub async fn tab_updated(&self, tab_id: TabId) -> Result<Transition, TrackerError> {
        self.submit(TrackerInput::TabUpdated(tab_id))
            .await?
            .wait()
            .await
    }

    /// Browser focus changed.
    ///
    /// # Errors
    ///
    /// - `TrackerError::Lookup` if focus was gained and the active tab cannot
    ///   be resolved
    /// - `TrackerError::ChannelClosed` if the actor has shut down
    pub async fn focus_changed(&self, focused: bool) -> Result<Transition, TrackerError> {
        self.submit(TrackerInput::FocusChanged(focused))
            .await?
            .wait()
            .await
    }

    /// Live tracking status, or `None` if the actor is gone.
    pub async fn status(&self) -> Option<StatusReport> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(TrackerCommand::GetStatus { respond_to: tx })
            .await
            .ok()?;

        rx.await.ok()
    }

    /// Statistics for `date` (today if `None`), with the resolved date.
    pub async fn daily_stats(&self, date: Option<DayKey>) -> Option<(DayKey, Option<DailyStats>)> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(TrackerCommand::GetDailyStats {
                date,
                respond_to: tx,
            })
            .await
            .ok()?;

        rx.await.ok()
    }

    /// Days with recorded activity, oldest first.
    ///
    /// Returns an empty vector if communication with the actor fails.
    pub async fn list_days(&self) -> Vec<DaySummary> {
        let (tx, rx) = oneshot::channel();

        if self
            .sender
            .send(TrackerCommand::ListDays { respond_to: tx })
            .await
            .is_err()
        {
            return Vec::new();
        }

        rx.await.unwrap_or_default()
    }

    pub async fn options(&self) -> Option<ExtensionOptions> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(TrackerCommand::GetOptions { respond_to: tx })
            .await
            .ok()?;

        rx.await.ok()
    }

    /// Replaces the tracking options. They are persisted with the next snapshot.
    ///
    /// # Errors
    ///
    /// - `TrackerError::ChannelClosed` if the actor has shut down
    pub async fn set_options(&self, options: ExtensionOptions) -> Result<(), TrackerError> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(TrackerCommand::SetOptions {
                options,
                respond_to: tx,
            })
            .await
            .map_err(|_| TrackerError::ChannelClosed)?;

        rx.await.map_err(|_| TrackerError::ChannelClosed)
    }

    /// Triggers a sleep-gap check. Fire-and-forget.
    ///
    /// Returns `false` if the actor has stopped.
    pub async fn system_check(&self) -> bool {
        self.sender.send(TrackerCommand::SystemCheck).await.is_ok()
    }

    /// Triggers a day-rollover check. Fire-and-forget.
    ///
    /// Returns `false` if the actor has stopped.
    pub async fn midnight_check(&self) -> bool {
        self.sender.send(TrackerCommand::MidnightCheck).await.is_ok()
    }

    /// Next local midnight according to the tracker's clock and time zone.
    pub async fn next_midnight(&self) -> Option<DateTime<Utc>> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(TrackerCommand::NextMidnight { respond_to: tx })
            .await
            .ok()?;

        rx.await.ok()
    }

    /// Ends the current session, flushes the snapshot, and stops the actor.
    ///
    /// # Errors
    ///
    /// - `TrackerError::ChannelClosed` if the actor was already gone
    pub async fn shutdown(&self) -> Result<(), TrackerError> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(TrackerCommand::Shutdown { respond_to: tx })
            .await
            .map_err(|_| TrackerError::ChannelClosed)?;

        rx.await.map_err(|_| TrackerError::ChannelClosed)
    }

    /// Subscribe to tracker events.
    ///
    /// This is a synchronous operation - it doesn't communicate with the actor.
    pub fn subscribe(&self) -> broadcast::Receiver<TrackerEvent> {
        self.event_sender.subscribe()
    }

    /// Returns `true` while the command channel is open.
    pub fn is_connected(&self) -> bool {
        !self.sender.is_closed()
    }
}
