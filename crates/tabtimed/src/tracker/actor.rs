//! Tracker actor - owns the session tracker and processes commands.
//!
//! The actor is the single owner of `SessionTracker` and the tracking options.
//! Commands are handled one at a time and run to completion. Tab lookups are
//! the only suspending step; they run in spawned tasks and come back as
//! `TrackerCommand::Resolved`. Every browser event gets a sequence number;
//! a resolution is discarded if a newer activation or focus change was
//! submitted after it, or if a newer event already changed tracking.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()` outside tests
//! - Responder and broadcast send failures are ignored (the caller went away)
//! - Persistence failures are logged by the persister; in-memory state wins

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use tabtime_core::{
    next_midnight, CompletedSession, ExtensionOptions, SessionTracker, SystemCheck, Transition,
    UnchangedReason,
};
use tabtime_protocol::DaySummary;

use super::commands::{
    Intent, StatusReport, TrackerCommand, TrackerError, TrackerEvent, TransitionResponder,
};
use crate::clock::Clock;
use crate::persist::PersistHandle;
use crate::tabs::{LookupError, TabInfo, TabLookup};

// ============================================================================
// Tracker Actor
// ============================================================================

/// The tracker actor.
///
/// Holds only a weak sender to its own channel, so the loop ends once every
/// `TrackerHandle` has been dropped.
pub struct TrackerActor<Tz: TimeZone> {
    receiver: mpsc::Receiver<TrackerCommand>,
    self_sender: mpsc::WeakSender<TrackerCommand>,

    tracker: SessionTracker<Tz>,
    options: ExtensionOptions,

    tabs: Arc<dyn TabLookup>,
    clock: Arc<dyn Clock>,
    persister: PersistHandle,
    event_publisher: broadcast::Sender<TrackerEvent>,

    /// Sequence number of the last submitted browser event.
    seq: u64,
    /// Resolutions below this are superseded. Raised by activations, focus
    /// changes and sleep gaps.
    barrier: u64,
    /// Sequence number of the newest event that changed tracking.
    last_applied: u64,
    /// Browser focus as last reported. Assumed focused until told otherwise.
    focused: bool,
    sleep_gap_threshold_ms: u64,
}

/// Collaborators the actor is wired to.
pub struct ActorParts {
    pub tabs: Arc<dyn TabLookup>,
    pub clock: Arc<dyn Clock>,
    pub persister: PersistHandle,
    pub event_publisher: broadcast::Sender<TrackerEvent>,
    pub sleep_gap_threshold_ms: u64,
}

impl<Tz: TimeZone> TrackerActor<Tz> {
    pub fn new(
        receiver: mpsc::Receiver<TrackerCommand>,
        self_sender: mpsc::WeakSender<TrackerCommand>,
        tracker: SessionTracker<Tz>,
        options: ExtensionOptions,
        parts: ActorParts,
    ) -> Self {
        Self {
            receiver,
            self_sender,
            tracker,
            options,
            tabs: parts.tabs,
            clock: parts.clock,
            persister: parts.persister,
            event_publisher: parts.event_publisher,
            seq: 0,
            barrier: 0,
            last_applied: 0,
            focused: true,
            sleep_gap_threshold_ms: parts.sleep_gap_threshold_ms,
        }
    }

    /// Runs the actor event loop until shutdown or until all handles drop.
    pub async fn run(mut self) {
        info!(today = %self.tracker.today(), "Tracker actor starting");

        // Midnight may have passed while the daemon was down.
        let now = self.clock.now();
        self.roll_over(now);

        while let Some(cmd) = self.receiver.recv().await {
            if let TrackerCommand::Shutdown { respond_to } = cmd {
                self.handle_shutdown().await;
                let _ = respond_to.send(());
                info!("Tracker actor shut down");
                return;
            }
            self.handle_command(cmd);
        }

        info!(
            days = self.tracker.store().daily_stats.len(),
            "Tracker actor stopped"
        );
    }

    /// Dispatches a command. Every command first runs the rollover check.
    pub fn handle_command(&mut self, cmd: TrackerCommand) {
        let now = self.clock.now();
        self.roll_over(now);

        match cmd {
            TrackerCommand::TabActivated { tab_id, respond_to } => {
                let seq = self.next_seq();
                self.barrier = seq;
                self.start_lookup(seq, Intent::Activate(tab_id), respond_to);
            }
            TrackerCommand::TabUpdated { tab_id, respond_to } => {
                // Updates often concern background tabs, so they only
                // supersede older events once they actually change tracking.
                let seq = self.next_seq();
                self.start_lookup(seq, Intent::Navigate(tab_id), respond_to);
            }
            TrackerCommand::FocusChanged {
                focused,
                respond_to,
            } => {
                let seq = self.next_seq();
                self.barrier = seq;
                self.focused = focused;
                if focused {
                    self.start_lookup(seq, Intent::FocusGained, respond_to);
                } else {
                    let transition = self.tracker.focus_lost(now);
                    self.mark_applied(seq, &transition);
                    self.after_transition(&transition, now);
                    let _ = respond_to.send(Ok(transition));
                }
            }
            TrackerCommand::Resolved {
                seq,
                intent,
                lookup,
                respond_to,
            } => {
                let result = self.handle_resolved(seq, intent, lookup, now);
                let _ = respond_to.send(result);
            }
            TrackerCommand::GetStatus { respond_to } => {
                let _ = respond_to.send(StatusReport {
                    status: self.tracker.status(now),
                    today: self.tracker.today().clone(),
                });
            }
            TrackerCommand::GetDailyStats { date, respond_to } => {
                let date = date.unwrap_or_else(|| self.tracker.today().clone());
                let stats = self.tracker.store().day(&date).cloned();
                let _ = respond_to.send((date, stats));
            }
            TrackerCommand::ListDays { respond_to } => {
                let days = self
                    .tracker
                    .store()
                    .daily_stats
                    .values()
                    .map(DaySummary::from_stats)
                    .collect();
                let _ = respond_to.send(days);
            }
            TrackerCommand::GetOptions { respond_to } => {
                let _ = respond_to.send(self.options.clone());
            }
            TrackerCommand::SetOptions {
                options,
                respond_to,
            } => {
                self.handle_set_options(options);
                let _ = respond_to.send(());
            }
            TrackerCommand::SystemCheck => {
                self.handle_system_check(now);
            }
            TrackerCommand::MidnightCheck => {
                debug!(today = %self.tracker.today(), "Midnight check");
            }
            TrackerCommand::NextMidnight { respond_to } => {
                let _ = respond_to.send(next_midnight(now, self.tracker.timezone()));
            }
            TrackerCommand::Shutdown { respond_to } => {
                // Only reachable when called directly; `run` intercepts shutdown.
                let ended = self.tracker.end_current_session(now);
                self.publish_ended(ended, now);
                self.persist();
                let _ = respond_to.send(());
            }
        }
    }

    // ========================================================================
    // Command Handlers
    // ========================================================================

    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn mark_applied(&mut self, seq: u64, transition: &Transition) {
        if transition.is_change() {
            self.last_applied = self.last_applied.max(seq);
        }
    }

    fn start_lookup(&self, seq: u64, intent: Intent, respond_to: TransitionResponder) {
        let Some(sender) = self.self_sender.upgrade() else {
            let _ = respond_to.send(Err(TrackerError::ChannelClosed));
            return;
        };

        let tabs = Arc::clone(&self.tabs);

        tokio::spawn(async move {
            let lookup = match intent {
                Intent::Activate(tab_id) | Intent::Navigate(tab_id) => {
                    tabs.get_tab(tab_id).await.map(Some)
                }
                Intent::FocusGained => tabs.active_tab().await,
            };

            // A failed send drops `respond_to`, which the caller sees as closed.
            let _ = sender
                .send(TrackerCommand::Resolved {
                    seq,
                    intent,
                    lookup,
                    respond_to,
                })
                .await;
        });
    }

    fn handle_resolved(
        &mut self,
        seq: u64,
        intent: Intent,
        lookup: Result<Option<TabInfo>, LookupError>,
        now: DateTime<Utc>,
    ) -> Result<Transition, TrackerError> {
        if seq < self.barrier || seq < self.last_applied {
            debug!(
                ?intent,
                seq,
                barrier = self.barrier,
                last_applied = self.last_applied,
                "Discarding superseded lookup"
            );
            return Ok(Transition::Unchanged(UnchangedReason::Superseded));
        }

        let tab = lookup.map_err(|e| {
            warn!(?intent, error = %e, "Tab lookup failed, state unchanged");
            TrackerError::from(e)
        })?;

        let transition = self.apply_tab(intent, tab, now)?;
        self.mark_applied(seq, &transition);
        self.after_transition(&transition, now);
        Ok(transition)
    }

    /// Applies a resolved tab to the state machine.
    fn apply_tab(
        &mut self,
        intent: Intent,
        tab: Option<TabInfo>,
        now: DateTime<Utc>,
    ) -> Result<Transition, TrackerError> {
        let Some(tab) = tab else {
            return Ok(Transition::Unchanged(UnchangedReason::NoActiveTab));
        };

        if let (Some(url), Some(favicon)) = (&tab.url, &tab.favicon) {
            self.tracker.note_favicon(url, favicon);
        }

        if !self.focused {
            return Ok(Transition::Unchanged(UnchangedReason::Unfocused));
        }
        if matches!(intent, Intent::Navigate(_)) && !tab.active {
            return Ok(Transition::Unchanged(UnchangedReason::InactiveTab));
        }

        let Some(url) = tab.url.as_deref() else {
            warn!(tab_id = %tab.id, "Tab has no URL, state unchanged");
            return Err(LookupError::NoUrl(tab.id).into());
        };

        Ok(match intent {
            Intent::FocusGained => self.tracker.focus_gained(Some(url), &self.options, now),
            Intent::Activate(_) | Intent::Navigate(_) => {
                self.tracker.activate(url, &self.options, now)
            }
        })
    }

    fn handle_system_check(&mut self, now: DateTime<Utc>) {
        match self.tracker.system_check(now, self.sleep_gap_threshold_ms) {
            SystemCheck::GapDetected { ended, .. } => {
                // Anything resolving now was requested before the sleep.
                self.barrier = self.next_seq();
                self.publish_ended(ended, now);
            }
            SystemCheck::FirstCheck => debug!("First system check"),
            SystemCheck::NoGap => {}
        }
        self.persist();
    }

    fn handle_set_options(&mut self, options: ExtensionOptions) {
        info!(
            track_localhost = options.track_localhost,
            allow = options.allow_list.len(),
            exclude = options.exclude_list.len(),
            "Tracking options updated"
        );
        self.options = options.clone();
        let _ = self
            .event_publisher
            .send(TrackerEvent::OptionsChanged { options });
        self.persist();
    }

    async fn handle_shutdown(&mut self) {
        let now = self.clock.now();
        self.roll_over(now);

        let ended = self.tracker.end_current_session(now);
        self.publish_ended(ended, now);
        self.persist();

        if let Err(e) = self.persister.flush().await {
            warn!(error = %e, "Final snapshot flush failed");
        }
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn roll_over(&mut self, now: DateTime<Utc>) {
        if let Some(today) = self.tracker.roll_over(now) {
            let _ = self
                .event_publisher
                .send(TrackerEvent::DayRolledOver { today });
            self.persist();
        }
    }

    fn after_transition(&mut self, transition: &Transition, now: DateTime<Utc>) {
        if !transition.is_change() {
            debug!(?transition, "No tracking change");
            return;
        }

        let _ = self.event_publisher.send(TrackerEvent::TrackingChanged {
            status: self.tracker.status(now),
            ended: transition.completed().cloned(),
        });
        self.persist();
    }

    fn publish_ended(&self, ended: Option<CompletedSession>, now: DateTime<Utc>) {
        if let Some(ended) = ended {
            let _ = self.event_publisher.send(TrackerEvent::TrackingChanged {
                status: self.tracker.status(now),
                ended: Some(ended),
            });
        }
    }

    fn persist(&self) {
        self.persister.save(self.tracker.snapshot(&self.options));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::tabs::TabTable;
    use tabtime_core::{DayKey, Domain, TrackingStatus};
    use tabtime_protocol::{TabId, TabUpdate};
    use tokio::sync::oneshot;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-06-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    struct Fixture {
        _sender: mpsc::Sender<TrackerCommand>,
        actor: TrackerActor<Utc>,
        events: broadcast::Receiver<TrackerEvent>,
        clock: ManualClock,
        tabs: TabTable,
    }

    fn create_actor() -> Fixture {
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let (event_tx, event_rx) = broadcast::channel(16);
        let clock = ManualClock::new(t0());
        let tabs = TabTable::new();

        let actor = TrackerActor::new(
            cmd_rx,
            cmd_tx.downgrade(),
            SessionTracker::new(Utc, t0()),
            ExtensionOptions::default(),
            ActorParts {
                tabs: Arc::new(tabs.clone()),
                clock: Arc::new(clock.clone()),
                persister: PersistHandle::disconnected(),
                event_publisher: event_tx,
                sleep_gap_threshold_ms: 30_000,
            },
        );

        Fixture {
            _sender: cmd_tx,
            actor,
            events: event_rx,
            clock,
            tabs,
        }
    }

    fn tab(id: i64, url: &str) -> TabInfo {
        TabInfo {
            id: TabId::new(id),
            url: Some(url.to_string()),
            active: true,
            favicon: None,
            status: None,
        }
    }

    /// Feeds a resolved lookup as the newest event.
    async fn resolve(
        actor: &mut TrackerActor<Utc>,
        intent: Intent,
        lookup: Result<Option<TabInfo>, LookupError>,
    ) -> Result<Transition, TrackerError> {
        let (tx, rx) = oneshot::channel();
        let seq = actor.next_seq();
        actor.handle_command(TrackerCommand::Resolved {
            seq,
            intent,
            lookup,
            respond_to: tx,
        });
        rx.await.unwrap()
    }

    async fn status(actor: &mut TrackerActor<Utc>) -> StatusReport {
        let (tx, rx) = oneshot::channel();
        actor.handle_command(TrackerCommand::GetStatus { respond_to: tx });
        rx.await.unwrap()
    }

    #[tokio::test]
    async fn test_resolved_activation_starts_session() {
        let mut fx = create_actor();

        let transition = resolve(
            &mut fx.actor,
            Intent::Activate(TabId::new(1)),
            Ok(Some(tab(1, "https://docs.rs/tokio"))),
        )
        .await
        .unwrap();
        assert!(matches!(transition, Transition::Started(_)));

        let event = fx.events.try_recv().unwrap();
        let TrackerEvent::TrackingChanged { status, ended } = event else {
            panic!("expected TrackingChanged");
        };
        assert!(ended.is_none());
        assert!(matches!(status, TrackingStatus::Tracking { .. }));
    }

    #[tokio::test]
    async fn test_lookup_older_than_activation_is_superseded() {
        let mut fx = create_actor();
        fx.actor.seq = 3;
        fx.actor.barrier = 3;

        let (tx, rx) = oneshot::channel();
        fx.actor.handle_command(TrackerCommand::Resolved {
            seq: 2,
            intent: Intent::Activate(TabId::new(1)),
            lookup: Ok(Some(tab(1, "https://a.com"))),
            respond_to: tx,
        });

        assert_eq!(
            rx.await.unwrap().unwrap(),
            Transition::Unchanged(UnchangedReason::Superseded)
        );
        assert_eq!(status(&mut fx.actor).await.status, TrackingStatus::Idle);
    }

    fn resolved(
        actor: &mut TrackerActor<Utc>,
        seq: u64,
        intent: Intent,
        tab: TabInfo,
    ) -> oneshot::Receiver<Result<Transition, TrackerError>> {
        let (tx, rx) = oneshot::channel();
        actor.handle_command(TrackerCommand::Resolved {
            seq,
            intent,
            lookup: Ok(Some(tab)),
            respond_to: tx,
        });
        rx
    }

    #[tokio::test]
    async fn test_applied_navigation_supersedes_older_activation() {
        let mut fx = create_actor();
        let activate = fx.actor.next_seq();
        let navigate = fx.actor.next_seq();

        let rx = resolved(
            &mut fx.actor,
            navigate,
            Intent::Navigate(TabId::new(1)),
            tab(1, "https://b.com"),
        );
        assert!(matches!(rx.await.unwrap().unwrap(), Transition::Started(_)));

        let rx = resolved(
            &mut fx.actor,
            activate,
            Intent::Activate(TabId::new(1)),
            tab(1, "https://a.com"),
        );
        assert_eq!(
            rx.await.unwrap().unwrap(),
            Transition::Unchanged(UnchangedReason::Superseded)
        );
    }

    #[tokio::test]
    async fn test_background_update_does_not_supersede_activation() {
        let mut fx = create_actor();
        let activate = fx.actor.next_seq();
        let update = fx.actor.next_seq();

        let mut background = tab(2, "https://b.com");
        background.active = false;
        let rx = resolved(&mut fx.actor, update, Intent::Navigate(TabId::new(2)), background);
        assert_eq!(
            rx.await.unwrap().unwrap(),
            Transition::Unchanged(UnchangedReason::InactiveTab)
        );

        let rx = resolved(
            &mut fx.actor,
            activate,
            Intent::Activate(TabId::new(1)),
            tab(1, "https://a.com"),
        );
        assert!(matches!(rx.await.unwrap().unwrap(), Transition::Started(_)));
    }

    #[tokio::test]
    async fn test_lookup_failure_leaves_state_unchanged() {
        let mut fx = create_actor();
        resolve(
            &mut fx.actor,
            Intent::Activate(TabId::new(1)),
            Ok(Some(tab(1, "https://a.com"))),
        )
        .await
        .unwrap();

        let result = resolve(
            &mut fx.actor,
            Intent::Activate(TabId::new(9)),
            Err(LookupError::TabNotFound(TabId::new(9))),
        )
        .await;
        assert!(matches!(result, Err(TrackerError::Lookup(_))));

        let TrackingStatus::Tracking { domain, .. } = status(&mut fx.actor).await.status else {
            panic!("expected tracking");
        };
        assert_eq!(domain, Domain::new("a.com"));
    }

    #[tokio::test]
    async fn test_tab_without_url_is_an_error() {
        let mut fx = create_actor();
        let mut no_url = tab(4, "https://a.com");
        no_url.url = None;

        let result = resolve(&mut fx.actor, Intent::Activate(TabId::new(4)), Ok(Some(no_url))).await;
        assert!(matches!(
            result,
            Err(TrackerError::Lookup(LookupError::NoUrl(_)))
        ));
    }

    #[tokio::test]
    async fn test_update_for_inactive_tab_is_ignored() {
        let mut fx = create_actor();
        let mut background = tab(2, "https://b.com");
        background.active = false;

        let transition = resolve(&mut fx.actor, Intent::Navigate(TabId::new(2)), Ok(Some(background)))
            .await
            .unwrap();
        assert_eq!(
            transition,
            Transition::Unchanged(UnchangedReason::InactiveTab)
        );
    }

    #[tokio::test]
    async fn test_focus_lost_ends_session_and_blocks_activation() {
        let mut fx = create_actor();
        resolve(
            &mut fx.actor,
            Intent::Activate(TabId::new(1)),
            Ok(Some(tab(1, "https://a.com"))),
        )
        .await
        .unwrap();
        fx.clock.advance_ms(15_000);

        let (tx, rx) = oneshot::channel();
        fx.actor.handle_command(TrackerCommand::FocusChanged {
            focused: false,
            respond_to: tx,
        });
        let Transition::Ended(ended) = rx.await.unwrap().unwrap() else {
            panic!("expected Ended");
        };
        assert_eq!(ended.session.duration, 15_000);

        let transition = resolve(
            &mut fx.actor,
            Intent::Activate(TabId::new(2)),
            Ok(Some(tab(2, "https://b.com"))),
        )
        .await
        .unwrap();
        assert_eq!(transition, Transition::Unchanged(UnchangedReason::Unfocused));
    }

    #[tokio::test]
    async fn test_focus_gained_uses_active_tab() {
        let mut fx = create_actor();
        fx.tabs
            .update(&TabUpdate {
                tab_id: TabId::new(7),
                url: Some("https://github.com/rust-lang".to_string()),
                status: None,
                favicon: None,
                active: Some(true),
            })
            .await;

        let (tx, rx) = oneshot::channel();
        fx.actor.handle_command(TrackerCommand::FocusChanged {
            focused: true,
            respond_to: tx,
        });

        // The lookup task sends `Resolved` back through the channel.
        let cmd = fx.actor.receiver.recv().await.unwrap();
        fx.actor.handle_command(cmd);

        let Transition::Started(started) = rx.await.unwrap().unwrap() else {
            panic!("expected Started");
        };
        assert_eq!(started.domain.as_str(), "github.com");
    }

    #[tokio::test]
    async fn test_sleep_gap_ends_session() {
        let mut fx = create_actor();
        resolve(
            &mut fx.actor,
            Intent::Activate(TabId::new(1)),
            Ok(Some(tab(1, "https://a.com"))),
        )
        .await
        .unwrap();
        let _ = fx.events.try_recv();

        fx.clock.advance_ms(10_000);
        fx.actor.handle_command(TrackerCommand::SystemCheck);
        fx.clock.advance_ms(60_000);
        fx.actor.handle_command(TrackerCommand::SystemCheck);

        let TrackerEvent::TrackingChanged { status, ended } = fx.events.try_recv().unwrap() else {
            panic!("expected TrackingChanged");
        };
        assert_eq!(status, TrackingStatus::Idle);
        assert_eq!(ended.unwrap().session.duration, 10_000);
    }

    #[tokio::test]
    async fn test_day_rollover_is_broadcast_once() {
        let mut fx = create_actor();
        fx.clock.advance_ms(24 * 60 * 60 * 1000);

        let report = status(&mut fx.actor).await;
        assert_eq!(report.today, DayKey::parse("2024-06-02").unwrap());
        assert_eq!(
            fx.events.try_recv().unwrap(),
            TrackerEvent::DayRolledOver {
                today: DayKey::parse("2024-06-02").unwrap()
            }
        );

        status(&mut fx.actor).await;
        assert!(fx.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_set_options_applies_to_next_activation() {
        let mut fx = create_actor();

        let (tx, rx) = oneshot::channel();
        fx.actor.handle_command(TrackerCommand::SetOptions {
            options: ExtensionOptions {
                exclude_list: vec!["https://a.com".to_string()],
                ..ExtensionOptions::default()
            },
            respond_to: tx,
        });
        rx.await.unwrap();
        assert!(matches!(
            fx.events.try_recv().unwrap(),
            TrackerEvent::OptionsChanged { .. }
        ));

        let transition = resolve(
            &mut fx.actor,
            Intent::Activate(TabId::new(1)),
            Ok(Some(tab(1, "https://a.com/inbox"))),
        )
        .await
        .unwrap();
        assert_eq!(transition, Transition::Unchanged(UnchangedReason::Rejected));
    }

    #[tokio::test]
    async fn test_daily_stats_and_day_list() {
        let mut fx = create_actor();
        resolve(
            &mut fx.actor,
            Intent::Activate(TabId::new(1)),
            Ok(Some(tab(1, "https://a.com"))),
        )
        .await
        .unwrap();
        fx.clock.advance_ms(5_000);
        resolve(
            &mut fx.actor,
            Intent::Activate(TabId::new(2)),
            Ok(Some(tab(2, "https://b.com"))),
        )
        .await
        .unwrap();

        let (tx, rx) = oneshot::channel();
        fx.actor.handle_command(TrackerCommand::GetDailyStats {
            date: None,
            respond_to: tx,
        });
        let (date, stats) = rx.await.unwrap();
        assert_eq!(date.as_str(), "2024-06-01");
        assert_eq!(stats.unwrap().total_time, 5_000);

        let (tx, rx) = oneshot::channel();
        fx.actor.handle_command(TrackerCommand::ListDays { respond_to: tx });
        let days = rx.await.unwrap();
        assert_eq!(days.len(), 1);
        assert_eq!(days[0].site_count, 1);
    }
}
