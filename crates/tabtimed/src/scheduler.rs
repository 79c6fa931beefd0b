//! Periodic triggers for the tracker.
//!
//! Two tokio tasks feed fire-and-forget commands to the tracker actor:
//! - the system-check tick, which drives sleep-gap detection
//! - the midnight alarm, which fires at each local midnight
//!
//! Re-arming a trigger aborts its previous task first. Dropping the
//! `Scheduler` aborts both.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, info};

use crate::clock::Clock;
use crate::tracker::TrackerHandle;

/// Pause before re-reading the next midnight when the alarm woke early
/// relative to the wall clock.
const EARLY_WAKE_BACKOFF: Duration = Duration::from_secs(1);

pub struct Scheduler {
    tracker: TrackerHandle,
    clock: Arc<dyn Clock>,
    tick: Duration,
    system_task: Option<JoinHandle<()>>,
    midnight_task: Option<JoinHandle<()>>,
}

impl Scheduler {
    pub fn new(tracker: TrackerHandle, clock: Arc<dyn Clock>, tick: Duration) -> Self {
        Self {
            tracker,
            clock,
            tick,
            system_task: None,
            midnight_task: None,
        }
    }

    /// Arms both triggers.
    pub fn start(&mut self) {
        info!(tick_secs = self.tick.as_secs(), "Scheduler starting");
        self.arm_system_check();
        self.arm_midnight();
    }

    /// (Re)arms the system-check tick. The first tick fires immediately.
    pub fn arm_system_check(&mut self) {
        if let Some(task) = self.system_task.take() {
            task.abort();
        }

        let tracker = self.tracker.clone();
        let tick = self.tick;

        self.system_task = Some(tokio::spawn(async move {
            let mut ticker = interval(tick);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;

                if !tracker.system_check().await {
                    debug!("System-check task stopping: tracker channel closed");
                    break;
                }
            }
        }));
    }

    /// (Re)arms the midnight alarm.
    ///
    /// The next midnight is recomputed after every fire.
    pub fn arm_midnight(&mut self) {
        if let Some(task) = self.midnight_task.take() {
            task.abort();
        }

        let tracker = self.tracker.clone();
        let clock = Arc::clone(&self.clock);

        self.midnight_task = Some(tokio::spawn(async move {
            let mut last_fired: Option<DateTime<Utc>> = None;

            loop {
                let Some(midnight) = tracker.next_midnight().await else {
                    debug!("Midnight task stopping: tracker channel closed");
                    break;
                };

                if last_fired == Some(midnight) {
                    // Woke before the wall clock reached midnight. Check
                    // again once it has, so the day does not wait for a tick.
                    sleep(EARLY_WAKE_BACKOFF).await;
                    if clock.now() >= midnight {
                        if !tracker.midnight_check().await {
                            debug!("Midnight task stopping: tracker channel closed");
                            break;
                        }
                        last_fired = None;
                    }
                    continue;
                }

                let wait = (midnight - clock.now()).to_std().unwrap_or(Duration::ZERO);
                debug!(at = %midnight, wait_secs = wait.as_secs(), "Midnight alarm armed");
                sleep(wait).await;

                if !tracker.midnight_check().await {
                    debug!("Midnight task stopping: tracker channel closed");
                    break;
                }
                last_fired = Some(midnight);
            }
        }));
    }

    /// Aborts both triggers.
    pub fn stop(&mut self) {
        for task in [self.system_task.take(), self.midnight_task.take()]
            .into_iter()
            .flatten()
        {
            task.abort();
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::tracker::TrackerCommand;
    use tokio::sync::{broadcast, mpsc};
    use tokio::time::Instant;

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn scheduler_with_channel(
        clock: ManualClock,
        tick: Duration,
    ) -> (Scheduler, mpsc::Receiver<TrackerCommand>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let (event_tx, _) = broadcast::channel(16);
        let handle = TrackerHandle::new(cmd_tx, event_tx);
        (Scheduler::new(handle, Arc::new(clock), tick), cmd_rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_system_check_ticks() {
        let clock = ManualClock::new(ts("2024-06-01T10:00:00Z"));
        let (mut scheduler, mut rx) = scheduler_with_channel(clock, Duration::from_secs(10));
        let started = Instant::now();

        scheduler.arm_system_check();

        assert!(matches!(rx.recv().await, Some(TrackerCommand::SystemCheck)));
        assert!(started.elapsed() < Duration::from_secs(1));

        assert!(matches!(rx.recv().await, Some(TrackerCommand::SystemCheck)));
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(10));
        assert!(elapsed < Duration::from_secs(11));
    }

    #[tokio::test(start_paused = true)]
    async fn test_midnight_alarm_fires_at_next_midnight() {
        let midnight = ts("2024-06-02T00:00:00Z");
        let clock = ManualClock::new(midnight - chrono::Duration::seconds(10));
        let (mut scheduler, mut rx) = scheduler_with_channel(clock, Duration::from_secs(3600));
        let started = Instant::now();

        scheduler.arm_midnight();

        loop {
            match rx.recv().await.unwrap() {
                TrackerCommand::NextMidnight { respond_to } => {
                    let _ = respond_to.send(midnight);
                }
                TrackerCommand::MidnightCheck => break,
                other => panic!("unexpected command: {other:?}"),
            }
        }

        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(10));
        assert!(elapsed < Duration::from_secs(11));
    }

    #[tokio::test(start_paused = true)]
    async fn test_early_wake_checks_again_after_midnight() {
        let midnight = ts("2024-06-02T00:00:00Z");
        let clock = ManualClock::new(midnight - chrono::Duration::seconds(10));
        let (mut scheduler, mut rx) =
            scheduler_with_channel(clock.clone(), Duration::from_secs(3600));

        scheduler.arm_midnight();

        // The timer fires while the wall clock still reads 23:59:50, and the
        // clock only passes midnight after the alarm re-reads it.
        let mut queries = 0;
        let mut checks = 0;
        while checks < 2 {
            match rx.recv().await.unwrap() {
                TrackerCommand::NextMidnight { respond_to } => {
                    queries += 1;
                    let _ = respond_to.send(midnight);
                    if queries == 2 {
                        clock.set(midnight + chrono::Duration::seconds(1));
                    }
                }
                TrackerCommand::MidnightCheck => checks += 1,
                other => panic!("unexpected command: {other:?}"),
            }
        }
        assert_eq!(queries, 2);
        assert_eq!(checks, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_replaces_previous_task() {
        let clock = ManualClock::new(ts("2024-06-01T10:00:00Z"));
        let (mut scheduler, mut rx) = scheduler_with_channel(clock, Duration::from_secs(10));

        scheduler.arm_system_check();
        assert!(matches!(rx.recv().await, Some(TrackerCommand::SystemCheck)));

        scheduler.arm_system_check();
        assert!(matches!(rx.recv().await, Some(TrackerCommand::SystemCheck)));

        // Only one tick per period remains.
        let started = Instant::now();
        assert!(matches!(rx.recv().await, Some(TrackerCommand::SystemCheck)));
        assert!(started.elapsed() >= Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_aborts_tasks() {
        let clock = ManualClock::new(ts("2024-06-01T10:00:00Z"));
        let (mut scheduler, mut rx) = scheduler_with_channel(clock, Duration::from_secs(10));

        scheduler.start();
        drop(scheduler);

        // Every sender lives in the aborted tasks or the dropped scheduler.
        while let Some(cmd) = rx.recv().await {
            if let TrackerCommand::NextMidnight { respond_to } = cmd {
                let _ = respond_to.send(ts("2024-06-02T00:00:00Z"));
            }
        }
    }
}
