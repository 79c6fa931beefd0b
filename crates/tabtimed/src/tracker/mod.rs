//! Session tracking using the Actor pattern.
//!
//! The tracker actor is the single owner of the `SessionTracker` state
//! machine and its statistics store. Every browser event, scheduler tick and
//! query goes through its command channel.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐     ┌─────────────────┐     ┌───────────────────┐
//! │ ConnectionHandler│────▶│  TrackerActor   │────▶│ Broadcast Channel │
//! │    Scheduler     │     └─────────────────┘     └───────────────────┘
//! └──────────────────┘        │          ▲                  │
//!         │ TrackerCommand    │ lookup   │ Resolved         │ TrackerEvent
//!         │ (mpsc channel)    ▼          │                  ▼
//!                          TabLookup task            subscribed clients
//!                             │
//!                             └──▶ Persister (snapshot after each change)
//! ```
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()` or `.expect()` in production code
//! - Channel operations handle closure gracefully

use std::sync::Arc;

use chrono::TimeZone;
use tokio::sync::{broadcast, mpsc};

use tabtime_core::{ExtensionOptions, SessionTracker};

use crate::clock::Clock;
use crate::persist::PersistHandle;
use crate::tabs::TabLookup;

mod actor;
mod commands;
mod handle;

pub use actor::{ActorParts, TrackerActor};
pub use commands::{
    Intent, StatusReport, TrackerCommand, TrackerError, TrackerEvent, TrackerInput,
    TransitionResponder,
};
pub use handle::{PendingTransition, TrackerHandle};

/// Channel buffer sizes
const COMMAND_BUFFER: usize = 100;
const EVENT_BUFFER: usize = 100;

/// What the tracker actor runs against.
pub struct TrackerRuntime {
    pub tabs: Arc<dyn TabLookup>,
    pub clock: Arc<dyn Clock>,
    pub persister: PersistHandle,
    pub sleep_gap_threshold_ms: u64,
}

/// Spawn the tracker actor and return a handle for interaction.
///
/// The actor stops after `TrackerHandle::shutdown` or once every handle
/// has been dropped. Periodic checks are driven separately by the
/// [`Scheduler`](crate::scheduler::Scheduler).
pub fn spawn_tracker<Tz>(
    tracker: SessionTracker<Tz>,
    options: ExtensionOptions,
    runtime: TrackerRuntime,
) -> TrackerHandle
where
    Tz: TimeZone + Send + 'static,
{
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
    let (event_tx, _) = broadcast::channel(EVENT_BUFFER);

    let actor = TrackerActor::new(
        cmd_rx,
        cmd_tx.downgrade(),
        tracker,
        options,
        ActorParts {
            tabs: runtime.tabs,
            clock: runtime.clock,
            persister: runtime.persister,
            event_publisher: event_tx.clone(),
            sleep_gap_threshold_ms: runtime.sleep_gap_threshold_ms,
        },
    );
    tokio::spawn(actor.run());

    TrackerHandle::new(cmd_tx, event_tx)
}
