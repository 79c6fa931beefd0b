//! tabtime Core - Domain logic for per-domain browser time tracking
//!
//! This crate provides the pure domain layer shared between
//! the daemon (tabtimed) and the client (tabtime):
//! - `domain` - URL classification and canonical domain extraction
//! - `clock` - Local-calendar helpers (day keys, next midnight, formatting)
//! - `model` - The persisted data model (sessions, per-site and per-day stats)
//! - `aggregate` - Merging completed sessions into daily statistics
//! - `tracker` - The session-tracking state machine
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod aggregate;
pub mod clock;
pub mod domain;
pub mod error;
pub mod model;
pub mod options;
pub mod tracker;

// Re-exports for convenience
pub use aggregate::{derived_favicon_url, FAVICON_SERVICE_URL};
pub use clock::{
    day_key, format_duration, format_time, local_iso_string, next_midnight, DayKey,
};
pub use domain::{
    is_forbidden_url, main_domain, should_track, Domain, Subdomains, FORBIDDEN_PREFIXES,
    IDLE_DOMAIN, UNKNOWN_DOMAIN,
};
pub use error::{DomainError, DomainResult};
pub use model::{CurrentSession, DailyStats, SiteTimeData, TimeSession, TimeTrackerStore};
pub use options::ExtensionOptions;
pub use tracker::{
    CompletedSession, SessionTracker, SystemCheck, TrackerSnapshot, TrackingStatus, Transition,
    UnchangedReason, DEFAULT_SLEEP_GAP_THRESHOLD_MS,
};
