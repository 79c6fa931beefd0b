//! tabtime Daemon - Session tracker, persistence and socket server
//!
//! This crate provides the runtime around the `tabtime-core` state machine:
//! - `tracker` - Tracker actor, the single owner of the tracking state
//! - `tabs` - Tab table fed by browser events, and the lookup seam
//! - `scheduler` - System-check ticker and midnight alarm
//! - `persist` - State file and the background writer task
//! - `server` - Unix socket server for bridges and CLI clients
//! - `config` - Daemon configuration
//! - `clock` - Injectable time source
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       tabtimed daemon                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                             │
//! │  ┌─────────────────┐     ┌─────────────────────────────┐    │
//! │  │  DaemonServer   │────▶│       TrackerActor          │    │
//! │  │ (Unix Socket)   │     │  (SessionTracker owner)     │    │
//! │  └────────┬────────┘     └──────┬───────────────┬──────┘    │
//! │           │                     │               │           │
//! │           │ connections         │ events        │ snapshots │
//! │           ▼                     ▼               ▼           │
//! │  ┌─────────────────┐  ┌──────────────────┐ ┌────────────┐   │
//! │  │ConnectionHandler│  │broadcast::Sender │ │ Persister  │   │
//! │  │  (per client)   │  │  (subscribers)   │ │(state.json)│   │
//! │  └─────────────────┘  └──────────────────┘ └────────────┘   │
//! │                                 ▲                           │
//! │                        ┌────────┴────────┐                  │
//! │                        │    Scheduler    │                  │
//! │                        │ (tick/midnight) │                  │
//! │                        └─────────────────┘                  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

pub mod clock;
pub mod config;
pub mod persist;
pub mod scheduler;
pub mod server;
pub mod tabs;
pub mod tracker;
