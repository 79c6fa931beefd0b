//! tabtime Protocol - Wire protocol for daemon communication
//!
//! This crate provides message types and parsing for communication
//! between the browser bridge and the daemon, and between the daemon
//! and CLI clients. Messages are newline-delimited JSON.

pub mod message;
pub mod parse;
pub mod version;

pub use message::{ClientMessage, DaemonMessage, DaySummary, MessageType};
pub use parse::{
    BrowserEvent, EventParseError, RawBrowserEvent, TabId, TabStatus, TabUpdate, WINDOW_ID_NONE,
};
pub use version::{ProtocolVersion, VersionError};
