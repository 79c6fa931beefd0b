//! tabtime Client - Library modules
//!
//! This library provides what the `tabtime` CLI needs to talk to the daemon:
//! - `client` - Connection, handshake, queries, and the browser-event bridge
//! - `report` - Plain-text rendering of status and daily statistics
//! - `error` - Client error type

pub mod client;
pub mod error;
pub mod report;

// Re-export commonly used types
pub use client::{BridgeStats, ClientConfig, DaemonClient};
pub use error::{ClientError, Result};
