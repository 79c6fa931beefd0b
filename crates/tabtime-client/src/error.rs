//! Error types for tabtime clients.
//!
//! **Panic-Free Policy:** No `.unwrap()`, `.expect()`, `panic!()`,
//! `unreachable!()`, or `todo!()` outside tests.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

// ============================================================================
// Client Error Type
// ============================================================================

/// Errors talking to the daemon.
///
/// Connection errors carry the socket path so the CLI can suggest
/// starting the daemon.
#[derive(Error, Debug)]
pub enum ClientError {
    /// No daemon is listening on the socket.
    #[error(
        "Daemon not running (no socket at {}). Start it with `tabtimed start -d`",
        .path.display()
    )]
    NotRunning { path: PathBuf },

    /// The socket exists but the connection failed.
    #[error("Failed to connect to daemon: {0}")]
    DaemonConnection(String),

    /// Protocol version mismatch with daemon
    #[error("Protocol version mismatch (client: {client_version}, daemon: {daemon_version})")]
    VersionMismatch {
        client_version: String,
        daemon_version: String,
    },

    /// The daemon sent something other than what the request expects.
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// The daemon answered with an `error` message.
    #[error("Daemon error{}: {message}", code_suffix(.code))]
    Daemon {
        message: String,
        code: Option<String>,
    },

    #[error("Timed out waiting for the daemon")]
    Timeout,

    #[error("Daemon closed the connection")]
    Disconnected,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to parse message: {0}")]
    ParseError(#[from] serde_json::Error),
}

fn code_suffix(code: &Option<String>) -> String {
    code.as_ref().map(|c| format!(" [{c}]")).unwrap_or_default()
}

/// Convenience Result type alias for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;
