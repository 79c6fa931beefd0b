//! Protocol message types for daemon communication.

use crate::version::ProtocolVersion;
use serde::{Deserialize, Serialize};
use tabtime_core::{CompletedSession, DailyStats, DayKey, ExtensionOptions, TrackingStatus};

/// Message types that can be sent by clients to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageType {
    /// Client handshake/connection request
    Connect {
        /// Client identifier (optional)
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
    },

    /// Browser event from the extension bridge
    BrowserEvent {
        /// The raw browser event JSON (to be parsed)
        data: serde_json::Value,
    },

    /// Request the live tracking status
    GetStatus,

    /// Request one day's statistics (defaults to today)
    GetDailyStats {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        date: Option<DayKey>,
    },

    /// Request the days that have recorded activity
    ListDays,

    /// Request the current tracking options
    GetOptions,

    /// Replace the tracking options
    SetOptions { options: ExtensionOptions },

    /// Subscribe to tracking updates
    Subscribe,

    /// Unsubscribe from updates
    Unsubscribe,

    /// Ping to check connection
    Ping {
        /// Sequence number for matching pong response
        seq: u64,
    },

    /// Client disconnecting gracefully
    Disconnect,
}

/// Messages sent from client to daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientMessage {
    /// Protocol version
    pub protocol_version: ProtocolVersion,

    /// Message payload
    #[serde(flatten)]
    pub message: MessageType,
}

impl ClientMessage {
    /// Creates a new client message with current protocol version.
    pub fn new(message: MessageType) -> Self {
        Self {
            protocol_version: ProtocolVersion::CURRENT,
            message,
        }
    }

    pub fn connect(client_id: Option<String>) -> Self {
        Self::new(MessageType::Connect { client_id })
    }

    pub fn browser_event(data: serde_json::Value) -> Self {
        Self::new(MessageType::BrowserEvent { data })
    }

    pub fn get_status() -> Self {
        Self::new(MessageType::GetStatus)
    }

    pub fn get_daily_stats(date: Option<DayKey>) -> Self {
        Self::new(MessageType::GetDailyStats { date })
    }

    pub fn list_days() -> Self {
        Self::new(MessageType::ListDays)
    }

    pub fn get_options() -> Self {
        Self::new(MessageType::GetOptions)
    }

    pub fn set_options(options: ExtensionOptions) -> Self {
        Self::new(MessageType::SetOptions { options })
    }

    pub fn subscribe() -> Self {
        Self::new(MessageType::Subscribe)
    }

    pub fn ping(seq: u64) -> Self {
        Self::new(MessageType::Ping { seq })
    }

    pub fn disconnect() -> Self {
        Self::new(MessageType::Disconnect)
    }
}

/// One row of the day list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaySummary {
    pub date: DayKey,
    /// Milliseconds.
    pub total_time: u64,
    pub site_count: usize,
}

impl DaySummary {
    pub fn from_stats(stats: &DailyStats) -> Self {
        Self {
            date: stats.date.clone(),
            total_time: stats.total_time,
            site_count: stats.sites.len(),
        }
    }
}

/// Messages sent from daemon to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DaemonMessage {
    /// Connection accepted
    Connected {
        /// Daemon's protocol version
        protocol_version: ProtocolVersion,
        /// Assigned client ID
        client_id: String,
    },

    /// Connection rejected (version mismatch, etc.)
    Rejected {
        reason: String,
        /// Daemon's protocol version (for client to upgrade)
        protocol_version: ProtocolVersion,
    },

    /// Live tracking status
    Status {
        status: TrackingStatus,
        today: DayKey,
    },

    /// One day's statistics; `stats` is absent if nothing was recorded
    DailyStats {
        date: DayKey,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stats: Option<DailyStats>,
    },

    /// Days with recorded activity, oldest first
    DayList { days: Vec<DaySummary> },

    /// Current tracking options
    Options { options: ExtensionOptions },

    /// The current session started, switched or ended (broadcast)
    TrackingChanged {
        status: TrackingStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ended: Option<CompletedSession>,
    },

    /// The local calendar day changed (broadcast)
    DayRolledOver { today: DayKey },

    /// Pong response to ping
    Pong { seq: u64 },

    /// Error response
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
}

impl DaemonMessage {
    pub fn connected(client_id: String) -> Self {
        Self::Connected {
            protocol_version: ProtocolVersion::CURRENT,
            client_id,
        }
    }

    pub fn rejected(reason: &str) -> Self {
        Self::Rejected {
            reason: reason.to_string(),
            protocol_version: ProtocolVersion::CURRENT,
        }
    }

    pub fn status(status: TrackingStatus, today: DayKey) -> Self {
        Self::Status { status, today }
    }

    pub fn daily_stats(date: DayKey, stats: Option<DailyStats>) -> Self {
        Self::DailyStats { date, stats }
    }

    pub fn day_list(days: Vec<DaySummary>) -> Self {
        Self::DayList { days }
    }

    pub fn options(options: ExtensionOptions) -> Self {
        Self::Options { options }
    }

    pub fn tracking_changed(status: TrackingStatus, ended: Option<CompletedSession>) -> Self {
        Self::TrackingChanged { status, ended }
    }

    pub fn day_rolled_over(today: DayKey) -> Self {
        Self::DayRolledOver { today }
    }

    pub fn pong(seq: u64) -> Self {
        Self::Pong { seq }
    }

    pub fn error(message: &str) -> Self {
        Self::Error {
            message: message.to_string(),
            code: None,
        }
    }

    pub fn error_with_code(message: &str, code: &str) -> Self {
        Self::Error {
            message: message.to_string(),
            code: Some(code.to_string()),
        }
    }
}
