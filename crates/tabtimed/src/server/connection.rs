//! Connection handler for individual client connections.
//!
//! Each client connection gets its own `ConnectionHandler` that:
//! - Performs protocol version negotiation
//! - Mirrors browser events into the tab table and submits them to the tracker
//! - Answers status and statistics queries
//! - Registers the client as a subscriber on request
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Connection errors are logged and result in graceful disconnect

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, RwLock};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use tabtime_core::ExtensionOptions;
use tabtime_protocol::{
    BrowserEvent, ClientMessage, DaemonMessage, EventParseError, MessageType, ProtocolVersion,
    RawBrowserEvent,
};

use crate::tabs::TabTable;
use crate::tracker::{TrackerError, TrackerHandle, TrackerInput};

/// Type alias for subscriber writer handle
pub type SubscriberWriter = Arc<Mutex<BufWriter<OwnedWriteHalf>>>;

/// A client subscribed to tracker broadcasts.
pub struct Subscriber {
    pub writer: SubscriberWriter,
}

/// Type alias for the subscribers map
pub type SubscribersMap = Arc<RwLock<HashMap<String, Subscriber>>>;

/// Maximum number of concurrent subscribers
pub const MAX_SUBSCRIBERS: usize = 10;

/// Maximum message size (1 MB)
const MAX_MESSAGE_SIZE: usize = 1_048_576;

/// Read timeout for idle connections (5 minutes)
const READ_TIMEOUT: Duration = Duration::from_secs(300);

/// Write timeout (10 seconds)
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

type ClientId = String;

/// Connection handler for a single client.
pub struct ConnectionHandler {
    reader: BufReader<OwnedReadHalf>,

    /// Shared with the broadcaster and with pending browser-event tasks
    writer: SubscriberWriter,

    tracker: TrackerHandle,
    tabs: TabTable,
    subscribers: SubscribersMap,

    client_id: Option<ClientId>,
    subscribed: bool,
    connection_number: u64,
}

impl ConnectionHandler {
    pub fn new(
        reader: OwnedReadHalf,
        writer: OwnedWriteHalf,
        tracker: TrackerHandle,
        tabs: TabTable,
        subscribers: SubscribersMap,
        connection_number: u64,
    ) -> Self {
        Self {
            reader: BufReader::new(reader),
            writer: Arc::new(Mutex::new(BufWriter::new(writer))),
            tracker,
            tabs,
            subscribers,
            client_id: None,
            subscribed: false,
            connection_number,
        }
    }

    /// Runs the connection handler.
    ///
    /// Performs the handshake, then processes messages until the connection
    /// closes. Returns the client id so the server can drop its subscription.
    pub async fn run(mut self) -> Option<ClientId> {
        debug!(connection = self.connection_number, "New client connected");

        match self.handle_handshake().await {
            Ok(()) => {
                info!(client_id = ?self.client_id, "Client handshake completed");
            }
            Err(e) => {
                warn!(
                    connection = self.connection_number,
                    error = %e,
                    "Handshake failed"
                );
                return None;
            }
        }

        let client_id = self.client_id.clone();

        if let Err(e) = self.process_messages().await {
            debug!(client_id = ?self.client_id, error = %e, "Connection closed");
        }

        info!(client_id = ?self.client_id, "Client disconnected");
        client_id
    }

    /// Expects a `Connect` message and answers `Connected` or `Rejected`.
    async fn handle_handshake(&mut self) -> Result<(), ConnectionError> {
        let msg = self.read_message().await?;

        let client_version = msg.protocol_version;
        if !client_version.is_compatible_with(&ProtocolVersion::CURRENT) {
            warn!(
                client_version = %client_version,
                server_version = %ProtocolVersion::CURRENT,
                "Protocol version mismatch"
            );

            self.send_message(DaemonMessage::rejected(&format!(
                "Protocol version {} not compatible with server version {}",
                client_version,
                ProtocolVersion::CURRENT
            )))
            .await?;

            return Err(ConnectionError::VersionMismatch {
                client: client_version,
                server: ProtocolVersion::CURRENT,
            });
        }

        match msg.message {
            MessageType::Connect { client_id } => {
                let assigned_id =
                    client_id.unwrap_or_else(|| format!("client-{}", self.connection_number));

                self.client_id = Some(assigned_id.clone());
                self.send_message(DaemonMessage::connected(assigned_id))
                    .await?;
                Ok(())
            }
            other => {
                self.send_message(DaemonMessage::error(
                    "Expected Connect message for handshake",
                ))
                .await?;

                Err(ConnectionError::UnexpectedMessage(format!("{other:?}")))
            }
        }
    }

    /// Reads and processes messages until EOF, timeout, or an I/O error.
    async fn process_messages(&mut self) -> Result<(), ConnectionError> {
        loop {
            let msg = match timeout(READ_TIMEOUT, self.read_message()).await {
                Ok(Ok(msg)) => msg,
                Ok(Err(ConnectionError::Eof)) => {
                    debug!(client_id = ?self.client_id, "Client sent EOF");
                    return Ok(());
                }
                Ok(Err(e @ ConnectionError::ParseError(_))) => {
                    // A bad line does not end the session.
                    warn!(client_id = ?self.client_id, error = %e, "Unparseable message");
                    self.send_message(DaemonMessage::error_with_code(&e.to_string(), e.code()))
                        .await?;
                    continue;
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    debug!(client_id = ?self.client_id, "Connection timed out");
                    return Err(ConnectionError::Timeout);
                }
            };

            match self.handle_message(msg).await {
                Ok(()) => {}
                Err(ConnectionError::Eof) => return Ok(()),
                Err(e) => {
                    warn!(client_id = ?self.client_id, error = %e, "Error handling message");

                    // Send error response but continue processing
                    let _ = self
                        .send_message(DaemonMessage::error_with_code(&e.to_string(), e.code()))
                        .await;
                }
            }
        }
    }

    async fn handle_message(&mut self, msg: ClientMessage) -> Result<(), ConnectionError> {
        match msg.message {
            MessageType::Connect { .. } => {
                self.send_message(DaemonMessage::error("Already connected"))
                    .await?;
            }

            MessageType::BrowserEvent { data } => {
                self.handle_browser_event(data).await?;
            }

            MessageType::GetStatus => {
                let report = self
                    .tracker
                    .status()
                    .await
                    .ok_or(ConnectionError::Tracker(TrackerError::ChannelClosed))?;
                self.send_message(DaemonMessage::status(report.status, report.today))
                    .await?;
            }

            MessageType::GetDailyStats { date } => {
                let (date, stats) = self
                    .tracker
                    .daily_stats(date)
                    .await
                    .ok_or(ConnectionError::Tracker(TrackerError::ChannelClosed))?;
                self.send_message(DaemonMessage::daily_stats(date, stats))
                    .await?;
            }

            MessageType::ListDays => {
                let days = self.tracker.list_days().await;
                self.send_message(DaemonMessage::day_list(days)).await?;
            }

            MessageType::GetOptions => {
                let options = self
                    .tracker
                    .options()
                    .await
                    .ok_or(ConnectionError::Tracker(TrackerError::ChannelClosed))?;
                self.send_message(DaemonMessage::options(options)).await?;
            }

            MessageType::SetOptions { options } => {
                self.handle_set_options(options).await?;
            }

            MessageType::Subscribe => {
                self.handle_subscribe().await?;
            }

            MessageType::Unsubscribe => {
                if let Some(ref client_id) = self.client_id {
                    self.subscribers.write().await.remove(client_id);
                }
                self.subscribed = false;
                debug!(client_id = ?self.client_id, "Client unsubscribed from updates");
            }

            MessageType::Ping { seq } => {
                self.send_message(DaemonMessage::pong(seq)).await?;
            }

            MessageType::Disconnect => {
                debug!(client_id = ?self.client_id, "Client requested disconnect");
                return Err(ConnectionError::Eof);
            }
        }

        Ok(())
    }

    /// Mirrors a browser event into the tab table and submits it.
    ///
    /// Success is silent. A failed transition is reported back on this
    /// connection once the tracker has resolved it.
    async fn handle_browser_event(&mut self, data: serde_json::Value) -> Result<(), ConnectionError> {
        let event = RawBrowserEvent::parse_value(data)?;
        debug!(client_id = ?self.client_id, ?event, "Browser event");

        let input = match event {
            BrowserEvent::TabActivated { tab_id, url } => {
                self.tabs.activate(tab_id, url).await;
                TrackerInput::TabActivated(tab_id)
            }
            BrowserEvent::TabUpdated(update) => {
                self.tabs.update(&update).await;
                TrackerInput::TabUpdated(update.tab_id)
            }
            BrowserEvent::TabRemoved { tab_id } => {
                self.tabs.remove(tab_id).await;
                return Ok(());
            }
            BrowserEvent::FocusChanged { focused } => TrackerInput::FocusChanged(focused),
        };

        let pending = self.tracker.submit(input).await?;
        let writer = Arc::clone(&self.writer);
        let client_id = self.client_id.clone();

        tokio::spawn(async move {
            match pending.wait().await {
                Ok(transition) => {
                    debug!(client_id = ?client_id, ?input, ?transition, "Browser event applied");
                }
                Err(e) => {
                    warn!(client_id = ?client_id, ?input, error = %e, "Browser event failed");
                    let reply = DaemonMessage::error_with_code(&e.to_string(), e.code());
                    let _ = write_message(&writer, &reply).await;
                }
            }
        });

        Ok(())
    }

    async fn handle_set_options(&mut self, options: ExtensionOptions) -> Result<(), ConnectionError> {
        self.tracker.set_options(options.clone()).await?;
        info!(client_id = ?self.client_id, "Options replaced by client");
        self.send_message(DaemonMessage::options(options)).await
    }

    async fn handle_subscribe(&mut self) -> Result<(), ConnectionError> {
        let Some(client_id) = self.client_id.clone() else {
            self.send_message(DaemonMessage::error("Must connect before subscribing"))
                .await?;
            return Ok(());
        };

        {
            let mut subs = self.subscribers.write().await;

            if subs.len() >= MAX_SUBSCRIBERS && !subs.contains_key(&client_id) {
                drop(subs);
                self.send_message(DaemonMessage::error_with_code(
                    &format!("Too many subscribers (max: {MAX_SUBSCRIBERS})"),
                    "too_many_subscribers",
                ))
                .await?;
                return Ok(());
            }

            subs.insert(
                client_id.clone(),
                Subscriber {
                    writer: Arc::clone(&self.writer),
                },
            );
        }

        self.subscribed = true;
        debug!(client_id = %client_id, "Client subscribed to updates");

        // Current status as initial state
        let report = self
            .tracker
            .status()
            .await
            .ok_or(ConnectionError::Tracker(TrackerError::ChannelClosed))?;
        self.send_message(DaemonMessage::status(report.status, report.today))
            .await
    }

    async fn read_message(&mut self) -> Result<ClientMessage, ConnectionError> {
        let mut line = String::new();

        let bytes_read = self
            .reader
            .read_line(&mut line)
            .await
            .map_err(|e| ConnectionError::Io(e.to_string()))?;

        if bytes_read == 0 {
            return Err(ConnectionError::Eof);
        }

        if line.len() > MAX_MESSAGE_SIZE {
            return Err(ConnectionError::MessageTooLarge {
                size: line.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }

        let msg: ClientMessage = serde_json::from_str(&line)
            .map_err(|e| ConnectionError::ParseError(e.to_string()))?;

        debug!(
            client_id = ?self.client_id,
            message_type = ?std::mem::discriminant(&msg.message),
            "Received message"
        );

        Ok(msg)
    }

    async fn send_message(&self, msg: DaemonMessage) -> Result<(), ConnectionError> {
        write_message(&self.writer, &msg).await
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscribed
    }

    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }
}

/// Writes one JSON line to a client, bounded by the write timeout.
pub async fn write_message(
    writer: &SubscriberWriter,
    msg: &DaemonMessage,
) -> Result<(), ConnectionError> {
    let json =
        serde_json::to_string(msg).map_err(|e| ConnectionError::ParseError(e.to_string()))?;

    let mut writer = writer.lock().await;

    match timeout(WRITE_TIMEOUT, async {
        writer.write_all(json.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
        Ok::<(), std::io::Error>(())
    })
    .await
    {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(ConnectionError::Io(e.to_string())),
        Err(_) => Err(ConnectionError::WriteTimeout),
    }
}

/// Errors that can occur during connection handling.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Protocol version mismatch: client {client}, server {server}")]
    VersionMismatch {
        client: ProtocolVersion,
        server: ProtocolVersion,
    },

    #[error("Unexpected message: {0}")]
    UnexpectedMessage(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Invalid browser event: {0}")]
    Event(#[from] EventParseError),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Connection closed")]
    Eof,

    #[error("Read timeout")]
    Timeout,

    #[error("Write timeout")]
    WriteTimeout,

    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("Tracker error: {0}")]
    Tracker(#[from] TrackerError),
}

impl ConnectionError {
    /// Code sent with `error` replies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::VersionMismatch { .. } => "version_mismatch",
            Self::UnexpectedMessage(_) => "unexpected_message",
            Self::ParseError(_) => "parse_error",
            Self::Event(_) => "invalid_event",
            Self::Io(_) | Self::Eof | Self::Timeout | Self::WriteTimeout => "io_error",
            Self::MessageTooLarge { .. } => "message_too_large",
            Self::Tracker(e) => e.code(),
        }
    }
}
