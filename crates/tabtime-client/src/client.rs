//! Daemon connection client.
//!
//! This module provides the `DaemonClient` which handles:
//! - Connection to the daemon via Unix socket, with optional backoff
//! - The protocol handshake
//! - Request/response queries used by the CLI
//! - Forwarding browser events for the bridge
//!
//! **Panic-Free Policy:** No `.unwrap()`, `.expect()`, `panic!()`,
//! `unreachable!()`, or `todo!()` outside tests.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::time::{interval_at, sleep, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tabtime_core::{DailyStats, DayKey, ExtensionOptions, TrackingStatus};
use tabtime_protocol::{ClientMessage, DaemonMessage, DaySummary, ProtocolVersion};

use crate::error::{ClientError, Result};

/// Default socket path, shared with the daemon.
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/tabtime.sock";

/// Environment variable overriding the socket path.
pub const SOCKET_ENV: &str = "TABTIME_SOCKET";

// ============================================================================
// Configuration
// ============================================================================

/// Connection behavior for the daemon client.
///
/// # Example
///
/// ```rust
/// use tabtime_client::client::ClientConfig;
/// use std::time::Duration;
///
/// let config = ClientConfig {
///     socket_path: std::path::PathBuf::from("/tmp/my-tabtime.sock"),
///     request_timeout: Duration::from_secs(2),
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Path to the Unix socket where the daemon listens.
    pub socket_path: PathBuf,

    /// Longest wait for a reply to a request.
    pub request_timeout: Duration,

    /// Initial delay before first retry after connection failure.
    pub retry_initial_delay: Duration,

    /// Maximum delay between retry attempts.
    pub retry_max_delay: Duration,

    /// Multiplier for exponential backoff (e.g., 2.0 doubles delay each retry).
    pub retry_multiplier: f64,

    /// How often the bridge pings a quiet connection. Must stay below the
    /// daemon's idle timeout (300 s).
    pub keepalive_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            request_timeout: Duration::from_secs(5),
            retry_initial_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(30),
            retry_multiplier: 2.0,
            keepalive_interval: Duration::from_secs(60),
        }
    }
}

impl ClientConfig {
    /// Default config with the socket path taken from `TABTIME_SOCKET` if set.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(path) = std::env::var_os(SOCKET_ENV) {
            config.socket_path = PathBuf::from(path);
        }
        config
    }

    /// Delay following `delay` in the backoff sequence.
    pub fn next_delay(&self, delay: Duration) -> Duration {
        let next_ms = (delay.as_millis() as f64 * self.retry_multiplier) as u64;
        Duration::from_millis(next_ms).min(self.retry_max_delay)
    }
}

/// Counters reported when a bridge session ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeStats {
    pub forwarded: u64,
    pub skipped: u64,
    pub daemon_errors: u64,
}

// ============================================================================
// Daemon Client
// ============================================================================

/// A handshaken connection to the daemon.
///
/// # Connection Lifecycle
///
/// 1. `connect` opens the socket and sends `Connect`
/// 2. The daemon answers `Connected` (or `Rejected` on a version mismatch)
/// 3. Requests are answered in order on the same connection
/// 4. After `subscribe`, broadcasts arrive interleaved and are read with `recv`
pub struct DaemonClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    client_id: String,
    request_timeout: Duration,
}

impl DaemonClient {
    /// Connects once and performs the handshake.
    ///
    /// # Errors
    ///
    /// - `ClientError::NotRunning` if no socket exists at the configured path
    /// - `ClientError::VersionMismatch` if the daemon rejects the handshake
    pub async fn connect(config: &ClientConfig, client_id: Option<String>) -> Result<Self> {
        if !config.socket_path.exists() {
            return Err(ClientError::NotRunning {
                path: config.socket_path.clone(),
            });
        }

        let stream = UnixStream::connect(&config.socket_path)
            .await
            .map_err(|e| ClientError::DaemonConnection(e.to_string()))?;
        let (reader, writer) = stream.into_split();

        let mut client = Self {
            reader: BufReader::new(reader),
            writer,
            client_id: String::new(),
            request_timeout: config.request_timeout,
        };
        client.handshake(client_id).await?;
        Ok(client)
    }

    /// Connects with exponential backoff until it succeeds or `cancel` fires.
    ///
    /// Version mismatches are not retried.
    pub async fn connect_with_retry(
        config: &ClientConfig,
        client_id: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        let mut delay = config.retry_initial_delay;
        let mut attempt = 0u32;

        loop {
            attempt = attempt.saturating_add(1);

            match Self::connect(config, client_id.clone()).await {
                Ok(client) => {
                    debug!(attempt, "Connection successful");
                    return Ok(client);
                }
                Err(e @ ClientError::VersionMismatch { .. }) => return Err(e),
                Err(e) => {
                    if attempt == 1 {
                        warn!(error = %e, "Daemon unavailable, will retry");
                    } else {
                        debug!(attempt, error = %e, "Connection attempt failed");
                    }
                }
            }

            tokio::select! {
                _ = sleep(delay) => {
                    delay = config.next_delay(delay);
                }
                _ = cancel.cancelled() => {
                    info!("Connection retry cancelled");
                    return Err(ClientError::DaemonConnection("cancelled".to_string()));
                }
            }
        }
    }

    async fn handshake(&mut self, client_id: Option<String>) -> Result<()> {
        self.send(&ClientMessage::connect(client_id)).await?;

        match self.recv_timeout().await? {
            DaemonMessage::Connected {
                protocol_version,
                client_id,
            } => {
                if !ProtocolVersion::CURRENT.is_compatible_with(&protocol_version) {
                    return Err(ClientError::VersionMismatch {
                        client_version: ProtocolVersion::CURRENT.to_string(),
                        daemon_version: protocol_version.to_string(),
                    });
                }
                debug!(client_id = %client_id, protocol_version = %protocol_version, "Handshake complete");
                self.client_id = client_id;
                Ok(())
            }
            DaemonMessage::Rejected {
                protocol_version, ..
            } => Err(ClientError::VersionMismatch {
                client_version: ProtocolVersion::CURRENT.to_string(),
                daemon_version: protocol_version.to_string(),
            }),
            other => Err(ClientError::ProtocolError(format!(
                "Unexpected response to connect: {other:?}"
            ))),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Writes one message as a JSON line.
    pub async fn send(&mut self, message: &ClientMessage) -> Result<()> {
        write_message(&mut self.writer, message).await
    }

    /// Reads the next message. `Ok(None)` means the daemon closed the socket.
    pub async fn recv(&mut self) -> Result<Option<DaemonMessage>> {
        let mut line = String::new();
        if self.reader.read_line(&mut line).await? == 0 {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(line.trim())?))
    }

    async fn recv_timeout(&mut self) -> Result<DaemonMessage> {
        match timeout(self.request_timeout, self.recv()).await {
            Ok(Ok(Some(message))) => Ok(message),
            Ok(Ok(None)) => Err(ClientError::Disconnected),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ClientError::Timeout),
        }
    }

    /// Sends a request and returns its reply. `error` replies become
    /// `ClientError::Daemon`.
    async fn request(&mut self, message: ClientMessage) -> Result<DaemonMessage> {
        self.send(&message).await?;
        match self.recv_timeout().await? {
            DaemonMessage::Error { message, code } => Err(ClientError::Daemon { message, code }),
            reply => Ok(reply),
        }
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Live tracking status and the daemon's current day.
    pub async fn status(&mut self) -> Result<(TrackingStatus, DayKey)> {
        match self.request(ClientMessage::get_status()).await? {
            DaemonMessage::Status { status, today } => Ok((status, today)),
            other => Err(unexpected("status", &other)),
        }
    }

    /// One day's statistics; today's if `date` is `None`.
    pub async fn daily_stats(
        &mut self,
        date: Option<DayKey>,
    ) -> Result<(DayKey, Option<DailyStats>)> {
        match self.request(ClientMessage::get_daily_stats(date)).await? {
            DaemonMessage::DailyStats { date, stats } => Ok((date, stats)),
            other => Err(unexpected("daily_stats", &other)),
        }
    }

    pub async fn list_days(&mut self) -> Result<Vec<DaySummary>> {
        match self.request(ClientMessage::list_days()).await? {
            DaemonMessage::DayList { days } => Ok(days),
            other => Err(unexpected("day_list", &other)),
        }
    }

    pub async fn options(&mut self) -> Result<ExtensionOptions> {
        match self.request(ClientMessage::get_options()).await? {
            DaemonMessage::Options { options } => Ok(options),
            other => Err(unexpected("options", &other)),
        }
    }

    /// Replaces the daemon's tracking options; returns what it stored.
    pub async fn set_options(&mut self, options: ExtensionOptions) -> Result<ExtensionOptions> {
        match self.request(ClientMessage::set_options(options)).await? {
            DaemonMessage::Options { options } => Ok(options),
            other => Err(unexpected("options", &other)),
        }
    }

    pub async fn ping(&mut self, seq: u64) -> Result<()> {
        match self.request(ClientMessage::ping(seq)).await? {
            DaemonMessage::Pong { seq: got } if got == seq => Ok(()),
            other => Err(unexpected("pong", &other)),
        }
    }

    /// Subscribes to broadcasts. Returns the initial status; later updates
    /// are read with [`recv`](Self::recv).
    pub async fn subscribe(&mut self) -> Result<(TrackingStatus, DayKey)> {
        match self.request(ClientMessage::subscribe()).await? {
            DaemonMessage::Status { status, today } => Ok((status, today)),
            other => Err(unexpected("status", &other)),
        }
    }

    /// Sends `disconnect` and drops the connection.
    pub async fn disconnect(mut self) -> Result<()> {
        self.send(&ClientMessage::disconnect()).await
    }

    // ========================================================================
    // Bridge
    // ========================================================================

    /// Forwards browser events, one JSON object per input line, until the
    /// input ends or `cancel` fires.
    ///
    /// Lines that are not JSON objects are skipped. Error replies from the
    /// daemon are logged and counted; they do not stop the bridge. A `ping`
    /// goes out every `keepalive` so the daemon does not drop the connection
    /// while the browser is quiet.
    ///
    /// # Errors
    ///
    /// - `ClientError::Disconnected` if the daemon goes away first
    pub async fn run_bridge<R>(
        self,
        input: R,
        keepalive: Duration,
        cancel: &CancellationToken,
    ) -> Result<BridgeStats>
    where
        R: AsyncBufRead + Unpin,
    {
        let DaemonClient {
            reader,
            mut writer,
            client_id,
            ..
        } = self;

        let daemon_errors = Arc::new(AtomicU64::new(0));
        let daemon_closed = CancellationToken::new();
        let reply_task = tokio::spawn(read_bridge_replies(
            reader,
            Arc::clone(&daemon_errors),
            daemon_closed.clone(),
        ));

        info!(client_id = %client_id, "Bridge started");

        let mut input = input;
        let mut stats = BridgeStats::default();
        let mut line = String::new();

        let mut keepalive_timer = interval_at(Instant::now() + keepalive, keepalive);
        keepalive_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut ping_seq: u64 = 0;

        // `line` is cleared only after a full line was handled, so a read
        // interrupted by another branch keeps what it already consumed.
        let result = loop {
            tokio::select! {
                read = input.read_line(&mut line) => {
                    match read {
                        Ok(0) => {
                            info!(
                                forwarded = stats.forwarded,
                                skipped = stats.skipped,
                                "Bridge input closed"
                            );
                            let _ = write_message(&mut writer, &ClientMessage::disconnect()).await;
                            break Ok(());
                        }
                        Ok(_) => {
                            let forwarded = forward_line(&mut writer, line.trim(), &mut stats).await;
                            line.clear();
                            if let Err(e) = forwarded {
                                break Err(e);
                            }
                        }
                        Err(e) => break Err(e.into()),
                    }
                }

                _ = keepalive_timer.tick() => {
                    ping_seq += 1;
                    debug!(seq = ping_seq, "Bridge keepalive");
                    if let Err(e) = write_message(&mut writer, &ClientMessage::ping(ping_seq)).await {
                        break Err(e);
                    }
                }

                _ = daemon_closed.cancelled() => {
                    warn!("Daemon closed the bridge connection");
                    break Err(ClientError::Disconnected);
                }

                _ = cancel.cancelled() => {
                    debug!("Bridge cancelled");
                    let _ = write_message(&mut writer, &ClientMessage::disconnect()).await;
                    break Ok(());
                }
            }
        };

        reply_task.abort();
        stats.daemon_errors = daemon_errors.load(Ordering::Relaxed);
        result.map(|()| stats)
    }
}

/// Logs error replies that arrive while the bridge is forwarding.
async fn read_bridge_replies(
    mut reader: BufReader<OwnedReadHalf>,
    errors: Arc<AtomicU64>,
    closed: CancellationToken,
) {
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) | Err(_) => break,
            Ok(_) => match serde_json::from_str::<DaemonMessage>(line.trim()) {
                Ok(DaemonMessage::Error { message, code }) => {
                    errors.fetch_add(1, Ordering::Relaxed);
                    warn!(error_message = %message, error_code = ?code, "Daemon rejected browser event");
                }
                Ok(other) => debug!(message = ?other, "Ignoring daemon message"),
                Err(e) => warn!(error = %e, "Unparseable daemon message"),
            },
        }
    }
    closed.cancel();
}

async fn forward_line(
    writer: &mut OwnedWriteHalf,
    line: &str,
    stats: &mut BridgeStats,
) -> Result<()> {
    if line.is_empty() {
        return Ok(());
    }

    match serde_json::from_str::<serde_json::Value>(line) {
        Ok(data) if data.is_object() => {
            write_message(writer, &ClientMessage::browser_event(data)).await?;
            stats.forwarded += 1;
        }
        Ok(_) => {
            stats.skipped += 1;
            warn!(line = %line, "Browser event is not a JSON object, skipped");
        }
        Err(e) => {
            stats.skipped += 1;
            warn!(error = %e, "Invalid browser event JSON, skipped");
        }
    }
    Ok(())
}

/// Writes one message as a JSON line.
async fn write_message(writer: &mut OwnedWriteHalf, message: &ClientMessage) -> Result<()> {
    let json = serde_json::to_string(message)?;
    writer.write_all(json.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    debug!(message_type = ?message.message, "Sent message to daemon");
    Ok(())
}

fn unexpected(expected: &str, got: &DaemonMessage) -> ClientError {
    ClientError::ProtocolError(format!("expected {expected}, got {got:?}"))
}

// ============================================================================
// Tests
// ============================================================================
