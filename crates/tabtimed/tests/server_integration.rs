//! Integration tests for the Unix socket server.
//!
//! These run a real DaemonServer over a temporary socket, wired to a spawned
//! tracker, and talk to it the way the bridge and the CLI do.
//!
//! Tests CAN use `.unwrap()` and `.expect()`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

use tabtime_client::{ClientConfig, DaemonClient};
use tabtime_core::{Domain, ExtensionOptions, SessionTracker, TrackingStatus};
use tabtime_protocol::{ClientMessage, DaemonMessage, MessageType, ProtocolVersion};
use tabtimed::clock::ManualClock;
use tabtimed::persist::PersistHandle;
use tabtimed::server::{DaemonServer, MAX_SUBSCRIBERS};
use tabtimed::tabs::TabTable;
use tabtimed::tracker::{spawn_tracker, TrackerRuntime};

// ============================================================================
// Constants
// ============================================================================

const SOCKET_WAIT_TIMEOUT: Duration = Duration::from_millis(500);
const SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(10);
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_millis(100);

/// Upper bound on waiting for a reply that should arrive.
const RECV_TIMEOUT: Duration = Duration::from_secs(2);

// ============================================================================
// Test Helpers
// ============================================================================

struct TestServer {
    socket_path: PathBuf,
    cancel_token: CancellationToken,
    clock: ManualClock,
    _temp_dir: TempDir,
}

impl TestServer {
    async fn spawn() -> Self {
        let temp_dir = tempfile::tempdir().expect("create temp dir");
        let socket_path = temp_dir.path().join("test.sock");

        let start: DateTime<Utc> = DateTime::parse_from_rfc3339("2024-06-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let clock = ManualClock::new(start);
        let tabs = TabTable::new();

        let tracker = spawn_tracker(
            SessionTracker::new(Utc, start),
            ExtensionOptions::default(),
            TrackerRuntime {
                tabs: Arc::new(tabs.clone()),
                clock: Arc::new(clock.clone()),
                persister: PersistHandle::disconnected(),
                sleep_gap_threshold_ms: 30_000,
            },
        );
        let cancel_token = CancellationToken::new();

        let server = DaemonServer::new(socket_path.clone(), tracker, tabs, cancel_token.clone());
        tokio::spawn(async move {
            let _ = server.run().await;
        });

        let start = tokio::time::Instant::now();
        while start.elapsed() < SOCKET_WAIT_TIMEOUT {
            if socket_path.exists() {
                break;
            }
            sleep(SOCKET_POLL_INTERVAL).await;
        }
        assert!(
            socket_path.exists(),
            "Server socket did not appear within {SOCKET_WAIT_TIMEOUT:?}"
        );

        TestServer {
            socket_path,
            cancel_token,
            clock,
            _temp_dir: temp_dir,
        }
    }

    async fn connect(&self) -> TestClient {
        let stream = UnixStream::connect(&self.socket_path)
            .await
            .expect("connect to server");
        TestClient::new(stream)
    }

    /// A connected client that has completed the handshake.
    async fn client(&self, id: &str) -> TestClient {
        let mut client = self.connect().await;
        client.handshake(Some(id.to_string())).await;
        client
    }

    async fn shutdown(self) {
        self.cancel_token.cancel();
        sleep(SHUTDOWN_GRACE_PERIOD).await;
    }
}

struct TestClient {
    reader: BufReader<tokio::net::unix::OwnedReadHalf>,
    writer: tokio::net::unix::OwnedWriteHalf,
}

impl TestClient {
    fn new(stream: UnixStream) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            reader: BufReader::new(reader),
            writer,
        }
    }

    async fn send_raw(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
        self.writer.flush().await.unwrap();
    }

    async fn send(&mut self, msg: ClientMessage) {
        let json = serde_json::to_string(&msg).unwrap();
        self.send_raw(&json).await;
    }

    async fn recv(&mut self) -> DaemonMessage {
        let mut line = String::new();
        timeout(RECV_TIMEOUT, self.reader.read_line(&mut line))
            .await
            .expect("reply within timeout")
            .unwrap();
        serde_json::from_str(&line).unwrap()
    }

    async fn handshake(&mut self, client_id: Option<String>) -> String {
        self.send(ClientMessage::connect(client_id)).await;

        match self.recv().await {
            DaemonMessage::Connected { client_id, .. } => client_id,
            other => panic!("Expected Connected, got {other:?}"),
        }
    }

    async fn subscribe(&mut self) {
        self.send(ClientMessage::subscribe()).await;
        match self.recv().await {
            DaemonMessage::Status { .. } => {}
            other => panic!("Expected initial Status, got {other:?}"),
        }
    }

    async fn status(&mut self) -> TrackingStatus {
        self.send(ClientMessage::get_status()).await;
        match self.recv().await {
            DaemonMessage::Status { status, .. } => status,
            other => panic!("Expected Status, got {other:?}"),
        }
    }
}

fn is_tracking(status: &TrackingStatus, expected: &str) -> bool {
    matches!(status, TrackingStatus::Tracking { domain, .. } if *domain == Domain::new(expected))
}

/// Polls `get_status` on a fresh connection until `done` accepts it.
async fn wait_for_status(
    server: &TestServer,
    done: impl Fn(&TrackingStatus) -> bool,
) -> TrackingStatus {
    let mut cli = server.client("cli").await;
    let mut status = cli.status().await;
    for _ in 0..50 {
        if done(&status) {
            break;
        }
        sleep(SOCKET_POLL_INTERVAL).await;
        status = cli.status().await;
    }
    status
}

// ============================================================================
// Connection Tests
// ============================================================================

#[tokio::test]
async fn test_handshake_success() {
    let server = TestServer::spawn().await;
    let mut client = server.connect().await;

    client
        .send(ClientMessage::connect(Some("bridge".to_string())))
        .await;

    match client.recv().await {
        DaemonMessage::Connected {
            protocol_version,
            client_id,
        } => {
            assert_eq!(protocol_version, ProtocolVersion::CURRENT);
            assert_eq!(client_id, "bridge");
        }
        other => panic!("Expected Connected, got {other:?}"),
    }

    server.shutdown().await;
}

#[tokio::test]
async fn test_handshake_auto_assigns_client_id() {
    let server = TestServer::spawn().await;
    let mut client = server.connect().await;

    let client_id = client.handshake(None).await;
    assert!(client_id.starts_with("client-"), "got: {client_id}");

    server.shutdown().await;
}

#[tokio::test]
async fn test_handshake_version_mismatch() {
    let server = TestServer::spawn().await;
    let mut client = server.connect().await;

    client
        .send(ClientMessage {
            protocol_version: ProtocolVersion::new(99, 0),
            message: MessageType::Connect { client_id: None },
        })
        .await;

    match client.recv().await {
        DaemonMessage::Rejected { reason, .. } => {
            assert!(reason.contains("not compatible"), "got: {reason}");
        }
        other => panic!("Expected Rejected, got {other:?}"),
    }

    server.shutdown().await;
}

#[tokio::test]
async fn test_ping_pong_and_disconnect() {
    let server = TestServer::spawn().await;
    let mut client = server.client("cli").await;

    client.send(ClientMessage::ping(7)).await;
    assert!(matches!(client.recv().await, DaemonMessage::Pong { seq: 7 }));

    client.send(ClientMessage::disconnect()).await;
    let mut line = String::new();
    let read = timeout(RECV_TIMEOUT, client.reader.read_line(&mut line))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(read, 0, "server should close the connection");

    server.shutdown().await;
}

// ============================================================================
// Browser Event Tests
// ============================================================================

#[tokio::test]
async fn test_browser_events_drive_tracking() {
    let server = TestServer::spawn().await;
    let mut watcher = server.client("watch").await;
    watcher.subscribe().await;

    let mut bridge = server.client("bridge").await;
    bridge
        .send(ClientMessage::browser_event(json!({
            "kind": "tab_activated",
            "tabId": 5,
            "url": "https://docs.rs/tokio"
        })))
        .await;

    match watcher.recv().await {
        DaemonMessage::TrackingChanged { status, ended } => {
            assert!(is_tracking(&status, "docs.rs"), "got: {status:?}");
            assert!(ended.is_none());
        }
        other => panic!("Expected TrackingChanged, got {other:?}"),
    }

    // Navigation of the active tab switches domain.
    server.clock.advance_ms(45_000);
    bridge
        .send(ClientMessage::browser_event(json!({
            "kind": "tab_updated",
            "tabId": 5,
            "url": "https://github.com/tokio-rs/tokio",
            "status": "complete",
            "active": true
        })))
        .await;

    match watcher.recv().await {
        DaemonMessage::TrackingChanged { status, ended } => {
            assert!(is_tracking(&status, "github.com"));
            let ended = ended.expect("previous session recorded");
            assert_eq!(ended.domain, Domain::new("docs.rs"));
            assert_eq!(ended.session.duration, 45_000);
        }
        other => panic!("Expected TrackingChanged, got {other:?}"),
    }

    // Losing focus ends the session.
    bridge
        .send(ClientMessage::browser_event(json!({
            "kind": "window_focus_changed",
            "windowId": -1
        })))
        .await;

    match watcher.recv().await {
        DaemonMessage::TrackingChanged { status, ended } => {
            assert_eq!(status, TrackingStatus::Idle);
            assert_eq!(ended.unwrap().domain, Domain::new("github.com"));
        }
        other => panic!("Expected TrackingChanged, got {other:?}"),
    }

    assert_eq!(bridge.status().await, TrackingStatus::Idle);

    server.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_bridge_keeps_connection_through_quiet_period() {
    let server = TestServer::spawn().await;
    let config = ClientConfig {
        socket_path: server.socket_path.clone(),
        ..ClientConfig::default()
    };
    let bridge = DaemonClient::connect(&config, Some("bridge".to_string()))
        .await
        .unwrap();

    let (mut browser, input) = tokio::io::duplex(4096);
    let cancel = CancellationToken::new();
    let bridge_cancel = cancel.clone();
    let keepalive = config.keepalive_interval;
    let bridge_task = tokio::spawn(async move {
        bridge
            .run_bridge(BufReader::new(input), keepalive, &bridge_cancel)
            .await
    });

    browser
        .write_all(b"{\"kind\":\"tab_activated\",\"tabId\":1,\"url\":\"https://a.com/\"}\n")
        .await
        .unwrap();
    let status = wait_for_status(&server, |s| is_tracking(s, "a.com")).await;
    assert!(is_tracking(&status, "a.com"), "got: {status:?}");

    // Longer than the daemon's 300 s idle timeout, with no browser events.
    sleep(Duration::from_secs(360)).await;
    assert!(!bridge_task.is_finished());

    browser
        .write_all(b"{\"kind\":\"window_focus_changed\",\"windowId\":-1}\n")
        .await
        .unwrap();
    let status = wait_for_status(&server, |s| *s == TrackingStatus::Idle).await;
    assert_eq!(status, TrackingStatus::Idle);

    cancel.cancel();
    let stats = bridge_task.await.unwrap().unwrap();
    assert_eq!(stats.forwarded, 2);
    assert_eq!(stats.daemon_errors, 0);

    server.shutdown().await;
}

#[tokio::test]
async fn test_failed_transition_is_reported_to_sender() {
    let server = TestServer::spawn().await;
    let mut bridge = server.client("bridge").await;

    // Activation without a URL for a tab the daemon has never seen.
    bridge
        .send(ClientMessage::browser_event(json!({
            "kind": "tab_activated",
            "tabId": 99
        })))
        .await;

    match bridge.recv().await {
        DaemonMessage::Error { code, .. } => {
            assert_eq!(code.as_deref(), Some("tab_without_url"));
        }
        other => panic!("Expected Error, got {other:?}"),
    }

    assert_eq!(bridge.status().await, TrackingStatus::Idle);

    server.shutdown().await;
}

#[tokio::test]
async fn test_invalid_browser_event_is_rejected() {
    let server = TestServer::spawn().await;
    let mut bridge = server.client("bridge").await;

    bridge
        .send(ClientMessage::browser_event(json!({ "kind": "tab_exploded" })))
        .await;

    match bridge.recv().await {
        DaemonMessage::Error { code, message } => {
            assert_eq!(code.as_deref(), Some("invalid_event"));
            assert!(message.contains("tab_exploded"));
        }
        other => panic!("Expected Error, got {other:?}"),
    }

    server.shutdown().await;
}

#[tokio::test]
async fn test_tab_removed_has_no_reply() {
    let server = TestServer::spawn().await;
    let mut bridge = server.client("bridge").await;

    bridge
        .send(ClientMessage::browser_event(json!({
            "kind": "tab_removed",
            "tabId": 3
        })))
        .await;

    // The next reply on the wire belongs to the ping.
    bridge.send(ClientMessage::ping(1)).await;
    assert!(matches!(bridge.recv().await, DaemonMessage::Pong { seq: 1 }));

    server.shutdown().await;
}

// ============================================================================
// Query Tests
// ============================================================================

#[tokio::test]
async fn test_daily_stats_after_session() {
    let server = TestServer::spawn().await;
    let mut watcher = server.client("watch").await;
    watcher.subscribe().await;
    let mut bridge = server.client("bridge").await;

    bridge
        .send(ClientMessage::browser_event(json!({
            "kind": "tab_activated",
            "tabId": 1,
            "url": "https://crates.io/"
        })))
        .await;
    assert!(matches!(watcher.recv().await, DaemonMessage::TrackingChanged { .. }));

    server.clock.advance_ms(90_000);
    bridge
        .send(ClientMessage::browser_event(json!({
            "kind": "window_focus_changed",
            "focused": false
        })))
        .await;
    assert!(matches!(
        watcher.recv().await,
        DaemonMessage::TrackingChanged { ended: Some(_), .. }
    ));

    bridge.send(ClientMessage::get_daily_stats(None)).await;
    match bridge.recv().await {
        DaemonMessage::DailyStats { date, stats } => {
            assert_eq!(date.as_str(), "2024-06-01");
            let stats = stats.expect("stats recorded");
            assert_eq!(stats.total_time, 90_000);
            assert_eq!(stats.sites.len(), 1);
        }
        other => panic!("Expected DailyStats, got {other:?}"),
    }

    bridge.send(ClientMessage::list_days()).await;
    match bridge.recv().await {
        DaemonMessage::DayList { days } => {
            assert_eq!(days.len(), 1);
            assert_eq!(days[0].site_count, 1);
        }
        other => panic!("Expected DayList, got {other:?}"),
    }

    server.shutdown().await;
}

#[tokio::test]
async fn test_daily_stats_for_empty_day() {
    let server = TestServer::spawn().await;
    let mut client = server.client("cli").await;

    client.send(ClientMessage::get_daily_stats(None)).await;
    match client.recv().await {
        DaemonMessage::DailyStats { stats, .. } => assert!(stats.is_none()),
        other => panic!("Expected DailyStats, got {other:?}"),
    }

    server.shutdown().await;
}

#[tokio::test]
async fn test_set_options_is_broadcast() {
    let server = TestServer::spawn().await;
    let mut watcher = server.client("watch").await;
    watcher.subscribe().await;
    let mut cli = server.client("cli").await;

    let options = ExtensionOptions {
        track_localhost: true,
        allow_list: vec![],
        exclude_list: vec!["https://news.ycombinator.com".to_string()],
    };
    cli.send(ClientMessage::set_options(options.clone())).await;

    match cli.recv().await {
        DaemonMessage::Options { options: got } => assert_eq!(got, options),
        other => panic!("Expected Options, got {other:?}"),
    }
    match watcher.recv().await {
        DaemonMessage::Options { options: got } => assert_eq!(got, options),
        other => panic!("Expected Options broadcast, got {other:?}"),
    }

    cli.send(ClientMessage::get_options()).await;
    assert!(matches!(cli.recv().await, DaemonMessage::Options { options: got } if got == options));

    server.shutdown().await;
}

// ============================================================================
// Robustness Tests
// ============================================================================

#[tokio::test]
async fn test_subscriber_limit() {
    let server = TestServer::spawn().await;

    let mut watchers = Vec::with_capacity(MAX_SUBSCRIBERS);
    for i in 0..MAX_SUBSCRIBERS {
        let mut watcher = server.client(&format!("watch-{i}")).await;
        watcher.subscribe().await;
        watchers.push(watcher);
    }

    let mut extra = server.client("watch-extra").await;
    extra.send(ClientMessage::subscribe()).await;
    match extra.recv().await {
        DaemonMessage::Error { code, .. } => {
            assert_eq!(code.as_deref(), Some("too_many_subscribers"));
        }
        other => panic!("Expected Error, got {other:?}"),
    }

    // The rejected client keeps a working connection.
    assert_eq!(extra.status().await, TrackingStatus::Idle);

    server.shutdown().await;
}

#[tokio::test]
async fn test_malformed_line_does_not_close_connection() {
    let server = TestServer::spawn().await;
    let mut client = server.client("cli").await;

    client.send_raw("{ not json").await;
    match client.recv().await {
        DaemonMessage::Error { code, .. } => assert_eq!(code.as_deref(), Some("parse_error")),
        other => panic!("Expected Error, got {other:?}"),
    }

    client.send(ClientMessage::ping(2)).await;
    assert!(matches!(client.recv().await, DaemonMessage::Pong { seq: 2 }));

    server.shutdown().await;
}

#[tokio::test]
async fn test_graceful_shutdown_removes_socket() {
    let server = TestServer::spawn().await;
    let socket_path = server.socket_path.clone();
    assert!(socket_path.exists());

    server.shutdown().await;
    assert!(!socket_path.exists());
}
