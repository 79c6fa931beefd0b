//! tabtime daemon - browser time tracker and socket server
//!
//! This binary runs as a background daemon, receiving browser events from
//! the `tabtime bridge` and answering status and statistics queries.
//!
//! # Usage
//!
//! ```bash
//! # Start the daemon (foreground)
//! tabtimed start
//!
//! # Start the daemon (background/daemonized) with an explicit config
//! tabtimed start -d --config ~/.config/tabtime/config.toml
//!
//! # Stop the daemon
//! tabtimed stop
//!
//! # Check daemon status
//! tabtimed status
//!
//! # Reload the [tracking] section of the config file
//! kill -HUP $(cat ~/.local/state/tabtime/tabtimed.pid)
//! ```

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Local;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use tabtime_core::SessionTracker;
use tabtimed::clock::{Clock, SystemClock};
use tabtimed::config::{self, DaemonConfig};
use tabtimed::persist::{spawn_persister, StateFile};
use tabtimed::scheduler::Scheduler;
use tabtimed::server::DaemonServer;
use tabtimed::tabs::TabTable;
use tabtimed::tracker::{spawn_tracker, TrackerHandle, TrackerRuntime};

/// tabtime daemon - per-domain browser time tracking
#[derive(Parser, Debug)]
#[command(name = "tabtimed", version, about)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the daemon
    Start {
        /// Run as a background daemon (fork to background)
        #[arg(short = 'd', long)]
        daemon: bool,

        /// Config file (defaults to $XDG_CONFIG_HOME/tabtime/config.toml)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Stop the running daemon
    Stop,
    /// Show daemon status
    Status,
}

fn pid_file_path() -> PathBuf {
    config::state_dir().join("tabtimed.pid")
}

fn log_file_path() -> PathBuf {
    config::state_dir().join("tabtimed.log")
}

fn read_pid() -> Option<u32> {
    let path = pid_file_path();
    let mut file = File::open(&path).ok()?;
    let mut contents = String::new();
    file.read_to_string(&mut contents).ok()?;
    contents.trim().parse().ok()
}

fn write_pid() -> Result<()> {
    let path = pid_file_path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("Failed to create state directory")?;
    }
    let mut file = File::create(&path).context("Failed to create PID file")?;
    write!(file, "{}", process::id()).context("Failed to write PID")?;
    Ok(())
}

fn remove_pid_file() {
    let _ = fs::remove_file(pid_file_path());
}

fn is_process_running(pid: u32) -> bool {
    PathBuf::from(format!("/proc/{pid}")).exists()
}

fn is_daemon_running() -> Option<u32> {
    if let Some(pid) = read_pid() {
        if is_process_running(pid) {
            return Some(pid);
        }
        remove_pid_file();
    }
    None
}

fn stop_daemon(pid: u32) -> Result<()> {
    #[cfg(unix)]
    {
        let Ok(pid) = i32::try_from(pid) else {
            bail!("Invalid PID {pid}");
        };
        let result = unsafe { libc::kill(pid, libc::SIGTERM) };
        if result != 0 {
            bail!("Failed to send SIGTERM to process {pid}");
        }
    }
    #[cfg(not(unix))]
    {
        bail!("Stop command is only supported on Unix systems");
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();

    let command = args.command.unwrap_or(Command::Start {
        daemon: false,
        config: None,
    });

    match command {
        Command::Start { daemon, config } => {
            if let Some(pid) = is_daemon_running() {
                eprintln!("Daemon is already running (PID {pid})");
                eprintln!("Use 'tabtimed stop' to stop it first.");
                process::exit(1);
            }

            // Resolve before daemonizing changes the working directory
            let config_path = match config {
                Some(path) => Some(
                    fs::canonicalize(&path)
                        .with_context(|| format!("Config file not found: {}", path.display()))?,
                ),
                None => None,
            };

            // Fail in the foreground on a bad config
            let daemon_config =
                DaemonConfig::load(config_path.as_deref()).context("Failed to load config")?;

            if daemon {
                daemonize()?;
            }

            write_pid()?;

            let result = run_daemon(daemon_config, config_path);

            remove_pid_file();

            result
        }
        Command::Stop => {
            if let Some(pid) = is_daemon_running() {
                println!("Stopping daemon (PID {pid})...");
                stop_daemon(pid)?;

                for _ in 0..50 {
                    if !is_process_running(pid) {
                        println!("Daemon stopped.");
                        return Ok(());
                    }
                    std::thread::sleep(Duration::from_millis(100));
                }

                eprintln!("Daemon did not stop within 5 seconds.");
                process::exit(1);
            } else {
                println!("Daemon is not running.");
                Ok(())
            }
        }
        Command::Status => {
            if let Some(pid) = is_daemon_running() {
                println!("Daemon is running (PID {pid})");

                let socket_path = std::env::var_os(config::SOCKET_ENV)
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from(config::DEFAULT_SOCKET_PATH));
                if socket_path.exists() {
                    println!("Socket: {}", socket_path.display());
                }
                println!("State dir: {}", config::state_dir().display());

                Ok(())
            } else {
                println!("Daemon is not running.");
                process::exit(1);
            }
        }
    }
}

fn daemonize() -> Result<()> {
    use daemonize::Daemonize;

    let log_path = log_file_path();

    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent).context("Failed to create log directory")?;
    }

    let stdout = File::create(&log_path).context("Failed to create log file for stdout")?;
    let stderr = stdout
        .try_clone()
        .context("Failed to create log file for stderr")?;

    let daemonize = Daemonize::new()
        .working_directory("/")
        .stdout(stdout)
        .stderr(stderr);

    daemonize.start().context("Failed to daemonize")?;

    Ok(())
}

#[tokio::main]
async fn run_daemon(config: DaemonConfig, config_path: Option<PathBuf>) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("tabtimed=info".parse()?)
                .add_directive("tabtime_core=info".parse()?),
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        "tabtime daemon starting"
    );

    let cancel_token = CancellationToken::new();

    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown_signal().await {
            error!(error = %e, "Error waiting for shutdown signal");
        }
        info!("Shutdown signal received");
        shutdown_token.cancel();
    });

    // ------------------------------------------------------------------------
    // State
    // ------------------------------------------------------------------------

    let state_file = StateFile::new(&config.state_path);
    let snapshot = state_file
        .load_or_recover()
        .context("Failed to read state file")?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let now = clock.now();

    // Options saved by the running daemon win over the config file
    let options = snapshot
        .as_ref()
        .and_then(|s| s.ext_options.clone())
        .or_else(|| config.tracking.clone())
        .unwrap_or_default();

    let tracker = match snapshot {
        Some(snapshot) => {
            info!(path = %state_file.path().display(), "Restoring tracking history");
            SessionTracker::from_snapshot(snapshot, Local, now)
        }
        None => SessionTracker::new(Local, now),
    };

    // ------------------------------------------------------------------------
    // Tasks
    // ------------------------------------------------------------------------

    let (persister, persist_task) = spawn_persister(state_file);
    let tabs = TabTable::new();

    let tracker = spawn_tracker(
        tracker,
        options,
        TrackerRuntime {
            tabs: Arc::new(tabs.clone()),
            clock: clock.clone(),
            persister,
            sleep_gap_threshold_ms: config.sleep_gap_threshold_ms,
        },
    );
    info!("Session tracker started");

    let mut scheduler = Scheduler::new(
        tracker.clone(),
        clock,
        Duration::from_secs(config.system_check_interval_secs),
    );
    scheduler.start();

    spawn_reload_task(tracker.clone(), config_path, cancel_token.clone());

    let server = DaemonServer::new(
        &config.socket_path,
        tracker.clone(),
        tabs,
        cancel_token.clone(),
    );

    info!(socket = %config.socket_path.display(), "Starting server");

    let result = server.run().await;
    if let Err(e) = &result {
        error!(error = %e, "Server error");
    }

    // ------------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------------

    scheduler.stop();

    if let Err(e) = tracker.shutdown().await {
        warn!(error = %e, "Tracker was already stopped");
    }
    drop(tracker);
    drop(server);

    if tokio::time::timeout(Duration::from_secs(5), persist_task)
        .await
        .is_err()
    {
        warn!("Persister did not finish within 5 seconds");
    }

    result?;
    info!("tabtime daemon stopped");
    Ok(())
}

/// Re-applies the config file's `[tracking]` section on SIGHUP.
fn spawn_reload_task(
    tracker: TrackerHandle,
    config_path: Option<PathBuf>,
    cancel_token: CancellationToken,
) {
    #[cfg(unix)]
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sighup = match signal(SignalKind::hangup()) {
            Ok(sighup) => sighup,
            Err(e) => {
                warn!(error = %e, "Failed to install SIGHUP handler, reload disabled");
                return;
            }
        };

        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => break,
                received = sighup.recv() => {
                    if received.is_none() {
                        break;
                    }
                    info!("Received SIGHUP, reloading config");
                    reload_tracking_options(&tracker, config_path.as_deref()).await;
                }
            }
        }
    });

    #[cfg(not(unix))]
    {
        let _ = (tracker, config_path, cancel_token);
    }
}

async fn reload_tracking_options(tracker: &TrackerHandle, config_path: Option<&Path>) {
    let config = match DaemonConfig::load(config_path) {
        Ok(config) => config,
        Err(e) => {
            warn!(error = %e, "Config reload failed, keeping current options");
            return;
        }
    };

    let Some(options) = config.tracking else {
        info!("Config has no [tracking] section, nothing to reload");
        return;
    };

    match tracker.set_options(options).await {
        Ok(()) => info!("Tracking options reloaded"),
        Err(e) => warn!(error = %e, "Failed to apply reloaded options"),
    }
}

async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
    }

    Ok(())
}
