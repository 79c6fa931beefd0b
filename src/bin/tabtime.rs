//! tabtime - command-line client for the tabtime daemon
//!
//! Queries tracking status and per-day statistics, follows live changes,
//! and bridges browser events from stdin to the daemon.
//!
//! # Usage
//!
//! ```text
//! tabtime status              # What is being tracked right now
//! tabtime today               # Per-site totals for today
//! tabtime day 2024-06-01      # Per-site totals for one day
//! tabtime days                # One line per recorded day
//! tabtime watch               # Print tracking changes as they happen
//! tabtime bridge              # Forward browser events (JSON lines) from stdin
//! tabtime options --exclude https://mail.example.com
//! ```

use std::io;

use anyhow::{Context, Result};
use chrono::Local;
use clap::{Args as ClapArgs, Parser, Subcommand};
use tokio::io::BufReader;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tabtime_client::report;
use tabtime_client::{ClientConfig, ClientError, DaemonClient};
use tabtime_core::{DayKey, ExtensionOptions};

// ============================================================================
// CLI Arguments
// ============================================================================

/// tabtime - per-domain browser time tracking
#[derive(Parser, Debug)]
#[command(name = "tabtime")]
#[command(about = "Query and feed the tabtime daemon")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show what is being tracked right now
    Status,
    /// Show per-site totals for today
    Today,
    /// Show per-site totals for one day
    Day {
        /// Day in YYYY-MM-DD form
        #[arg(value_parser = parse_day)]
        date: DayKey,
    },
    /// List every recorded day
    Days,
    /// Print tracking changes as they happen
    Watch,
    /// Forward browser events from stdin to the daemon
    Bridge,
    /// Show or change the tracking options
    Options(OptionsArgs),
}

#[derive(ClapArgs, Debug, Default)]
struct OptionsArgs {
    /// Track http://localhost pages
    #[arg(long)]
    track_localhost: Option<bool>,

    /// Add a URL prefix to the allow list
    #[arg(long, value_name = "PREFIX")]
    allow: Vec<String>,

    /// Add a URL prefix to the exclude list
    #[arg(long, value_name = "PREFIX")]
    exclude: Vec<String>,

    /// Empty both lists before adding
    #[arg(long)]
    clear_lists: bool,
}

impl OptionsArgs {
    fn is_empty(&self) -> bool {
        self.track_localhost.is_none()
            && self.allow.is_empty()
            && self.exclude.is_empty()
            && !self.clear_lists
    }

    fn apply(self, mut options: ExtensionOptions) -> ExtensionOptions {
        if self.clear_lists {
            options.allow_list.clear();
            options.exclude_list.clear();
        }
        if let Some(track) = self.track_localhost {
            options.track_localhost = track;
        }
        for prefix in self.allow {
            if !options.allow_list.contains(&prefix) {
                options.allow_list.push(prefix);
            }
        }
        for prefix in self.exclude {
            if !options.exclude_list.contains(&prefix) {
                options.exclude_list.push(prefix);
            }
        }
        options
    }
}

fn parse_day(value: &str) -> std::result::Result<DayKey, String> {
    DayKey::parse(value).map_err(|e| e.to_string())
}

// ============================================================================
// Commands
// ============================================================================

async fn connect(config: &ClientConfig, client_id: &str) -> Result<DaemonClient> {
    DaemonClient::connect(config, Some(client_id.to_string()))
        .await
        .context("Could not reach the tabtime daemon")
}

fn print_options(options: &ExtensionOptions) {
    println!(
        "track localhost: {}",
        if options.track_localhost { "yes" } else { "no" }
    );
    print_list("allow", &options.allow_list);
    print_list("exclude", &options.exclude_list);
}

fn print_list(name: &str, entries: &[String]) {
    if entries.is_empty() {
        println!("{name}: (none)");
        return;
    }
    println!("{name}:");
    for entry in entries {
        println!("  {entry}");
    }
}

async fn run_options(config: &ClientConfig, args: OptionsArgs) -> Result<()> {
    let mut client = connect(config, "tabtime-cli").await?;
    let current = client.options().await?;

    let shown = if args.is_empty() {
        current
    } else {
        client.set_options(args.apply(current)).await?
    };
    print_options(&shown);

    client.disconnect().await?;
    Ok(())
}

/// Prints broadcasts until interrupted, reconnecting whenever the daemon
/// goes away.
async fn run_watch(config: &ClientConfig, cancel: &CancellationToken) -> Result<()> {
    loop {
        let mut client =
            match DaemonClient::connect_with_retry(config, Some("tabtime-watch".to_string()), cancel)
                .await
            {
                Ok(client) => client,
                Err(_) if cancel.is_cancelled() => return Ok(()),
                Err(e) => return Err(e.into()),
            };

        let (status, today) = client.subscribe().await?;
        println!("[{today}] {}", report::render_status(&status, &Local));

        loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = client.disconnect().await;
                    return Ok(());
                }
                message = client.recv() => message,
            };

            match message {
                Ok(Some(message)) => {
                    if let Some(line) = report::render_change(&message, &Local) {
                        println!("{line}");
                    }
                }
                Ok(None) | Err(ClientError::Io(_)) => {
                    eprintln!("Daemon disconnected, reconnecting...");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "Ignoring unreadable message");
                }
            }
        }
    }
}

async fn run_bridge(config: &ClientConfig, cancel: &CancellationToken) -> Result<()> {
    let client = connect(config, "tabtime-bridge").await?;
    info!(client_id = %client.client_id(), "Bridge connected");

    let stdin = BufReader::new(tokio::io::stdin());
    let stats = client
        .run_bridge(stdin, config.keepalive_interval, cancel)
        .await?;

    info!(
        forwarded = stats.forwarded,
        skipped = stats.skipped,
        daemon_errors = stats.daemon_errors,
        "Bridge finished"
    );
    Ok(())
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // stdout carries command output; logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("tabtime_client=warn".parse()?))
        .with_writer(io::stderr)
        .init();

    let config = ClientConfig::from_env();

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    match args.command.unwrap_or(Command::Status) {
        Command::Status => {
            let mut client = connect(&config, "tabtime-cli").await?;
            let (status, today) = client.status().await?;
            println!("[{today}] {}", report::render_status(&status, &Local));
            client.disconnect().await?;
        }
        Command::Today => {
            let mut client = connect(&config, "tabtime-cli").await?;
            let (date, stats) = client.daily_stats(None).await?;
            print!("{}", report::render_day(&date, stats.as_ref(), &Local));
            client.disconnect().await?;
        }
        Command::Day { date } => {
            let mut client = connect(&config, "tabtime-cli").await?;
            let (date, stats) = client.daily_stats(Some(date)).await?;
            print!("{}", report::render_day(&date, stats.as_ref(), &Local));
            client.disconnect().await?;
        }
        Command::Days => {
            let mut client = connect(&config, "tabtime-cli").await?;
            let days = client.list_days().await?;
            print!("{}", report::render_days(&days));
            client.disconnect().await?;
        }
        Command::Watch => run_watch(&config, &cancel).await?,
        Command::Bridge => run_bridge(&config, &cancel).await?,
        Command::Options(options) => run_options(&config, options).await?,
    }

    Ok(())
}
