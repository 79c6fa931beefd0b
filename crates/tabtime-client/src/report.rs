//! Plain-text rendering of tracking data for the CLI.
//!
//! Durations use `format_duration`, clock times use `format_time` in the
//! caller's time zone, and each site is shown with its share of the day.

use std::fmt::Write as _;

use chrono::TimeZone;

use tabtime_core::{
    format_duration, format_time, CompletedSession, DailyStats, DayKey, TrackingStatus,
};
use tabtime_protocol::{DaemonMessage, DaySummary};

/// Share of `total` taken by `part`, in percent. Zero when `total` is zero.
pub fn percentage(part: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    part as f64 * 100.0 / total as f64
}

/// One-line tracking status.
///
/// ```text
/// Tracking docs.rs since 10:02:13 (4m 10s)
/// ```
pub fn render_status<Tz: TimeZone>(status: &TrackingStatus, tz: &Tz) -> String {
    match status {
        TrackingStatus::Idle => "Idle".to_string(),
        TrackingStatus::Tracking {
            domain,
            started_at,
            elapsed_ms,
        } => format!(
            "Tracking {domain} since {} ({})",
            format_time(*started_at, tz),
            format_duration(*elapsed_ms)
        ),
    }
}

/// Per-site table for one day, longest first.
///
/// ```text
/// 2024-06-01  total 1h 30m 0s  (2 sites)
///   docs.rs                      1h 0m 0s   66.7%  last 11:00:00
///   github.com                   30m 0s     33.3%  last 11:30:00
/// ```
pub fn render_day<Tz: TimeZone>(date: &DayKey, stats: Option<&DailyStats>, tz: &Tz) -> String {
    let Some(stats) = stats.filter(|s| !s.sites.is_empty()) else {
        return format!("{date}  nothing tracked\n");
    };

    let mut out = String::new();
    let _ = writeln!(
        out,
        "{date}  total {}  ({} {})",
        format_duration(stats.total_time),
        stats.sites.len(),
        if stats.sites.len() == 1 { "site" } else { "sites" }
    );

    let width = stats
        .sites
        .keys()
        .map(|d| d.as_str().len())
        .max()
        .unwrap_or(0)
        .max(20);

    for site in stats.sites_by_time() {
        let _ = writeln!(
            out,
            "  {:<width$}  {:>10}  {:>5.1}%  last {}",
            site.domain.as_str(),
            format_duration(site.total_time),
            percentage(site.total_time, stats.total_time),
            format_time(site.last_visited, tz),
        );
    }
    out
}

/// One line per recorded day, oldest first.
pub fn render_days(days: &[DaySummary]) -> String {
    if days.is_empty() {
        return "No days recorded\n".to_string();
    }

    let mut out = String::new();
    for day in days {
        let _ = writeln!(
            out,
            "{}  {:>12}  {} {}",
            day.date,
            format_duration(day.total_time),
            day.site_count,
            if day.site_count == 1 { "site" } else { "sites" }
        );
    }
    out
}

fn render_ended<Tz: TimeZone>(ended: &CompletedSession, tz: &Tz) -> String {
    format!(
        "ended {} {}-{} ({})",
        ended.domain,
        format_time(ended.session.start_time, tz),
        format_time(ended.session.end_time, tz),
        format_duration(ended.session.duration)
    )
}

/// Line printed by `watch` for a broadcast, or `None` for messages it ignores.
pub fn render_change<Tz: TimeZone>(message: &DaemonMessage, tz: &Tz) -> Option<String> {
    match message {
        DaemonMessage::TrackingChanged { status, ended } => Some(match ended {
            Some(ended) => format!(
                "{}; {}",
                render_ended(ended, tz),
                render_status(status, tz)
            ),
            None => render_status(status, tz),
        }),
        DaemonMessage::DayRolledOver { today } => Some(format!("New day {today}")),
        DaemonMessage::Options { options } => Some(format!(
            "Options changed: localhost {}, {} allowed, {} excluded",
            if options.track_localhost { "on" } else { "off" },
            options.allow_list.len(),
            options.exclude_list.len()
        )),
        DaemonMessage::Status { status, .. } => Some(render_status(status, tz)),
        _ => None,
    }
}
