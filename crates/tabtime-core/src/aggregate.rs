//! Merging completed sessions into daily statistics.
//!
//! # Panic-Free Guarantees
//!
//! Totals use saturating addition; an overflowing counter stops growing
//! instead of wrapping or panicking.

use tracing::trace;

use crate::{
    main_domain, DailyStats, DayKey, Domain, SiteTimeData, Subdomains, TimeSession,
    TimeTrackerStore,
};

/// Favicon service used when no favicon was observed for a site.
pub const FAVICON_SERVICE_URL: &str = "https://www.google.com/s2/favicons";

const FAVICON_SIZE: u32 = 64;

/// Builds the favicon URL for `domain` from its subdomain-stripped form.
pub fn derived_favicon_url(domain: &Domain) -> String {
    let key = main_domain(domain.as_str(), Subdomains::Remove);
    format!("{FAVICON_SERVICE_URL}?domain={key}&sz={FAVICON_SIZE}")
}

impl DailyStats {
    /// Appends `session` to `domain`'s record for this day.
    ///
    /// Returns false (and records nothing) for the idle sentinel. Recording
    /// the same session twice counts it twice.
    pub fn record(
        &mut self,
        domain: &Domain,
        session: TimeSession,
        observed_favicon: Option<&str>,
    ) -> bool {
        if domain.is_idle() {
            return false;
        }

        let site = self
            .sites
            .entry(domain.clone())
            .or_insert_with(|| SiteTimeData::new(domain.clone(), session.end_time));

        if site.favicon.is_none() {
            site.favicon = Some(match observed_favicon.filter(|f| !f.is_empty()) {
                Some(observed) => observed.to_string(),
                None => derived_favicon_url(domain),
            });
        }

        site.total_time = site.total_time.saturating_add(session.duration);
        site.last_visited = site.last_visited.max(session.end_time);
        self.total_time = self.total_time.saturating_add(session.duration);

        trace!(
            day = %self.date,
            domain = %domain,
            duration_ms = session.duration,
            site_total_ms = site.total_time,
            "Session recorded"
        );

        site.sessions.push(session);
        true
    }
}

impl TimeTrackerStore {
    /// Records `session` under `day`, creating the day lazily.
    pub fn record(
        &mut self,
        day: &DayKey,
        domain: &Domain,
        session: TimeSession,
        observed_favicon: Option<&str>,
    ) -> bool {
        if domain.is_idle() {
            return false;
        }

        self.daily_stats
            .entry(day.clone())
            .or_insert_with(|| DailyStats::new(day.clone()))
            .record(domain, session, observed_favicon)
    }
}
