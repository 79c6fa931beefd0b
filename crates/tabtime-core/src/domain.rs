//! URL classification and canonical domain extraction.
//!
//! Two questions are answered here for every URL the browser reports:
//! - should time on this URL be tracked at all (`should_track`)?
//! - which domain does the time belong to (`main_domain`)?

use std::borrow::Cow;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;
use url::{Host, Url};

use crate::ExtensionOptions;

// ============================================================================
// Sentinels and Policy Constants
// ============================================================================

/// Tracked-domain value meaning "no trackable tab is currently focused".
///
/// Sessions for this domain are never persisted.
pub const IDLE_DOMAIN: &str = "idle";

/// Domain returned when a URL cannot be parsed.
pub const UNKNOWN_DOMAIN: &str = "unknown";

/// URL prefixes that are never tracked: browser-internal pages and the
/// extension store.
pub const FORBIDDEN_PREFIXES: &[&str] = &[
    "chrome-extension://",
    "chrome-search://",
    "chrome://",
    "devtools://",
    "edge://",
    "https://chrome.google.com/webstore",
    "moz-extension://",
    "about:",
];

const LOCALHOST_PREFIX: &str = "http://localhost";

// ============================================================================
// Domain Identifier
// ============================================================================

/// Canonical domain a session is attributed to (e.g., "docs.rs").
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Domain(String);

impl Domain {
    /// Creates a domain from a hostname string.
    ///
    /// Note: This does not validate the hostname. Use `main_domain` to
    /// derive a domain from a URL.
    pub fn new(host: impl Into<String>) -> Self {
        Self(host.into())
    }

    /// The idle sentinel.
    pub fn idle() -> Self {
        Self(IDLE_DOMAIN.to_string())
    }

    /// The sentinel for unparseable URLs.
    pub fn unknown() -> Self {
        Self(UNKNOWN_DOMAIN.to_string())
    }

    /// Returns true for the idle sentinel (or an empty domain).
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.0.is_empty() || self.0 == IDLE_DOMAIN
    }

    /// Returns true for the unparseable-URL sentinel.
    #[must_use]
    pub fn is_unknown(&self) -> bool {
        self.0 == UNKNOWN_DOMAIN
    }

    /// Returns the underlying string reference.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for Domain {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for Domain {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for Domain {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// ============================================================================
// Classification
// ============================================================================

/// Whether subdomains are kept when extracting a domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Subdomains {
    /// `a.example.com` and `b.example.com` stay distinct (session identity).
    #[default]
    Keep,

    /// Reduce to the last two labels (favicon lookup key). Not PSL-aware.
    Remove,
}

/// Returns true if the URL points at a browser-internal page or the
/// extension store.
pub fn is_forbidden_url(url: &str) -> bool {
    FORBIDDEN_PREFIXES
        .iter()
        .any(|prefix| url.starts_with(prefix))
}

/// Decides whether time spent on `url` should be tracked.
///
/// Checks run in order: empty, forbidden prefix, localhost toggle,
/// exclude list, allow list. A URL on both lists is excluded.
pub fn should_track(url: &str, options: &ExtensionOptions) -> bool {
    if url.is_empty() {
        return false;
    }

    if is_forbidden_url(url) {
        return false;
    }

    if url.starts_with(LOCALHOST_PREFIX) && !options.track_localhost {
        return false;
    }

    if options
        .exclude_list
        .iter()
        .any(|prefix| url.starts_with(prefix.as_str()))
    {
        return false;
    }

    if !options.allow_list.is_empty()
        && !options
            .allow_list
            .iter()
            .any(|prefix| url.starts_with(prefix.as_str()))
    {
        return false;
    }

    true
}

/// Extracts the hostname of `url` as a `Domain`.
///
/// URLs without a scheme are parsed as `http://`. Unparseable input yields
/// `Domain::unknown()` rather than an error, so it can still be tracked or
/// excluded deterministically. IP-literal hosts are never subdomain-stripped.
pub fn main_domain(url: &str, subdomains: Subdomains) -> Domain {
    let trimmed = url.trim();
    let candidate: Cow<'_, str> = if trimmed.contains("://") {
        Cow::Borrowed(trimmed)
    } else {
        Cow::Owned(format!("http://{trimmed}"))
    };

    let parsed = match Url::parse(&candidate) {
        Ok(parsed) => parsed,
        Err(e) => {
            debug!(url = %trimmed, error = %e, "Unparseable URL, using unknown domain");
            return Domain::unknown();
        }
    };

    match parsed.host() {
        Some(Host::Domain(host)) if !host.is_empty() => match subdomains {
            Subdomains::Keep => Domain::new(host),
            Subdomains::Remove => Domain::new(strip_subdomains(host)),
        },
        Some(Host::Ipv4(_)) | Some(Host::Ipv6(_)) => parsed
            .host_str()
            .map(Domain::new)
            .unwrap_or_else(Domain::unknown),
        _ => Domain::unknown(),
    }
}

/// Keeps only the last two dot-separated labels of a hostname.
fn strip_subdomains(host: &str) -> String {
    let host = host.trim_end_matches('.');
    let mut labels = host.rsplitn(3, '.');
    match (labels.next(), labels.next(), labels.next()) {
        (Some(tld), Some(name), Some(_)) => format!("{name}.{tld}"),
        _ => host.to_string(),
    }
}
