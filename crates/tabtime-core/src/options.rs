//! User-configured tracking policy.

use serde::{Deserialize, Serialize};

/// Tracking options, read-only to the tracker.
///
/// Serialized in camelCase to match the persisted store; snake_case aliases
/// are accepted so the same struct can be read from a TOML config section.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExtensionOptions {
    /// Whether `http://localhost*` pages are tracked.
    #[serde(alias = "track_localhost")]
    pub track_localhost: bool,

    /// URL prefixes that are exclusively tracked (empty = everything allowed).
    #[serde(alias = "allow_list")]
    pub allow_list: Vec<String>,

    /// URL prefixes that are never tracked. Wins over `allow_list`.
    #[serde(alias = "exclude_list")]
    pub exclude_list: Vec<String>,
}

impl ExtensionOptions {
    /// Options with localhost tracking switched on.
    #[must_use]
    pub fn with_localhost(mut self, track: bool) -> Self {
        self.track_localhost = track;
        self
    }
}
