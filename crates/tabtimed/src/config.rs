//! Daemon configuration.
//!
//! Loaded from an optional TOML file, then overridden by environment
//! variables:
//! - `TABTIME_SOCKET`: socket path
//! - `TABTIME_STATE`: state file path
//!
//! A missing file at the default location is not an error; every field has
//! a default.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use tabtime_core::{ExtensionOptions, DEFAULT_SLEEP_GAP_THRESHOLD_MS};

/// Default Unix socket path.
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/tabtime.sock";

/// Default system-check period.
pub const DEFAULT_SYSTEM_CHECK_INTERVAL_SECS: u64 = 10;

pub const SOCKET_ENV: &str = "TABTIME_SOCKET";
pub const STATE_ENV: &str = "TABTIME_STATE";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonConfig {
    pub socket_path: PathBuf,
    pub state_path: PathBuf,
    pub system_check_interval_secs: u64,
    pub sleep_gap_threshold_ms: u64,
    /// Seeds the tracking options when the state file carries none.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tracking: Option<ExtensionOptions>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            state_path: default_state_path(),
            system_check_interval_secs: DEFAULT_SYSTEM_CHECK_INTERVAL_SECS,
            sleep_gap_threshold_ms: DEFAULT_SLEEP_GAP_THRESHOLD_MS,
            tracking: None,
        }
    }
}

/// `$XDG_STATE_HOME/tabtime`, falling back to `/tmp/tabtime`.
pub fn state_dir() -> PathBuf {
    dirs::state_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("tabtime")
}

pub fn default_state_path() -> PathBuf {
    state_dir().join("state.json")
}

/// `$XDG_CONFIG_HOME/tabtime/config.toml`, if a config dir exists.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("tabtime").join("config.toml"))
}

impl DaemonConfig {
    /// Loads the config file and applies environment overrides.
    ///
    /// An explicit `path` must exist. Without one, the default location is
    /// used if present.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match default_config_path().filter(|p| p.exists()) {
                Some(path) => Self::from_file(&path)?,
                None => {
                    debug!("No config file, using defaults");
                    Self::default()
                }
            },
        };

        config.apply_overrides(
            std::env::var_os(SOCKET_ENV).map(PathBuf::from),
            std::env::var_os(STATE_ENV).map(PathBuf::from),
        );
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        info!(path = %path.display(), "Loading configuration from file");

        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn apply_overrides(&mut self, socket: Option<PathBuf>, state: Option<PathBuf>) {
        if let Some(socket) = socket {
            debug!(path = %socket.display(), "Socket path overridden");
            self.socket_path = socket;
        }
        if let Some(state) = state {
            debug!(path = %state.display(), "State path overridden");
            self.state_path = state;
        }
    }

    /// The tick must be strictly shorter than the sleep-gap threshold,
    /// otherwise every tick would look like a sleep.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.system_check_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "system_check_interval_secs must be positive".to_string(),
            ));
        }

        let tick_ms = self.system_check_interval_secs.saturating_mul(1000);
        if tick_ms >= self.sleep_gap_threshold_ms {
            return Err(ConfigError::Invalid(format!(
                "system_check_interval_secs ({}s) must be below sleep_gap_threshold_ms ({}ms)",
                self.system_check_interval_secs, self.sleep_gap_threshold_ms
            )));
        }

        Ok(())
    }
}
