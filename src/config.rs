//! Configuration loading and validation.
//!
//! One TOML file owned by the operator. Every field has a default so a
//! bridge can boot from an empty file; the session directory falls back to
//! `~/.stonebridge/sessions`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

/// Top-level bridge configuration.
#[derive(Debug, Deserialize, Default)]
pub struct Config {
    /// Session record storage settings.
    #[serde(default)]
    pub sessions: SessionsConfig,

    /// Inbound delivery tracking limits.
    #[serde(default)]
    pub delivery: DeliveryConfig,

    /// Credential refresh and webhook renewal timing.
    #[serde(default)]
    pub refresh: RefreshConfig,

    /// HTTP client timeouts for platform transports.
    #[serde(default)]
    pub http: HttpConfig,
}

/// Where session records are persisted.
#[derive(Debug, Default, Deserialize)]
pub struct SessionsConfig {
    /// Directory holding one JSON record per session key.
    /// Empty means `~/.stonebridge/sessions`.
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

/// Bounds for the per-client inflight event map.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct DeliveryConfig {
    /// Maximum dispatched-but-unacknowledged events retained per client.
    #[serde(default = "default_inflight_capacity")]
    pub inflight_capacity: usize,

    /// Entries older than this many seconds are dropped on trim.
    #[serde(default = "default_inflight_max_age_secs")]
    pub inflight_max_age_secs: u64,

    /// Fixed interval between poll cycles for poll-delivery clients.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            inflight_capacity: default_inflight_capacity(),
            inflight_max_age_secs: default_inflight_max_age_secs(),
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

impl DeliveryConfig {
    /// Maximum inflight entry age as a [`Duration`].
    pub fn inflight_max_age(&self) -> Duration {
        Duration::from_secs(self.inflight_max_age_secs)
    }
}

/// Timing for proactive credential refresh and subscription renewal.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RefreshConfig {
    /// Refresh a token when less than this many seconds remain before expiry.
    #[serde(default = "default_refresh_margin_secs")]
    pub margin_secs: u64,

    /// Renew a webhook subscription this many seconds before it expires.
    #[serde(default = "default_renewal_window_secs")]
    pub renewal_window_secs: u64,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            margin_secs: default_refresh_margin_secs(),
            renewal_window_secs: default_renewal_window_secs(),
        }
    }
}

impl RefreshConfig {
    /// Refresh margin as a [`Duration`].
    pub fn margin(&self) -> Duration {
        Duration::from_secs(self.margin_secs)
    }

    /// Renewal window as a [`Duration`].
    pub fn renewal_window(&self) -> Duration {
        Duration::from_secs(self.renewal_window_secs)
    }
}

/// HTTP transport timeouts shared by the platform clients.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct HttpConfig {
    /// TCP connect timeout in seconds.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Per-request timeout in seconds for ordinary API calls.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Server-side hold time in seconds for long-poll requests.
    #[serde(default = "default_long_poll_secs")]
    pub long_poll_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            long_poll_secs: default_long_poll_secs(),
        }
    }
}

// Default value functions for serde

fn default_inflight_capacity() -> usize {
    1000
}
fn default_inflight_max_age_secs() -> u64 {
    3600
}
fn default_poll_interval_secs() -> u64 {
    1
}
fn default_refresh_margin_secs() -> u64 {
    45
}
fn default_renewal_window_secs() -> u64 {
    300
}
fn default_connect_timeout_secs() -> u64 {
    5
}
fn default_request_timeout_secs() -> u64 {
    30
}
fn default_long_poll_secs() -> u64 {
    25
}

/// Load the bridge config from a TOML file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed.
pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read config at {}: {e}", path.display()))?;
    let config: Config = toml::from_str(&contents)
        .map_err(|e| anyhow::anyhow!("failed to parse config at {}: {e}", path.display()))?;
    Ok(config)
}

/// Resolve the default base directory (`~/.stonebridge/`).
///
/// # Errors
///
/// Returns an error if the home directory cannot be determined.
pub fn base_dir() -> anyhow::Result<PathBuf> {
    let home = directories::BaseDirs::new()
        .ok_or_else(|| anyhow::anyhow!("cannot determine home directory"))?;
    Ok(home.home_dir().join(".stonebridge"))
}

/// Resolve the effective session directory for a config.
///
/// # Errors
///
/// Returns an error if no directory is configured and the home directory
/// cannot be determined.
pub fn session_dir(config: &Config) -> anyhow::Result<PathBuf> {
    match &config.sessions.dir {
        Some(dir) => Ok(dir.clone()),
        None => Ok(base_dir()?.join("sessions")),
    }
}
