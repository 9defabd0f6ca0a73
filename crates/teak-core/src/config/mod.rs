//! Configuration module for Teak Core.
//!
//! Three kinds of configuration live here:
//! - [`SdkConfig`]: local settings loaded from a TOML file
//! - [`AppIdentity`] / [`DeviceIdentity`]: identity supplied by the host app
//! - [`RemoteConfiguration`]: the server-side snapshot with per-endpoint policy

mod identity;
mod policy;
mod remote;

pub use identity::{AppIdentity, DeviceIdentity, SDK_VERSION};
pub use policy::{BatchPolicy, EndpointPolicy, PolicyError, RetryPolicy};
pub use remote::{DEFAULT_HEARTBEAT_INTERVAL, RemoteConfiguration};

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Session lifecycle settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct SessionConfig {
    /// How long a paused session may be resumed without being replaced.
    #[serde(default = "default_grace_window_secs")]
    pub grace_window_secs: u64,
    /// Heartbeat interval used until the remote configuration provides one.
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
}

fn default_grace_window_secs() -> u64 {
    120
}

fn default_heartbeat_interval_secs() -> u64 {
    60
}

impl SessionConfig {
    /// Grace window as a [`Duration`].
    pub fn grace_window(&self) -> Duration {
        Duration::from_secs(self.grace_window_secs)
    }

    /// Fallback heartbeat interval as a [`Duration`].
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            grace_window_secs: default_grace_window_secs(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
        }
    }
}

/// Outbound transport settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct TransportConfig {
    /// URL scheme used for every request.
    #[serde(default = "default_scheme")]
    pub scheme: String,
    /// Host serving `/games/{app_id}/settings.json`.
    #[serde(default = "default_settings_host")]
    pub settings_host: String,
    /// Host receiving heartbeats.
    #[serde(default = "default_heartbeat_host")]
    pub heartbeat_host: String,
    /// Header carrying the request signature.
    #[serde(default = "default_signature_header")]
    pub signature_header: String,
    /// Optional HTTP client timeout. `None` keeps the client default.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

fn default_scheme() -> String {
    "https".to_string()
}

fn default_settings_host() -> String {
    "gocarrot.com".to_string()
}

fn default_heartbeat_host() -> String {
    "iroko.gocarrot.com".to_string()
}

fn default_signature_header() -> String {
    "Authorization".to_string()
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            scheme: default_scheme(),
            settings_host: default_settings_host(),
            heartbeat_host: default_heartbeat_host(),
            signature_header: default_signature_header(),
            timeout_secs: None,
        }
    }
}

/// Persistent request cache settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct CacheConfig {
    /// SQLite database file.
    #[serde(default = "default_cache_path")]
    pub path: PathBuf,
}

fn default_cache_path() -> PathBuf {
    PathBuf::from("teak.db")
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { path: default_cache_path() }
    }
}

/// Root configuration for the SDK core.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct SdkConfig {
    /// Session settings.
    #[serde(default)]
    pub session: SessionConfig,
    /// Transport settings.
    #[serde(default)]
    pub transport: TransportConfig,
    /// Cache settings.
    #[serde(default)]
    pub cache: CacheConfig,
}

impl SdkConfig {
    /// Create a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml_str(contents: &str) -> crate::error::Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> crate::error::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }
}
