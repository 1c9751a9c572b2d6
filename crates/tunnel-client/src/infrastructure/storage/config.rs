//! TOML-based configuration for the client application.
//!
//! Reads and writes [`ClientConfig`] at `client.toml` in the platform config
//! directory (see [`tunnel_core::settings`]), unless `--config` points
//! elsewhere.
//!
//! ```toml
//! [client]
//! log_level = "info"
//!
//! [network]
//! server_ip = "127.0.0.1"
//! server_port = 8000
//! retry_interval_secs = 5.0
//!
//! [serial]
//! port = "COM1"
//! baud_rate = 9600
//!
//! [keys]
//! rsa_key_size = 2048
//!
//! [session]
//! max_pending_bytes = 1048576
//! keep_alive_secs = 5.0
//! ```
//!
//! Every field has a default, so a missing section or file is fine.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tunnel_core::settings::{self, default_log_level, ConfigError, KeySettings, SerialSettings};

use crate::application::session::{SessionLimits, SessionTimings, DEFAULT_MAX_PENDING_BYTES};

/// File name inside the config directory.
pub const CONFIG_FILE_NAME: &str = "client.toml";

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level client configuration stored on disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ClientConfig {
    #[serde(default)]
    pub client: GeneralConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default = "default_client_serial")]
    pub serial: SerialSettings,
    #[serde(default)]
    pub keys: KeySettings,
    #[serde(default)]
    pub session: SessionConfig,
}

/// General behaviour.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GeneralConfig {
    /// `tracing` level or filter directive, e.g. `"info"` or `"tunnel_client=debug"`.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Where the server is and how often to retry it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkConfig {
    #[serde(default = "default_server_ip")]
    pub server_ip: String,
    #[serde(default = "default_server_port")]
    pub server_port: u16,
    /// Seconds between connection attempts while disconnected.
    #[serde(default = "default_retry_interval_secs")]
    pub retry_interval_secs: f64,
}

/// Session-loop tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionConfig {
    /// Serial reads pause once this many bytes await delivery.
    #[serde(default = "default_max_pending_bytes")]
    pub max_pending_bytes: usize,
    /// Idle seconds before a keep-alive is sent.
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: f64,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_client_serial() -> SerialSettings {
    SerialSettings::for_port("COM1")
}
fn default_server_ip() -> String {
    "127.0.0.1".to_string()
}
fn default_server_port() -> u16 {
    8000
}
fn default_retry_interval_secs() -> f64 {
    5.0
}
fn default_max_pending_bytes() -> usize {
    DEFAULT_MAX_PENDING_BYTES
}
fn default_keep_alive_secs() -> f64 {
    5.0
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            server_ip: default_server_ip(),
            server_port: default_server_port(),
            retry_interval_secs: default_retry_interval_secs(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_pending_bytes: default_max_pending_bytes(),
            keep_alive_secs: default_keep_alive_secs(),
        }
    }
}

/// Longest interval accepted from the config file (one day).
const MAX_INTERVAL: Duration = Duration::from_secs(86_400);

/// Converts user-supplied seconds to a `Duration`, falling back for values
/// that are negative, zero, or not finite, and capping at [`MAX_INTERVAL`].
fn seconds_or(secs: f64, fallback: f64) -> Duration {
    Duration::try_from_secs_f64(secs)
        .ok()
        .filter(|d| !d.is_zero())
        .map(|d| d.min(MAX_INTERVAL))
        .unwrap_or_else(|| Duration::from_secs_f64(fallback))
}

impl ClientConfig {
    pub fn retry_interval(&self) -> Duration {
        seconds_or(self.network.retry_interval_secs, default_retry_interval_secs())
    }

    /// Session-loop intervals derived from this config.
    pub fn session_timings(&self) -> SessionTimings {
        SessionTimings {
            keep_alive: seconds_or(self.session.keep_alive_secs, default_keep_alive_secs()),
            ..SessionTimings::with_retry_interval(self.retry_interval())
        }
    }

    /// Session-loop limits derived from this config.
    pub fn session_limits(&self) -> SessionLimits {
        SessionLimits {
            read_chunk: self.serial.buffer_size.max(1),
            max_pending_bytes: self.session.max_pending_bytes,
        }
    }
}

// ── Config repository ─────────────────────────────────────────────────────────

/// Resolves the default path of the client config file.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] if the base directory cannot be
/// determined.
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    Ok(settings::config_dir()?.join(CONFIG_FILE_NAME))
}

/// Loads [`ClientConfig`] from `path`, returning defaults if the file does
/// not yet exist.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// and [`ConfigError::Parse`] if the TOML is malformed.
pub fn load_config(path: &Path) -> Result<ClientConfig, ConfigError> {
    settings::load_toml_or_default(path)
}

/// Persists `config` to `path`, creating the directory if needed.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system failures or
/// [`ConfigError::Serialize`] if serialization fails.
pub fn save_config(path: &Path, config: &ClientConfig) -> Result<(), ConfigError> {
    settings::save_toml(path, config)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
