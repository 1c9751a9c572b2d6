//! Configuration sections shared by both binaries, plus the helpers that
//! locate, load and save TOML config files.
//!
//! Config files live in the platform-appropriate directory:
//! - Windows:  `%APPDATA%\SerialTunnel\`
//! - Linux:    `~/.config/serialtunnel/`
//! - macOS:    `~/Library/Application Support/SerialTunnel/`
//!
//! Key files default to the `keys/` subdirectory of the same place.
//!
//! # Serde default values
//!
//! Fields annotated with `#[serde(default = "some_fn")]` use the return value
//! of `some_fn()` when the field is absent from the TOML file, so a config
//! written by an older version, or no config at all, still yields a usable
//! setup.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The platform config directory could not be determined.
    #[error("could not determine platform config directory")]
    NoPlatformConfigDir,

    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// The config could not be serialized to TOML.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

// ── Shared config sections ────────────────────────────────────────────────────

/// `[serial]` section: which local port to use and how.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SerialSettings {
    /// Device name, e.g. `"COM1"` or `"/dev/ttyUSB0"`.
    #[serde(default = "default_serial_port")]
    pub port: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Upper bound on bytes taken from the port in one read.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
}

impl SerialSettings {
    /// Default settings for the given device name.
    pub fn for_port(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            ..Self::default()
        }
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

/// `[keys]` section: RSA key size and where the PEM files live.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KeySettings {
    #[serde(default = "default_rsa_key_size")]
    pub rsa_key_size: usize,
    /// Overrides the default `keys/` directory next to the config file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_dir: Option<PathBuf>,
}

impl KeySettings {
    /// The directory key files are read from and written to.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NoPlatformConfigDir`] when no `key_dir` is
    /// configured and the platform directory cannot be determined.
    pub fn resolve_dir(&self) -> Result<PathBuf, ConfigError> {
        match &self.key_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(config_dir()?.join("keys")),
        }
    }
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_serial_port() -> String {
    "COM1".to_string()
}
fn default_baud_rate() -> u32 {
    9600
}
fn default_buffer_size() -> usize {
    1024
}
fn default_read_timeout_ms() -> u64 {
    100
}
fn default_write_timeout_ms() -> u64 {
    1000
}
fn default_rsa_key_size() -> usize {
    2048
}

/// Log level used when neither `RUST_LOG`, the command line nor the config
/// file says otherwise.
pub fn default_log_level() -> String {
    "info".to_string()
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            port: default_serial_port(),
            baud_rate: default_baud_rate(),
            buffer_size: default_buffer_size(),
            read_timeout_ms: default_read_timeout_ms(),
            write_timeout_ms: default_write_timeout_ms(),
        }
    }
}

impl Default for KeySettings {
    fn default() -> Self {
        Self {
            rsa_key_size: default_rsa_key_size(),
            key_dir: None,
        }
    }
}

// ── Config repository ─────────────────────────────────────────────────────────

/// Determines the platform-appropriate directory for config and key files.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] when the platform config base
/// directory cannot be determined from the environment.
pub fn config_dir() -> Result<PathBuf, ConfigError> {
    platform_config_dir().ok_or(ConfigError::NoPlatformConfigDir)
}

/// Loads a TOML config from `path`, returning `T::default()` if the file does
/// not exist.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// and [`ConfigError::Parse`] if the TOML is malformed.
pub fn load_toml_or_default<T>(path: &Path) -> Result<T, ConfigError>
where
    T: DeserializeOwned + Default,
{
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(toml::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(source) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Writes `config` to `path` as pretty TOML, creating parent directories.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system failures or
/// [`ConfigError::Serialize`] if serialization fails.
pub fn save_toml<T: Serialize>(path: &Path, config: &T) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
    }

    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Resolves the platform config base directory including the app subdirectory.
fn platform_config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA").map(|p| PathBuf::from(p).join("SerialTunnel"))
    }

    #[cfg(target_os = "linux")]
    {
        // XDG_CONFIG_HOME or ~/.config
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
        Some(base.join("serialtunnel"))
    }

    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME").map(|h| {
            PathBuf::from(h)
                .join("Library")
                .join("Application Support")
                .join("SerialTunnel")
        })
    }

    #[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
    {
        None
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
