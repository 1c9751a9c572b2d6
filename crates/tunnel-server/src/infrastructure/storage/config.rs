//! TOML-based configuration for the server application.
//!
//! Reads and writes [`ServerConfig`] at `server.toml` in the platform config
//! directory, unless `--config` points elsewhere:
//!
//! ```toml
//! [server]
//! log_level = "info"
//!
//! [network]
//! listen_ip = "0.0.0.0"
//! listen_port = 8000
//! max_clients = 5
//!
//! [serial]
//! port = "COM3"
//! baud_rate = 9600
//!
//! [keys]
//! rsa_key_size = 2048
//! ```
//!
//! The serial section defaults to `COM3` rather than the client's `COM1`, so
//! both ends of a null-modem test rig can run on one machine.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tunnel_core::settings::{self, default_log_level, ConfigError, KeySettings, SerialSettings};

use crate::infrastructure::network::ServerSettings;

/// File name inside the config directory.
pub const CONFIG_FILE_NAME: &str = "server.toml";

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level server configuration stored on disk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    #[serde(default)]
    pub server: GeneralConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default = "default_server_serial")]
    pub serial: SerialSettings,
    #[serde(default)]
    pub keys: KeySettings,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GeneralConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Where to listen and how many clients to admit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkConfig {
    #[serde(default = "default_listen_ip")]
    pub listen_ip: String,
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_server_serial() -> SerialSettings {
    SerialSettings::for_port("COM3")
}
fn default_listen_ip() -> String {
    "0.0.0.0".to_string()
}
fn default_listen_port() -> u16 {
    8000
}
fn default_max_clients() -> usize {
    5
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server: GeneralConfig::default(),
            network: NetworkConfig::default(),
            serial: default_server_serial(),
            keys: KeySettings::default(),
        }
    }
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
            listen_ip: default_listen_ip(),
            listen_port: default_listen_port(),
            max_clients: default_max_clients(),
        }
    }
}

impl ServerConfig {
    /// Listener and session tunables derived from this config.
    pub fn server_settings(&self) -> ServerSettings {
        ServerSettings {
            max_clients: self.network.max_clients,
            ..ServerSettings::default()
        }
    }
}

// ── Config repository ─────────────────────────────────────────────────────────

/// Resolves the default path of the server config file.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] if the base directory cannot be
/// determined.
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    Ok(settings::config_dir()?.join(CONFIG_FILE_NAME))
}

/// Loads [`ServerConfig`] from `path`, returning defaults if the file does
/// not yet exist.
pub fn load_config(path: &Path) -> Result<ServerConfig, ConfigError> {
    settings::load_toml_or_default(path)
}

/// Persists `config` to `path`, creating the directory if needed.
pub fn save_config(path: &Path, config: &ServerConfig) -> Result<(), ConfigError> {
    settings::save_toml(path, config)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_defaults() {
        let cfg = ServerConfig::default();

        assert_eq!(cfg.network.listen_ip, "0.0.0.0");
        assert_eq!(cfg.network.listen_port, 8000);
        assert_eq!(cfg.network.max_clients, 5);
        assert_eq!(cfg.serial.port, "COM3");
        assert_eq!(cfg.server.log_level, "info");
    }

    #[test]
    fn test_missing_sections_use_defaults() {
        // Arrange
        let text = r#"
[network]
max_clients = 2
"#;

        // Act
        let cfg: ServerConfig = toml::from_str(text).unwrap();

        // Assert
        assert_eq!(cfg.network.max_clients, 2);
        assert_eq!(cfg.network.listen_port, 8000);
        assert_eq!(cfg.serial.port, "COM3");
        assert_eq!(cfg.keys.rsa_key_size, 2048);
    }

    #[test]
    fn test_malformed_toml_is_a_parse_error() {
        let dir = std::env::temp_dir().join(format!("tunnel_server_bad_{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(CONFIG_FILE_NAME);
        std::fs::write(&path, "[network\nlisten_port = ").unwrap();

        let result = load_config(&path);

        assert!(matches!(result, Err(ConfigError::Parse(_))));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_server_settings_carry_max_clients() {
        let mut cfg = ServerConfig::default();
        cfg.network.max_clients = 2;

        let settings = cfg.server_settings();

        assert_eq!(settings.max_clients, 2);
        assert_eq!(settings.session_poll, ServerSettings::default().session_poll);
    }

    #[test]
    fn test_save_and_load_round_trip_via_temp_dir() {
        // Arrange
        let dir = std::env::temp_dir().join(format!("tunnel_server_cfg_{}", uuid::Uuid::new_v4()));
        let path = dir.join(CONFIG_FILE_NAME);
        let mut cfg = ServerConfig::default();
        cfg.network.listen_port = 9200;
        cfg.serial.baud_rate = 115_200;

        // Act
        save_config(&path, &cfg).unwrap();
        let loaded = load_config(&path).unwrap();

        // Assert
        assert_eq!(loaded, cfg);
        std::fs::remove_dir_all(&dir).ok();
    }
}
