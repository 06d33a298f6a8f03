//! Configuration management for the messenger.
//!
//! This module provides TOML-based configuration with support for multiple
//! configuration sources (default, file-based, environment variables) and
//! validation of configuration parameters.

use crate::crypto::AtRestScheme;
use crate::session::{EngineOptions, ProtocolType, MIN_FRAGMENT_SIZE};
use crate::utils::{ConfigError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default configuration file name
pub const DEFAULT_CONFIG_FILE: &str = "messenger.toml";

/// Environment variable prefix for configuration
pub const ENV_PREFIX: &str = "MESSENGER";

/// Development at-rest key. Deployments are expected to override it.
pub const DEFAULT_AT_REST_KEY: &str = "0123456789abcdef0123456789abcdef";

/// Complete configuration for the messenger application
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessengerConfig {
    /// Local identity
    pub identity: IdentityConfig,
    /// Network configuration
    pub network: NetworkConfig,
    /// Session engine configuration
    pub session: SessionConfig,
    /// Storage configuration
    pub storage: StorageConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// How this node presents itself to peers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Human-readable name
    pub display_name: String,
    /// MAC-like routing id; derived from the identity key when unset
    pub routing_id: Option<String>,
    /// Address peers use to reach this node, and the address inbound
    /// envelopes must be destined to
    pub address: String,
}

/// Network and transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Port to listen on, also the port dialled on peers
    pub listen_port: u16,
    /// Interface to bind the listener to
    pub bind_address: String,
    /// Connection timeout in seconds
    pub connection_timeout: u64,
    /// Largest accepted envelope line in bytes
    pub max_envelope_size: usize,
}

/// Session engine and registry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Protocol used for sessions created without a hint
    pub default_protocol: ProtocolType,
    /// Seconds a handshake may stay incomplete before it is abandoned
    pub handshake_timeout: u64,
    /// Largest wire fragment in bytes (0 = never fragment)
    pub max_fragment_size: usize,
    /// Maximum number of concurrent sessions
    pub max_sessions: usize,
    /// Seconds between sweeps for stalled handshakes
    pub reaper_interval: u64,
}

/// Storage and persistence configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Base directory for data storage
    pub data_dir: PathBuf,
    /// Directory for storing keys
    pub keys_dir: PathBuf,
    /// SQLite database holding message history and session records
    pub database_file: PathBuf,
    /// At-rest AES key; its UTF-8 bytes must be 16, 24 or 32 long
    pub at_rest_key: String,
    /// At-rest record layout
    pub at_rest_scheme: AtRestScheme,
    /// Days of history to keep (0 = keep forever)
    pub retention_days: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            display_name: "Anonymous".to_string(),
            routing_id: None,
            address: "127.0.0.1".to_string(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_port: crate::defaults::DEFAULT_PORT,
            bind_address: "0.0.0.0".to_string(),
            connection_timeout: 10,
            max_envelope_size: crate::MAX_MESSAGE_SIZE,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_protocol: ProtocolType::Otr,
            handshake_timeout: crate::defaults::DEFAULT_HANDSHAKE_TIMEOUT,
            max_fragment_size: 0,
            max_sessions: crate::defaults::DEFAULT_MAX_SESSIONS,
            reaper_interval: crate::defaults::DEFAULT_REAPER_INTERVAL,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("otr-messenger");

        Self {
            keys_dir: data_dir.join("keys"),
            database_file: data_dir.join("messages.db"),
            data_dir,
            at_rest_key: DEFAULT_AT_REST_KEY.to_string(),
            at_rest_scheme: AtRestScheme::LegacyZeroIv,
            retention_days: 0,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl SessionConfig {
    /// Engine knobs derived from this section
    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            handshake_timeout_secs: self.handshake_timeout,
            max_fragment_size: self.max_fragment_size,
        }
    }
}

impl MessengerConfig {
    /// Load configuration from a TOML file
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the configuration file
    ///
    /// # Errors
    ///
    /// Returns error if file cannot be read or parsed
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
            path: path.display().to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(ConfigError::from)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with multiple sources (default, file, environment)
    ///
    /// # Arguments
    ///
    /// * `config_file` - Optional path to configuration file
    pub fn load(config_file: Option<&Path>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(path) = config_file {
            if path.exists() {
                let file_config = Self::from_file(path)?;
                config = config.merge(file_config);
            }
        } else {
            let default_locations = [
                PathBuf::from(DEFAULT_CONFIG_FILE),
                dirs::config_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("otr-messenger")
                    .join(DEFAULT_CONFIG_FILE),
            ];

            for location in &default_locations {
                if location.exists() {
                    let file_config = Self::from_file(location)?;
                    config = config.merge(file_config);
                    break;
                }
            }
        }

        config = config.merge_from_env()?;
        config.validate()?;

        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self).map_err(|e| ConfigError::ParseError {
            reason: e.to_string(),
        })?;

        std::fs::write(path, content)?;
        Ok(())
    }

    /// Merge this configuration with another, preferring values from other
    pub fn merge(mut self, other: Self) -> Self {
        self.identity = other.identity;
        self.network = other.network;
        self.session = other.session;
        self.storage = other.storage;
        self.logging = other.logging;
        self
    }

    /// Point every storage path under `data_dir`
    pub fn with_data_dir<P: Into<PathBuf>>(mut self, data_dir: P) -> Self {
        let data_dir = data_dir.into();
        self.storage.keys_dir = data_dir.join("keys");
        self.storage.database_file = data_dir.join("messages.db");
        self.storage.data_dir = data_dir;
        self
    }

    /// Merge configuration from environment variables
    fn merge_from_env(mut self) -> Result<Self> {
        if let Ok(port) = std::env::var("MESSENGER_NETWORK_LISTEN_PORT") {
            self.network.listen_port = port.parse().map_err(|_| ConfigError::InvalidValue {
                field: "MESSENGER_NETWORK_LISTEN_PORT".to_string(),
                value: port,
            })?;
        }

        if let Ok(address) = std::env::var("MESSENGER_IDENTITY_ADDRESS") {
            self.identity.address = address;
        }

        if let Ok(name) = std::env::var("MESSENGER_IDENTITY_DISPLAY_NAME") {
            self.identity.display_name = name;
        }

        if let Ok(level) = std::env::var("MESSENGER_LOGGING_LEVEL") {
            self.logging.level = level;
        }

        if let Ok(data_dir) = std::env::var("MESSENGER_STORAGE_DATA_DIR") {
            self = self.with_data_dir(data_dir);
        }

        if let Ok(key) = std::env::var("MESSENGER_STORAGE_AT_REST_KEY") {
            self.storage.at_rest_key = key;
        }

        Ok(self)
    }

    /// Validate the configuration for consistency and correctness
    pub fn validate(&self) -> Result<()> {
        if self.identity.address.trim().is_empty() {
            return Err(ConfigError::MissingField {
                field: "identity.address".to_string(),
            }
            .into());
        }

        if self.network.listen_port == 0 {
            return Err(invalid("network.listen_port", "0"));
        }

        if self.session.max_sessions == 0 {
            return Err(invalid("session.max_sessions", "0"));
        }

        if self.session.handshake_timeout == 0 {
            return Err(invalid("session.handshake_timeout", "0"));
        }

        let fragment = self.session.max_fragment_size;
        if fragment != 0 && fragment < MIN_FRAGMENT_SIZE {
            return Err(invalid("session.max_fragment_size", &fragment.to_string()));
        }

        // Checked again when the cipher is built; failing here gives a
        // config-level message before anything is opened.
        let key_len = self.storage.at_rest_key.len();
        if !matches!(key_len, 16 | 24 | 32) {
            return Err(invalid(
                "storage.at_rest_key",
                &format!("<{key_len} bytes>"),
            ));
        }

        match self.logging.level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            _ => return Err(invalid("logging.level", &self.logging.level)),
        }

        Ok(())
    }

    /// Ensure all required directories exist
    pub fn ensure_directories(&self) -> Result<()> {
        let mut dirs_to_create = vec![&self.storage.data_dir, &self.storage.keys_dir];
        let db_parent = self.storage.database_file.parent().map(Path::to_path_buf);
        if let Some(parent) = db_parent.as_ref() {
            dirs_to_create.push(parent);
        }

        for dir in dirs_to_create {
            if !dir.as_os_str().is_empty() && !dir.exists() {
                std::fs::create_dir_all(dir).map_err(|_| ConfigError::DirectoryCreation {
                    path: dir.display().to_string(),
                })?;
            }
        }

        Ok(())
    }

    /// Get the configuration as a pretty-printed TOML string
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| {
            ConfigError::ParseError {
                reason: e.to_string(),
            }
            .into()
        })
    }
}

fn invalid(field: &str, value: &str) -> crate::utils::MessengerError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = MessengerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.network.listen_port, crate::defaults::DEFAULT_PORT);
        assert_eq!(config.session.default_protocol, ProtocolType::Otr);
        assert_eq!(config.storage.at_rest_scheme, AtRestScheme::LegacyZeroIv);
    }

    #[test]
    fn test_config_serialization() {
        let config = MessengerConfig::default();
        let toml_str = config.to_toml_string().unwrap();
        assert!(toml_str.contains("listen_port"));
        assert!(toml_str.contains("default_protocol = \"otr\""));
        assert!(toml_str.contains("at_rest_scheme = \"legacy-zero-iv\""));
    }

    #[test]
    fn test_config_file_operations() {
        let mut config = MessengerConfig::default();
        config.session.default_protocol = ProtocolType::DoubleRatchet;
        let temp_file = NamedTempFile::new().unwrap();

        config.save(temp_file.path()).unwrap();
        let loaded_config = MessengerConfig::from_file(temp_file.path()).unwrap();

        assert_eq!(config.network.listen_port, loaded_config.network.listen_port);
        assert_eq!(loaded_config.session.default_protocol, ProtocolType::DoubleRatchet);
    }

    #[test]
    fn test_config_validation() {
        let mut config = MessengerConfig::default();
        assert!(config.validate().is_ok());

        config.network.listen_port = 0;
        assert!(config.validate().is_err());

        config = MessengerConfig::default();
        config.session.max_sessions = 0;
        assert!(config.validate().is_err());

        config = MessengerConfig::default();
        config.logging.level = "invalid".to_string();
        assert!(config.validate().is_err());

        config = MessengerConfig::default();
        config.storage.at_rest_key = "too short".to_string();
        assert!(config.validate().is_err());

        config = MessengerConfig::default();
        config.session.max_fragment_size = 4;
        assert!(config.validate().is_err());
        config.session.max_fragment_size = MIN_FRAGMENT_SIZE;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_merge() {
        let mut config1 = MessengerConfig::default();
        let mut config2 = MessengerConfig::default();

        config1.network.listen_port = 4242;
        config2.network.listen_port = 4243;

        let merged = config1.merge(config2);
        assert_eq!(merged.network.listen_port, 4243);
    }

    #[test]
    fn test_env_override() {
        std::env::set_var("MESSENGER_NETWORK_LISTEN_PORT", "9999");

        let config = MessengerConfig::default().merge_from_env().unwrap();
        assert_eq!(config.network.listen_port, 9999);

        std::env::remove_var("MESSENGER_NETWORK_LISTEN_PORT");
    }

    #[test]
    fn test_directory_paths() {
        let config = MessengerConfig::default().with_data_dir("/tmp/otr-messenger-test");

        assert!(config.storage.keys_dir.starts_with(&config.storage.data_dir));
        assert!(config.storage.database_file.starts_with(&config.storage.data_dir));
    }
}
