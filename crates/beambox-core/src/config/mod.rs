//! Configuration management for Beambox.
//!
//! This module handles loading, saving, and validating Beambox configuration.
//!
//! ## Configuration File Locations
//!
//! | Platform | Path |
//! |----------|------|
//! | Linux | `~/.config/beambox/config.toml` |
//! | macOS | `~/Library/Application Support/com.beambox.Beambox/config.toml` |
//! | Windows | `%APPDATA%\Beambox\Beambox\config\config.toml` |
//!
//! ## Example
//!
//! ```rust,ignore
//! use beambox_core::config::Config;
//!
//! let config = Config::load()?;
//! println!("Device name: {}", config.general.device_name);
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::protocol::MAX_BODY_SIZE;

/// Main configuration struct for Beambox.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,
    /// Ports
    pub network: NetworkConfig,
    /// Session timing
    pub session: SessionConfig,
    /// Transfer settings
    pub transfer: TransferConfig,
}

/// General configuration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Display name announced to peers
    pub device_name: String,
    /// Directory received files are written to
    pub download_dir: PathBuf,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        let download_dir = directories::UserDirs::new()
            .and_then(|dirs| dirs.download_dir().map(Path::to_path_buf))
            .unwrap_or_else(|| PathBuf::from("."));
        Self {
            device_name: hostname::get().map_or_else(
                |_| "Beambox Device".to_string(),
                |h| h.to_string_lossy().to_string(),
            ),
            download_dir,
        }
    }
}

/// Well-known ports.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// FileExplore control port (TCP)
    pub file_explore_port: u16,
    /// File transfer data port (TCP)
    pub file_transfer_port: u16,
    /// QR-code rendezvous port (UDP)
    pub qr_code_port: u16,
    /// Port broadcast announcements are sent to (UDP)
    pub broadcast_receiver_port: u16,
    /// Port the announcer listens on for transfer requests (UDP)
    pub broadcast_transfer_port: u16,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            file_explore_port: crate::DEFAULT_FILE_EXPLORE_PORT,
            file_transfer_port: crate::DEFAULT_FILE_TRANSFER_PORT,
            qr_code_port: crate::DEFAULT_QR_CODE_PORT,
            broadcast_receiver_port: crate::DEFAULT_BROADCAST_RECEIVER_PORT,
            broadcast_transfer_port: crate::DEFAULT_BROADCAST_TRANSFER_PORT,
        }
    }
}

/// Session timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Interval between FileExplore heartbeats
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,
    /// Heartbeat intervals without traffic before the session is dropped
    pub idle_multiplier: u32,
    /// Wait before the single request retransmission
    #[serde(with = "humantime_serde")]
    pub retry_timeout: Duration,
    /// Interval between broadcast announcements
    #[serde(with = "humantime_serde")]
    pub broadcast_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(crate::DEFAULT_HEARTBEAT_INTERVAL_MS),
            idle_multiplier: crate::DEFAULT_IDLE_MULTIPLIER,
            retry_timeout: Duration::from_millis(crate::DEFAULT_RETRY_TIMEOUT_MS),
            broadcast_interval: Duration::from_millis(crate::DEFAULT_BROADCAST_INTERVAL_MS),
        }
    }
}

impl SessionConfig {
    /// Silence after which a session is considered dead.
    #[must_use]
    pub fn idle_timeout(&self) -> Duration {
        self.heartbeat_interval * self.idle_multiplier
    }
}

/// Transfer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Parallel data connections per transfer
    pub max_connection: usize,
    /// Chunk size in bytes
    pub buffer_size: usize,
    /// How long a sender waits for downloaders to connect
    #[serde(with = "humantime_serde")]
    pub accept_timeout: Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_connection: crate::DEFAULT_MAX_CONNECTION,
            buffer_size: crate::DEFAULT_BUFFER_SIZE,
            accept_timeout: Duration::from_secs(10),
        }
    }
}

impl Config {
    /// Load configuration from the default location.
    ///
    /// If the configuration file doesn't exist, returns the default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration file exists but cannot be read,
    /// parsed, or validated.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    /// Load configuration from `path`, falling back to defaults when the
    /// file does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read, parsed, or
    /// validated.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::ConfigError(format!("Failed to read config: {e}")))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| Error::ConfigError(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to the default location.
    ///
    /// Creates the configuration directory if it doesn't exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be written.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path())
    }

    /// Save configuration to `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be written.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::ConfigError(format!("Failed to create config directory: {e}"))
            })?;
        }

        std::fs::write(path, self.to_toml()?)
            .map_err(|e| Error::ConfigError(format!("Failed to write config: {e}")))
    }

    /// Render as pretty TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| Error::ConfigError(format!("Failed to serialize config: {e}")))
    }

    /// Check value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] naming the first offending key.
    pub fn validate(&self) -> Result<()> {
        let invalid = |key: &str, reason: &str| Error::InvalidConfig {
            key: key.to_string(),
            reason: reason.to_string(),
        };

        if self.session.heartbeat_interval.is_zero() {
            return Err(invalid("session.heartbeat_interval", "must be greater than zero"));
        }
        if self.session.idle_multiplier == 0 {
            return Err(invalid("session.idle_multiplier", "must be at least 1"));
        }
        if self.session.retry_timeout.is_zero() {
            return Err(invalid("session.retry_timeout", "must be greater than zero"));
        }
        if self.session.broadcast_interval.is_zero() {
            return Err(invalid("session.broadcast_interval", "must be greater than zero"));
        }
        if self.transfer.max_connection == 0 {
            return Err(invalid("transfer.max_connection", "must be at least 1"));
        }
        if self.transfer.buffer_size == 0 || self.transfer.buffer_size > MAX_BODY_SIZE {
            return Err(invalid(
                "transfer.buffer_size",
                &format!("must be between 1 and {MAX_BODY_SIZE} bytes"),
            ));
        }
        Ok(())
    }

    /// Get the default configuration directory path.
    #[must_use]
    pub fn config_dir() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "beambox", "Beambox")
            .map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the full path to the configuration file.
    #[must_use]
    pub fn config_path() -> PathBuf {
        Self::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("config.toml")
    }
}

mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() == 0 && duration.as_secs() > 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        super::parse_duration(&s).ok_or_else(|| {
            serde::de::Error::custom(format!(
                "invalid duration '{s}', expected e.g. \"500ms\", \"8s\" or \"1m\""
            ))
        })
    }
}

/// Parse `"<n>ms"`, `"<n>s"`, `"<n>m"` or `"<n>h"`.
///
/// Returns `None` for unknown units and for values that overflow.
#[must_use]
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    let number = |n: &str| n.trim().parse::<u64>().ok();
    if let Some(ms) = s.strip_suffix("ms") {
        number(ms).map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        number(secs).map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        number(mins)?.checked_mul(60).map(Duration::from_secs)
    } else if let Some(hours) = s.strip_suffix('h') {
        number(hours)?.checked_mul(3600).map(Duration::from_secs)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_config_default() {
        let config = Config::default();

        assert_eq!(config.network.file_explore_port, crate::DEFAULT_FILE_EXPLORE_PORT);
        assert_eq!(config.session.heartbeat_interval, Duration::from_secs(8));
        assert_eq!(config.session.idle_timeout(), Duration::from_secs(24));
        assert_eq!(config.transfer.buffer_size, 512 * 1024);
        config.validate().expect("defaults are valid");
    }

    #[test]
    fn test_config_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config").join("config.toml");

        let mut original = Config::default();
        original.general.device_name = "Test Device".to_string();
        original.network.qr_code_port = 12345;
        original.session.retry_timeout = Duration::from_millis(1500);
        original.transfer.max_connection = 2;
        original.save_to(&config_path).expect("save");

        let loaded = Config::load_from(&config_path).expect("load");
        assert_eq!(loaded.general.device_name, "Test Device");
        assert_eq!(loaded.network.qr_code_port, 12345);
        assert_eq!(loaded.session.retry_timeout, Duration::from_millis(1500));
        assert_eq!(loaded.transfer.max_connection, 2);
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let config = Config::load_from(&temp_dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.transfer.max_connection, crate::DEFAULT_MAX_CONNECTION);
    }

    #[test]
    fn test_config_deserialization_partial() {
        let partial_toml = r#"
[general]
device_name = "My Custom Device"

[session]
heartbeat_interval = "2s"
"#;

        let config: Config = toml::from_str(partial_toml).expect("parse partial config");

        assert_eq!(config.general.device_name, "My Custom Device");
        assert_eq!(config.session.heartbeat_interval, Duration::from_secs(2));
        assert_eq!(config.session.retry_timeout, Duration::from_millis(1000));
        assert_eq!(config.transfer.buffer_size, crate::DEFAULT_BUFFER_SIZE);
    }

    #[test]
    fn test_humantime_duration_serialization() {
        let config = Config::default();
        let toml_str = config.to_toml().expect("serialize");

        assert!(toml_str.contains("heartbeat_interval = \"8s\""));
        assert!(toml_str.contains("[session]"));
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("8000ms"), Some(Duration::from_millis(8000)));
        assert_eq!(parse_duration("8s"), Some(Duration::from_secs(8)));
        assert_eq!(parse_duration("1m"), Some(Duration::from_secs(60)));
        assert_eq!(parse_duration("1h"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_duration(" 30s "), Some(Duration::from_secs(30)));
        assert_eq!(parse_duration("soon"), None);
        assert_eq!(parse_duration(""), None);
        assert_eq!(parse_duration("-5s"), None);
    }

    #[test]
    fn test_parse_duration_overflow() {
        assert_eq!(parse_duration("307445734561825861m"), None);
        assert_eq!(parse_duration("5124095576030432h"), None);
        assert_eq!(
            parse_duration("307445734561825860m"),
            Some(Duration::from_secs(307_445_734_561_825_860 * 60))
        );
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.transfer.max_connection = 0;
        assert!(matches!(
            config.validate(),
            Err(Error::InvalidConfig { ref key, .. }) if key == "transfer.max_connection"
        ));

        let mut config = Config::default();
        config.transfer.buffer_size = MAX_BODY_SIZE + 1;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.session.heartbeat_interval = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_file_is_config_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        std::fs::write(&path, "[transfer]\nmax_connection = 0\n").unwrap();
        assert!(matches!(
            Config::load_from(&path),
            Err(Error::InvalidConfig { .. })
        ));

        std::fs::write(&path, "[session]\nretry_timeout = \"fast\"\n").unwrap();
        assert!(matches!(Config::load_from(&path), Err(Error::ConfigError(_))));

        std::fs::write(&path, "[session]\nheartbeat_interval = \"307445734561825861m\"\n")
            .unwrap();
        assert!(matches!(Config::load_from(&path), Err(Error::ConfigError(_))));
    }
}
