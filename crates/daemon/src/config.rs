//! Configuration management for the Fetchbox daemon.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/fetchbox/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use protocol::MAX_UPLOAD_PAYLOAD;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),

    #[error("max_upload_size must be between 1 and {max}, got {size}")]
    InvalidMaxUploadSize { size: u64, max: u64 },

    #[error("max_connections_per_server must be between 1 and 16, got {0}")]
    InvalidMaxConnections(u32),

    #[error("summary_interval must be at least 1 second, got {0}")]
    InvalidSummaryInterval(u32),

    #[error("transfer program must not be empty")]
    EmptyProgram,
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Public trackers appended to every transfer.
pub const DEFAULT_TRACKERS: &[&str] = &[
    "udp://tracker.opentrackr.org:1337/announce",
    "udp://9.rarbg.com:2810/announce",
    "udp://tracker.openbittorrent.com:80/announce",
    "udp://opentracker.i2p.rocks:6969/announce",
    "https://tracker.tamersunion.org:443/announce",
    "http://tracker1.itzmx.com:8080/announce",
    "udp://tracker.torrent.eu.org:451/announce",
];

/// Main configuration structure for the Fetchbox daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General daemon configuration.
    pub daemon: DaemonConfig,

    /// Storage roots and upload limits.
    pub storage: StorageConfig,

    /// Download utility settings.
    pub transfer: TransferConfig,

    /// External extraction command.
    pub extract: ExtractConfig,
}

/// General daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Directory for daemon data (roots, scratch, logs, PID file).
    pub data_dir: PathBuf,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Control socket path. Defaults to `<data_dir>/fetchbox.sock`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub socket_path: Option<PathBuf>,
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    /// Raw downloads root. Defaults to `<data_dir>/downloads`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub downloads_dir: Option<PathBuf>,

    /// Extracted archives root. Defaults to `<data_dir>/extracted`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extracted_dir: Option<PathBuf>,

    /// Maximum size of a single uploaded file in bytes (default: 32MB).
    ///
    /// Uploads travel inline in one request line, so this is capped at
    /// [`MAX_UPLOAD_PAYLOAD`].
    pub max_upload_size: u64,
}

/// Download utility configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TransferConfig {
    /// Program to launch, looked up on `PATH`.
    pub program: String,

    /// Value of `--max-connection-per-server`.
    pub max_connections_per_server: u32,

    /// Value of `--summary-interval` in seconds.
    pub summary_interval: u32,

    /// Value of `--disk-cache`.
    pub disk_cache: String,

    /// Trackers passed as `--bt-tracker`.
    pub trackers: Vec<String>,
}

/// External extractor configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExtractConfig {
    /// Program used for formats without native support (rar, 7z).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    /// Arguments; `{archive}` and `{dest}` are substituted.
    pub args: Vec<String>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: "info".to_string(),
            socket_path: None,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            downloads_dir: None,
            extracted_dir: None,
            max_upload_size: 32 * 1024 * 1024, // 32MB
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            program: "aria2c".to_string(),
            max_connections_per_server: 16,
            summary_interval: 1,
            disk_cache: "0".to_string(),
            trackers: DEFAULT_TRACKERS.iter().map(|t| t.to_string()).collect(),
        }
    }
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            command: None,
            args: vec![
                "x".to_string(),
                "-y".to_string(),
                "-o{dest}".to_string(),
                "{archive}".to_string(),
            ],
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("fetchbox")
        .join("config.toml")
}

/// Returns the default data directory path.
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("fetchbox")
}

impl Config {
    /// Raw downloads root.
    pub fn downloads_dir(&self) -> PathBuf {
        self.storage
            .downloads_dir
            .clone()
            .unwrap_or_else(|| self.daemon.data_dir.join("downloads"))
    }

    /// Extracted archives root.
    pub fn extracted_dir(&self) -> PathBuf {
        self.storage
            .extracted_dir
            .clone()
            .unwrap_or_else(|| self.daemon.data_dir.join("extracted"))
    }

    /// Private staging area for uploads and packaged archives.
    pub fn scratch_dir(&self) -> PathBuf {
        self.daemon.data_dir.join("scratch")
    }

    /// Directory for rolling log files.
    pub fn log_dir(&self) -> PathBuf {
        self.daemon.data_dir.join("logs")
    }

    /// Control socket path.
    pub fn socket_path(&self) -> PathBuf {
        self.daemon
            .socket_path
            .clone()
            .unwrap_or_else(|| self.daemon.data_dir.join("fetchbox.sock"))
    }

    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - FETCHBOX_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - FETCHBOX_DATA_DIR: Override the data directory
    pub fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("FETCHBOX_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.daemon.log_level = level;
            }
        }

        if let Ok(dir) = std::env::var("FETCHBOX_DATA_DIR") {
            if !dir.is_empty() {
                tracing::info!("Overriding data_dir from environment: {}", dir);
                self.daemon.data_dir = PathBuf::from(dir);
            }
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let level = self.daemon.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.daemon.log_level.clone()));
        }

        let size = self.storage.max_upload_size;
        if size == 0 || size > MAX_UPLOAD_PAYLOAD {
            return Err(ConfigError::InvalidMaxUploadSize {
                size,
                max: MAX_UPLOAD_PAYLOAD,
            });
        }

        let connections = self.transfer.max_connections_per_server;
        if !(1..=16).contains(&connections) {
            return Err(ConfigError::InvalidMaxConnections(connections));
        }

        if self.transfer.summary_interval < 1 {
            return Err(ConfigError::InvalidSummaryInterval(
                self.transfer.summary_interval,
            ));
        }

        if self.transfer.program.trim().is_empty() {
            return Err(ConfigError::EmptyProgram);
        }

        Ok(())
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
