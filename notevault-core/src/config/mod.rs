//! Configuration management for NoteVault
//!
//! Defaults are usable as-is; a TOML file and `NOTEVAULT_<SECTION>_<KEY>`
//! environment variables can override them. Every constructor validates
//! before returning.

use crate::core_crypto::KdfParams;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

mod error;

pub use error::ConfigError;

const MIB: usize = 1024 * 1024;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Encrypted file store
    pub store: StoreConfig,

    /// Password key derivation cost
    pub kdf: KdfParams,

    /// Broadcast fan-out limits
    pub broadcast: BroadcastConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory holding the index document and every data file
    pub data_dir: PathBuf,

    /// File name of the encrypted index document inside `data_dir`
    pub index_file: String,

    /// Extension given to data files
    pub data_extension: String,

    /// Chunk size for streaming encryption and key rotation
    pub stream_chunk_size: usize,
}

/// Broadcast configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcastConfig {
    /// Identifier written into every reply envelope
    pub sender_id: String,

    /// Maximum number of recipients per broadcast
    pub max_recipients: usize,

    /// Maximum size of one message in bytes
    pub max_message_size: usize,

    /// Maximum of message size times recipient count
    pub max_total_broadcast_size: usize,

    /// How long one recipient may take before it is recorded as timed out
    #[serde(with = "humantime_serde")]
    pub recipient_timeout: Duration,

    /// Chunk size used while buffering the inbound message
    pub read_chunk_size: usize,

    /// Buffer capacity of each per-recipient duplex pipe
    pub channel_capacity: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Enable JSON formatting
    pub json_format: bool,

    /// Include timestamps
    pub with_timestamp: bool,

    /// Include target module
    pub with_target: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            index_file: "index.enc".to_string(),
            data_extension: "enc".to_string(),
            stream_chunk_size: 64 * 1024,
        }
    }
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            sender_id: "notevault".to_string(),
            max_recipients: 1000,
            max_message_size: 50 * MIB,
            max_total_broadcast_size: 500 * MIB,
            recipient_timeout: Duration::from_secs(30),
            read_chunk_size: 64 * 1024,
            channel_capacity: 64 * 1024,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            with_timestamp: true,
            with_target: true,
        }
    }
}

fn parse_var<T>(name: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::InvalidEnv {
                var: name.to_string(),
                message: e.to_string(),
            }),
        Err(_) => Ok(None),
    }
}

impl Config {
    /// Load configuration from environment variables
    ///
    /// Environment variables follow the pattern: NOTEVAULT_<SECTION>_<KEY>
    /// Example: NOTEVAULT_STORE_DATA_DIR=/var/lib/notevault
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay environment variables onto an existing configuration
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        // Store config
        if let Ok(data_dir) = env::var("NOTEVAULT_STORE_DATA_DIR") {
            self.store.data_dir = PathBuf::from(data_dir);
        }
        if let Some(size) = parse_var("NOTEVAULT_STORE_CHUNK_SIZE")? {
            self.store.stream_chunk_size = size;
        }

        // KDF config
        if let Some(memory) = parse_var("NOTEVAULT_KDF_MEMORY_KIB")? {
            self.kdf.memory_kib = memory;
        }
        if let Some(iterations) = parse_var("NOTEVAULT_KDF_ITERATIONS")? {
            self.kdf.iterations = iterations;
        }

        // Broadcast config
        if let Ok(sender) = env::var("NOTEVAULT_BROADCAST_SENDER_ID") {
            self.broadcast.sender_id = sender;
        }
        if let Some(max) = parse_var("NOTEVAULT_BROADCAST_MAX_RECIPIENTS")? {
            self.broadcast.max_recipients = max;
        }
        if let Some(max) = parse_var("NOTEVAULT_BROADCAST_MAX_MESSAGE_SIZE")? {
            self.broadcast.max_message_size = max;
        }
        if let Some(max) = parse_var("NOTEVAULT_BROADCAST_MAX_TOTAL_SIZE")? {
            self.broadcast.max_total_broadcast_size = max;
        }
        if let Ok(timeout) = env::var("NOTEVAULT_BROADCAST_RECIPIENT_TIMEOUT") {
            self.broadcast.recipient_timeout = humantime_serde::re::humantime::parse_duration(
                &timeout,
            )
            .map_err(|e| ConfigError::InvalidEnv {
                var: "NOTEVAULT_BROADCAST_RECIPIENT_TIMEOUT".to_string(),
                message: e.to_string(),
            })?;
        }

        // Logging config
        if let Ok(level) = env::var("NOTEVAULT_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(json) = parse_var("NOTEVAULT_LOG_JSON")? {
            self.logging.json_format = json;
        }

        Ok(())
    }

    /// Load configuration from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let config: Self = toml::from_str(&contents)?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        // Store config
        if self.store.index_file.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "index_file must not be empty".to_string(),
            ));
        }
        if self.store.data_extension.is_empty() || self.store.data_extension.contains('.') {
            return Err(ConfigError::ValidationFailed(format!(
                "Invalid data extension: {:?}",
                self.store.data_extension
            )));
        }
        if self.store.stream_chunk_size == 0 {
            return Err(ConfigError::ValidationFailed(
                "stream_chunk_size must be greater than 0".to_string(),
            ));
        }

        // KDF config
        if self.kdf.iterations == 0 || self.kdf.parallelism == 0 {
            return Err(ConfigError::ValidationFailed(
                "KDF iterations and parallelism must be greater than 0".to_string(),
            ));
        }
        if self.kdf.memory_kib < 8 * self.kdf.parallelism {
            return Err(ConfigError::ValidationFailed(
                "KDF memory must be at least 8 KiB per lane".to_string(),
            ));
        }

        // Broadcast config
        let b = &self.broadcast;
        if b.max_recipients == 0 || b.max_message_size == 0 || b.max_total_broadcast_size == 0 {
            return Err(ConfigError::ValidationFailed(
                "broadcast limits must be greater than 0".to_string(),
            ));
        }
        if b.max_total_broadcast_size < b.max_message_size {
            return Err(ConfigError::ValidationFailed(
                "max_total_broadcast_size must not be below max_message_size".to_string(),
            ));
        }
        if b.read_chunk_size == 0 || b.channel_capacity == 0 {
            return Err(ConfigError::ValidationFailed(
                "read_chunk_size and channel_capacity must be greater than 0".to_string(),
            ));
        }
        if b.recipient_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "recipient_timeout must be greater than 0".to_string(),
            ));
        }

        // Logging config
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::ValidationFailed(format!(
                "Invalid log level: {}",
                self.logging.level
            )));
        }

        Ok(())
    }

    /// Save configuration to file
    pub fn save_to_file(&self, path: impl AsRef<std::path::Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let contents = toml::to_string_pretty(self)?;

        std::fs::write(path, contents).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })?;

        Ok(())
    }
}
