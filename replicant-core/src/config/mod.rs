//! Configuration for the replication client
//!
//! Sources, lowest precedence first: built-in defaults, a TOML file
//! ([`Config::from_file`]), `REPLICANT_*` environment variables
//! ([`Config::apply_env`]). Durations are written the humantime way
//! (`"500ms"`, `"5s"`).

use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::logging::LogLevel;

mod error;

pub use error::ConfigError;

/// Main application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub sync: SyncConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

/// Where the server lives and how to reach its endpoints
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// e.g. `https://example.org`
    pub base_url: String,

    /// Long-lived update stream
    pub stream_path: String,

    /// Snapshot / replay endpoint
    pub elements_path: String,

    pub health_path: String,

    pub schema_path: String,

    /// Timeout of request/response calls, connect timeout of the stream
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

/// Update pipeline and reconnect behaviour
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Throttle window for update bursts, zero disables throttling
    #[serde(with = "humantime_serde")]
    pub autoupdate_delay: Duration,

    /// Consecutive stream failures tolerated before going offline
    pub max_retries: u32,

    #[serde(with = "humantime_serde")]
    pub first_retry_delay: Duration,

    #[serde(with = "humantime_serde")]
    pub retry_delay_min: Duration,

    #[serde(with = "humantime_serde")]
    pub retry_delay_max: Duration,

    /// Buffer of the broadcast channels for store and lifecycle events
    pub event_capacity: usize,

    /// Keep reconnecting without a logged-in user
    pub guests_enabled: bool,
}

/// Local replica cache
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory of the file-backed cache; in-memory when unset
    pub cache_dir: Option<PathBuf>,

    /// Restore the cache on startup
    pub persist: bool,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: LogLevel,
    pub json_format: bool,
    pub with_timestamp: bool,
    pub with_target: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
            stream_path: "/system/autoupdate".to_string(),
            elements_path: "/system/get-elements".to_string(),
            health_path: "/system/health".to_string(),
            schema_path: "/system/schema".to_string(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            autoupdate_delay: Duration::ZERO,
            max_retries: 3,
            first_retry_delay: Duration::from_millis(500),
            retry_delay_min: Duration::from_secs(2),
            retry_delay_max: Duration::from_secs(5),
            event_capacity: 256,
            guests_enabled: true,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            json_format: false,
            with_timestamp: true,
            with_target: true,
        }
    }
}

fn parse_var<T>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e| ConfigError::invalid(key, e))
}

fn parse_duration(key: &str, value: &str) -> Result<Duration, ConfigError> {
    humantime::parse_duration(value).map_err(|e| ConfigError::invalid(key, e))
}

impl Config {
    /// Defaults overridden by the environment
    ///
    /// Variables follow the pattern `REPLICANT_<SECTION>_<KEY>`, e.g.
    /// `REPLICANT_SERVER_BASE_URL=https://example.org`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| ConfigError::FileReadError(e.to_string()))?;

        let config: Self =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Override fields from `REPLICANT_*` variables that are set.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_vars(|key| env::var(key).ok())
    }

    fn apply_vars(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        const BASE_URL: &str = "REPLICANT_SERVER_BASE_URL";
        const REQUEST_TIMEOUT: &str = "REPLICANT_SERVER_REQUEST_TIMEOUT";
        const DELAY: &str = "REPLICANT_SYNC_AUTOUPDATE_DELAY";
        const MAX_RETRIES: &str = "REPLICANT_SYNC_MAX_RETRIES";
        const GUESTS: &str = "REPLICANT_SYNC_GUESTS_ENABLED";
        const CACHE_DIR: &str = "REPLICANT_STORAGE_CACHE_DIR";
        const PERSIST: &str = "REPLICANT_STORAGE_PERSIST";
        const LOG_LEVEL: &str = "REPLICANT_LOG_LEVEL";
        const LOG_JSON: &str = "REPLICANT_LOG_JSON";

        if let Some(url) = var(BASE_URL) {
            self.server.base_url = url;
        }
        if let Some(timeout) = var(REQUEST_TIMEOUT) {
            self.server.request_timeout = parse_duration(REQUEST_TIMEOUT, &timeout)?;
        }
        if let Some(delay) = var(DELAY) {
            self.sync.autoupdate_delay = parse_duration(DELAY, &delay)?;
        }
        if let Some(retries) = var(MAX_RETRIES) {
            self.sync.max_retries = parse_var(MAX_RETRIES, &retries)?;
        }
        if let Some(guests) = var(GUESTS) {
            self.sync.guests_enabled = parse_var(GUESTS, &guests)?;
        }
        if let Some(dir) = var(CACHE_DIR) {
            self.storage.cache_dir = Some(PathBuf::from(dir));
        }
        if let Some(persist) = var(PERSIST) {
            self.storage.persist = parse_var(PERSIST, &persist)?;
        }
        if let Some(level) = var(LOG_LEVEL) {
            self.logging.level = parse_var(LOG_LEVEL, &level)?;
        }
        if let Some(json) = var(LOG_JSON) {
            self.logging.json_format = parse_var(LOG_JSON, &json)?;
        }
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = self.server.base_url.trim();
        if url.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "server.base_url must not be empty".to_string(),
            ));
        }
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(ConfigError::ValidationFailed(format!(
                "server.base_url must be an http(s) URL: {}",
                url
            )));
        }

        if self.sync.max_retries == 0 {
            return Err(ConfigError::ValidationFailed(
                "sync.max_retries must be greater than 0".to_string(),
            ));
        }

        if self.sync.retry_delay_min >= self.sync.retry_delay_max {
            return Err(ConfigError::ValidationFailed(
                "sync.retry_delay_min must be smaller than sync.retry_delay_max".to_string(),
            ));
        }

        if self.sync.event_capacity == 0 {
            return Err(ConfigError::ValidationFailed(
                "sync.event_capacity must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Save configuration to file
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let contents =
            toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(path, contents).map_err(|e| ConfigError::FileWriteError(e.to_string()))?;

        Ok(())
    }
}
