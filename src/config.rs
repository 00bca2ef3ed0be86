//! Configuration using Figment
//!
//! Strongly-typed settings for the live session. Configuration is loaded from:
//! 1. `config/live.toml` (optional; every field has a default)
//! 2. Environment variables prefixed with `LIVE_TELEMETRY_`, with `__`
//!    separating nested keys
//!
//! # Example
//! ```no_run
//! use live_telemetry::config::LiveConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // LIVE_TELEMETRY_STREAM__URL=wss://ingest.example.com/ws overrides the file
//! let config = LiveConfig::load()?;
//! config.validate()?;
//! println!("Streaming from {}", config.stream.url);
//! # Ok(())
//! # }
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::calibration::{CalibrationConfig, MIN_SAMPLES};
use crate::connection::{parse_stream_url, ReconnectConfig};
use crate::error::{AppResult, TelemetryError};
use crate::history::MAX_HISTORY;
use crate::session::{DEFAULT_REFRESH_SECS, REFRESH_SECS_RANGE};

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/live.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "LIVE_TELEMETRY_";

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];
const LOG_FORMATS: [&str; 3] = ["pretty", "compact", "json"];

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LiveConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Streaming connection
    #[serde(default)]
    pub stream: StreamConfig,
    /// REST fallback
    #[serde(default)]
    pub api: ApiConfig,
    /// Calibration thresholds
    #[serde(default)]
    pub calibration: CalibrationSettings,
    /// History buffer
    #[serde(default)]
    pub history: HistoryConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

/// Streaming connection configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamConfig {
    /// WebSocket URL of the telemetry stream
    #[serde(default = "default_stream_url")]
    pub url: String,
    /// The hosting origin is encrypted: `ws:` is upgraded to `wss:`
    #[serde(default)]
    pub secure_origin: bool,
    /// First reconnect delay in milliseconds
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,
    /// Reconnect delay ceiling in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
    /// Growth factor between consecutive failures
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

/// REST fallback configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Base URL of the REST API
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Telemetry poll interval in seconds (1-5)
    #[serde(default = "default_refresh_secs")]
    pub refresh_secs: u64,
    /// Training statistics poll interval in milliseconds
    #[serde(default = "default_training_poll")]
    pub training_poll_ms: u64,
    /// Analysis window requested from the training endpoint, in seconds
    #[serde(default = "default_training_window")]
    pub training_window_s: u32,
    /// Per-request timeout in milliseconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
}

/// Calibration configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationSettings {
    /// Samples required to lock
    #[serde(default = "default_min_samples")]
    pub min_samples: u32,
    /// Calibration time before the low-data fallback flag, in milliseconds
    #[serde(default = "default_calibration_timeout")]
    pub timeout_ms: u64,
    /// Lifetime of the "recently locked" badge, in milliseconds
    #[serde(default = "default_lock_badge")]
    pub lock_badge_ms: u64,
}

/// History buffer configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// Records kept, newest first
    #[serde(default = "default_max_history")]
    pub max_history: usize,
}

// Default value functions
fn default_name() -> String {
    "live-telemetry".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_stream_url() -> String {
    "ws://localhost:8080/ws".to_string()
}

fn default_initial_delay() -> u64 {
    1_000
}

fn default_max_delay() -> u64 {
    15_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_base_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_refresh_secs() -> u64 {
    DEFAULT_REFRESH_SECS
}

fn default_training_poll() -> u64 {
    1_000
}

fn default_training_window() -> u32 {
    120
}

fn default_request_timeout() -> u64 {
    10_000
}

fn default_min_samples() -> u32 {
    MIN_SAMPLES
}

fn default_calibration_timeout() -> u64 {
    12_000
}

fn default_lock_badge() -> u64 {
    1_500
}

fn default_max_history() -> usize {
    MAX_HISTORY
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            url: default_stream_url(),
            secure_origin: false,
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            refresh_secs: default_refresh_secs(),
            training_poll_ms: default_training_poll(),
            training_window_s: default_training_window(),
            request_timeout_ms: default_request_timeout(),
        }
    }
}

impl Default for CalibrationSettings {
    fn default() -> Self {
        Self {
            min_samples: default_min_samples(),
            timeout_ms: default_calibration_timeout(),
            lock_badge_ms: default_lock_badge(),
        }
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_history: default_max_history(),
        }
    }
}

impl StreamConfig {
    /// Backoff settings for the connection manager.
    #[must_use]
    pub fn reconnect(&self) -> ReconnectConfig {
        ReconnectConfig {
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            backoff_multiplier: self.backoff_multiplier,
        }
    }
}

impl CalibrationSettings {
    /// Thresholds for the calibration machine.
    #[must_use]
    pub fn to_calibration_config(&self) -> CalibrationConfig {
        CalibrationConfig {
            min_samples: self.min_samples,
            timeout: Duration::from_millis(self.timeout_ms),
            lock_badge: Duration::from_millis(self.lock_badge_ms),
        }
    }
}

impl LiveConfig {
    /// Load configuration from `config/live.toml` and environment variables
    ///
    /// Environment variables override the file with prefix `LIVE_TELEMETRY_`.
    /// Example: `LIVE_TELEMETRY_APPLICATION__LOG_LEVEL=debug`
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    ///
    /// A missing file is not an error; defaults and the environment still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Self::figment(path).extract()
    }

    /// Load from `path` and reject values that fail [`Self::validate`].
    pub fn load_validated<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config = Self::load_from(path)?;
        config.validate().map_err(TelemetryError::Configuration)?;
        Ok(config)
    }

    /// The provider stack used by [`Self::load_from`].
    pub fn figment<P: AsRef<Path>>(path: P) -> Figment {
        Figment::from(Serialized::defaults(LiveConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        if !LOG_LEVELS.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                LOG_LEVELS.join(", ")
            ));
        }

        if !LOG_FORMATS.contains(&self.application.log_format.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                LOG_FORMATS.join(", ")
            ));
        }

        parse_stream_url(&self.stream.url).map_err(|e| e.to_string())?;

        match url::Url::parse(&self.api.base_url) {
            Ok(base) if matches!(base.scheme(), "http" | "https") => {}
            Ok(base) => {
                return Err(format!(
                    "Invalid api.base_url '{}': unsupported scheme '{}'",
                    self.api.base_url,
                    base.scheme()
                ))
            }
            Err(e) => return Err(format!("Invalid api.base_url '{}': {}", self.api.base_url, e)),
        }

        if self.stream.initial_delay_ms == 0 {
            return Err("stream.initial_delay_ms must be greater than 0".to_string());
        }
        if self.stream.max_delay_ms < self.stream.initial_delay_ms {
            return Err(format!(
                "stream.max_delay_ms ({}) must not be below stream.initial_delay_ms ({})",
                self.stream.max_delay_ms, self.stream.initial_delay_ms
            ));
        }
        if !(1.0..=ReconnectConfig::MAX_MULTIPLIER).contains(&self.stream.backoff_multiplier) {
            return Err(format!(
                "Invalid stream.backoff_multiplier {}. Must be between 1.0 and {}",
                self.stream.backoff_multiplier,
                ReconnectConfig::MAX_MULTIPLIER
            ));
        }

        if !REFRESH_SECS_RANGE.contains(&self.api.refresh_secs) {
            return Err(format!(
                "Invalid api.refresh_secs {}. Must be {}-{}",
                self.api.refresh_secs,
                REFRESH_SECS_RANGE.start(),
                REFRESH_SECS_RANGE.end()
            ));
        }
        if self.api.training_poll_ms == 0 || self.api.training_window_s == 0 {
            return Err("api.training_poll_ms and api.training_window_s must be greater than 0".to_string());
        }
        if self.api.request_timeout_ms == 0 {
            return Err("api.request_timeout_ms must be greater than 0".to_string());
        }

        if self.calibration.min_samples == 0 {
            return Err("calibration.min_samples must be at least 1".to_string());
        }
        if self.history.max_history == 0 {
            return Err("history.max_history must be at least 1".to_string());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_constants() {
        let config = LiveConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.stream.reconnect(), ReconnectConfig::default());
        assert_eq!(
            config.calibration.to_calibration_config(),
            CalibrationConfig::default()
        );
        assert_eq!(config.history.max_history, MAX_HISTORY);
        assert_eq!(config.api.refresh_secs, 3);
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = LiveConfig::default();
        config.application.log_level = "invalid".to_string();
        assert!(config.validate().unwrap_err().contains("log_level"));
    }

    #[test]
    fn test_invalid_urls() {
        let mut config = LiveConfig::default();
        config.stream.url = "http://example.com/ws".to_string();
        assert!(config.validate().is_err());

        let mut config = LiveConfig::default();
        config.api.base_url = "ftp://example.com".to_string();
        assert!(config.validate().unwrap_err().contains("unsupported scheme"));
    }

    #[test]
    fn test_invalid_ranges() {
        let mut config = LiveConfig::default();
        config.api.refresh_secs = 9;
        assert!(config.validate().unwrap_err().contains("refresh_secs"));

        let mut config = LiveConfig::default();
        config.stream.max_delay_ms = 10;
        assert!(config.validate().is_err());

        let mut config = LiveConfig::default();
        config.stream.backoff_multiplier = f64::NAN;
        assert!(config.validate().is_err());

        let mut config = LiveConfig::default();
        config.stream.backoff_multiplier = 1e20;
        assert!(config.validate().unwrap_err().contains("backoff_multiplier"));
        config.stream.backoff_multiplier = ReconnectConfig::MAX_MULTIPLIER;
        assert!(config.validate().is_ok());

        let mut config = LiveConfig::default();
        config.history.max_history = 0;
        assert!(config.validate().is_err());
    }
}
