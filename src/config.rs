//! Configuration management for the rate limiter service.

use ::config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{RateLimiterError, Result};

/// Prefix of environment variables overriding file settings,
/// e.g. `RATELIMITER__TOKEN_BUCKET__CAPACITY=20`.
const ENV_PREFIX: &str = "RATELIMITER";

/// Main configuration for the rate limiter service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Fixed-window counter guarding `/ftw/limited`
    #[serde(default)]
    pub fixed_window: FixedWindowConfig,

    /// Token bucket guarding `/tb/limited`
    #[serde(default)]
    pub token_bucket: TokenBucketConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

/// Fixed-window counter configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixedWindowConfig {
    /// Window length in seconds
    #[serde(default = "default_window_size")]
    pub size_secs: u64,

    /// Requests admitted per key per window
    #[serde(default = "default_threshold")]
    pub threshold: u64,

    /// Seconds between sweeps of past windows; two windows when unset
    #[serde(default)]
    pub sweep_interval_secs: Option<u64>,
}

impl Default for FixedWindowConfig {
    fn default() -> Self {
        Self {
            size_secs: default_window_size(),
            threshold: default_threshold(),
            sweep_interval_secs: None,
        }
    }
}

impl FixedWindowConfig {
    /// Interval between sweeps.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(
            self.sweep_interval_secs
                .unwrap_or_else(|| self.size_secs.saturating_mul(2)),
        )
    }
}

fn default_window_size() -> u64 {
    60
}

fn default_threshold() -> u64 {
    10
}

/// Token bucket configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenBucketConfig {
    /// Tokens per key
    #[serde(default = "default_capacity")]
    pub capacity: u64,

    /// Seconds between refill ticks
    #[serde(default = "default_rate")]
    pub rate_secs: u64,
}

impl Default for TokenBucketConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            rate_secs: default_rate(),
        }
    }
}

fn default_capacity() -> u64 {
    10
}

fn default_rate() -> u64 {
    1
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Settings {
    /// Load settings from an optional YAML file, then apply
    /// `RATELIMITER__*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration file");
            let name = path.to_str().ok_or_else(|| {
                RateLimiterError::Config("configuration path is not valid UTF-8".to_string())
            })?;
            builder = builder.add_source(File::new(name, FileFormat::Yaml));
        }

        let settings: Settings = builder
            .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?
            .try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Parse settings from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let settings: Settings = serde_yaml::from_str(yaml)
            .map_err(|e| RateLimiterError::Config(format!("Failed to parse settings: {}", e)))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reject limiter parameters the engines cannot work with.
    pub fn validate(&self) -> Result<()> {
        let zero = [
            ("fixed_window.size_secs", self.fixed_window.size_secs),
            ("fixed_window.threshold", self.fixed_window.threshold),
            (
                "fixed_window.sweep_interval_secs",
                self.fixed_window.sweep_interval_secs.unwrap_or(1),
            ),
            ("token_bucket.capacity", self.token_bucket.capacity),
            ("token_bucket.rate_secs", self.token_bucket.rate_secs),
        ]
        .into_iter()
        .find(|(_, value)| *value == 0);

        match zero {
            Some((field, _)) => Err(RateLimiterError::Config(format!(
                "{} must be greater than zero",
                field
            ))),
            None => Ok(()),
        }
    }
}
