//! Error types for the rate limiter service.

use thiserror::Error;

use crate::ratelimit::OutOfTokens;

/// Main error type for rate limiter operations.
#[derive(Error, Debug)]
pub enum RateLimiterError {
    /// Configuration-related errors, including invalid limiter parameters
    #[error("Configuration error: {0}")]
    Config(String),

    /// A token bucket has no tokens left for the key
    #[error("Rate limit error: {0}")]
    OutOfTokens(#[from] OutOfTokens),

    /// A refill loop is already running for this bucket
    #[error("Refill loop already running")]
    RefillRunning,

    /// A sweep loop is already running for this counter
    #[error("Sweep loop already running")]
    SweepRunning,

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<::config::ConfigError> for RateLimiterError {
    fn from(err: ::config::ConfigError) -> Self {
        RateLimiterError::Config(err.to_string())
    }
}

/// Result type alias for rate limiter operations.
pub type Result<T> = std::result::Result<T, RateLimiterError>;
