//! Admission trait shared by the fixed-window counter and the token bucket.

use async_trait::async_trait;

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The request may proceed.
    Allow,
    /// The key is over its limit; the request must be rejected.
    Deny,
}

impl Decision {
    /// Whether the request may proceed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow)
    }
}

impl From<bool> for Decision {
    fn from(allowed: bool) -> Self {
        if allowed {
            Decision::Allow
        } else {
            Decision::Deny
        }
    }
}

/// Trait for rate limiter implementations.
///
/// This trait abstracts over the `FixedWindowCounter` and the `TokenBucket`
/// so the HTTP middleware can guard a route with either.
#[async_trait]
pub trait RateLimiterBackend: Send + Sync {
    /// Run the limiter's decision operation for `key`, consuming one unit.
    async fn check(&self, key: &str) -> Decision;

    /// Short name of the algorithm, used in logs.
    fn name(&self) -> &'static str;
}
