//! Token bucket rate limiter.
//!
//! Every key owns up to `capacity` tokens. Each admitted request takes one;
//! a background loop puts one back per key every `rate` seconds until the
//! bucket is full again. Refill happens in whole ticks, there is no
//! fractional accrual between them.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use super::backend::{Decision, RateLimiterBackend};
use super::clock::Clock;
use super::task::LoopGuard;
use crate::error::{RateLimiterError, Result};

/// Returned by [`TokenBucket::remove`] when the key has no tokens left.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("out of tokens")]
pub struct OutOfTokens;

/// Tokens held by one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketEntry {
    /// Tokens left to spend
    pub tokens: u64,
    /// When the entry was created or last consumed from
    pub last_update: DateTime<Utc>,
}

/// Per-key token bucket.
///
/// Entries are created on first use and never evicted. Note the asymmetry on
/// unknown keys: [`add`](Self::add) creates a full bucket, while
/// [`remove`](Self::remove) creates one already missing the token it spends.
pub struct TokenBucket {
    capacity: u64,
    /// Seconds between refill ticks
    rate: u64,
    buckets: RwLock<HashMap<String, BucketEntry>>,
    clock: Arc<dyn Clock>,
    shutdown: CancellationToken,
    refilling: AtomicBool,
}

impl TokenBucket {
    /// Create a bucket of `capacity` tokens per key, refilled one token every
    /// `rate` seconds.
    pub fn new(capacity: u64, rate: u64, clock: Arc<dyn Clock>) -> Result<Self> {
        if capacity == 0 {
            return Err(RateLimiterError::Config(
                "token bucket capacity must be greater than zero".to_string(),
            ));
        }
        if rate == 0 {
            return Err(RateLimiterError::Config(
                "token bucket rate must be greater than zero".to_string(),
            ));
        }

        Ok(Self {
            capacity,
            rate,
            buckets: RwLock::new(HashMap::new()),
            clock,
            shutdown: CancellationToken::new(),
            refilling: AtomicBool::new(false),
        })
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Period between refill ticks.
    pub fn rate(&self) -> Duration {
        Duration::from_secs(self.rate)
    }

    /// Credit one token to `key`, creating a full bucket for unknown keys.
    pub fn add(&self, key: &str) {
        let mut buckets = self.buckets.write();

        match buckets.get_mut(key) {
            None => {
                buckets.insert(
                    key.to_string(),
                    BucketEntry {
                        tokens: self.capacity,
                        last_update: self.clock.now(),
                    },
                );
            }
            Some(entry) if entry.tokens < self.capacity => entry.tokens += 1,
            Some(_) => {}
        }
    }

    /// Spend one token of `key`.
    ///
    /// An unknown key starts with `capacity - 1` tokens. Fails without
    /// touching the bucket when it is empty.
    pub fn remove(&self, key: &str) -> std::result::Result<(), OutOfTokens> {
        let now = self.clock.now();
        let mut buckets = self.buckets.write();

        match buckets.get_mut(key) {
            None => {
                buckets.insert(
                    key.to_string(),
                    BucketEntry {
                        tokens: self.capacity - 1,
                        last_update: now,
                    },
                );
                trace!(key = %key, tokens = self.capacity - 1, "Created token bucket");
                Ok(())
            }
            Some(entry) if entry.tokens == 0 => {
                debug!(key = %key, "Token bucket exhausted");
                Err(OutOfTokens)
            }
            Some(entry) => {
                entry.tokens -= 1;
                entry.last_update = now;
                trace!(key = %key, tokens = entry.tokens, "Consumed token");
                Ok(())
            }
        }
    }

    /// Tokens left for `key`; zero for keys never seen.
    pub fn remaining(&self, key: &str) -> u64 {
        self.buckets
            .read()
            .get(key)
            .map(|entry| entry.tokens)
            .unwrap_or(0)
    }

    /// Snapshot of the entry for `key`, if any.
    pub fn entry(&self, key: &str) -> Option<BucketEntry> {
        self.buckets.read().get(key).copied()
    }

    /// Number of keys currently tracked.
    pub fn key_count(&self) -> usize {
        self.buckets.read().len()
    }

    /// Apply one refill tick: every key below capacity gains a token.
    ///
    /// Returns the number of keys that were topped up.
    pub fn refill(&self) -> usize {
        let mut buckets = self.buckets.write();
        Self::refill_locked(&mut buckets, self.capacity)
    }

    fn refill_locked(buckets: &mut HashMap<String, BucketEntry>, capacity: u64) -> usize {
        let mut refilled = 0;
        for entry in buckets.values_mut() {
            if entry.tokens < capacity {
                entry.tokens += 1;
                refilled += 1;
            }
        }
        refilled
    }

    /// Refill tick as run by the loop. `None` once the bucket is stopped.
    fn refill_unless_stopped(&self) -> Option<usize> {
        let mut buckets = self.buckets.write();
        // stop() may have raced the tick; it waits on this lock.
        if self.shutdown.is_cancelled() {
            return None;
        }
        Some(Self::refill_locked(&mut buckets, self.capacity))
    }

    /// Refill every `rate` seconds until [`stop`](Self::stop) is called.
    ///
    /// The first tick lands one period after the loop starts. Only one loop
    /// may run per bucket; a second call fails with
    /// [`RateLimiterError::RefillRunning`].
    pub async fn run_refill(&self) -> Result<()> {
        let _guard =
            LoopGuard::acquire(&self.refilling).ok_or(RateLimiterError::RefillRunning)?;
        let period = self.rate();
        let mut ticker = interval_at(Instant::now() + period, period);

        info!(rate_secs = self.rate, capacity = self.capacity, "Starting token refill");

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => match self.refill_unless_stopped() {
                    Some(refilled) => trace!(refilled = refilled, "Refill tick"),
                    None => break,
                },
            }
        }

        info!("Token refill stopped");
        Ok(())
    }

    /// Spawn [`run_refill`](Self::run_refill) onto the tokio runtime.
    pub fn spawn_refill(self: &Arc<Self>) -> JoinHandle<Result<()>> {
        let bucket = Arc::clone(self);
        tokio::spawn(async move { bucket.run_refill().await })
    }

    /// Stop the refill loop.
    ///
    /// Idempotent, and fine to call when no loop is running. Once this returns
    /// no further tick changes any bucket. A stopped bucket cannot start a
    /// new refill loop.
    pub fn stop(&self) {
        self.shutdown.cancel();
        // Wait out a tick that is already holding the lock.
        drop(self.buckets.write());
    }
}

#[async_trait]
impl RateLimiterBackend for TokenBucket {
    async fn check(&self, key: &str) -> Decision {
        Decision::from(self.remove(key).is_ok())
    }

    fn name(&self) -> &'static str {
        "token_bucket"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::{MockClock, SystemClock};
    use chrono::TimeZone;
    use tokio_test::{assert_err, assert_ok};

    const IP: &str = "127.0.0.1";

    fn bucket(capacity: u64, rate: u64) -> TokenBucket {
        TokenBucket::new(capacity, rate, Arc::new(SystemClock)).unwrap()
    }

    #[test]
    fn test_rejects_zero_parameters() {
        assert!(matches!(
            TokenBucket::new(0, 1, Arc::new(SystemClock)),
            Err(RateLimiterError::Config(_))
        ));
        assert!(matches!(
            TokenBucket::new(10, 0, Arc::new(SystemClock)),
            Err(RateLimiterError::Config(_))
        ));
    }

    #[test]
    fn test_remaining_unknown_key() {
        let tb = bucket(10, 1);

        assert_eq!(tb.remaining(IP), 0);
        assert_eq!(tb.key_count(), 0);
        assert!(tb.entry(IP).is_none());
    }

    #[test]
    fn test_add_token() {
        let tb = bucket(10, 1);

        tb.add(IP);
        tb.add(IP);
        tb.add(IP);

        assert_eq!(tb.remaining(IP), 10);
    }

    #[test]
    fn test_add_below_capacity() {
        let tb = bucket(10, 1);

        tb.remove(IP).unwrap();
        tb.remove(IP).unwrap();
        assert_eq!(tb.remaining(IP), 8);

        tb.add(IP);
        assert_eq!(tb.remaining(IP), 9);

        for _ in 0..5 {
            tb.add(IP);
        }
        assert_eq!(tb.remaining(IP), 10);
    }

    #[test]
    fn test_remove_token() {
        let tb = bucket(10, 1);

        assert_ok!(tb.remove(IP));
        assert_eq!(tb.remaining(IP), 9);
    }

    #[test]
    fn test_remove_until_empty() {
        let tb = bucket(3, 1);

        for expected in [2, 1, 0] {
            assert_ok!(tb.remove(IP));
            assert_eq!(tb.remaining(IP), expected);
        }

        assert_eq!(assert_err!(tb.remove(IP)), OutOfTokens);
        assert_eq!(tb.remaining(IP), 0);
    }

    #[test]
    fn test_capacity_one() {
        let tb = bucket(1, 1);

        assert_ok!(tb.remove(IP));
        assert_err!(tb.remove(IP));

        tb.refill();
        assert_ok!(tb.remove(IP));
    }

    #[test]
    fn test_entry_timestamps_follow_clock() {
        let clock = Arc::new(MockClock::new(
            Utc.with_ymd_and_hms(2024, 3, 2, 22, 33, 10).unwrap(),
        ));
        let tb = TokenBucket::new(10, 1, clock.clone()).unwrap();

        tb.remove(IP).unwrap();
        assert_eq!(
            tb.entry(IP).unwrap().last_update,
            Utc.with_ymd_and_hms(2024, 3, 2, 22, 33, 10).unwrap()
        );

        clock.advance(chrono::Duration::seconds(3));
        tb.remove(IP).unwrap();
        assert_eq!(
            tb.entry(IP).unwrap().last_update,
            Utc.with_ymd_and_hms(2024, 3, 2, 22, 33, 13).unwrap()
        );
    }

    #[test]
    fn test_refill_tick_caps_at_capacity() {
        let tb = bucket(10, 1);

        tb.remove("a").unwrap();
        tb.remove("b").unwrap();
        tb.remove("b").unwrap();
        tb.add("c");

        assert_eq!(tb.refill(), 2);
        assert_eq!(tb.remaining("a"), 10);
        assert_eq!(tb.remaining("b"), 9);
        assert_eq!(tb.remaining("c"), 10);

        assert_eq!(tb.refill(), 1);
        assert_eq!(tb.remaining("b"), 10);
        assert_eq!(tb.refill(), 0);
    }

    #[test]
    fn test_concurrent_removes_are_not_lost() {
        let tb = Arc::new(bucket(100, 1));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let tb = Arc::clone(&tb);
                std::thread::spawn(move || (0..25).filter(|_| tb.remove(IP).is_ok()).count())
            })
            .collect();

        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();

        assert_eq!(admitted, 100);
        assert_eq!(tb.remaining(IP), 0);
    }

    #[tokio::test]
    async fn test_backend_check() {
        let tb = bucket(1, 1);

        assert_eq!(tb.check(IP).await, Decision::Allow);
        assert_eq!(tb.check(IP).await, Decision::Deny);
        assert_eq!(tb.name(), "token_bucket");
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill() {
        let tb = Arc::new(bucket(10, 1));

        assert_eq!(tb.remaining(IP), 0);
        tb.remove(IP).unwrap();
        assert_eq!(tb.remaining(IP), 9);

        let handle = tb.spawn_refill();

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(tb.remaining(IP), 10);

        tb.stop();
        assert_ok!(handle.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_one_token_per_tick() {
        let tb = Arc::new(bucket(10, 2));
        for _ in 0..5 {
            tb.remove(IP).unwrap();
        }

        let handle = tb.spawn_refill();

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(tb.remaining(IP), 6);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(tb.remaining(IP), 7);

        tb.stop();
        assert_ok!(handle.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_refill_after_stop() {
        let tb = Arc::new(bucket(10, 1));
        tb.remove(IP).unwrap();
        tb.remove(IP).unwrap();

        let handle = tb.spawn_refill();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(tb.remaining(IP), 9);

        tb.stop();
        assert_ok!(handle.await.unwrap());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(tb.remaining(IP), 9);
    }

    #[tokio::test]
    async fn test_stop_without_loop_and_twice() {
        let tb = bucket(10, 1);

        tb.stop();
        tb.stop();

        // A stopped bucket's loop exits at once.
        assert_ok!(tb.run_refill().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_refill_is_rejected() {
        let tb = Arc::new(bucket(10, 1));

        let first = tb.spawn_refill();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(matches!(
            tb.run_refill().await,
            Err(RateLimiterError::RefillRunning)
        ));

        tb.stop();
        assert_ok!(first.await.unwrap());
    }
}
