//! Fixed-window counter rate limiter.
//!
//! Time is cut into `size`-second windows aligned on the Unix epoch. Each key
//! may make `threshold` requests per window; the window a request falls in is
//! `floor(now / size) * size`. Counts for windows other than the current one
//! are dead weight and are reclaimed by [`FixedWindowCounter::expire_past_windows`].

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use super::backend::{Decision, RateLimiterBackend};
use super::clock::Clock;
use super::task::LoopGuard;
use crate::error::{RateLimiterError, Result};

/// Requests counted for one key within one window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowEntry {
    /// Admitted requests in this window
    pub count: u64,
    /// When the count last changed
    pub last_update: DateTime<Utc>,
}

/// Per-key, per-window request counter.
///
/// All state sits behind one reader/writer lock: `count` and `entries` share
/// it, while `increment` and the sweep take it exclusively.
pub struct FixedWindowCounter {
    /// Window length in seconds
    size: i64,
    /// Maximum admitted requests per key per window
    threshold: u64,
    /// key -> window start -> entry
    windows: RwLock<HashMap<String, HashMap<i64, WindowEntry>>>,
    clock: Arc<dyn Clock>,
    shutdown: CancellationToken,
    sweeping: AtomicBool,
}

impl FixedWindowCounter {
    /// Create a counter admitting `threshold` requests per `size`-second window.
    pub fn new(size: u64, threshold: u64, clock: Arc<dyn Clock>) -> Result<Self> {
        if size == 0 {
            return Err(RateLimiterError::Config(
                "fixed window size must be greater than zero".to_string(),
            ));
        }
        if threshold == 0 {
            return Err(RateLimiterError::Config(
                "fixed window threshold must be greater than zero".to_string(),
            ));
        }
        let size = i64::try_from(size).map_err(|_| {
            RateLimiterError::Config(format!("fixed window size {} is too large", size))
        })?;

        Ok(Self {
            size,
            threshold,
            windows: RwLock::new(HashMap::new()),
            clock,
            shutdown: CancellationToken::new(),
            sweeping: AtomicBool::new(false),
        })
    }

    /// Window length in seconds.
    pub fn size(&self) -> u64 {
        self.size as u64
    }

    /// Maximum admitted requests per key per window.
    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    /// Start of the window containing the clock's current instant.
    pub fn current_window(&self) -> i64 {
        self.window_of(self.clock.now())
    }

    fn window_of(&self, now: DateTime<Utc>) -> i64 {
        now.timestamp().div_euclid(self.size) * self.size
    }

    /// Count a request for `key` and decide whether it is admitted.
    ///
    /// Returns `false` once `threshold` requests were admitted in the current
    /// window; a denied request leaves the count untouched.
    pub fn increment(&self, key: &str) -> bool {
        let now = self.clock.now();
        let window = self.window_of(now);

        let mut windows = self.windows.write();
        let per_key = windows.entry(key.to_string()).or_default();

        match per_key.get_mut(&window) {
            None => {
                per_key.insert(
                    window,
                    WindowEntry {
                        count: 1,
                        last_update: now,
                    },
                );
                trace!(key = %key, window = window, "Opened new window");
                true
            }
            Some(entry) if entry.count >= self.threshold => {
                debug!(
                    key = %key,
                    window = window,
                    count = entry.count,
                    threshold = self.threshold,
                    "Fixed window limit exceeded"
                );
                false
            }
            Some(entry) => {
                entry.count += 1;
                entry.last_update = now;
                trace!(key = %key, window = window, count = entry.count, "Incremented window");
                true
            }
        }
    }

    /// Requests counted for `key` in the current window.
    pub fn count(&self, key: &str) -> u64 {
        let window = self.current_window();
        let windows = self.windows.read();
        windows
            .get(key)
            .and_then(|per_key| per_key.get(&window))
            .map(|entry| entry.count)
            .unwrap_or(0)
    }

    /// Snapshot of every window still held for `key`, swept or not.
    pub fn entries(&self, key: &str) -> HashMap<i64, WindowEntry> {
        let windows = self.windows.read();
        windows.get(key).cloned().unwrap_or_default()
    }

    /// Number of keys currently tracked.
    pub fn key_count(&self) -> usize {
        self.windows.read().len()
    }

    /// Drop every window other than the current one.
    ///
    /// Keys left without windows are removed. Returns the number of window
    /// entries removed.
    pub fn expire_past_windows(&self) -> usize {
        let window = self.current_window();
        let mut windows = self.windows.write();
        let mut removed = 0;

        windows.retain(|_, per_key| {
            let before = per_key.len();
            per_key.retain(|start, _| *start == window);
            removed += before - per_key.len();
            !per_key.is_empty()
        });

        removed
    }

    /// Sweep interval used when none is configured: two windows.
    pub fn default_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.size() * 2)
    }

    /// Run [`expire_past_windows`](Self::expire_past_windows) every `every`
    /// until [`stop`](Self::stop) is called.
    ///
    /// The first sweep happens one interval after the loop starts. Only one
    /// sweep loop may run per counter.
    pub async fn run_sweeper(&self, every: Duration) -> Result<()> {
        if every.is_zero() {
            return Err(RateLimiterError::Config(
                "sweep interval must be greater than zero".to_string(),
            ));
        }
        let _guard = LoopGuard::acquire(&self.sweeping).ok_or(RateLimiterError::SweepRunning)?;
        let mut ticker = interval_at(Instant::now() + every, every);

        info!(interval_secs = every.as_secs(), "Starting fixed window sweeper");

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let removed = self.expire_past_windows();
                    debug!(removed = removed, "Expired past windows");
                }
            }
        }

        info!("Fixed window sweeper stopped");
        Ok(())
    }

    /// Spawn [`run_sweeper`](Self::run_sweeper) onto the tokio runtime.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<Result<()>> {
        let counter = Arc::clone(self);
        tokio::spawn(async move { counter.run_sweeper(every).await })
    }

    /// Signal the sweep loop to exit. Safe to call any number of times.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }
}

#[async_trait]
impl RateLimiterBackend for FixedWindowCounter {
    async fn check(&self, key: &str) -> Decision {
        Decision::from(self.increment(key))
    }

    fn name(&self) -> &'static str {
        "fixed_window"
    }
}
