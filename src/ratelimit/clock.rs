//! Time sources for the rate limiters.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;

/// A source of "now" for window and refill bookkeeping.
///
/// Limiters hold an `Arc<dyn Clock>` so tests can pin time to a fixed
/// instant and move it across window boundaries without sleeping.
pub trait Clock: Send + Sync {
    /// The current instant.
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that returns whatever instant it was last set to.
#[derive(Debug)]
pub struct MockClock {
    now: Mutex<DateTime<Utc>>,
}

impl MockClock {
    /// Create a clock frozen at `now`.
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    /// Move the clock to `now`.
    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock() = now;
    }

    /// Move the clock forward by `delta`.
    pub fn advance(&self, delta: Duration) {
        let mut now = self.now.lock();
        *now += delta;
    }
}

impl Clock for MockClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_mock_clock_is_frozen() {
        let instant = Utc.with_ymd_and_hms(2024, 3, 2, 22, 33, 10).unwrap();
        let clock = MockClock::new(instant);

        assert_eq!(clock.now(), instant);
        assert_eq!(clock.now(), instant);
    }

    #[test]
    fn test_mock_clock_set_and_advance() {
        let clock = MockClock::new(Utc.with_ymd_and_hms(2024, 3, 2, 22, 33, 10).unwrap());

        clock.advance(Duration::seconds(5));
        assert_eq!(
            clock.now(),
            Utc.with_ymd_and_hms(2024, 3, 2, 22, 33, 15).unwrap()
        );

        let later = Utc.with_ymd_and_hms(2024, 3, 2, 22, 34, 10).unwrap();
        clock.set(later);
        assert_eq!(clock.now(), later);
    }

    #[test]
    fn test_system_clock_moves_forward() {
        let clock = SystemClock;
        let first = clock.now();
        let second = clock.now();
        assert!(second >= first);
    }
}
