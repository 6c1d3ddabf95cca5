//! Time utilities and constants.

use chrono::{DateTime, Duration, Utc};

/// Timing constants.
pub mod constants {
    use super::Duration;

    /// Lifetime of an exchange quote (2 minutes).
    pub fn quote_ttl() -> Duration {
        Duration::minutes(2)
    }
}

/// A UTC timestamp.
pub type Timestamp = DateTime<Utc>;

/// Get the current timestamp.
pub fn now() -> Timestamp {
    Utc::now()
}

/// Source of the current time. Injected so quote expiry can be tested.
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;

    /// Whether `expiry` is at or before the current time.
    fn is_expired(&self, expiry: Timestamp) -> bool {
        self.now() >= expiry
    }
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        now()
    }
}

/// A clock that only moves when told to.
#[cfg(any(test, feature = "test-utils"))]
#[derive(Debug)]
pub struct ManualClock {
    current: parking_lot::Mutex<Timestamp>,
}

#[cfg(any(test, feature = "test-utils"))]
impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self {
            current: parking_lot::Mutex::new(start),
        }
    }

    pub fn starting_now() -> Self {
        Self::new(now())
    }

    pub fn advance(&self, by: Duration) {
        *self.current.lock() += by;
    }

    pub fn set(&self, to: Timestamp) {
        *self.current.lock() = to;
    }
}

#[cfg(any(test, feature = "test-utils"))]
impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        *self.current.lock()
    }
}
