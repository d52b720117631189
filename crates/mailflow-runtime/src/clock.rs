//! Time source abstraction for the broker.
//!
//! Message availability, TTL expiry, and visibility timeouts are all driven
//! by the broker's clock. Abstracting it lets tests advance time explicitly
//! instead of sleeping through retry delays.

use chrono::{DateTime, Duration, Utc};
use std::sync::Mutex;

/// Source of the current time for broker bookkeeping
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time source used in production
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced time source for tests
pub struct ManualClock {
    current: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Create a manual clock starting at the current wall-clock time
    pub fn new() -> Self {
        Self {
            current: Mutex::new(Utc::now()),
        }
    }

    /// Create a manual clock starting at a fixed instant
    pub fn starting_at(instant: DateTime<Utc>) -> Self {
        Self {
            current: Mutex::new(instant),
        }
    }

    /// Advance the clock by the given duration
    pub fn advance(&self, duration: Duration) {
        let mut current = self.current.lock().expect("clock lock poisoned");
        *current = *current + duration;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.current.lock().expect("clock lock poisoned")
    }
}
