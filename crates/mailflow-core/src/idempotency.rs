//! Duplicate suppression for email submissions.
//!
//! An event ID admitted once within the window is a duplicate on every later
//! submission inside that window, regardless of payload. The check and the
//! record are one atomic operation under a single mutex, so two concurrent
//! submissions of the same event ID can never both be admitted.

use crate::EventId;
use chrono::{DateTime, Duration, Utc};
use mailflow_runtime::{Clock, SystemClock};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[cfg(test)]
#[path = "idempotency_tests.rs"]
mod tests;

/// Default suppression window
const DEFAULT_WINDOW_HOURS: i64 = 24;

/// How often expired records are swept out, amortized into admissions
const SWEEP_INTERVAL_MINUTES: i64 = 5;

/// Outcome of an admission check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// First sighting within the window; the submission proceeds
    Fresh,
    /// Already seen within the window; the submission is suppressed
    Duplicate,
}

struct GuardState {
    first_seen: HashMap<EventId, DateTime<Utc>>,
    last_sweep: DateTime<Utc>,
}

/// In-process idempotency guard with a fixed suppression window
///
/// Owned by the submission service instance; restarting the process clears
/// the window, which at-least-once delivery already tolerates.
pub struct IdempotencyGuard {
    state: Mutex<GuardState>,
    window: Duration,
    sweep_interval: Duration,
    clock: Arc<dyn Clock>,
}

impl IdempotencyGuard {
    /// Create a guard with the default 24-hour window and system clock
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a guard with the default window on an explicit clock
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self::with_window(Duration::hours(DEFAULT_WINDOW_HOURS), clock)
    }

    /// Create a guard with an explicit window, for tests
    pub fn with_window(window: Duration, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        Self {
            state: Mutex::new(GuardState {
                first_seen: HashMap::new(),
                last_sweep: now,
            }),
            window,
            sweep_interval: Duration::minutes(SWEEP_INTERVAL_MINUTES),
            clock,
        }
    }

    /// Atomically check the event ID and record it when fresh
    ///
    /// A record older than the window counts as fresh and is overwritten
    /// with the current time; the window does not slide on duplicates.
    pub fn check_and_record(&self, event_id: &EventId) -> Admission {
        let now = self.clock.now();
        let mut state = self.state.lock().expect("idempotency lock poisoned");

        if now - state.last_sweep >= self.sweep_interval {
            let cutoff = now - self.window;
            state.first_seen.retain(|_, seen| *seen > cutoff);
            state.last_sweep = now;
        }

        match state.first_seen.get(event_id) {
            Some(seen) if now - *seen < self.window => Admission::Duplicate,
            _ => {
                state.first_seen.insert(event_id.clone(), now);
                Admission::Fresh
            }
        }
    }

    /// Remove a record so the event can be resubmitted
    ///
    /// Used by the submission service to compensate when a submission fails
    /// after admission but before the message reaches a queue.
    pub fn forget(&self, event_id: &EventId) {
        let mut state = self.state.lock().expect("idempotency lock poisoned");
        state.first_seen.remove(event_id);
    }
}

impl Default for IdempotencyGuard {
    fn default() -> Self {
        Self::new()
    }
}
