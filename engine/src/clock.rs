//! Monotonic wall clock for ordering mutations and stamping stored values.
//!
//! Wall-clock milliseconds can repeat or step backwards (NTP adjustments,
//! a device clock being fixed by hand). Queue ordering must not, so every
//! stamp handed out is strictly greater than the previous one.

use crate::Timestamp;
use std::sync::atomic::{AtomicU64, Ordering};

/// A clock that never hands out the same or a smaller timestamp twice.
///
/// Ordering rules:
/// 1. The stamp is the current wall-clock time in milliseconds
/// 2. If that is not after the last stamp, the last stamp plus one is used
#[derive(Debug, Default)]
pub struct MonotonicClock {
    last: AtomicU64,
}

impl MonotonicClock {
    /// Create a clock with no history.
    pub fn new() -> Self {
        Self {
            last: AtomicU64::new(0),
        }
    }

    /// Create a clock whose next stamp is guaranteed to exceed `last`.
    pub fn starting_after(last: Timestamp) -> Self {
        Self {
            last: AtomicU64::new(last),
        }
    }

    /// Current wall-clock time in milliseconds since the epoch.
    pub fn wall_millis() -> Timestamp {
        chrono::Utc::now().timestamp_millis().max(0) as Timestamp
    }

    /// Produce the next stamp.
    pub fn tick(&self) -> Timestamp {
        self.tick_at(Self::wall_millis())
    }

    /// Produce the next stamp given an observed wall-clock reading.
    pub fn tick_at(&self, wall: Timestamp) -> Timestamp {
        let mut current = self.last.load(Ordering::Acquire);
        loop {
            let next = wall.max(current + 1);
            match self
                .last
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return next,
                Err(actual) => current = actual,
            }
        }
    }

    /// Advance the clock to be at least `seen`.
    /// Used when loading stamps persisted by an earlier process.
    pub fn observe(&self, seen: Timestamp) {
        self.last.fetch_max(seen, Ordering::AcqRel);
    }

    /// The last stamp handed out (or observed).
    pub fn last(&self) -> Timestamp {
        self.last.load(Ordering::Acquire)
    }
}
