//! Time sources.
//!
//! Every component that measures elapsed time (bucket refill, breaker recovery,
//! cache expiry, coalescing windows) reads it through [`Clock`], so tests can
//! drive time explicitly with [`ManualClock`] instead of sleeping.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;

use crate::sync::lock_unpoisoned;
use crate::Timestamp;

/// A monotonic clock plus a wall clock for reporting.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Monotonic now, used for all elapsed-time arithmetic.
    fn now(&self) -> Instant;

    /// Wall-clock now, used only for timestamps that leave the process.
    fn wall(&self) -> Timestamp;
}

/// Shared handle to a clock.
pub type SharedClock = Arc<dyn Clock>;

/// The real clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn wall(&self) -> Timestamp {
        Utc::now()
    }
}

/// Convenience constructor for the shared system clock.
pub fn system_clock() -> SharedClock {
    Arc::new(SystemClock)
}

/// A clock that only moves when told to.
pub struct ManualClock {
    origin: Instant,
    wall_origin: Timestamp,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            wall_origin: Utc::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    /// Create a shared manual clock.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Move time forward.
    pub fn advance(&self, by: Duration) {
        let mut offset = lock_unpoisoned(&self.offset);
        *offset += by;
    }

    /// Move time forward by whole milliseconds.
    pub fn advance_ms(&self, ms: u64) {
        self.advance(Duration::from_millis(ms));
    }

    /// Total time advanced since creation.
    pub fn elapsed(&self) -> Duration {
        *lock_unpoisoned(&self.offset)
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + self.elapsed()
    }

    fn wall(&self) -> Timestamp {
        let offset = chrono::Duration::from_std(self.elapsed()).unwrap_or(chrono::Duration::zero());
        self.wall_origin + offset
    }
}

impl fmt::Debug for ManualClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualClock")
            .field("elapsed", &self.elapsed())
            .finish()
    }
}
