//! Monotonic time source for deadline bookkeeping
//!
//! All scheduler deadlines (FIFO expiry, priority aging, epoch timers) are
//! expressed in nanoseconds on a monotonic axis. The axis is provided by a
//! [`Clock`] so that tests can drive time by hand while production uses the
//! system monotonic clock.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// A point on the scheduler's monotonic time axis, in nanoseconds.
pub type Tick = u64;

/// Convert a duration to ticks, saturating on overflow.
#[inline]
pub fn ticks(d: Duration) -> Tick {
    d.as_nanos().min(u128::from(u64::MAX)) as u64
}

/// Monotonic time source.
pub trait Clock: Send + Sync {
    /// Current position on the monotonic axis.
    fn now(&self) -> Tick;
}

/// System monotonic clock. Tick zero is the instant the clock was created.
pub struct SystemClock {
    base: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Tick {
        ticks(self.base.elapsed())
    }
}

/// Manually advanced clock for deterministic tests.
///
/// Time never moves unless [`ManualClock::advance`] or [`ManualClock::set`]
/// is called.
pub struct ManualClock {
    now: Mutex<Tick>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self { now: Mutex::new(0) }
    }

    /// Move time forward by `d`.
    pub fn advance(&self, d: Duration) {
        let mut now = self.now.lock();
        *now = now.saturating_add(ticks(d));
    }

    /// Jump to an absolute tick. Panics if this would move time backwards.
    pub fn set(&self, tick: Tick) {
        let mut now = self.now.lock();
        assert!(tick >= *now, "manual clock cannot move backwards");
        *now = tick;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Tick {
        *self.now.lock()
    }
}
