//! Epoch timers
//!
//! A management stream becomes eligible for one admission per epoch. The
//! timer is a signal, nothing more: when an epoch boundary passes, the
//! stream's armed flag is set and the timer re-arms itself; all real work
//! happens later, on the dispatch path, under the scheduler lock. Doing any
//! queue work from timer context would deadlock against that lock.
//!
//! The deadline arithmetic lives in [`EpochTimer`] and is driven from two
//! places: the dispatch path polls it (so a busy device observes epochs with
//! no extra machinery), and the optional [`EpochTimerDriver`] background
//! tasks poll it so epochs keep firing while the device is idle. Both go
//! through the same compare-and-swap, so an epoch fires exactly once no
//! matter who notices it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::debug;

use crate::clock::Tick;
use crate::gate::StreamKind;
use crate::scheduler::ZincScheduler;

// =============================================================================
// Epoch deadline arithmetic
// =============================================================================

/// Periodic one-shot-at-a-time deadline. `fire_if_due` returns true exactly
/// once per elapsed period.
pub struct EpochTimer {
    next_fire: AtomicU64,
}

impl EpochTimer {
    pub fn new() -> Self {
        Self {
            next_fire: AtomicU64::new(Tick::MAX),
        }
    }

    /// Arm the first epoch, `period` from `now`.
    pub fn start(&self, now: Tick, period: Tick) {
        self.next_fire.store(now.saturating_add(period), Ordering::Release);
    }

    /// If the deadline has passed, advance it by one period (skipping any
    /// periods that elapsed unobserved) and report the fire. Exactly one
    /// caller wins per deadline.
    pub fn fire_if_due(&self, now: Tick, period: Tick) -> bool {
        let period = period.max(1);
        loop {
            let deadline = self.next_fire.load(Ordering::Acquire);
            if now < deadline {
                return false;
            }
            let mut next = deadline.saturating_add(period);
            if next <= now {
                next = now.saturating_add(period);
            }
            if self
                .next_fire
                .compare_exchange(deadline, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }

    #[cfg(test)]
    fn next_fire(&self) -> Tick {
        self.next_fire.load(Ordering::Acquire)
    }
}

impl Default for EpochTimer {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Background driver
// =============================================================================

/// Background tasks that keep the epoch timers ticking while no I/O is being
/// dispatched. One task per stream; each sleeps roughly one epoch, then runs
/// the shared tick path. Stop is synchronous from the caller's perspective:
/// when `stop` returns, no tick can run anymore.
pub struct EpochTimerDriver {
    running: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

impl EpochTimerDriver {
    /// Spawn the per-stream arming tasks on the current tokio runtime.
    pub fn spawn(scheduler: Arc<ZincScheduler>) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let mut handles = Vec::with_capacity(2);

        for kind in [StreamKind::Reset, StreamKind::Finish] {
            let scheduler = Arc::clone(&scheduler);
            let running = Arc::clone(&running);
            handles.push(tokio::spawn(async move {
                debug!(stream = %kind, "epoch timer task started");
                while running.load(Ordering::Acquire) {
                    tokio::time::sleep(scheduler.epoch_period(kind)).await;
                    if !running.load(Ordering::Acquire) {
                        break;
                    }
                    scheduler.tick_epoch_timer(kind);
                }
                debug!(stream = %kind, "epoch timer task stopped");
            }));
        }

        Self { running, handles }
    }

    /// Stop both tasks and wait for any in-flight tick to finish.
    pub async fn stop(self) {
        self.running.store(false, Ordering::Release);
        for handle in self.handles {
            handle.abort();
            let _ = handle.await;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
