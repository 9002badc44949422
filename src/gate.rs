//! Management-operation gate
//!
//! Zone resets and zone finishes interfere destructively with in-flight
//! writes, so they are not dispatched on arrival. Each of the two management
//! streams holds its requests in a side queue and releases at most one per
//! epoch, when the epoch timer (or a drain signal) has armed the stream and
//! one of the admission rules fires:
//!
//! 1. **Drain** — inflight write volume is below the stream's concurrency
//!    threshold; interference is cheap right now.
//! 2. **Tokens** — enough write volume has been dispatched since the last
//!    admission; heavy write traffic must not defer management forever.
//! 3. **Starvation** — the head request has been deferred for the maximum
//!    number of epochs; bound its worst-case latency.
//!
//! Otherwise the epoch is spent aging every held request by one hold.
//!
//! Held queues are LIFO: new management requests are pushed at the head and
//! admission pops the head, so the most recent command drains first while
//! older ones catch up through hold-count aging.
//!
//! The armed flag is set from timer and drain contexts without the scheduler
//! lock and consumed by the dispatcher with a compare-and-swap; the worst a
//! race can cost is one extra dispatch attempt or one missed epoch.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

use tracing::debug;

use crate::config::StreamParams;
use crate::queue::Rq;
use crate::stats::StreamDebug;

// =============================================================================
// Stream identity
// =============================================================================

/// Which management stream a gate instance serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Reset,
    Finish,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamKind::Reset => write!(f, "reset"),
            StreamKind::Finish => write!(f, "finish"),
        }
    }
}

/// Why an admission fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmitCause {
    Drain,
    Tokens,
    Starvation,
}

impl fmt::Display for AdmitCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdmitCause::Drain => write!(f, "drain"),
            AdmitCause::Tokens => write!(f, "tokens"),
            AdmitCause::Starvation => write!(f, "starvation"),
        }
    }
}

// =============================================================================
// Gate stream
// =============================================================================

/// Lock-free side of one management stream. The held queue itself lives in
/// the scheduler's locked state; everything here is touched from dispatch,
/// completion and timer contexts concurrently.
pub struct GateStream {
    kind: StreamKind,

    /// Epoch flag: set by the timer or a drain signal, consumed (CAS) by the
    /// dispatcher.
    armed: AtomicBool,

    /// In-flight write volume in 8 KiB units. Signed like the completion
    /// arithmetic that drives it: transient dips below zero must still
    /// compare below the drain threshold.
    pending_writes: AtomicI64,

    /// Write volume dispatched since this stream's last admission.
    dispatched_writes: AtomicU64,

    admitted_drain: AtomicU64,
    admitted_tokens: AtomicU64,
    admitted_starvation: AtomicU64,
    deferrals: AtomicU64,
}

impl GateStream {
    pub fn new(kind: StreamKind) -> Self {
        Self {
            kind,
            armed: AtomicBool::new(false),
            pending_writes: AtomicI64::new(0),
            dispatched_writes: AtomicU64::new(0),
            admitted_drain: AtomicU64::new(0),
            admitted_tokens: AtomicU64::new(0),
            admitted_starvation: AtomicU64::new(0),
            deferrals: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    /// Arm the stream for the next dispatch pass.
    pub fn arm(&self) {
        self.armed.store(true, Ordering::Release);
    }

    /// Consume the armed flag. At most one caller per epoch wins.
    pub fn consume(&self) -> bool {
        self.armed
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    #[inline]
    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::Acquire)
    }

    /// Account a write handed to the driver.
    pub fn note_write_dispatched(&self, units: u64) {
        self.dispatched_writes.fetch_add(units, Ordering::Relaxed);
        self.pending_writes.fetch_add(units as i64, Ordering::Relaxed);
    }

    /// Account a completed write.
    pub fn note_write_completed(&self, units: u64) {
        self.pending_writes.fetch_sub(units as i64, Ordering::Relaxed);
    }

    #[inline]
    pub fn pending_writes(&self) -> i64 {
        self.pending_writes.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn dispatched_writes(&self) -> u64 {
        self.dispatched_writes.load(Ordering::Relaxed)
    }

    /// Arm eagerly when the device is drained below the stream threshold.
    /// Called on management insert and on management completion.
    pub fn arm_if_drained(&self, params: &StreamParams) {
        if self.pending_writes() < params.minimum_concurrency_threshold as i64 {
            self.arm();
        }
    }

    /// Push a newly inserted management request. Head insert: the queue
    /// serves newest-first, aging the rest.
    pub fn hold(&self, queue: &mut VecDeque<Rq>, rq: Rq) {
        rq.reset_hold_count();
        queue.push_front(rq);
    }

    /// Run one armed epoch evaluation against the held queue. Returns the
    /// admitted request, or `None` after spending the epoch on aging.
    ///
    /// Must run under the scheduler lock; the inflight counter is read
    /// atomically and may be slightly stale, which is tolerated because the
    /// gate re-runs on every dispatch call.
    pub fn evaluate(
        &self,
        queue: &mut VecDeque<Rq>,
        params: &StreamParams,
    ) -> Option<(Rq, AdmitCause)> {
        let cause = if queue.is_empty() {
            None
        } else if self.pending_writes() < params.minimum_concurrency_threshold as i64 {
            Some(AdmitCause::Drain)
        } else if self.dispatched_writes() > params.command_tokens {
            Some(AdmitCause::Tokens)
        } else if queue
            .front()
            .map(|rq| rq.hold_count() >= params.maximum_epoch_holds)
            .unwrap_or(false)
        {
            Some(AdmitCause::Starvation)
        } else {
            None
        };

        match cause.and_then(|cause| queue.pop_front().map(|rq| (rq, cause))) {
            Some((rq, cause)) => {
                self.dispatched_writes.store(0, Ordering::Relaxed);
                self.counter_for(cause).fetch_add(1, Ordering::Relaxed);
                debug!(
                    stream = %self.kind,
                    %cause,
                    held = queue.len(),
                    holds = rq.hold_count(),
                    "admitting management request"
                );
                Some((rq, cause))
            }
            None => {
                for rq in queue.iter() {
                    rq.bump_hold_count();
                }
                if !queue.is_empty() {
                    self.deferrals.fetch_add(1, Ordering::Relaxed);
                }
                None
            }
        }
    }

    fn counter_for(&self, cause: AdmitCause) -> &AtomicU64 {
        match cause {
            AdmitCause::Drain => &self.admitted_drain,
            AdmitCause::Tokens => &self.admitted_tokens,
            AdmitCause::Starvation => &self.admitted_starvation,
        }
    }

    pub fn admitted(&self) -> u64 {
        self.admitted_drain.load(Ordering::Relaxed)
            + self.admitted_tokens.load(Ordering::Relaxed)
            + self.admitted_starvation.load(Ordering::Relaxed)
    }

    pub fn debug(&self, queue: &VecDeque<Rq>) -> StreamDebug {
        StreamDebug {
            queued: queue.len(),
            armed: self.is_armed(),
            pending_writes: self.pending_writes().max(0) as u64,
            dispatched_writes: self.dispatched_writes(),
            admitted_drain: self.admitted_drain.load(Ordering::Relaxed),
            admitted_tokens: self.admitted_tokens.load(Ordering::Relaxed),
            admitted_starvation: self.admitted_starvation.load(Ordering::Relaxed),
            deferrals: self.deferrals.load(Ordering::Relaxed),
            head_hold_count: queue.front().map(|rq| rq.hold_count()),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
