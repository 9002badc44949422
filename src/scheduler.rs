//! The ZINC scheduler core
//!
//! One [`ZincScheduler`] instance serves one attached device. The block
//! layer drives it through the elevator-style operation surface:
//!
//! - [`insert`](ZincScheduler::insert) / [`insert_requests`](ZincScheduler::insert_requests)
//! - [`dispatch`](ZincScheduler::dispatch)
//! - [`prepare_request`](ZincScheduler::prepare_request) / [`finish_request`](ZincScheduler::finish_request)
//! - [`bio_merge`](ZincScheduler::bio_merge), [`request_merge`](ZincScheduler::request_merge),
//!   [`requests_merged`](ZincScheduler::requests_merged), [`request_merged`](ZincScheduler::request_merged)
//! - [`has_work`](ZincScheduler::has_work), [`limit_depth`](ZincScheduler::limit_depth),
//!   [`depth_updated`](ZincScheduler::depth_updated)
//!
//! Dispatch order on every call: armed management streams first (reset, then
//! finish), then the priority-aging override, then strict-priority deadline
//! dispatch with sector-sorted batching and read/write starvation control.
//!
//! All queue state lives behind a single mutex held for the full duration of
//! each operation; none of these paths allocate, sleep or do I/O while
//! holding it. Zone write-lock state sits behind its own short lock because
//! completions touch it without entering the scheduler. A handful of
//! counters (inflight/dispatched write volume, per-priority completions,
//! armed flags) are atomics because completion and timer contexts update
//! them outside the mutex.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, trace, warn};

use crate::clock::{ticks, Clock, SystemClock, Tick};
use crate::config::SchedulerConfig;
use crate::error::{Error, Result};
use crate::gate::{GateStream, StreamKind};
use crate::queue::{PrioBucket, Rq};
use crate::request::{
    io_units_from_bytes, io_units_from_sectors, Bio, DataDir, Prio, ReqOp, SchedClass, PRIO_COUNT,
};
use crate::stats::{queued, CompletedCounters, DebugSnapshot, PrioCounters, PrioDebug, PrioStatsSnapshot, RequestEntry};
use crate::timer::EpochTimer;
use crate::zone::{DeviceInfo, ZoneWriteLocks};

// =============================================================================
// Merge verdicts
// =============================================================================

/// Outcome of the front-merge probe.
#[derive(Debug, Clone)]
pub enum MergeVerdict {
    /// No queued request can absorb the bio.
    None,
    /// The bio extends this queued request downward.
    Front(Rq),
    /// The candidate is discard-mergeable; multiple ranges may coalesce.
    Discard(Rq),
}

// =============================================================================
// Locked state
// =============================================================================

struct SchedState {
    per_prio: [PrioBucket; PRIO_COUNT],
    counters: [PrioCounters; PRIO_COUNT],

    /// Direction of the latest dispatched request.
    last_dir: DataDir,
    /// Length of the current sequential batch.
    batching: u32,
    /// Times reads have starved a pending write.
    starved: u32,

    reset_queue: VecDeque<Rq>,
    finish_queue: VecDeque<Rq>,

    next_seq: u64,
}

impl SchedState {
    fn new() -> Self {
        Self {
            per_prio: [PrioBucket::new(), PrioBucket::new(), PrioBucket::new()],
            counters: [PrioCounters::default(); PRIO_COUNT],
            last_dir: DataDir::Write,
            batching: 0,
            starved: 0,
            reset_queue: VecDeque::new(),
            finish_queue: VecDeque::new(),
            next_seq: 0,
        }
    }
}

// =============================================================================
// Scheduler
// =============================================================================

/// Deadline scheduler with gated zone-management admission; one instance per
/// attached zoned (or conventional) block device.
pub struct ZincScheduler {
    device: DeviceInfo,
    clock: Arc<dyn Clock>,

    config: RwLock<SchedulerConfig>,
    state: Mutex<SchedState>,
    zone_locks: ZoneWriteLocks,
    completed: CompletedCounters,

    reset_gate: GateStream,
    finish_gate: GateStream,
    reset_timer: EpochTimer,
    finish_timer: EpochTimer,

    /// Set by completions that unblocked zoned writes; the host polls it and
    /// re-runs the hardware queue.
    needs_restart: AtomicBool,

    /// Bios absorbed into queued requests.
    bio_merges: AtomicU64,
}

impl ZincScheduler {
    /// Attach to a device with the system clock.
    pub fn new(device: DeviceInfo, config: SchedulerConfig) -> Result<Self> {
        Self::with_clock(device, config, Arc::new(SystemClock::new()))
    }

    /// Attach with an explicit time source.
    pub fn with_clock(
        device: DeviceInfo,
        mut config: SchedulerConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        device.validate()?;
        config.validate()?;
        if config.async_depth == 0 {
            config.async_depth = (3 * device.nr_requests / 4).max(1);
        }

        let scheduler = Self {
            reset_timer: EpochTimer::new(),
            finish_timer: EpochTimer::new(),
            reset_gate: GateStream::new(StreamKind::Reset),
            finish_gate: GateStream::new(StreamKind::Finish),
            state: Mutex::new(SchedState::new()),
            zone_locks: ZoneWriteLocks::new(),
            completed: CompletedCounters::default(),
            config: RwLock::new(config),
            device,
            clock,
            needs_restart: AtomicBool::new(false),
            bio_merges: AtomicU64::new(0),
        };

        let now = scheduler.now();
        let config = scheduler.config.read();
        scheduler
            .reset_timer
            .start(now, ticks(config.reset.epoch_period()));
        scheduler
            .finish_timer
            .start(now, ticks(config.finish.epoch_period()));
        drop(config);

        info!(
            zoned = scheduler.device.zoned,
            rotational = scheduler.device.rotational,
            nr_requests = scheduler.device.nr_requests,
            "zinc scheduler attached"
        );
        Ok(scheduler)
    }

    #[inline]
    fn now(&self) -> Tick {
        self.clock.now()
    }

    /// Current position on the scheduler's time axis.
    pub fn clock_now(&self) -> Tick {
        self.now()
    }

    pub fn device(&self) -> &DeviceInfo {
        &self.device
    }

    fn gate(&self, kind: StreamKind) -> &GateStream {
        match kind {
            StreamKind::Reset => &self.reset_gate,
            StreamKind::Finish => &self.finish_gate,
        }
    }

    fn epoch_timer(&self, kind: StreamKind) -> &EpochTimer {
        match kind {
            StreamKind::Reset => &self.reset_timer,
            StreamKind::Finish => &self.finish_timer,
        }
    }

    // =========================================================================
    // Tuning knobs
    // =========================================================================

    /// Write a tuning knob by name; out-of-range values are clamped.
    pub fn set_attr(&self, name: &str, value: i64) -> Result<()> {
        self.config.write().set_attr(name, value)
    }

    /// Read a tuning knob by name.
    pub fn attr(&self, name: &str) -> Result<i64> {
        self.config.read().attr(name)
    }

    // =========================================================================
    // Epoch timers
    // =========================================================================

    /// Epoch period of a stream, floored to one timer tick.
    pub fn epoch_period(&self, kind: StreamKind) -> Duration {
        self.config
            .read()
            .stream(kind == StreamKind::Reset)
            .epoch_period()
    }

    /// Fire the stream's epoch timer if its deadline passed, arming the gate
    /// and re-arming the timer. Safe from any context; does nothing but flag
    /// work for the next dispatch pass.
    pub fn tick_epoch_timer(&self, kind: StreamKind) {
        let period = ticks(self.epoch_period(kind));
        if self.epoch_timer(kind).fire_if_due(self.now(), period) {
            self.gate(kind).arm();
        }
    }

    fn tick_epoch_timers(&self) {
        self.tick_epoch_timer(StreamKind::Reset);
        self.tick_epoch_timer(StreamKind::Finish);
    }

    /// Arm a stream directly, as a timer fire would.
    pub fn arm_epoch(&self, kind: StreamKind) {
        self.gate(kind).arm();
    }

    pub fn reset_gate_armed(&self) -> bool {
        self.reset_gate.is_armed()
    }

    pub fn finish_gate_armed(&self) -> bool {
        self.finish_gate.is_armed()
    }

    // =========================================================================
    // Insert
    // =========================================================================

    /// Called when the block layer allocates a request, before any insert.
    pub fn prepare_request(&self, rq: &Rq) {
        rq.clear_scheduled();
    }

    /// Insert one request. `at_head` routes reads/writes to the
    /// immediate-dispatch list instead of the sorted path.
    pub fn insert(&self, rq: Rq, at_head: bool) -> Result<()> {
        let mut state = self.state.lock();
        self.insert_locked(&mut state, rq, at_head)
    }

    /// Insert a batch under one lock acquisition. Unsupported requests are
    /// skipped and the first such error is returned after the rest have been
    /// inserted.
    pub fn insert_requests(
        &self,
        rqs: impl IntoIterator<Item = Rq>,
        at_head: bool,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let mut first_err = None;
        for rq in rqs {
            if let Err(err) = self.insert_locked(&mut state, rq, at_head) {
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn insert_locked(&self, state: &mut SchedState, rq: Rq, at_head: bool) -> Result<()> {
        // A requeue of a dispatched write may still hold its zone lock.
        self.zone_locks.unlock_for(&self.device, &rq);

        match rq.sched_class() {
            SchedClass::Reset => {
                rq.mark_scheduled();
                self.reset_gate.hold(&mut state.reset_queue, rq);
                self.reset_gate.arm_if_drained(&self.config.read().reset);
                trace!(held = state.reset_queue.len(), "held zone-reset");
                Ok(())
            }
            SchedClass::Finish => {
                rq.mark_scheduled();
                self.finish_gate.hold(&mut state.finish_queue, rq);
                self.finish_gate.arm_if_drained(&self.config.read().finish);
                trace!(held = state.finish_queue.len(), "held zone-finish");
                Ok(())
            }
            SchedClass::Other => Err(Error::UnsupportedOperation { op: rq.op() }),
            SchedClass::Read | SchedClass::Write => {
                let dir = match rq.data_dir() {
                    Some(dir) => dir,
                    None => return Err(Error::UnsupportedOperation { op: rq.op() }),
                };
                let prio = rq.prio();
                if rq.mark_scheduled() {
                    state.counters[prio.index()].bump_inserted();
                }

                if self.try_insert_merge(state, &rq) {
                    return Ok(());
                }

                rq.set_seq(state.next_seq);
                state.next_seq += 1;

                let now = self.now();
                let bucket = &mut state.per_prio[prio.index()];
                if at_head {
                    rq.set_fifo_deadline(now);
                    bucket.dispatch.push_front(rq);
                } else {
                    let expire = ticks(self.config.read().expire(dir));
                    rq.set_fifo_deadline(now.saturating_add(expire));
                    bucket.queue(rq, dir);
                }
                Ok(())
            }
        }
    }

    /// Coalesce an incoming request with a queued sector neighbor, the way
    /// the block layer's insertion-merge probe would. The absorbed request
    /// never enters the queues.
    fn try_insert_merge(&self, state: &mut SchedState, rq: &Rq) -> bool {
        let Some(dir) = rq.data_dir() else {
            return false;
        };
        let p = rq.prio().index();

        // Back merge: a queued request ends exactly where this one starts.
        let back = state.per_prio[p]
            .sort(dir)
            .nearest_starting_before(rq.sector())
            .filter(|prev| {
                prev.end_sector() == rq.sector()
                    && prev.op() == rq.op()
                    && prev.nr_sectors() + rq.nr_sectors() <= self.device.max_sectors
            });
        if let Some(prev) = back {
            prev.grow_back(rq.nr_sectors(), rq.data_len());
            state.counters[p].bump_merged();
            trace!(sector = prev.sector(), "insert back-merge");
            return true;
        }

        // Front merge: a queued request starts exactly where this one ends.
        let front = state.per_prio[p]
            .sort(dir)
            .find_starting_at(rq.end_sector())
            .filter(|next| {
                next.op() == rq.op()
                    && next.nr_sectors() + rq.nr_sectors() <= self.device.max_sectors
            });
        if let Some(next) = front {
            next.grow_front(&Bio::new(rq.op(), rq.sector(), rq.nr_sectors(), rq.io_class()));
            state.per_prio[p].reposition(&next, dir);
            state.counters[p].bump_merged();
            trace!(sector = next.sector(), "insert front-merge");
            return true;
        }

        false
    }

    // =========================================================================
    // Merge adapter
    // =========================================================================

    /// Front-merge probe: can some queued request absorb `bio` at its front?
    /// Honors the `front_merges` knob; discard-mergeable candidates get
    /// their own verdict.
    pub fn request_merge(&self, bio: &Bio) -> MergeVerdict {
        let state = self.state.lock();
        self.request_merge_locked(&state, bio)
    }

    fn request_merge_locked(&self, state: &SchedState, bio: &Bio) -> MergeVerdict {
        if !self.config.read().front_merges {
            return MergeVerdict::None;
        }
        let Some(dir) = bio.op.sched_class().data_dir() else {
            return MergeVerdict::None;
        };
        let p = Prio::from_class(bio.io_class).index();

        match state.per_prio[p].sort(dir).find_starting_at(bio.end_sector()) {
            Some(rq)
                if rq.op() == bio.op
                    && rq.nr_sectors() + bio.nr_sectors <= self.device.max_sectors =>
            {
                if rq.op() == ReqOp::Discard {
                    MergeVerdict::Discard(rq)
                } else {
                    MergeVerdict::Front(rq)
                }
            }
            _ => MergeVerdict::None,
        }
    }

    /// Try to merge `bio` into a queued request, back merge first, then the
    /// front-merge probe. Returns true if the bio was absorbed.
    pub fn bio_merge(&self, bio: &Bio) -> bool {
        let mut state = self.state.lock();
        let Some(dir) = bio.op.sched_class().data_dir() else {
            return false;
        };
        let p = Prio::from_class(bio.io_class).index();

        // Back merge against the request ending at the bio's start.
        let back = state.per_prio[p]
            .sort(dir)
            .nearest_starting_before(bio.sector)
            .filter(|prev| {
                prev.end_sector() == bio.sector
                    && prev.op() == bio.op
                    && prev.nr_sectors() + bio.nr_sectors <= self.device.max_sectors
            });
        if let Some(prev) = back {
            prev.grow_back(bio.nr_sectors, bio.bytes());
            self.bio_merges.fetch_add(1, Ordering::Relaxed);
            trace!(sector = prev.sector(), "bio back-merge");
            return true;
        }

        match self.request_merge_locked(&state, bio) {
            MergeVerdict::Front(rq) | MergeVerdict::Discard(rq) => {
                rq.grow_front(bio);
                state.per_prio[p].reposition(&rq, dir);
                self.bio_merges.fetch_add(1, Ordering::Relaxed);
                trace!(sector = rq.sector(), "bio front-merge");
                true
            }
            MergeVerdict::None => false,
        }
    }

    /// Post-merge bookkeeping for a request whose start sector moved:
    /// re-key it in its sector index.
    pub fn request_merged(&self, rq: &Rq) {
        let Some(dir) = rq.data_dir() else { return };
        let mut state = self.state.lock();
        state.per_prio[rq.prio().index()].reposition(rq, dir);
    }

    /// Callback after queued request `donor` has been coalesced into `rq`:
    /// fold the donor's span, inherit its earlier expiry deadline and FIFO
    /// position, and drop the donor from all queues.
    pub fn requests_merged(&self, rq: &Rq, donor: &Rq) {
        let mut state = self.state.lock();
        let p = donor.prio().index();
        state.counters[p].bump_merged();

        if rq.end_sector() == donor.sector() {
            rq.grow_back(donor.nr_sectors(), donor.data_len());
        }

        let bucket = &mut state.per_prio[p];
        bucket.inherit_fifo_position(rq, donor);
        bucket.remove(donor);
    }

    /// Bios absorbed into queued requests so far.
    pub fn bio_merge_count(&self) -> u64 {
        self.bio_merges.load(Ordering::Relaxed)
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    /// Hand the next request to the driver, or `None` when nothing is
    /// eligible right now.
    pub fn dispatch(&self) -> Option<Rq> {
        self.tick_epoch_timers();

        let mut state = self.state.lock();
        let now = self.now();
        let config = self.config.read().clone();

        let rq = self.dispatch_locked(&mut state, &config, now);

        if let Some(rq) = rq.as_ref() {
            if rq.sched_class() == SchedClass::Write {
                let units = io_units_from_bytes(rq.data_len());
                self.reset_gate.note_write_dispatched(units);
                self.finish_gate.note_write_dispatched(units);
            }
        }
        rq
    }

    fn dispatch_locked(
        &self,
        state: &mut SchedState,
        config: &SchedulerConfig,
        now: Tick,
    ) -> Option<Rq> {
        // Armed management streams come first, reset then finish. The armed
        // flag is consumed with a CAS so a concurrent timer fire costs at
        // most one extra evaluation.
        if self.reset_gate.consume() {
            if let Some((rq, _)) = self.reset_gate.evaluate(&mut state.reset_queue, &config.reset)
            {
                return Some(rq);
            }
        }
        if self.finish_gate.consume() {
            if let Some((rq, _)) =
                self.finish_gate.evaluate(&mut state.finish_queue, &config.finish)
            {
                return Some(rq);
            }
        }

        if let Some(rq) = self.dispatch_prio_aged(state, config, now) {
            return Some(rq);
        }

        // Strict priority order; a level with queued requests shadows every
        // lower level even when none of its requests are dispatchable.
        for prio in Prio::ALL {
            let rq = self.dispatch_from(state, config, prio, now, now as i64);
            if rq.is_some() {
                return rq;
            }
            if queued(&state.counters[prio.index()], self.completed.get(prio)) > 0 {
                break;
            }
        }
        None
    }

    /// Dispatch a non-realtime request that has been queued for longer than
    /// the aging horizon, bypassing strict priority.
    fn dispatch_prio_aged(
        &self,
        state: &mut SchedState,
        config: &SchedulerConfig,
        now: Tick,
    ) -> Option<Rq> {
        let prio_cnt = Prio::ALL
            .iter()
            .filter(|prio| {
                queued(&state.counters[prio.index()], self.completed.get(**prio)) > 0
            })
            .count();
        if prio_cnt < 2 {
            return None;
        }

        let latest_start = now as i64 - ticks(config.prio_aging_expire) as i64;
        for prio in [Prio::BestEffort, Prio::Idle] {
            if let Some(rq) = self.dispatch_from(state, config, prio, now, latest_start) {
                debug!(prio = %prio, sector = rq.sector(), "priority-aged dispatch");
                return Some(rq);
            }
        }
        None
    }

    /// Select the best request from one priority bucket: immediate list,
    /// then batch continuation, then direction selection with expiry
    /// override, bounded by `latest_start`.
    fn dispatch_from(
        &self,
        state: &mut SchedState,
        config: &SchedulerConfig,
        prio: Prio,
        now: Tick,
        latest_start: i64,
    ) -> Option<Rq> {
        let p = prio.index();

        if let Some(head) = state.per_prio[p].dispatch.front().cloned() {
            if self.started_after(config, &head, latest_start) {
                return None;
            }
            state.per_prio[p].dispatch.pop_front();
            return Some(self.finalize_dispatch(state, head));
        }

        let mut rq = None;
        if state.batching < config.fifo_batch {
            // Still entitled to continue the sequential batch.
            rq = self.eligible_next(state, p, state.last_dir);
        }

        if rq.is_none() {
            let dir = self.select_dir(state, config, p)?;

            // A deadline has expired, or there is no sector-sorted
            // continuation: restart from the earliest-expiring request.
            let next = self.eligible_next(state, p, dir);
            rq = if state.per_prio[p].fifo(dir).head_expired(now) || next.is_none() {
                self.eligible_fifo(state, p, dir)
            } else {
                next
            };
            // All queued writes may target locked zones.
            rq.as_ref()?;

            state.last_dir = dir;
            state.batching = 0;
        }

        let rq = rq?;
        if self.started_after(config, &rq, latest_start) {
            return None;
        }
        state.batching += 1;
        self.move_request(state, p, &rq);
        Some(self.finalize_dispatch(state, rq))
    }

    /// Pick the direction to serve: reads unless a dispatchable write has
    /// been starved `writes_starved` times.
    fn select_dir(
        &self,
        state: &mut SchedState,
        config: &SchedulerConfig,
        p: usize,
    ) -> Option<DataDir> {
        let has_reads = !state.per_prio[p].fifo(DataDir::Read).is_empty();
        let has_writes = !state.per_prio[p].fifo(DataDir::Write).is_empty();

        if has_reads {
            if has_writes && self.eligible_fifo(state, p, DataDir::Write).is_some() {
                let starved = state.starved;
                state.starved += 1;
                if i64::from(starved) >= i64::from(config.writes_starved) {
                    state.starved = 0;
                    return Some(DataDir::Write);
                }
            }
            return Some(DataDir::Read);
        }

        if has_writes {
            state.starved = 0;
            return Some(DataDir::Write);
        }
        None
    }

    /// Next request in arrival order that may be dispatched. For zoned
    /// writes, scan for an unlocked target zone; on rotational media only
    /// stream heads qualify so sequential runs stay intact.
    fn eligible_fifo(&self, state: &SchedState, p: usize, dir: DataDir) -> Option<Rq> {
        let bucket = &state.per_prio[p];
        let head = bucket.fifo(dir).head()?;
        if dir == DataDir::Read || !self.device.zoned {
            return Some(Arc::clone(head));
        }

        bucket
            .fifo(DataDir::Write)
            .iter()
            .find(|rq| {
                self.zone_locks.can_dispatch(&self.device, rq)
                    && (!self.device.rotational || !bucket.is_seq_write(rq))
            })
            .map(Arc::clone)
    }

    /// Next request in sector order from the batch cursor that may be
    /// dispatched. Locked-zone candidates are skipped one by one on
    /// non-rotational devices and as whole sequential runs on rotational
    /// ones.
    fn eligible_next(&self, state: &SchedState, p: usize, dir: DataDir) -> Option<Rq> {
        let bucket = &state.per_prio[p];
        let mut rq = bucket.next_rq(dir)?;
        if dir == DataDir::Read || !self.device.zoned {
            return Some(rq);
        }

        loop {
            if self.zone_locks.can_dispatch(&self.device, &rq) {
                return Some(rq);
            }
            rq = if !self.device.rotational {
                bucket.sort(dir).latter(&rq)?
            } else {
                bucket.skip_seq_writes(rq)?
            };
        }
    }

    /// True iff `rq` was inserted after `latest_start` on the time axis.
    fn started_after(&self, config: &SchedulerConfig, rq: &Rq, latest_start: i64) -> bool {
        let Some(dir) = rq.data_dir() else {
            return false;
        };
        let start = rq.fifo_deadline() as i64 - ticks(config.expire(dir)) as i64;
        start > latest_start
    }

    /// Advance the direction cursor past `rq` and take it off the sorted
    /// index and FIFO.
    fn move_request(&self, state: &mut SchedState, p: usize, rq: &Rq) {
        let Some(dir) = rq.data_dir() else { return };
        let bucket = &mut state.per_prio[p];
        let latter = bucket.sort(dir).latter(rq);
        bucket.set_next_rq(dir, latter);
        bucket.remove(rq);
    }

    fn finalize_dispatch(&self, state: &mut SchedState, rq: Rq) -> Rq {
        state.counters[rq.prio().index()].bump_dispatched();
        self.zone_locks.lock_for(&self.device, &rq);
        trace!(
            op = %rq.op(),
            sector = rq.sector(),
            batch = state.batching,
            "dispatched"
        );
        rq
    }

    // =========================================================================
    // Completion
    // =========================================================================

    /// Called for every completed request, whether or not it went through
    /// the scheduler; bypassing requests are ignored via the insertion
    /// marker.
    pub fn finish_request(&self, rq: &Rq) {
        if !rq.is_scheduled() {
            return;
        }

        match rq.sched_class() {
            SchedClass::Read | SchedClass::Write => {
                self.completed.bump(rq.prio());
                if rq.sched_class() == SchedClass::Write {
                    // The device reports the sectors actually transferred.
                    let units = io_units_from_sectors(rq.completed_sectors());
                    self.reset_gate.note_write_completed(units);
                    self.finish_gate.note_write_completed(units);
                }
            }
            SchedClass::Reset => {
                self.reset_gate.arm_if_drained(&self.config.read().reset);
            }
            SchedClass::Finish => {
                self.finish_gate.arm_if_drained(&self.config.read().finish);
            }
            SchedClass::Other => {}
        }

        if self.device.zoned {
            self.zone_locks.unlock_for(&self.device, rq);

            // Dispatch may have stalled with every queued write aimed at a
            // locked zone; tell the host to run the queue again.
            if self.has_write_work() {
                self.needs_restart.store(true, Ordering::Release);
            }
        }
    }

    /// Whether a completion has requested a hardware-queue restart since the
    /// last call. Clears the flag.
    pub fn take_queue_restart(&self) -> bool {
        self.needs_restart.swap(false, Ordering::AcqRel)
    }

    // =========================================================================
    // Work queries and depth limiting
    // =========================================================================

    /// Any queued work at all, including held management requests.
    pub fn has_work(&self) -> bool {
        let state = self.state.lock();
        state.per_prio.iter().any(|bucket| bucket.has_work())
            || !state.reset_queue.is_empty()
            || !state.finish_queue.is_empty()
    }

    /// Any queued writes at any priority.
    pub fn has_write_work(&self) -> bool {
        let state = self.state.lock();
        state.per_prio.iter().any(|bucket| bucket.has_write_work())
    }

    /// Shallow tag-allocation depth for a request about to be allocated, or
    /// `None` for unthrottled allocation. Synchronous reads are never
    /// throttled.
    pub fn limit_depth(&self, op: ReqOp, is_sync: bool) -> Option<u32> {
        if is_sync && !op.is_write() {
            return None;
        }
        Some(self.config.read().async_depth.max(1))
    }

    /// Recompute the async depth after the device queue depth changed.
    pub fn depth_updated(&self, nr_requests: u32) {
        let depth = (3 * nr_requests / 4).max(1);
        self.config.write().async_depth = depth;
        debug!(async_depth = depth, "async depth updated");
    }

    /// Per-hardware-context initialization hook.
    pub fn init_hw_context(&self) {
        self.depth_updated(self.device.nr_requests);
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Detach from the device. All queues are expected to be empty; leaks
    /// are logged, not panicked on. A spawned
    /// [`EpochTimerDriver`](crate::timer::EpochTimerDriver) must be stopped
    /// before calling this.
    pub fn exit(&self) {
        let state = self.state.lock();
        for prio in Prio::ALL {
            let counters = &state.counters[prio.index()];
            let completed = self.completed.get(prio);
            let queued = queued(counters, completed);
            if queued != 0 || state.per_prio[prio.index()].has_work() {
                warn!(
                    prio = %prio,
                    inserted = counters.inserted,
                    merged = counters.merged,
                    dispatched = counters.dispatched,
                    completed,
                    queued,
                    "requests leaked at detach"
                );
            }
        }
        if !state.reset_queue.is_empty() || !state.finish_queue.is_empty() {
            warn!(
                reset = state.reset_queue.len(),
                finish = state.finish_queue.len(),
                "management requests leaked at detach"
            );
        }
        info!("zinc scheduler detached");
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    /// Requests currently queued at a priority level.
    pub fn queued_at(&self, prio: Prio) -> u32 {
        let state = self.state.lock();
        queued(&state.counters[prio.index()], self.completed.get(prio))
    }

    /// Full debugging snapshot of queues, cursors and counters.
    pub fn debug_snapshot(&self) -> DebugSnapshot {
        let state = self.state.lock();

        let per_prio = Prio::ALL
            .iter()
            .map(|prio| {
                let p = prio.index();
                let bucket = &state.per_prio[p];
                PrioDebug {
                    stats: PrioStatsSnapshot::new(&state.counters[p], self.completed.get(*prio)),
                    dispatch: bucket.dispatch.iter().map(entry).collect(),
                    read_fifo: bucket.fifo(DataDir::Read).iter().map(entry).collect(),
                    write_fifo: bucket.fifo(DataDir::Write).iter().map(entry).collect(),
                    next_read_sector: bucket.next_rq(DataDir::Read).map(|rq| rq.sector()),
                    next_write_sector: bucket.next_rq(DataDir::Write).map(|rq| rq.sector()),
                }
            })
            .collect();

        DebugSnapshot {
            per_prio,
            last_dir: state.last_dir,
            batching: state.batching,
            starved: state.starved,
            async_depth: self.config.read().async_depth,
            reset: self.reset_gate.debug(&state.reset_queue),
            finish: self.finish_gate.debug(&state.finish_queue),
        }
    }
}

fn entry(rq: &Rq) -> RequestEntry {
    RequestEntry {
        sector: rq.sector(),
        nr_sectors: rq.nr_sectors(),
        fifo_deadline: rq.fifo_deadline(),
    }
}

// =============================================================================
// Tests
// =============================================================================
