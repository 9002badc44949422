//! ZINC scheduler integration tests
//!
//! End-to-end coverage of the scheduler's externally observable behavior:
//! - Management-gate admission (drain, token and starvation cases)
//! - Deadline dispatch (priority aging, read/write starvation, expiry)
//! - Merge adapter (front merge on a contiguous bio)
//! - Cross-cutting invariants (conservation, disjointness, zoned safety)
//! - Wall-clock epochs through the background timer driver

use std::sync::Arc;
use std::time::Duration;

use zinc::{
    Bio, Clock, DeviceInfo, IoClass, ManualClock, MergeVerdict, Prio, ReqOp, Request,
    SchedClass, SchedulerConfig, StreamKind, ZincScheduler,
};

const ZONE_SECTORS: u64 = 1 << 16;
const EPOCH_MS: u64 = 64;

struct Harness {
    clock: Arc<ManualClock>,
    sched: ZincScheduler,
}

/// Route scheduler logs through the test harness; `RUST_LOG=zinc=trace`
/// shows the dispatch decisions when a test fails.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

impl Harness {
    fn new(device: DeviceInfo, config: SchedulerConfig) -> Self {
        init_tracing();
        let clock = Arc::new(ManualClock::new());
        let sched =
            ZincScheduler::with_clock(device, config, Arc::clone(&clock) as Arc<dyn Clock>)
                .unwrap();
        Self { clock, sched }
    }

    fn conventional() -> Self {
        Self::new(DeviceInfo::conventional(128), SchedulerConfig::default())
    }

    fn insert(&self, op: ReqOp, sector: u64, nr_sectors: u64, class: IoClass) -> Arc<Request> {
        let rq = Arc::new(Request::new(op, sector, nr_sectors, class));
        self.sched.prepare_request(&rq);
        self.sched.insert(Arc::clone(&rq), false).unwrap();
        rq
    }

    /// One 8 KiB write; sectors are spaced so writes never merge.
    fn write_8k(&self, slot: u64) -> Arc<Request> {
        self.insert(ReqOp::Write, slot * 64, 16, IoClass::BestEffort)
    }

    fn advance_ms(&self, ms: u64) {
        self.clock.advance(Duration::from_millis(ms));
    }

    /// Advance one epoch and run a dispatch pass.
    fn epoch_dispatch(&self) -> Option<Arc<Request>> {
        self.advance_ms(EPOCH_MS);
        self.sched.dispatch()
    }
}

// =============================================================================
// Management-gate admission
// =============================================================================

mod management_gate {
    use super::*;

    #[test]
    fn drain_case_admits_under_low_inflight() {
        let h = Harness::new(
            DeviceInfo::zoned(ZONE_SECTORS, false, 128),
            SchedulerConfig::default(),
        );

        // Two 8 KiB writes to distinct zones, dispatched but not completed:
        // inflight volume is 2 units, below the threshold of 3.
        h.insert(ReqOp::Write, 0, 16, IoClass::BestEffort);
        h.insert(ReqOp::Write, ZONE_SECTORS, 16, IoClass::BestEffort);
        assert_eq!(h.sched.dispatch().unwrap().sched_class(), SchedClass::Write);
        assert_eq!(h.sched.dispatch().unwrap().sched_class(), SchedClass::Write);

        let reset = h.insert(ReqOp::ZoneReset, 0, 0, IoClass::None);
        // Insertion below the drain threshold armed the stream eagerly.
        assert!(h.sched.reset_gate_armed());

        let next = h.sched.dispatch().unwrap();
        assert!(Arc::ptr_eq(&next, &reset));
        assert_eq!(h.sched.debug_snapshot().reset.admitted_drain, 1);
    }

    #[test]
    fn token_case_forces_progress_under_write_pressure() {
        let h = Harness::conventional();

        // Exceed the 2000-unit token budget with inflight volume held high.
        for slot in 0..1000 {
            h.write_8k(slot);
        }
        for _ in 0..1000 {
            assert_eq!(h.sched.dispatch().unwrap().sched_class(), SchedClass::Write);
        }

        let reset = h.insert(ReqOp::ZoneReset, 0, 0, IoClass::None);
        assert!(!h.sched.reset_gate_armed(), "inflight >= threshold");

        // Writes keep flowing while the epoch has not ticked.
        for slot in 1000..2001 {
            h.write_8k(slot);
        }
        for _ in 0..1001 {
            assert_eq!(h.sched.dispatch().unwrap().sched_class(), SchedClass::Write);
        }
        assert_eq!(h.sched.debug_snapshot().reset.dispatched_writes, 2001);

        let admitted = h.epoch_dispatch().unwrap();
        assert!(Arc::ptr_eq(&admitted, &reset));

        let snapshot = h.sched.debug_snapshot();
        assert_eq!(snapshot.reset.admitted_tokens, 1);
        // The write budget restarts for the next window.
        assert_eq!(snapshot.reset.dispatched_writes, 0);
    }

    #[test]
    fn starvation_case_bounds_hold_epochs() {
        let mut config = SchedulerConfig::default();
        config.reset.command_tokens = i32::MAX as u64;
        let h = Harness::new(DeviceInfo::conventional(128), config);

        // Keep inflight volume at 5 units for the whole test.
        for slot in 0..5 {
            h.write_8k(slot);
        }
        for _ in 0..5 {
            h.sched.dispatch().unwrap();
        }

        let reset = h.insert(ReqOp::ZoneReset, 0, 0, IoClass::None);
        assert!(!h.sched.reset_gate_armed());

        // Three armed evaluations defer and age the held request.
        for epoch in 1..=3u32 {
            assert!(h.epoch_dispatch().is_none());
            let snapshot = h.sched.debug_snapshot();
            assert_eq!(snapshot.reset.head_hold_count, Some(epoch));
            assert_eq!(snapshot.reset.deferrals, u64::from(epoch));
        }

        // The fourth admits on the starvation rule with hold count 3.
        let admitted = h.epoch_dispatch().unwrap();
        assert!(Arc::ptr_eq(&admitted, &reset));
        assert_eq!(admitted.hold_count(), 3);
        assert_eq!(h.sched.debug_snapshot().reset.admitted_starvation, 1);
    }

    #[test]
    fn streams_are_independent() {
        let h = Harness::conventional();

        // Keep the device busy so nothing arms eagerly.
        for slot in 0..5 {
            h.write_8k(slot);
        }
        for _ in 0..5 {
            h.sched.dispatch().unwrap();
        }

        h.insert(ReqOp::ZoneFinish, 0, 0, IoClass::None);
        h.sched.arm_epoch(StreamKind::Reset);

        // Only the reset stream is armed and its queue is empty: nothing is
        // admitted and the finish queue does not age.
        assert!(h.sched.dispatch().is_none());
        let snapshot = h.sched.debug_snapshot();
        assert_eq!(snapshot.finish.head_hold_count, Some(0));

        h.sched.arm_epoch(StreamKind::Finish);
        h.sched.set_attr("finish_minimum_concurrency_treshold", 100).unwrap();
        let admitted = h.sched.dispatch().unwrap();
        assert_eq!(admitted.sched_class(), SchedClass::Finish);
    }
}

// =============================================================================
// Deadline dispatch path
// =============================================================================

mod deadline_path {
    use super::*;

    #[test]
    fn priority_aging_promotes_old_best_effort() {
        let h = Harness::conventional();

        let aged = h.insert(ReqOp::Read, 100, 8, IoClass::BestEffort);
        h.advance_ms(10_001);
        let fresh_rt = h.insert(ReqOp::Read, 0, 8, IoClass::RealTime);
        h.advance_ms(1);

        // The best-effort read crossed the aging horizon and bypasses the
        // queued realtime read.
        let first = h.sched.dispatch().unwrap();
        assert!(Arc::ptr_eq(&first, &aged));

        let second = h.sched.dispatch().unwrap();
        assert!(Arc::ptr_eq(&second, &fresh_rt));
    }

    #[test]
    fn fresh_realtime_wins_without_aging() {
        let h = Harness::conventional();

        h.insert(ReqOp::Read, 100, 8, IoClass::BestEffort);
        let rt = h.insert(ReqOp::Read, 0, 8, IoClass::RealTime);

        let first = h.sched.dispatch().unwrap();
        assert!(Arc::ptr_eq(&first, &rt));
    }

    #[test]
    fn reads_starve_writes_at_most_writes_starved_times() {
        let mut config = SchedulerConfig::default();
        config.fifo_batch = 1;
        let h = Harness::new(DeviceInfo::conventional(128), config);

        for i in 0..5 {
            h.insert(ReqOp::Read, i * 64, 8, IoClass::BestEffort);
        }
        let write = h.insert(ReqOp::Write, 10_000, 16, IoClass::BestEffort);

        let classes: Vec<SchedClass> = (0..3)
            .map(|_| h.sched.dispatch().unwrap().sched_class())
            .collect();
        assert_eq!(
            classes,
            vec![SchedClass::Read, SchedClass::Read, SchedClass::Write]
        );
        assert!(!write.holds_zone_lock());
    }

    #[test]
    fn expiry_deadline_never_increases() {
        let h = Harness::conventional();

        let rq = h.insert(ReqOp::Read, 0, 8, IoClass::BestEffort);
        let deadline = rq.fifo_deadline();

        h.advance_ms(50);
        h.insert(ReqOp::Read, 64, 8, IoClass::BestEffort);
        h.advance_ms(50);

        let dispatched = h.sched.dispatch().unwrap();
        assert!(Arc::ptr_eq(&dispatched, &rq));
        assert_eq!(rq.fifo_deadline(), deadline);
    }
}

// =============================================================================
// Merge adapter
// =============================================================================

mod merging {
    use super::*;

    #[test]
    fn front_merge_on_contiguous_bio() {
        let h = Harness::conventional();

        let rq = h.insert(ReqOp::Read, 200, 8, IoClass::BestEffort);
        let bio = Bio::new(ReqOp::Read, 192, 8, IoClass::BestEffort);

        assert!(h.sched.bio_merge(&bio));
        assert_eq!(rq.sector(), 192);
        assert_eq!(rq.nr_sectors(), 16);
        assert_eq!(h.sched.bio_merge_count(), 1);

        // The request was re-keyed: a probe against the new start sector
        // finds it again.
        let probe = Bio::new(ReqOp::Read, 184, 8, IoClass::BestEffort);
        match h.sched.request_merge(&probe) {
            MergeVerdict::Front(found) => assert!(Arc::ptr_eq(&found, &rq)),
            other => panic!("expected front merge, got {other:?}"),
        }
    }

    #[test]
    fn merge_probe_respects_direction_and_class() {
        let h = Harness::conventional();
        h.insert(ReqOp::Read, 200, 8, IoClass::BestEffort);

        // Write bio against a queued read: no merge.
        let bio = Bio::new(ReqOp::Write, 192, 8, IoClass::BestEffort);
        assert!(matches!(h.sched.request_merge(&bio), MergeVerdict::None));
        assert!(!h.sched.bio_merge(&bio));

        // Same sectors, different priority class: different bucket.
        let bio = Bio::new(ReqOp::Read, 192, 8, IoClass::Idle);
        assert!(matches!(h.sched.request_merge(&bio), MergeVerdict::None));
    }
}

// =============================================================================
// Cross-cutting invariants
// =============================================================================

mod invariants {
    use super::*;

    #[test]
    fn conservation_per_priority() {
        let h = Harness::conventional();

        // Mixed workload: spaced reads, one mergeable read pair, writes.
        let mut inserted = Vec::new();
        for i in 0..8 {
            inserted.push(h.insert(ReqOp::Read, i * 640, 8, IoClass::BestEffort));
        }
        h.insert(ReqOp::Read, 8, 8, IoClass::BestEffort); // back-merges into the first
        for i in 0..4 {
            inserted.push(h.insert(ReqOp::Write, 100_000 + i * 640, 16, IoClass::BestEffort));
        }

        for _ in 0..5 {
            let rq = h.sched.dispatch().unwrap();
            h.sched.finish_request(&rq);
        }

        let snapshot = h.sched.debug_snapshot();
        let be = &snapshot.per_prio[Prio::BestEffort.index()];
        let in_queues =
            (be.dispatch.len() + be.read_fifo.len() + be.write_fifo.len()) as u32;

        assert_eq!(
            be.stats.inserted,
            be.stats.dispatched + be.stats.merged + in_queues
        );
        assert!(be.stats.completed <= be.stats.dispatched + be.stats.merged);
    }

    #[test]
    fn each_request_dispatches_exactly_once() {
        let h = Harness::conventional();

        let mut inserted = Vec::new();
        for i in 0..6 {
            inserted.push(h.insert(ReqOp::Read, i * 640, 8, IoClass::BestEffort));
            inserted.push(h.insert(ReqOp::Write, 50_000 + i * 640, 16, IoClass::BestEffort));
        }
        inserted.push(h.insert(ReqOp::ZoneReset, 0, 0, IoClass::None));
        inserted.push(h.insert(ReqOp::ZoneFinish, 0, 0, IoClass::None));

        let mut dispatched = Vec::new();
        loop {
            // Arm both streams every pass so held management requests drain.
            h.sched.arm_epoch(StreamKind::Reset);
            h.sched.arm_epoch(StreamKind::Finish);
            match h.sched.dispatch() {
                Some(rq) => dispatched.push(rq),
                None if h.sched.has_work() => continue,
                None => break,
            }
        }

        assert_eq!(dispatched.len(), inserted.len());
        for rq in &inserted {
            let count = dispatched.iter().filter(|d| Arc::ptr_eq(d, rq)).count();
            assert_eq!(count, 1);
        }
    }

    #[test]
    fn at_most_one_inflight_write_per_zone() {
        let h = Harness::new(
            DeviceInfo::zoned(ZONE_SECTORS, false, 128),
            SchedulerConfig::default(),
        );

        // Five non-mergeable writes, all in zone 0.
        let mut writes = Vec::new();
        for i in 0..5 {
            writes.push(h.insert(ReqOp::Write, i * 64, 16, IoClass::BestEffort));
        }

        let mut inflight: Vec<Arc<Request>> = Vec::new();
        let mut served = 0;
        while served < writes.len() {
            match h.sched.dispatch() {
                Some(rq) => {
                    // Nothing else may be in flight to zone 0.
                    assert!(inflight.is_empty());
                    inflight.push(rq);
                    served += 1;
                }
                None => {
                    let rq = inflight.pop().expect("dispatch stalled with no inflight");
                    h.sched.finish_request(&rq);
                    assert!(h.sched.take_queue_restart() || served == writes.len());
                }
            }
        }
    }

    #[test]
    fn detach_after_clean_drain() {
        let h = Harness::conventional();
        for i in 0..3 {
            h.insert(ReqOp::Read, i * 640, 8, IoClass::BestEffort);
        }
        while let Some(rq) = h.sched.dispatch() {
            h.sched.finish_request(&rq);
        }
        assert!(!h.sched.has_work());
        h.sched.exit();
    }
}

// =============================================================================
// Wall-clock epochs through the timer driver
// =============================================================================

mod timers {
    use super::*;
    use zinc::EpochTimerDriver;

    #[tokio::test]
    async fn held_reset_ages_out_under_real_epochs() {
        super::init_tracing();
        let scheduler = Arc::new(
            ZincScheduler::new(DeviceInfo::conventional(128), SchedulerConfig::default())
                .unwrap(),
        );
        let driver = EpochTimerDriver::spawn(Arc::clone(&scheduler));

        // Keep inflight volume above the drain threshold.
        for i in 0..5u64 {
            let rq = Arc::new(Request::new(ReqOp::Write, i * 64, 16, IoClass::BestEffort));
            scheduler.prepare_request(&rq);
            scheduler.insert(rq, false).unwrap();
        }
        while scheduler.dispatch().is_some() {}

        let reset = Arc::new(Request::new(ReqOp::ZoneReset, 0, 0, IoClass::None));
        scheduler.prepare_request(&reset);
        scheduler.insert(Arc::clone(&reset), false).unwrap();

        // One armed evaluation per epoch: three deferrals, then the
        // starvation rule admits with hold count 3.
        let mut admitted = None;
        for _ in 0..10 {
            tokio::time::sleep(Duration::from_millis(70)).await;
            if let Some(rq) = scheduler.dispatch() {
                admitted = Some(rq);
                break;
            }
        }

        let rq = admitted.expect("held reset never admitted");
        assert!(Arc::ptr_eq(&rq, &reset));
        assert_eq!(rq.hold_count(), 3);

        driver.stop().await;
        scheduler.exit();
    }
}
