//! Per-priority request queues
//!
//! Each priority level keeps, per direction, a sector-sorted index for
//! seek-friendly batching and an arrival-ordered FIFO carrying expiry
//! deadlines, plus an immediate-dispatch list for head inserts. A queued
//! read/write is always in exactly one FIFO and, unless it is being handed
//! out, in the matching sector index.
//!
//! The sector index is a `BTreeMap` keyed by `(sector, insertion sequence)`
//! so ties on sector resolve in arrival order and traversal is stable.

use std::collections::{BTreeMap, VecDeque};
use std::ops::Bound::{Excluded, Included, Unbounded};
use std::sync::Arc;

use crate::clock::Tick;
use crate::request::{DataDir, Request, DIR_COUNT};

/// Shared request handle, identity-compared by pointer.
pub type Rq = Arc<Request>;

// =============================================================================
// Sector-sorted index
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct SortKey {
    sector: u64,
    seq: u64,
}

impl SortKey {
    fn of(rq: &Rq) -> Self {
        Self {
            sector: rq.sort_sector(),
            seq: rq.seq(),
        }
    }
}

/// Requests ordered by starting sector with stable insertion-order ties.
#[derive(Default)]
pub struct SectorIndex {
    map: BTreeMap<SortKey, Rq>,
}

impl SectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Index a request under its current starting sector.
    pub fn insert(&mut self, rq: Rq) {
        rq.set_sort_sector(rq.sector());
        self.map.insert(SortKey::of(&rq), rq);
    }

    /// Drop a request from the index. Returns false if it was not indexed.
    pub fn remove(&mut self, rq: &Rq) -> bool {
        self.map.remove(&SortKey::of(rq)).is_some()
    }

    pub fn contains(&self, rq: &Rq) -> bool {
        self.map.contains_key(&SortKey::of(rq))
    }

    /// The request after `rq` in sector-sorted order.
    pub fn latter(&self, rq: &Rq) -> Option<Rq> {
        self.map
            .range((Excluded(SortKey::of(rq)), Unbounded))
            .next()
            .map(|(_, r)| Arc::clone(r))
    }

    /// The request before `rq` in sector-sorted order.
    pub fn earlier(&self, rq: &Rq) -> Option<Rq> {
        self.map
            .range((Unbounded, Excluded(SortKey::of(rq))))
            .next_back()
            .map(|(_, r)| Arc::clone(r))
    }

    /// The indexed request with the greatest starting sector below `sector`.
    /// With non-overlapping requests this is the only back-merge candidate.
    pub fn nearest_starting_before(&self, sector: u64) -> Option<Rq> {
        self.map
            .range((Unbounded, Excluded(SortKey { sector, seq: 0 })))
            .next_back()
            .map(|(_, r)| Arc::clone(r))
    }

    /// The first (earliest inserted) request starting exactly at `sector`.
    pub fn find_starting_at(&self, sector: u64) -> Option<Rq> {
        self.map
            .range((
                Included(SortKey { sector, seq: 0 }),
                Included(SortKey {
                    sector,
                    seq: u64::MAX,
                }),
            ))
            .next()
            .map(|(_, r)| Arc::clone(r))
    }

    /// Re-key a request whose starting sector changed (front merge).
    pub fn reposition(&mut self, rq: &Rq) {
        if self.remove(rq) {
            self.insert(Arc::clone(rq));
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Rq> {
        self.map.values()
    }
}

// =============================================================================
// Expiry FIFO
// =============================================================================

/// Arrival-ordered list; the head carries the earliest expiry deadline.
#[derive(Default)]
pub struct ExpiryFifo {
    list: VecDeque<Rq>,
}

impl ExpiryFifo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub fn push_back(&mut self, rq: Rq) {
        self.list.push_back(rq);
    }

    pub fn head(&self) -> Option<&Rq> {
        self.list.front()
    }

    /// True iff the head request's expiry deadline has passed.
    pub fn head_expired(&self, now: Tick) -> bool {
        self.list
            .front()
            .map(|rq| rq.fifo_deadline() <= now)
            .unwrap_or(false)
    }

    pub fn position(&self, rq: &Rq) -> Option<usize> {
        self.list.iter().position(|r| Arc::ptr_eq(r, rq))
    }

    /// Remove a request by identity. Returns false if not present.
    pub fn remove(&mut self, rq: &Rq) -> bool {
        match self.position(rq) {
            Some(idx) => {
                self.list.remove(idx);
                true
            }
            None => false,
        }
    }

    fn insert_at(&mut self, idx: usize, rq: Rq) {
        self.list.insert(idx.min(self.list.len()), rq);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Rq> {
        self.list.iter()
    }
}

// =============================================================================
// Per-priority bucket
// =============================================================================

/// Queues for a single priority level.
pub struct PrioBucket {
    /// Head-inserted requests, dispatched before anything else.
    pub dispatch: VecDeque<Rq>,

    sort: [SectorIndex; DIR_COUNT],
    fifo: [ExpiryFifo; DIR_COUNT],

    /// Next request in sector order per direction, if a batch is running.
    next_rq: [Option<Rq>; DIR_COUNT],
}

impl Default for PrioBucket {
    fn default() -> Self {
        Self::new()
    }
}

impl PrioBucket {
    pub fn new() -> Self {
        Self {
            dispatch: VecDeque::new(),
            sort: [SectorIndex::new(), SectorIndex::new()],
            fifo: [ExpiryFifo::new(), ExpiryFifo::new()],
            next_rq: [None, None],
        }
    }

    #[inline]
    pub fn sort(&self, dir: DataDir) -> &SectorIndex {
        &self.sort[dir.index()]
    }

    #[inline]
    pub fn fifo(&self, dir: DataDir) -> &ExpiryFifo {
        &self.fifo[dir.index()]
    }

    pub fn next_rq(&self, dir: DataDir) -> Option<Rq> {
        self.next_rq[dir.index()].clone()
    }

    pub fn set_next_rq(&mut self, dir: DataDir, rq: Option<Rq>) {
        self.next_rq[dir.index()] = rq;
    }

    /// Queue a request: FIFO tail plus sector index. The caller has already
    /// stamped the expiry deadline.
    pub fn queue(&mut self, rq: Rq, dir: DataDir) {
        self.sort[dir.index()].insert(Arc::clone(&rq));
        self.fifo[dir.index()].push_back(rq);
    }

    /// Remove a request from the FIFO and the sector index, keeping the
    /// next-cursor valid: a cursor pointing at the removed request advances
    /// to its sector successor.
    pub fn remove(&mut self, rq: &Rq) {
        let Some(dir) = rq.data_dir() else { return };
        let d = dir.index();

        self.fifo[d].remove(rq);
        if let Some(pos) = self.dispatch.iter().position(|r| Arc::ptr_eq(r, rq)) {
            self.dispatch.remove(pos);
        }

        if self.next_rq[d]
            .as_ref()
            .map(|next| Arc::ptr_eq(next, rq))
            .unwrap_or(false)
        {
            self.next_rq[d] = self.sort[d].latter(rq);
        }
        self.sort[d].remove(rq);
    }

    /// Re-key a request in its direction's sector index after its starting
    /// sector changed.
    pub fn reposition(&mut self, rq: &Rq, dir: DataDir) {
        self.sort[dir.index()].reposition(rq);
    }

    /// Whether `rq` continues a sequential write stream (its sector-sorted
    /// predecessor ends exactly where it starts).
    pub fn is_seq_write(&self, rq: &Rq) -> bool {
        match self.sort[DataDir::Write.index()].earlier(rq) {
            Some(prev) => prev.sector() + prev.nr_sectors() == rq.sector(),
            None => false,
        }
    }

    /// Skip past the whole sequential run starting at `rq`, even across zone
    /// boundaries, returning the first request after it in sector order.
    pub fn skip_seq_writes(&self, rq: Rq) -> Option<Rq> {
        let index = &self.sort[DataDir::Write.index()];
        let pos = rq.sector();
        let mut skipped = 0u64;
        let mut cur = Some(rq);

        while let Some(r) = cur {
            if r.sector() != pos + skipped {
                return Some(r);
            }
            skipped += r.nr_sectors();
            cur = index.latter(&r);
        }
        None
    }

    /// Migrate FIFO state when `donor` is coalesced into `recipient`: if the
    /// donor expires first, the recipient inherits the earlier deadline and
    /// the donor's FIFO position. The donor itself is removed separately.
    pub fn inherit_fifo_position(&mut self, recipient: &Rq, donor: &Rq) {
        let Some(dir) = recipient.data_dir() else {
            return;
        };
        let d = dir.index();

        let in_fifo = self.fifo[d].position(recipient).is_some() && self.fifo[d].position(donor).is_some();
        if !in_fifo || donor.fifo_deadline() >= recipient.fifo_deadline() {
            return;
        }

        self.fifo[d].remove(recipient);
        if let Some(donor_idx) = self.fifo[d].position(donor) {
            self.fifo[d].insert_at(donor_idx + 1, Arc::clone(recipient));
        }
        recipient.set_fifo_deadline(donor.fifo_deadline());
    }

    /// Any dispatchable work at this priority level.
    pub fn has_work(&self) -> bool {
        !self.dispatch.is_empty()
            || !self.fifo[DataDir::Read.index()].is_empty()
            || !self.fifo[DataDir::Write.index()].is_empty()
    }

    pub fn has_write_work(&self) -> bool {
        !self.fifo[DataDir::Write.index()].is_empty()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{IoClass, ReqOp};

    fn rq(op: ReqOp, sector: u64, nr: u64, seq: u64) -> Rq {
        let r = Arc::new(Request::new(op, sector, nr, IoClass::BestEffort));
        r.set_seq(seq);
        r
    }

    #[test]
    fn test_index_order_and_ties() {
        let mut index = SectorIndex::new();
        let a = rq(ReqOp::Read, 100, 8, 1);
        let b = rq(ReqOp::Read, 50, 8, 2);
        let c = rq(ReqOp::Read, 100, 8, 3);
        index.insert(Arc::clone(&a));
        index.insert(Arc::clone(&b));
        index.insert(Arc::clone(&c));

        let order: Vec<u64> = index.iter().map(|r| r.seq()).collect();
        // Sector order, insertion order on the sector-100 tie.
        assert_eq!(order, vec![2, 1, 3]);

        assert!(Arc::ptr_eq(&index.latter(&b).unwrap(), &a));
        assert!(Arc::ptr_eq(&index.latter(&a).unwrap(), &c));
        assert!(index.latter(&c).is_none());
        assert!(Arc::ptr_eq(&index.earlier(&a).unwrap(), &b));
    }

    #[test]
    fn test_index_find_starting_at() {
        let mut index = SectorIndex::new();
        let a = rq(ReqOp::Read, 200, 8, 1);
        let b = rq(ReqOp::Read, 200, 8, 2);
        index.insert(Arc::clone(&a));
        index.insert(Arc::clone(&b));

        // Earliest-inserted wins on duplicate start sectors.
        assert!(Arc::ptr_eq(&index.find_starting_at(200).unwrap(), &a));
        assert!(index.find_starting_at(199).is_none());
    }

    #[test]
    fn test_index_reposition_after_front_grow() {
        let mut index = SectorIndex::new();
        let a = rq(ReqOp::Read, 200, 8, 1);
        let b = rq(ReqOp::Read, 100, 8, 2);
        index.insert(Arc::clone(&a));
        index.insert(Arc::clone(&b));

        a.grow_front(&crate::request::Bio::new(
            ReqOp::Read,
            192,
            8,
            IoClass::BestEffort,
        ));
        // Still findable under the stale key until repositioned.
        assert!(index.contains(&a));
        index.reposition(&a);

        let order: Vec<u64> = index.iter().map(|r| r.sector()).collect();
        assert_eq!(order, vec![100, 192]);
        assert!(Arc::ptr_eq(&index.find_starting_at(192).unwrap(), &a));
    }

    #[test]
    fn test_fifo_expiry() {
        let mut fifo = ExpiryFifo::new();
        assert!(!fifo.head_expired(1_000));

        let a = rq(ReqOp::Read, 0, 8, 1);
        a.set_fifo_deadline(500);
        fifo.push_back(Arc::clone(&a));

        assert!(!fifo.head_expired(499));
        assert!(fifo.head_expired(500));
        assert!(fifo.head_expired(501));
    }

    #[test]
    fn test_bucket_cursor_advances_on_remove() {
        let mut bucket = PrioBucket::new();
        let a = rq(ReqOp::Write, 10, 8, 1);
        let b = rq(ReqOp::Write, 20, 8, 2);
        let c = rq(ReqOp::Write, 30, 8, 3);
        for r in [&a, &b, &c] {
            bucket.queue(Arc::clone(r), DataDir::Write);
        }
        bucket.set_next_rq(DataDir::Write, Some(Arc::clone(&b)));

        bucket.remove(&b);
        let cursor = bucket.next_rq(DataDir::Write).unwrap();
        assert!(Arc::ptr_eq(&cursor, &c));

        bucket.remove(&c);
        assert!(bucket.next_rq(DataDir::Write).is_none());
        assert_eq!(bucket.fifo(DataDir::Write).len(), 1);
    }

    #[test]
    fn test_bucket_seq_write_detection() {
        let mut bucket = PrioBucket::new();
        let a = rq(ReqOp::Write, 100, 8, 1);
        let b = rq(ReqOp::Write, 108, 8, 2); // continues a
        let c = rq(ReqOp::Write, 200, 8, 3); // isolated
        for r in [&a, &b, &c] {
            bucket.queue(Arc::clone(r), DataDir::Write);
        }

        assert!(!bucket.is_seq_write(&a));
        assert!(bucket.is_seq_write(&b));
        assert!(!bucket.is_seq_write(&c));
    }

    #[test]
    fn test_bucket_skip_seq_run_as_group() {
        let mut bucket = PrioBucket::new();
        // One three-request sequential run, then a detached request.
        let a = rq(ReqOp::Write, 100, 8, 1);
        let b = rq(ReqOp::Write, 108, 8, 2);
        let c = rq(ReqOp::Write, 116, 8, 3);
        let d = rq(ReqOp::Write, 400, 8, 4);
        for r in [&a, &b, &c, &d] {
            bucket.queue(Arc::clone(r), DataDir::Write);
        }

        let next = bucket.skip_seq_writes(Arc::clone(&a)).unwrap();
        assert!(Arc::ptr_eq(&next, &d));

        // A run at the end of the index skips to nothing.
        bucket.remove(&d);
        assert!(bucket.skip_seq_writes(Arc::clone(&a)).is_none());
    }

    #[test]
    fn test_fifo_inheritance_on_requests_merged() {
        let mut bucket = PrioBucket::new();
        let donor = rq(ReqOp::Write, 108, 8, 1);
        donor.set_fifo_deadline(1_000);
        let recipient = rq(ReqOp::Write, 100, 8, 2);
        recipient.set_fifo_deadline(9_000);
        bucket.queue(Arc::clone(&donor), DataDir::Write);
        bucket.queue(Arc::clone(&recipient), DataDir::Write);

        bucket.inherit_fifo_position(&recipient, &donor);
        bucket.remove(&donor);

        assert_eq!(recipient.fifo_deadline(), 1_000);
        let head = bucket.fifo(DataDir::Write).head().unwrap();
        assert!(Arc::ptr_eq(head, &recipient));
        assert_eq!(bucket.fifo(DataDir::Write).len(), 1);
    }

    #[test]
    fn test_fifo_inheritance_noop_when_recipient_earlier() {
        let mut bucket = PrioBucket::new();
        let recipient = rq(ReqOp::Write, 100, 8, 1);
        recipient.set_fifo_deadline(1_000);
        let donor = rq(ReqOp::Write, 108, 8, 2);
        donor.set_fifo_deadline(5_000);
        bucket.queue(Arc::clone(&recipient), DataDir::Write);
        bucket.queue(Arc::clone(&donor), DataDir::Write);

        bucket.inherit_fifo_position(&recipient, &donor);
        assert_eq!(recipient.fifo_deadline(), 1_000);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(64))]

            /// The sector index stays sorted by (sector, insertion order)
            /// under arbitrary insert/remove interleavings.
            #[test]
            fn index_order_is_stable(
                sectors in prop::collection::vec(0u64..512, 1..40),
                remove_mask in prop::collection::vec(any::<bool>(), 1..40),
            ) {
                let mut index = SectorIndex::new();
                let mut all = Vec::new();
                for (seq, sector) in sectors.iter().enumerate() {
                    let r = rq(ReqOp::Read, *sector, 8, seq as u64);
                    index.insert(Arc::clone(&r));
                    all.push(r);
                }
                for (r, remove) in all.iter().zip(remove_mask.iter().cycle()) {
                    if *remove {
                        index.remove(r);
                    }
                }

                let keys: Vec<(u64, u64)> =
                    index.iter().map(|r| (r.sector(), r.seq())).collect();
                let mut sorted = keys.clone();
                sorted.sort();
                prop_assert_eq!(keys, sorted);
            }
        }
    }
}
