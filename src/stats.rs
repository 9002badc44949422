//! Scheduler statistics and introspection snapshots
//!
//! Per-priority counters follow the single-writer discipline: `inserted`,
//! `merged` and `dispatched` are only written under the scheduler lock and
//! are plain integers; `completed` is bumped from completion context and is
//! atomic. It is fine if these counters wrap; what matters is that they are
//! at least as wide as log2 of the maximum outstanding request count.

use std::sync::atomic::{AtomicU32, Ordering};

use serde::{Deserialize, Serialize};

use crate::clock::Tick;
use crate::request::{DataDir, Prio, PRIO_COUNT};

// =============================================================================
// Per-priority counters
// =============================================================================

/// Counters written under the scheduler lock.
#[derive(Debug, Default, Clone, Copy)]
pub struct PrioCounters {
    pub inserted: u32,
    pub merged: u32,
    pub dispatched: u32,
}

impl PrioCounters {
    #[inline]
    pub fn bump_inserted(&mut self) {
        self.inserted = self.inserted.wrapping_add(1);
    }

    #[inline]
    pub fn bump_merged(&mut self) {
        self.merged = self.merged.wrapping_add(1);
    }

    #[inline]
    pub fn bump_dispatched(&mut self) {
        self.dispatched = self.dispatched.wrapping_add(1);
    }
}

/// Completion counters, one per priority level, written without the
/// scheduler lock.
#[derive(Debug, Default)]
pub struct CompletedCounters {
    completed: [AtomicU32; PRIO_COUNT],
}

impl CompletedCounters {
    pub fn bump(&self, prio: Prio) {
        self.completed[prio.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self, prio: Prio) -> u32 {
        self.completed[prio.index()].load(Ordering::Relaxed)
    }
}

/// Requests currently queued for a priority level: inserted minus completed,
/// modulo counter width.
#[inline]
pub fn queued(counters: &PrioCounters, completed: u32) -> u32 {
    counters.inserted.wrapping_sub(completed)
}

/// Requests handed to the driver and not yet completed for a priority level.
#[inline]
pub fn owned_by_driver(counters: &PrioCounters, completed: u32) -> u32 {
    counters
        .dispatched
        .wrapping_add(counters.merged)
        .wrapping_sub(completed)
}

// =============================================================================
// Snapshots
// =============================================================================

/// Point-in-time view of one priority level's counters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PrioStatsSnapshot {
    pub inserted: u32,
    pub merged: u32,
    pub dispatched: u32,
    pub completed: u32,
    pub queued: u32,
    pub owned_by_driver: u32,
}

impl PrioStatsSnapshot {
    pub fn new(counters: &PrioCounters, completed: u32) -> Self {
        Self {
            inserted: counters.inserted,
            merged: counters.merged,
            dispatched: counters.dispatched,
            completed,
            queued: queued(counters, completed),
            owned_by_driver: owned_by_driver(counters, completed),
        }
    }
}

/// One request as shown in FIFO/dispatch listings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RequestEntry {
    pub sector: u64,
    pub nr_sectors: u64,
    pub fifo_deadline: Tick,
}

/// Introspection view of one priority bucket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrioDebug {
    pub stats: PrioStatsSnapshot,
    pub dispatch: Vec<RequestEntry>,
    pub read_fifo: Vec<RequestEntry>,
    pub write_fifo: Vec<RequestEntry>,
    pub next_read_sector: Option<u64>,
    pub next_write_sector: Option<u64>,
}

/// Introspection view of one management stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamDebug {
    pub queued: usize,
    pub armed: bool,
    pub pending_writes: u64,
    pub dispatched_writes: u64,
    pub admitted_drain: u64,
    pub admitted_tokens: u64,
    pub admitted_starvation: u64,
    pub deferrals: u64,
    pub head_hold_count: Option<u32>,
}

/// Full scheduler introspection snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebugSnapshot {
    pub per_prio: Vec<PrioDebug>,
    pub last_dir: DataDir,
    pub batching: u32,
    pub starved: u32,
    pub async_depth: u32,
    pub reset: StreamDebug,
    pub finish: StreamDebug,
}

// =============================================================================
// Tests
// =============================================================================
