//! Zoned-device description and per-zone write locking
//!
//! A zoned device is written sequentially within each zone, so at most one
//! write may be in flight per zone. The lock table here is the exclusion
//! primitive the dispatcher and the completion path share. It is guarded by
//! its own short-held lock, separate from the scheduler lock, because
//! completions release zones without entering the scheduler.

use std::collections::HashSet;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::request::{Request, SchedClass};

// =============================================================================
// Device description
// =============================================================================

/// The device attributes the scheduler needs from the attach path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Whether the device enforces sequential writes per zone.
    pub zoned: bool,

    /// Rotational media: breaking a sequential write stream costs throughput,
    /// so locked-zone skips jump whole sequential runs.
    pub rotational: bool,

    /// Sectors per zone; zero on conventional devices.
    pub zone_sectors: u64,

    /// Largest single request the device accepts; merges never grow a
    /// request past this.
    pub max_sectors: u64,

    /// Device queue depth; feeds the async-depth computation.
    pub nr_requests: u32,
}

/// Default largest request span (128 KiB of 512 B sectors).
pub const DEFAULT_MAX_SECTORS: u64 = 256;

impl DeviceInfo {
    /// A conventional (non-zoned) device.
    pub fn conventional(nr_requests: u32) -> Self {
        Self {
            zoned: false,
            rotational: false,
            zone_sectors: 0,
            max_sectors: DEFAULT_MAX_SECTORS,
            nr_requests,
        }
    }

    /// A zoned device with the given zone size in sectors.
    pub fn zoned(zone_sectors: u64, rotational: bool, nr_requests: u32) -> Self {
        Self {
            zoned: true,
            rotational,
            zone_sectors,
            max_sectors: DEFAULT_MAX_SECTORS,
            nr_requests,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.zoned && self.zone_sectors == 0 {
            return Err(Error::InvalidConfig(
                "zoned device must report a zone size".into(),
            ));
        }
        if self.max_sectors == 0 {
            return Err(Error::InvalidConfig("max_sectors must be non-zero".into()));
        }
        if self.nr_requests == 0 {
            return Err(Error::InvalidConfig("queue depth must be non-zero".into()));
        }
        Ok(())
    }

    /// Zone index containing `sector`.
    #[inline]
    pub fn zone_of(&self, sector: u64) -> u64 {
        debug_assert!(self.zone_sectors > 0);
        sector / self.zone_sectors
    }

    /// Whether dispatching `rq` requires holding its target zone's write lock.
    #[inline]
    pub fn needs_zone_lock(&self, rq: &Request) -> bool {
        self.zoned && rq.sched_class() == SchedClass::Write
    }
}

// =============================================================================
// Zone write locks
// =============================================================================

/// Per-zone write exclusion table.
pub struct ZoneWriteLocks {
    locked: Mutex<HashSet<u64>>,
}

impl Default for ZoneWriteLocks {
    fn default() -> Self {
        Self::new()
    }
}

impl ZoneWriteLocks {
    pub fn new() -> Self {
        Self {
            locked: Mutex::new(HashSet::new()),
        }
    }

    /// Whether a write to `rq`'s target zone may be dispatched right now.
    /// Always true for non-write requests and conventional devices.
    pub fn can_dispatch(&self, device: &DeviceInfo, rq: &Request) -> bool {
        if !device.needs_zone_lock(rq) {
            return true;
        }
        !self.locked.lock().contains(&device.zone_of(rq.sector()))
    }

    /// Lock the target zone of `rq` at dispatch, marking the request as the
    /// holder. No-op when the request does not need the lock.
    pub fn lock_for(&self, device: &DeviceInfo, rq: &Request) {
        if !device.needs_zone_lock(rq) {
            return;
        }
        let newly = self.locked.lock().insert(device.zone_of(rq.sector()));
        debug_assert!(newly, "zone write lock already held at dispatch");
        rq.set_zone_locked(true);
    }

    /// Release the zone lock held by `rq`, if any.
    pub fn unlock_for(&self, device: &DeviceInfo, rq: &Request) {
        if !rq.holds_zone_lock() {
            return;
        }
        self.locked.lock().remove(&device.zone_of(rq.sector()));
        rq.set_zone_locked(false);
    }

    pub fn locked_zones(&self) -> usize {
        self.locked.lock().len()
    }
}

// =============================================================================
// Tests
// =============================================================================
