//! Scheduler configuration and the tuning-knob surface
//!
//! Every parameter is exposed as an integer read/write knob under the name
//! the device administration surface uses. Out-of-range writes are clamped
//! to the declared bounds, never rejected; only unknown names error.
//!
//! Note the knob strings for the concurrency thresholds keep the historical
//! `treshold` spelling; renaming them would break deployed tooling.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::request::DataDir;

// =============================================================================
// Defaults
// =============================================================================

/// Max time before a queued read is submitted.
pub const DEFAULT_READ_EXPIRE: Duration = Duration::from_millis(500);

/// Max time before a queued write is submitted. Soft limit.
pub const DEFAULT_WRITE_EXPIRE: Duration = Duration::from_millis(5000);

/// Time after which lower-priority requests dispatch even while
/// higher-priority requests are pending.
pub const DEFAULT_PRIO_AGING_EXPIRE: Duration = Duration::from_millis(10_000);

/// Max times reads can starve a pending write.
pub const DEFAULT_WRITES_STARVED: i32 = 2;

/// Number of sequential requests treated as one batch.
pub const DEFAULT_FIFO_BATCH: u32 = 16;

/// Management epoch length for both streams.
pub const DEFAULT_EPOCH_INTERVAL: Duration = Duration::from_millis(64);

/// Write volume (8 KiB units) that forces a management admission.
pub const DEFAULT_COMMAND_TOKENS: u64 = 2000;

/// Inflight-write level (8 KiB units) below which the device counts as
/// drained for management admission.
pub const DEFAULT_MINIMUM_CONCURRENCY_THRESHOLD: u64 = 3;

/// Epochs a held management request may be deferred before it is forced out.
pub const DEFAULT_MAXIMUM_EPOCH_HOLDS: u32 = 3;

/// Finest epoch-timer granularity; intervals are floored to one tick on use.
pub const TIMER_TICK: Duration = Duration::from_millis(1);

const MS_MAX: i64 = i32::MAX as i64;

// =============================================================================
// Per-stream parameters
// =============================================================================

/// Parameters of one management stream (reset or finish).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamParams {
    /// Epoch timer period.
    pub epoch_interval: Duration,

    /// Dispatched-write budget (8 KiB units) above which an admission is due.
    pub command_tokens: u64,

    /// Inflight-write level (8 KiB units) counting as drained.
    pub minimum_concurrency_threshold: u64,

    /// Hold-count bound before a deferred request is forced out.
    pub maximum_epoch_holds: u32,
}

impl Default for StreamParams {
    fn default() -> Self {
        Self {
            epoch_interval: DEFAULT_EPOCH_INTERVAL,
            command_tokens: DEFAULT_COMMAND_TOKENS,
            minimum_concurrency_threshold: DEFAULT_MINIMUM_CONCURRENCY_THRESHOLD,
            maximum_epoch_holds: DEFAULT_MAXIMUM_EPOCH_HOLDS,
        }
    }
}

impl StreamParams {
    /// Epoch period floored to one timer tick.
    pub fn epoch_period(&self) -> Duration {
        self.epoch_interval.max(TIMER_TICK)
    }
}

// =============================================================================
// Scheduler configuration
// =============================================================================

/// Tunable scheduler behavior, one instance per attached device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// FIFO expiry interval for reads.
    pub read_expire: Duration,

    /// FIFO expiry interval for writes.
    pub write_expire: Duration,

    /// Read-bias bound: how many direction decisions may prefer reads while
    /// a dispatchable write is pending.
    pub writes_starved: i32,

    /// Whether the front-merge probe is enabled.
    pub front_merges: bool,

    /// Shallow tag-allocation depth for async requests and writes.
    /// Recomputed from the device queue depth via `depth_updated`.
    pub async_depth: u32,

    /// Sequential requests dispatched per batch.
    pub fifo_batch: u32,

    /// Aging horizon for non-realtime requests.
    pub prio_aging_expire: Duration,

    /// Zone-reset stream parameters.
    pub reset: StreamParams,

    /// Zone-finish stream parameters.
    pub finish: StreamParams,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            read_expire: DEFAULT_READ_EXPIRE,
            write_expire: DEFAULT_WRITE_EXPIRE,
            writes_starved: DEFAULT_WRITES_STARVED,
            front_merges: true,
            async_depth: 0,
            fifo_batch: DEFAULT_FIFO_BATCH,
            prio_aging_expire: DEFAULT_PRIO_AGING_EXPIRE,
            reset: StreamParams::default(),
            finish: StreamParams::default(),
        }
    }
}

impl SchedulerConfig {
    /// FIFO expiry interval for a direction.
    #[inline]
    pub fn expire(&self, dir: DataDir) -> Duration {
        match dir {
            DataDir::Read => self.read_expire,
            DataDir::Write => self.write_expire,
        }
    }

    /// Stream parameters for the reset or finish stream.
    #[inline]
    pub fn stream(&self, reset: bool) -> &StreamParams {
        if reset {
            &self.reset
        } else {
            &self.finish
        }
    }

    /// Validate the configuration at attach time.
    pub fn validate(&self) -> Result<()> {
        if self.read_expire > Duration::from_millis(MS_MAX as u64)
            || self.write_expire > Duration::from_millis(MS_MAX as u64)
        {
            return Err(Error::InvalidConfig(
                "expiry intervals must fit in i32 milliseconds".into(),
            ));
        }
        if self.reset.epoch_interval > Duration::from_millis(MS_MAX as u64)
            || self.finish.epoch_interval > Duration::from_millis(MS_MAX as u64)
        {
            return Err(Error::InvalidConfig(
                "epoch intervals must fit in i32 milliseconds".into(),
            ));
        }
        Ok(())
    }

    /// All knob names understood by [`set_attr`](Self::set_attr).
    pub const ATTR_NAMES: [&'static str; 15] = [
        "read_expire",
        "write_expire",
        "writes_starved",
        "front_merges",
        "async_depth",
        "fifo_batch",
        "prio_aging_expire",
        "reset_epoch_interval",
        "reset_command_tokens",
        "reset_minimum_concurrency_treshold",
        "reset_maximum_epoch_holds",
        "finish_epoch_interval",
        "finish_command_tokens",
        "finish_minimum_concurrency_treshold",
        "finish_maximum_epoch_holds",
    ];

    /// Write a knob by name. The value is clamped to the knob's bounds.
    /// Time knobs are in milliseconds.
    pub fn set_attr(&mut self, name: &str, value: i64) -> Result<()> {
        match name {
            "read_expire" => self.read_expire = clamp_ms(value),
            "write_expire" => self.write_expire = clamp_ms(value),
            "prio_aging_expire" => self.prio_aging_expire = clamp_ms(value),
            "writes_starved" => {
                self.writes_starved = value.clamp(i32::MIN as i64, i32::MAX as i64) as i32
            }
            "front_merges" => self.front_merges = value.clamp(0, 1) != 0,
            "async_depth" => self.async_depth = value.clamp(1, i32::MAX as i64) as u32,
            "fifo_batch" => self.fifo_batch = clamp_count(value) as u32,
            "reset_epoch_interval" => self.reset.epoch_interval = clamp_ms(value),
            "reset_command_tokens" => self.reset.command_tokens = clamp_count(value),
            "reset_minimum_concurrency_treshold" => {
                self.reset.minimum_concurrency_threshold = clamp_count(value)
            }
            "reset_maximum_epoch_holds" => {
                self.reset.maximum_epoch_holds = clamp_count(value) as u32
            }
            "finish_epoch_interval" => self.finish.epoch_interval = clamp_ms(value),
            "finish_command_tokens" => self.finish.command_tokens = clamp_count(value),
            "finish_minimum_concurrency_treshold" => {
                self.finish.minimum_concurrency_threshold = clamp_count(value)
            }
            "finish_maximum_epoch_holds" => {
                self.finish.maximum_epoch_holds = clamp_count(value) as u32
            }
            _ => return Err(Error::UnknownAttribute(name.into())),
        }
        Ok(())
    }

    /// Read a knob by name. Time knobs are reported in milliseconds.
    pub fn attr(&self, name: &str) -> Result<i64> {
        let value = match name {
            "read_expire" => self.read_expire.as_millis() as i64,
            "write_expire" => self.write_expire.as_millis() as i64,
            "prio_aging_expire" => self.prio_aging_expire.as_millis() as i64,
            "writes_starved" => i64::from(self.writes_starved),
            "front_merges" => i64::from(self.front_merges),
            "async_depth" => i64::from(self.async_depth),
            "fifo_batch" => i64::from(self.fifo_batch),
            "reset_epoch_interval" => self.reset.epoch_interval.as_millis() as i64,
            "reset_command_tokens" => self.reset.command_tokens as i64,
            "reset_minimum_concurrency_treshold" => {
                self.reset.minimum_concurrency_threshold as i64
            }
            "reset_maximum_epoch_holds" => i64::from(self.reset.maximum_epoch_holds),
            "finish_epoch_interval" => self.finish.epoch_interval.as_millis() as i64,
            "finish_command_tokens" => self.finish.command_tokens as i64,
            "finish_minimum_concurrency_treshold" => {
                self.finish.minimum_concurrency_threshold as i64
            }
            "finish_maximum_epoch_holds" => i64::from(self.finish.maximum_epoch_holds),
            _ => return Err(Error::UnknownAttribute(name.into())),
        };
        Ok(value)
    }
}

fn clamp_ms(value: i64) -> Duration {
    Duration::from_millis(value.clamp(0, MS_MAX) as u64)
}

fn clamp_count(value: i64) -> u64 {
    value.clamp(0, i32::MAX as i64) as u64
}

// =============================================================================
// Tests
// =============================================================================
