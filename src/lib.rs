//! ZINC - An I/O scheduler for zoned block storage devices
//!
//! On ZNS-class SSDs, zone-reset and zone-finish commands interfere
//! destructively with in-flight writes: a management command issued while
//! writes are pending can stall or dramatically slow them. ZINC is a
//! deadline-style request scheduler that admits management commands only at
//! epoch boundaries, under admission rules that bound their interference,
//! while hold-count aging prevents management starvation.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                           ZincScheduler                              │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │                                                                      │
//! │  insert ──┬── read/write ──▶ per-priority buckets (rt / be / idle)   │
//! │           │                   sector index + expiry FIFO per dir     │
//! │           └── reset/finish ─▶ management side-queues (LIFO)          │
//! │                                                                      │
//! │  dispatch ─▶ 1. armed management gate   (drain │ tokens │ aging)     │
//! │              2. priority-aged requests                               │
//! │              3. strict priority: batch ▸ starved ▸ expiry ▸ zones    │
//! │                                                                      │
//! │  complete ─▶ inflight-write accounting ─▶ drain re-arm               │
//! │              zone write-unlock ─▶ queue restart                      │
//! │                                                                      │
//! │      epoch timers ──▶ armed flags (signal only, no work)             │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use zinc::{DeviceInfo, IoClass, ReqOp, Request, SchedulerConfig, ZincScheduler};
//!
//! let device = DeviceInfo::zoned(1 << 19, false, 128);
//! let sched = ZincScheduler::new(device, SchedulerConfig::default()).unwrap();
//!
//! let write = Arc::new(Request::new(ReqOp::Write, 0, 16, IoClass::BestEffort));
//! sched.prepare_request(&write);
//! sched.insert(Arc::clone(&write), false).unwrap();
//!
//! let dispatched = sched.dispatch().unwrap();
//! sched.finish_request(&dispatched);
//! sched.exit();
//! ```
//!
//! # Modules
//!
//! - [`clock`] - Monotonic time source (system and manual clocks)
//! - [`config`] - Tuning knobs with defaults and clamping
//! - [`error`] - Error types
//! - [`gate`] - Management-operation gate (epoch admission)
//! - [`queue`] - Per-priority sector indices and expiry FIFOs
//! - [`request`] - Request model and operation classification
//! - [`scheduler`] - The scheduler core and its operation surface
//! - [`stats`] - Counters and introspection snapshots
//! - [`timer`] - Epoch timers and the background arming driver
//! - [`zone`] - Device description and per-zone write locks

pub mod clock;
pub mod config;
pub mod error;
pub mod gate;
pub mod queue;
pub mod request;
pub mod scheduler;
pub mod stats;
pub mod timer;
pub mod zone;

// Re-export commonly used types
pub use clock::{Clock, ManualClock, SystemClock, Tick};
pub use config::{SchedulerConfig, StreamParams};
pub use error::{Error, Result};
pub use gate::{AdmitCause, StreamKind};
pub use queue::Rq;
pub use request::{Bio, DataDir, IoClass, Prio, ReqOp, Request, SchedClass};
pub use scheduler::{MergeVerdict, ZincScheduler};
pub use stats::DebugSnapshot;
pub use timer::EpochTimerDriver;
pub use zone::{DeviceInfo, ZoneWriteLocks};
