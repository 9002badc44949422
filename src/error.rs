//! Error types for the ZINC scheduler

use thiserror::Error;

use crate::request::ReqOp;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the ZINC scheduler.
///
/// The hot path is deliberately error-free: dispatch returning nothing and
/// completions are normal outcomes. Errors surface only at insert (operations
/// the scheduler does not support), at attach (invalid configuration) and on
/// the admin surface (unknown knob names).
#[derive(Error, Debug)]
pub enum Error {
    /// Operation cannot be scheduled (zone-append and anything else that is
    /// neither read, write, zone-reset nor zone-finish)
    #[error("unsupported operation for scheduling: {op}")]
    UnsupportedOperation { op: ReqOp },

    /// Invalid scheduler configuration
    #[error("invalid scheduler configuration: {0}")]
    InvalidConfig(String),

    /// Unknown tuning attribute name
    #[error("unknown scheduler attribute: {0}")]
    UnknownAttribute(String),
}
