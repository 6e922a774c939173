//! Error types for the audio engine
//!
//! Every fallible engine operation returns a [`FlingerResult`]. The variants
//! mirror the status codes clients of an audio server expect to switch on,
//! so callers can distinguish "try again" from "this object is gone".

use thiserror::Error;

/// Errors returned by threads, tracks and the flinger facade
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FlingerError {
    /// An argument was out of range or inconsistent with the target
    #[error("Bad value: {0}")]
    BadValue(String),

    /// The operation is not valid in the current state
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// The object has not been initialized (or failed to)
    #[error("Not initialized: {0}")]
    NoInit(String),

    /// A non-blocking call could not make progress
    #[error("Operation would block")]
    WouldBlock,

    /// The peer (thread, client or HAL stream) has gone away
    #[error("Dead object: {0}")]
    DeadObject(String),

    /// Not enough data available to satisfy the request
    #[error("Not enough data")]
    NotEnoughData,

    /// A bounded wait expired
    #[error("Timed out after {0} ms")]
    TimedOut(u64),

    /// A fixed-size resource pool is exhausted
    #[error("Out of resources: {0}")]
    NoMemory(String),

    /// The object already exists
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// The caller is not allowed to do this
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// The hardware stream reported a failure
    #[error("HAL error: {0}")]
    Hal(String),
}

/// Result type for engine operations
pub type FlingerResult<T> = Result<T, FlingerError>;

impl FlingerError {
    /// Shorthand for [`FlingerError::BadValue`]
    pub fn bad_value(msg: impl Into<String>) -> Self {
        Self::BadValue(msg.into())
    }

    /// Shorthand for [`FlingerError::InvalidOperation`]
    pub fn invalid_operation(msg: impl Into<String>) -> Self {
        Self::InvalidOperation(msg.into())
    }

    /// Whether a retry could succeed without the caller changing anything
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::WouldBlock | Self::NotEnoughData | Self::TimedOut(_))
    }
}

impl From<rubato::ResamplerConstructionError> for FlingerError {
    fn from(e: rubato::ResamplerConstructionError) -> Self {
        Self::BadValue(format!("resampler: {}", e))
    }
}
