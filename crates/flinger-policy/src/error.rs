//! Error type for routing decisions

use thiserror::Error;

/// Errors returned by the routing [`Engine`](crate::Engine)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PolicyError {
    /// Out-of-range phone state, forced config not allowed for a usage, bad curve
    #[error("Bad value: {0}")]
    BadValue(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

pub type PolicyResult<T> = Result<T, PolicyError>;

impl PolicyError {
    pub fn bad_value(msg: impl Into<String>) -> Self {
        Self::BadValue(msg.into())
    }
}

impl From<PolicyError> for flinger_core::FlingerError {
    fn from(e: PolicyError) -> Self {
        match e {
            PolicyError::BadValue(msg) => flinger_core::FlingerError::BadValue(msg),
            PolicyError::InvalidOperation(msg) => flinger_core::FlingerError::InvalidOperation(msg),
        }
    }
}
