//! Cloud coordination error types

use crate::poller::PollError;
use thiserror::Error;

/// Errors surfaced by coordinated resource operations
#[derive(Error, Debug)]
pub enum CloudError {
    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    #[error("Invalid resource ID {id:?}: {reason}")]
    InvalidResourceId { id: String, reason: String },

    #[error("Timed out after {waited:?} acquiring lock {key}")]
    LockTimeout {
        key: String,
        waited: std::time::Duration,
    },

    #[error("Operation {0} was cancelled")]
    Cancelled(String),

    #[error("API error: {0}")]
    ApiError(String),

    #[error(transparent)]
    Poll(#[from] PollError),
}

impl CloudError {
    /// Whether this error means the remote resource does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(self, CloudError::ResourceNotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, CloudError>;
