//! Queue error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("unknown channel: {0}")]
    UnknownChannel(String),

    #[error("channel already registered: {0}")]
    DuplicateChannel(String),

    #[error("invalid channel '{name}': {reason}")]
    InvalidChannel { name: String, reason: String },

    #[error("task failed: {0}")]
    TaskFailed(String),
}

impl QueueError {
    /// Wrap any displayable failure from a unit of work.
    pub fn task(err: impl std::fmt::Display) -> Self {
        QueueError::TaskFailed(err.to_string())
    }
}
