use feedwatch_connector::SourceError;
use feedwatch_queue::QueueError;

/// Persistence failures. Never fatal: callers log and carry on.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("state I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("state file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum SubscriptionError {
    #[error(transparent)]
    Store(#[from] StateError),

    #[error("@{0} is already tracked")]
    Duplicate(String),

    #[error("invalid observer id '{0}'")]
    InvalidObserver(String),

    #[error("account lookup failed: {0}")]
    Source(#[from] SourceError),
}

impl From<std::io::Error> for SubscriptionError {
    fn from(e: std::io::Error) -> Self {
        SubscriptionError::Store(StateError::Io(e))
    }
}

/// A failed detection cycle. Logged by the periodic loop, which keeps going.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("cannot read tracking lists: {0}")]
    Subscriptions(#[from] SubscriptionError),

    #[error("enqueue failed: {0}")]
    Enqueue(#[from] QueueError),

    #[error("dispatcher is not running")]
    DispatcherStopped,

    #[error("detection cycle panicked")]
    Panicked,
}
