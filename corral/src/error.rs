use thiserror::Error;

use crate::job::JobId;

/// Errors raised by a [`JobStore`](crate::store::JobStore) backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached. Callers retry with bounded backoff.
    #[error("job store unavailable: {0}")]
    Unavailable(String),

    /// The store answered but rejected the operation.
    #[error("job store error: {0}")]
    Backend(String),

    /// A stored value could not be decoded.
    #[error("corrupt value at {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

impl StoreError {
    /// Whether the failure is transient connectivity loss.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error()
            || err.is_connection_dropped()
            || err.is_connection_refusal()
            || err.is_timeout()
        {
            StoreError::Unavailable(err.to_string())
        } else {
            StoreError::Backend(err.to_string())
        }
    }
}

/// Errors surfaced by [`TaskQueue`](crate::queue::TaskQueue) operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// No handler is registered under this task name.
    #[error("unknown task `{0}`")]
    UnknownTask(String),

    /// The queue name is not part of the configured priority order.
    #[error("unknown queue `{0}`")]
    UnknownQueue(String),

    /// An enqueue option is out of range.
    #[error("invalid enqueue options: {0}")]
    InvalidOptions(String),

    /// The job record does not exist or its TTL has expired.
    #[error("job {0} not found")]
    NotFound(JobId),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("job serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Compare-and-swap kept losing to concurrent writers.
    #[error("job {0} is under contention, update abandoned")]
    Contention(JobId),
}

impl QueueError {
    /// Whether retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            QueueError::Store(err) => err.is_unavailable(),
            QueueError::Contention(_) => true,
            _ => false,
        }
    }
}
