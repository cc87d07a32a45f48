use thiserror::Error;

use crate::types::JobId;

/// Result type for broker and pool operations
pub type QueueResult<T> = Result<T, QueueError>;

/// Result type for a single job attempt
pub type JobResult = Result<(), JobError>;

/// Infrastructure and configuration errors
#[derive(Error, Debug, Clone)]
pub enum QueueError {
    /// Connection loss, timeout or pool exhaustion. Retried inside `BrokerClient`.
    #[error("Broker unavailable: {0}")]
    BrokerUnavailable(String),

    #[error("Broker error: {0}")]
    Broker(String),

    /// The claim was already settled or reclaimed after its visibility window
    #[error("Stale claim for job {0}")]
    StaleClaim(JobId),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("No handler registered for job: {0}")]
    UnregisteredJob(String),

    #[error("Handler already registered for job: {0}")]
    DuplicateHandler(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Arguments that would not survive a round trip through the broker
    #[error("Invalid arguments: {0}")]
    InvalidArguments(#[from] ArgError),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl QueueError {
    /// Whether the broker client should retry the operation
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::BrokerUnavailable(_))
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for QueueError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error()
            || err.is_connection_dropped()
            || err.is_connection_refusal()
            || err.is_timeout()
        {
            Self::BrokerUnavailable(err.to_string())
        } else {
            Self::Broker(err.to_string())
        }
    }
}

/// Typed argument extraction failure
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ArgError {
    #[error("missing argument `{0}`")]
    Missing(String),

    #[error("argument `{key}` is {found}, expected {expected}")]
    WrongType {
        key: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("argument `{0}` is not a finite number")]
    NonFinite(String),
}

/// Outcome of a failed attempt - determines retry behavior
#[derive(Error, Debug, Clone)]
pub enum JobError {
    /// Argument validation failed in middleware or handler
    #[error("Invalid arguments: {0}")]
    Argument(#[from] ArgError),

    /// Business failure; retried while attempts remain
    #[error("Job failed: {0}")]
    Failed(String),

    /// Dead-lettered without further attempts
    #[error("Permanent error: {0}")]
    Permanent(String),

    /// No handler for the envelope's name
    #[error("Unknown job: {0}")]
    UnknownJob(String),

    /// Handler or middleware panicked
    #[error("Job panicked: {0}")]
    Panicked(String),
}

impl JobError {
    /// Create a retryable failure
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }

    /// Create a permanent failure
    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    /// Check if this error may be retried
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Permanent(_) | Self::UnknownJob(_))
    }
}
