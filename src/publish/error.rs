//! Queue and publish error types

use thiserror::Error;

use crate::platform::PlatformError;
use crate::storage::StorageError;

pub type QueueResult<T> = Result<T, QueueError>;

pub type PublishResult<T> = Result<T, PublishError>;

/// Job queue backend failures
#[derive(Error, Debug)]
pub enum QueueError {
    /// Backend cannot be reached
    #[error("Queue unavailable: {0}")]
    Unavailable(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Stored job payload could not be decoded
    #[error("Invalid job payload: {0}")]
    Payload(#[from] serde_json::Error),
}

impl QueueError {
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Unavailable(_) => true,
            Self::Redis(e) => e.is_io_error() || e.is_timeout() || e.is_connection_dropped(),
            Self::Payload(_) => false,
        }
    }
}

impl From<deadpool_redis::PoolError> for QueueError {
    fn from(err: deadpool_redis::PoolError) -> Self {
        Self::Unavailable(err.to_string())
    }
}

/// Scheduling and publishing failures
#[derive(Error, Debug)]
pub enum PublishError {
    #[error("Content {0} not found")]
    NotFound(String),

    /// Content already carries an external post id
    #[error("Content {0} is already published")]
    AlreadyPublished(String),

    /// Content is claimed by a running publish attempt
    #[error("Content {0} is being published")]
    InProgress(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),
}

impl PublishError {
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::NotFound(_) | Self::AlreadyPublished(_) | Self::InProgress(_) => false,
            Self::Storage(e) => e.is_recoverable(),
            Self::Queue(e) => e.is_recoverable(),
            Self::Platform(e) => !e.is_permanent(),
        }
    }
}
