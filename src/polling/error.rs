//! Polling error types

use thiserror::Error;

use crate::platform::PlatformError;
use crate::storage::StorageError;

/// Failures of a single poll tick or of loop management
#[derive(Error, Debug)]
pub enum PollError {
    #[error("Account {0} is not registered")]
    UnknownAccount(String),

    #[error("No credential found for reference '{0}'")]
    MissingCredential(String),

    #[error("Platform request failed: {0}")]
    Platform(#[from] PlatformError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl PollError {
    /// Whether the next tick may succeed without operator action
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::UnknownAccount(_) | Self::MissingCredential(_) => false,
            Self::Platform(e) => !e.is_permanent(),
            Self::Storage(e) => e.is_recoverable(),
        }
    }
}

pub type PollResult<T> = std::result::Result<T, PollError>;
