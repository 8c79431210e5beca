//! Unified error handling for the cadence crate
//!
//! Each module owns a `thiserror` enum for its failures. [`Error`] wraps
//! them so the service, CLI and HTTP layer can handle any failure through
//! one type.
//!
//! # Architecture
//!
//! - [`CadenceErrorTrait`] - Common interface implemented by the unified error
//! - [`ErrorCategory`] - Classification of errors for handling strategies
//! - [`Error`] - Unified error enum wrapping all domain-specific errors
//!
//! # Usage
//!
//! ```rust,ignore
//! use cadence::error::{CadenceErrorTrait, Error};
//!
//! fn handle_error(err: Error) {
//!     if err.is_recoverable() {
//!         tracing::warn!(category = ?err.category(), "Retrying: {err}");
//!     } else {
//!         tracing::error!("Fatal error: {err}");
//!     }
//! }
//! ```

use std::io;
use thiserror::Error;

pub use crate::coordination::CoordinationError;
pub use crate::platform::PlatformError;
pub use crate::polling::PollError;
pub use crate::publish::{PublishError, QueueError};
pub use crate::storage::StorageError;

/// Common trait for cadence error types
pub trait CadenceErrorTrait: std::error::Error {
    /// Check if this error is recoverable (can be retried)
    fn is_recoverable(&self) -> bool;

    /// Get the error category for handling strategies
    fn category(&self) -> ErrorCategory;
}

/// Classification of errors for handling strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Lease store and election failures
    Coordination,
    /// Platform API errors (HTTP, timeout, rate limit)
    Network,
    /// Content store and I/O errors
    Storage,
    /// Job queue errors
    Queue,
    /// Configuration and validation errors
    Config,
    /// Other/unknown errors
    Other,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Coordination => "coordination",
            Self::Network => "network",
            Self::Storage => "storage",
            Self::Queue => "queue",
            Self::Config => "config",
            Self::Other => "other",
        }
    }
}

/// Unified error type for the cadence crate
#[derive(Error, Debug)]
pub enum Error {
    #[error("Coordination error: {0}")]
    Coordination(#[from] CoordinationError),

    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Publish error: {0}")]
    Publish(#[from] PublishError),

    #[error("Polling error: {0}")]
    Poll(#[from] PollError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(String),

    /// Generic error with context
    #[error("{context}")]
    Other {
        context: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl CadenceErrorTrait for Error {
    fn is_recoverable(&self) -> bool {
        match self {
            Self::Coordination(e) => e.is_recoverable(),
            Self::Platform(e) => !e.is_permanent(),
            Self::Storage(e) => e.is_recoverable(),
            Self::Queue(e) => e.is_recoverable(),
            Self::Publish(e) => e.is_recoverable(),
            Self::Poll(e) => e.is_recoverable(),
            Self::Io(_) => true,
            Self::Json(_) => false,
            Self::Config(_) => false,
            Self::Other { .. } => false,
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::Coordination(_) => ErrorCategory::Coordination,
            Self::Platform(_) => ErrorCategory::Network,
            Self::Storage(_) | Self::Io(_) => ErrorCategory::Storage,
            Self::Queue(_) => ErrorCategory::Queue,
            Self::Publish(e) => match e {
                PublishError::Storage(_) => ErrorCategory::Storage,
                PublishError::Queue(_) => ErrorCategory::Queue,
                PublishError::Platform(_) => ErrorCategory::Network,
                PublishError::NotFound(_)
                | PublishError::AlreadyPublished(_)
                | PublishError::InProgress(_) => ErrorCategory::Other,
            },
            Self::Poll(e) => match e {
                PollError::Storage(_) => ErrorCategory::Storage,
                PollError::Platform(_) => ErrorCategory::Network,
                PollError::UnknownAccount(_) | PollError::MissingCredential(_) => {
                    ErrorCategory::Other
                }
            },
            Self::Config(_) => ErrorCategory::Config,
            Self::Json(_) | Self::Other { .. } => ErrorCategory::Other,
        }
    }
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a generic error with context
    pub fn other(context: impl Into<String>) -> Self {
        Self::Other {
            context: context.into(),
            source: None,
        }
    }

    /// Create a generic error with context and source
    pub fn with_source(
        context: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Other {
            context: context.into(),
            source: Some(Box::new(source)),
        }
    }
}

// Conversion from anyhow::Error
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Other {
            context: err.to_string(),
            source: None,
        }
    }
}

/// Result type alias using the unified Error type
pub type Result<T> = std::result::Result<T, Error>;
