//! Social platform API errors

use thiserror::Error;

/// Errors returned by a [`SocialPlatformClient`](super::SocialPlatformClient)
#[derive(Error, Debug)]
pub enum PlatformError {
    /// Transport-level failure
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Platform throttled the request
    #[error("Platform rate limit exceeded")]
    RateLimited { retry_after_secs: Option<u64> },

    /// Platform returned a 5xx status
    #[error("Platform server error: {0}")]
    Server(u16),

    /// Request did not complete in time
    #[error("Platform request timed out")]
    Timeout,

    /// Token expired or revoked
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Account lacks the permission for this call
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Media rejected by the platform
    #[error("Invalid media: {0}")]
    InvalidMedia(String),

    /// Any other 4xx rejection
    #[error("Request rejected with status {status}: {message}")]
    Rejected { status: u16, message: String },

    /// Response body could not be understood
    #[error("Invalid platform response: {0}")]
    InvalidResponse(String),

    /// No credential available for the account
    #[error("Missing credential for account {0}")]
    MissingCredential(String),
}

impl PlatformError {
    /// Map a non-success HTTP status to an error
    pub fn from_status(status: u16, message: impl Into<String>, retry_after_secs: Option<u64>) -> Self {
        let message = message.into();
        match status {
            401 => Self::Unauthorized(message),
            403 => Self::PermissionDenied(message),
            415 | 422 => Self::InvalidMedia(message),
            429 => Self::RateLimited { retry_after_secs },
            500..=599 => Self::Server(status),
            _ => Self::Rejected { status, message },
        }
    }

    /// Retrying will never help
    ///
    /// Permanent errors move content straight to `failed`; everything else
    /// consumes one attempt and is retried.
    pub fn is_permanent(&self) -> bool {
        match self {
            Self::Unauthorized(_)
            | Self::PermissionDenied(_)
            | Self::InvalidMedia(_)
            | Self::MissingCredential(_) => true,
            Self::Rejected { status, .. } => *status != 408,
            Self::Http(e) => e.is_builder() || e.is_redirect(),
            Self::RateLimited { .. }
            | Self::Server(_)
            | Self::Timeout
            | Self::InvalidResponse(_) => false,
        }
    }

    /// Whether the request reached the platform and counts against its quota
    pub fn was_issued(&self) -> bool {
        match self {
            Self::Http(e) => !(e.is_builder() || e.is_connect()),
            Self::MissingCredential(_) => false,
            _ => true,
        }
    }
}
