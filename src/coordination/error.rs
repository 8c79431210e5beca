//! Error types for distributed coordination
//!
//! A lease held by another owner is never an error: `acquire` and `renew`
//! report it as `Ok(false)`. The variants here are failures of the backing
//! store itself, which callers must handle according to the configured
//! election failure policy.

use thiserror::Error;

/// Result type for coordination operations
pub type CoordinationResult<T> = Result<T, CoordinationError>;

/// Lease store failures
#[derive(Error, Debug)]
pub enum CoordinationError {
    /// Store could not be reached (pool exhausted, connection refused)
    #[error("Lease store unavailable: {0}")]
    StoreUnavailable(String),

    /// Store call did not finish in time
    #[error("Lease store timed out during '{operation}'")]
    Timeout { operation: String },

    /// Store rejected or failed the query
    #[error("Lease store query failed during '{operation}': {reason}")]
    Query { operation: String, reason: String },

    /// Lease configuration is unusable
    #[error("Invalid lease configuration: {0}")]
    InvalidConfig(String),
}

impl CoordinationError {
    /// Create a query error with context
    pub fn query(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Query {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }

    /// Check if the error is transient
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::InvalidConfig(_))
    }
}

impl From<deadpool_postgres::PoolError> for CoordinationError {
    fn from(err: deadpool_postgres::PoolError) -> Self {
        match err {
            deadpool_postgres::PoolError::Timeout(_) => Self::timeout("pool checkout"),
            other => Self::StoreUnavailable(other.to_string()),
        }
    }
}

impl From<tokio_postgres::Error> for CoordinationError {
    fn from(err: tokio_postgres::Error) -> Self {
        if err.is_closed() {
            Self::StoreUnavailable(err.to_string())
        } else {
            Self::query("statement", err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CoordinationError::timeout("acquire");
        assert!(err.to_string().contains("acquire"));

        let err = CoordinationError::StoreUnavailable("connection refused".to_string());
        assert!(err.to_string().contains("connection refused"));
    }

    #[test]
    fn test_is_recoverable() {
        assert!(CoordinationError::timeout("renew").is_recoverable());
        assert!(!CoordinationError::InvalidConfig("ttl".to_string()).is_recoverable());
    }
}
