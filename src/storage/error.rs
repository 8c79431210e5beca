//! Storage error types

use thiserror::Error;

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Content and account store failures
#[derive(Error, Debug)]
pub enum StorageError {
    /// Connection pool could not hand out a connection
    #[error("Database unavailable: {0}")]
    Unavailable(String),

    /// Statement failed
    #[error("Query failed during '{operation}': {reason}")]
    Query { operation: String, reason: String },

    /// Stored row could not be turned into a model
    #[error("Corrupt row in {table}: {reason}")]
    CorruptRow { table: String, reason: String },

    /// Pool or schema setup failed
    #[error("Database setup failed: {0}")]
    Setup(String),
}

impl StorageError {
    pub fn query(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Query {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    pub fn corrupt(table: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::CorruptRow {
            table: table.into(),
            reason: reason.into(),
        }
    }

    /// Check if the error is transient
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Query { .. })
    }
}

impl From<deadpool_postgres::PoolError> for StorageError {
    fn from(err: deadpool_postgres::PoolError) -> Self {
        Self::Unavailable(err.to_string())
    }
}

impl From<tokio_postgres::Error> for StorageError {
    fn from(err: tokio_postgres::Error) -> Self {
        if err.is_closed() {
            Self::Unavailable(err.to_string())
        } else {
            Self::query("statement", err.to_string())
        }
    }
}
