//! Common error types for the identity service

use thiserror::Error;

/// Common result type for identity operations
pub type Result<T> = std::result::Result<T, Error>;

/// SQLite primary result codes that indicate lock contention
const SQLITE_BUSY: i64 = 5;
const SQLITE_LOCKED: i64 = 6;

/// Common error types across the identity service
#[derive(Error, Debug)]
pub enum Error {
    /// Identity store failure (wraps sqlx::Error). Safe to retry the whole call.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid observation or request parameter
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Requested record does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// A contact group broke a linkage invariant. Indicates a bug, never retried.
    #[error("Invariant violation: {0}")]
    Invariant(String),

    /// Internal server error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True when re-running the failed operation from scratch may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Database(_))
    }

    /// True when the store rejected the operation because another writer holds a lock
    pub fn is_lock_contention(&self) -> bool {
        let Error::Database(sqlx::Error::Database(db_err)) = self else {
            return false;
        };

        // Extended result codes carry the primary code in the low byte
        let by_code = db_err
            .code()
            .and_then(|code| code.parse::<i64>().ok())
            .map(|code| matches!(code & 0xff, SQLITE_BUSY | SQLITE_LOCKED))
            .unwrap_or(false);

        by_code || db_err.message().contains("database is locked")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_store_errors_are_retryable() {
        assert!(Error::Database(sqlx::Error::PoolTimedOut).is_retryable());
        assert!(!Error::InvalidInput("empty".to_string()).is_retryable());
        assert!(!Error::Invariant("no primary".to_string()).is_retryable());
    }

    #[test]
    fn test_pool_timeout_is_not_lock_contention() {
        assert!(!Error::Database(sqlx::Error::PoolTimedOut).is_lock_contention());
        assert!(!Error::Internal("database is locked".to_string()).is_lock_contention());
    }
}
