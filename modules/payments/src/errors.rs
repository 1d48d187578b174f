//! Typed error surfaces.
//!
//! Domain outcomes never travel as `Err`. They're `DeclineReason` values
//! inside a successful `AuthorizeOutcome`, reserving transport-level error
//! channels for infrastructure failures. Everything in this file is
//! infrastructure: it is either retried transparently or translated to a
//! transport-level status one layer up, never leaked as domain data.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage connection error: {0}")]
    Connection(String),

    #[error("unique constraint violated: {0}")]
    UniqueViolation(String),

    #[error("row not found")]
    NotFound,
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => StorageError::NotFound,
            sqlx::Error::Database(db_err) => {
                if db_err.is_unique_violation() {
                    StorageError::UniqueViolation(db_err.to_string())
                } else {
                    StorageError::Connection(db_err.to_string())
                }
            }
            other => StorageError::Connection(other.to_string()),
        }
    }
}

/// Surfaced to callers of `Authorize` when the storage layer could not
/// durably decide an outcome. The caller retries with the same
/// idempotency key.
#[derive(Debug, Error)]
#[error("transient failure, retry with the same idempotency key: {reason}")]
pub struct TransientFailure {
    pub reason: String,
}

impl From<StorageError> for TransientFailure {
    fn from(err: StorageError) -> Self {
        TransientFailure {
            reason: err.to_string(),
        }
    }
}

/// Raised at the transport boundary before any storage call is made, as
/// request-level validation. Distinct from a domain decline.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid argument: {0}")]
pub struct InvalidArgument(pub String);
