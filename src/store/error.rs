//! Store Error Types

use std::time::Duration;

use thiserror::Error;

/// PostgreSQL SQLSTATE for `serialization_failure`
const SQLSTATE_SERIALIZATION_FAILURE: &str = "40001";
/// PostgreSQL SQLSTATE for `deadlock_detected`
const SQLSTATE_DEADLOCK_DETECTED: &str = "40P01";

/// Malformed request, rejected before any transaction is opened
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Amount must be greater than zero, got {0}")]
    InvalidAmount(i64),

    #[error("Source and destination account are the same: {0}")]
    SameAccount(i64),
}

/// Errors surfaced by [`Store::exec_tx`](super::Store::exec_tx) and the
/// workflows built on it
#[derive(Error, Debug)]
pub enum TxError {
    #[error("Invalid request: {0}")]
    Validation(#[from] ValidationError),

    #[error("Failed to begin transaction: {0}")]
    Begin(#[source] sqlx::Error),

    #[error("Database error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("Transaction timed out after {0:?}")]
    TimedOut(Duration),

    #[error("Transaction cancelled")]
    Cancelled,

    /// Work failed and the rollback that followed failed too
    #[error("tx err: {work}, rb err: {rollback}")]
    Rollback {
        #[source]
        work: Box<TxError>,
        rollback: sqlx::Error,
    },

    /// Outcome of the transaction is unknown to the caller
    #[error("Failed to commit transaction: {0}")]
    Commit(#[source] sqlx::Error),
}

impl TxError {
    /// Combine a work error with the rollback failure that followed it
    pub fn with_rollback(work: TxError, rollback: sqlx::Error) -> Self {
        TxError::Rollback {
            work: Box::new(work),
            rollback,
        }
    }

    /// Error code for logs and API responses
    pub fn code(&self) -> &'static str {
        match self {
            TxError::Validation(ValidationError::InvalidAmount(_)) => "INVALID_AMOUNT",
            TxError::Validation(ValidationError::SameAccount(_)) => "SAME_ACCOUNT",
            TxError::Begin(_) => "BEGIN_FAILED",
            TxError::Store(sqlx::Error::RowNotFound) => "NOT_FOUND",
            TxError::Store(_) => "DATABASE_ERROR",
            TxError::TimedOut(_) => "TIMED_OUT",
            TxError::Cancelled => "CANCELLED",
            TxError::Rollback { .. } => "ROLLBACK_FAILED",
            TxError::Commit(_) => "COMMIT_FAILED",
        }
    }

    /// The error that made the work fail, looking through a failed rollback
    pub fn work_error(&self) -> &TxError {
        match self {
            TxError::Rollback { work, .. } => work,
            other => other,
        }
    }

    /// The rollback failure, if any
    pub fn rollback_error(&self) -> Option<&sqlx::Error> {
        match self {
            TxError::Rollback { rollback, .. } => Some(rollback),
            _ => None,
        }
    }

    /// Timeout or cancellation fired before the work finished
    pub fn is_interrupted(&self) -> bool {
        matches!(self, TxError::TimedOut(_) | TxError::Cancelled)
    }

    /// Whether a caller may reasonably run the whole transaction again
    ///
    /// Only store-reported serialization failures and deadlocks qualify.
    /// The store itself never retries.
    pub fn is_retryable(&self) -> bool {
        match self.work_error() {
            TxError::Store(e) | TxError::Commit(e) => is_conflict(e),
            _ => false,
        }
    }
}

fn is_conflict(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db) => matches!(
            db.code().as_deref(),
            Some(SQLSTATE_SERIALIZATION_FAILURE) | Some(SQLSTATE_DEADLOCK_DETECTED)
        ),
        _ => false,
    }
}
