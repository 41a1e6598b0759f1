use thiserror::Error;

/// Failures talking to the remote ratings feed.
#[derive(Error, Debug)]
pub enum FeedError {
    #[error("Feed unavailable at {url} after {attempts} attempt(s): {reason}")]
    Unavailable {
        url: String,
        attempts: u32,
        reason: String,
    },

    #[error("Feed response malformed: {0}")]
    Malformed(String),

    #[error("Invalid feed request: {0}")]
    InvalidRequest(String),
}

/// Failures reported by the relational store.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The store cannot be reached at all. Fatal for a batch.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// The transaction lost a lock or serialization conflict. Safe to retry.
    #[error("Store transaction conflict: {0}")]
    Conflict(String),

    /// A single statement failed (constraint, decode, ...). Scoped to one row.
    #[error("Store query failed: {0}")]
    Query(String),
}

impl StoreError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }
}

const SERIALIZATION_FAILURE: &str = "40001";
const DEADLOCK_DETECTED: &str = "40P01";

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &err {
            if matches!(
                db.code().as_deref(),
                Some(SERIALIZATION_FAILURE | DEADLOCK_DETECTED)
            ) {
                return StoreError::Conflict(err.to_string());
            }
        }
        match err {
            sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
            | sqlx::Error::Io(_)
            | sqlx::Error::Tls(_) => StoreError::Unavailable(err.to_string()),
            other => StoreError::Query(other.to_string()),
        }
    }
}

/// Failure of a single imported row. Counted, never fatal unless the store is gone.
#[derive(Error, Debug)]
pub enum RowError {
    #[error("Invalid row: {0}")]
    Invalid(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Failure that prevents a batch from running to completion.
#[derive(Error, Debug)]
pub enum ImportError {
    #[error(transparent)]
    Feed(#[from] FeedError),

    #[error(transparent)]
    Store(#[from] StoreError),
}
