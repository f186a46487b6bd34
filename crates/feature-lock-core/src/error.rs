use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors that can occur in the lock store layer.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The `locked_records.record_id` uniqueness constraint rejected an insert.
    #[error("Record {record_id} is already locked by {holder}")]
    UniqueViolation { record_id: String, holder: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Errors raised by a `FeatureStore` while resolving a query.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolutionError {
    #[error("Unknown record type: {0}")]
    UnknownRecordType(String),

    #[error("Unsupported predicate: {0}")]
    UnsupportedPredicate(String),

    #[error("Feature store error: {0}")]
    Backend(String),
}

/// Errors surfaced by `LockManager` operations.
#[derive(Error, Debug)]
pub enum LockError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Raised only by all-or-nothing acquisition; nothing was persisted.
    #[error("Cannot lock all features: {record_id} is locked until {held_until}")]
    Conflict {
        record_id: String,
        held_until: DateTime<Utc>,
    },

    #[error("Lock not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Feature {record_id} is locked and no lock id was supplied")]
    MissingLockId { record_id: String },

    #[error("Feature {record_id} is locked by a lock other than {lock_id}")]
    WrongLockId { record_id: String, lock_id: String },
}

impl LockError {
    /// Whether this error means the request lost to another holder.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            LockError::Conflict { .. }
                | LockError::MissingLockId { .. }
                | LockError::WrongLockId { .. }
        )
    }
}
