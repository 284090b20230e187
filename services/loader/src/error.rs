//! Error types for the warehouse load path.

use thiserror::Error;

/// Result type alias for warehouse operations.
pub type Result<T> = std::result::Result<T, LoadError>;

/// Typed failure for a batch load.
///
/// Every mid-batch failure rolls the batch back; the variant tells the
/// caller whether a retry can help (Transaction/Timeout/Storage) or the
/// batch itself is bad (Integrity/DataShape).
#[derive(Error, Debug)]
pub enum LoadError {
    /// Constraint violation: duplicate composite fact key, conflicting
    /// duplicate natural keys in one upsert call, FK breakage.
    #[error("integrity violation: {0}")]
    Integrity(String),

    /// Commit or rollback failed inside the storage engine.
    #[error("transaction failed: {0}")]
    Transaction(#[source] sqlx::Error),

    /// Batch is missing a required field or otherwise malformed.
    #[error("bad batch shape: {0}")]
    DataShape(String),

    /// Any other storage-engine error.
    #[error("storage error: {0}")]
    Storage(#[source] sqlx::Error),

    /// The batch transaction exceeded its time bound and was rolled back.
    #[error("batch timed out after {seconds}s")]
    Timeout { seconds: u64 },
}

impl From<sqlx::Error> for LoadError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db)
                if db.is_unique_violation()
                    || db.is_foreign_key_violation()
                    || db.is_check_violation() =>
            {
                LoadError::Integrity(db.message().to_string())
            }
            _ => LoadError::Storage(err),
        }
    }
}
