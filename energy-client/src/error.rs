/// Failures surfaced by a `BucketStore`.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    /// No row exists for the requested key, location or window.
    #[error("not found: {0}")]
    NotFound(String),
    /// Connectivity, lock contention or a deadline; the call may be retried.
    #[error("transient store error: {0}")]
    Transient(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    /// Permanent failure such as a decode error or constraint violation.
    #[error("store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

// serialization_failure, deadlock_detected, lock_not_available, query_canceled
const TRANSIENT_SQLSTATES: [&str; 4] = ["40001", "40P01", "55P03", "57014"];

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::RowNotFound => StoreError::NotFound(e.to_string()),
            sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
            | sqlx::Error::Io(_) => StoreError::Transient(e.to_string()),
            sqlx::Error::Database(db_err)
                if db_err
                    .code()
                    .as_deref()
                    .is_some_and(|code| TRANSIENT_SQLSTATES.contains(&code)) =>
            {
                StoreError::Transient(e.to_string())
            }
            sqlx::Error::Configuration(_) => StoreError::Configuration(e.to_string()),
            _ => StoreError::Backend(e.to_string()),
        }
    }
}
