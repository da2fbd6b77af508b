//! Error types for z-metering storage.

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur in storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database operation failed.
    #[error("database error: {0}")]
    Database(String),

    /// Serialization/deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Record not found.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Kind of record.
        entity: &'static str,
        /// Key that was looked up.
        id: String,
    },

    /// Insufficient credits for a debit.
    #[error("insufficient credits: remaining={remaining}, required={required}")]
    InsufficientCredits {
        /// Credits left on the account.
        remaining: u64,
        /// Credits requested.
        required: u64,
    },

    /// A concurrent writer got there first and the outcome could not be resolved.
    #[error("write conflict: {0}")]
    Conflict(String),
}

impl From<StoreError> for z_metering_core::MeteringError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::InsufficientCredits {
                remaining,
                required,
            } => Self::InsufficientCredits {
                remaining,
                required,
            },
            other => Self::Storage(other.to_string()),
        }
    }
}

impl StoreError {
    /// Shorthand for a missing record.
    pub(crate) fn not_found(entity: &'static str, id: impl std::fmt::Display) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}
