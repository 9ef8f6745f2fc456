//! Error types for state store operations.

use thiserror::Error;

/// Errors from the durable state store.
#[derive(Debug, Error)]
pub enum StateError {
    /// Underlying database operation failed.
    #[error("state store error: {0}")]
    Database(#[from] sqlx::Error),

    /// The referenced row does not exist.
    #[error("row not found: id {0}")]
    NotFound(i64),

    /// A progress update did not increase the recorded offset.
    ///
    /// Progress is monotonic per item; a non-increasing write indicates a
    /// logic error or a second claimant and is rejected.
    #[error("non-monotonic progress update for item {id}: {bytes} bytes")]
    NonMonotonicProgress {
        /// The file item id.
        id: i64,
        /// The rejected offset.
        bytes: i64,
    },
}
