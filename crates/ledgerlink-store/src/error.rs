//! Error types for token storage.

use thiserror::Error;

/// Errors raised by a token store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database connection or operation failed.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Could not prepare the database location.
    #[error("Storage path error for '{path}': {source}")]
    Path {
        path: String,
        source: std::io::Error,
    },

    /// A stored row could not be turned back into a token.
    #[error("Invalid data: {0}")]
    InvalidData(String),
}

/// Result type alias for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
