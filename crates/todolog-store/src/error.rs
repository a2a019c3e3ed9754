//! Error types for storage operations.

use thiserror::Error;
use todolog_types::{ItemId, ValidationError};

/// Errors from the mutation executor and log reads.
///
/// Any error returned from a write means the transaction was rolled back and
/// no watermark was produced.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Input rejected before a transaction was opened.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Update or toggle target does not exist.
    #[error("item not found: {0}")]
    NotFound(ItemId),

    /// Insert collided with an existing id.
    #[error("item already exists: {0}")]
    AlreadyExists(ItemId),

    /// Underlying SQLite failure.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl StoreError {
    /// Whether the failure is the caller's fault rather than the engine's.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            StoreError::Validation(_) | StoreError::NotFound(_) | StoreError::AlreadyExists(_)
        )
    }
}
