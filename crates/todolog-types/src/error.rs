//! Validation errors shared by the client and the mutation executor.

use thiserror::Error;

/// Input rejected before any storage transaction opens.
///
/// The same rules run on the client (so an invalid mutation never becomes
/// pending) and in the executor (so a hand-crafted request never reaches
/// storage).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Item id was empty.
    #[error("item id must not be empty")]
    EmptyId,

    /// Title was empty or whitespace only.
    #[error("title must not be empty")]
    EmptyTitle,

    /// Title exceeded the length bound.
    #[error("title is {len} characters, maximum is {max}")]
    TitleTooLong { len: usize, max: usize },

    /// Update carried no fields.
    #[error("no changes provided")]
    EmptyChanges,

    /// Delete carried no ids.
    #[error("at least one id is required")]
    EmptyIdList,
}
