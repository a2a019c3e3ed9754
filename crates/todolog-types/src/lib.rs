//! Shared item, watermark, and wire types for todolog.
//!
//! This crate is the leaf every other todolog crate builds on. It has **no
//! internal todolog dependencies**: the storage engine, the HTTP server, and the
//! reconciling client all speak in these types.
//!
//! # Overview
//!
//! ```text
//! Item (ItemId) ← one todo row, owned by the storage engine
//!     └── written by a mutation (create/update/toggle/delete/clear)
//!     └── every committed mutation is stamped with a Watermark
//!
//! Shape log ← the replicated change stream of the todos table
//!     └── ChangeMessage (operation + txid + offset)
//!     └── ControlMessage (up-to-date at txid, must-refetch)
//! ```
//!
//! # Key Types
//!
//! |--------------------|---------------------------------------------------|
//! | Type               | Purpose                                           |
//! |--------------------|---------------------------------------------------|
//! | [`Item`]           | A todo (id, title, completed, timestamps)         |
//! | [`ItemId`]         | Immutable, globally unique item identifier        |
//! | [`ItemChanges`]    | Partial field set for an update                   |
//! | [`Watermark`]      | Commit sequence number / log position             |
//! | [`LogOffset`]      | Position of a single entry in the change log      |
//! | [`ShapeMessage`]   | One line of the shape log stream                  |
//! |--------------------|---------------------------------------------------|

pub mod error;
pub mod ids;
pub mod item;
pub mod rpc;
pub mod shape;
pub mod watermark;

// Re-export primary types at crate root for convenience.
pub use error::ValidationError;
pub use ids::ItemId;
pub use item::{Item, ItemChanges, NewItem, TITLE_MAX_LEN, validate_title};
pub use rpc::{
    CreateRequest, DeleteRequest, ErrorBody, ItemTxResponse, ToggleRequest, TxResponse,
    UpdateRequest,
};
pub use shape::{
    COLLECTION, ChangeHeaders, ChangeMessage, Control, ControlHeaders, ControlMessage, Operation,
    ShapeMessage,
};
pub use watermark::{LogOffset, ParseOffsetError, Watermark};

/// Current time as Unix milliseconds. Used for item timestamps on both sides.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
