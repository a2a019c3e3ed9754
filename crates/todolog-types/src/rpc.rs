//! Request and response bodies of the mutation RPC surface.
//!
//! | Route                          | Request          | Response         |
//! |--------------------------------|------------------|------------------|
//! | `POST /api/todos/create`       | [`CreateRequest`]| [`ItemTxResponse`]|
//! | `POST /api/todos/update`       | [`UpdateRequest`]| [`ItemTxResponse`]|
//! | `POST /api/todos/toggle`       | [`ToggleRequest`]| [`ItemTxResponse`]|
//! | `POST /api/todos/delete`       | [`DeleteRequest`]| [`TxResponse`]   |
//! | `POST /api/todos/clear-completed` | (none)        | [`TxResponse`]   |

use serde::{Deserialize, Serialize};

use crate::{Item, ItemChanges, ItemId, NewItem, Watermark};

pub type CreateRequest = NewItem;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateRequest {
    pub id: ItemId,
    pub changes: ItemChanges,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToggleRequest {
    pub id: ItemId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteRequest {
    pub ids: Vec<ItemId>,
}

/// A written item plus the watermark of the transaction that wrote it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemTxResponse {
    pub item: Item,
    pub txid: Watermark,
}

/// Watermark of a write that returns no item. `None` means nothing was written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxResponse {
    pub txid: Option<Watermark>,
}

/// JSON error body returned by every failing route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Stable machine-readable code (`VALIDATION`, `NOT_FOUND`, ...).
    pub code: String,
    pub message: String,
}
