//! SQLite persistence for todolog.
//!
//! One table of items, a single-row commit clock, and an append-only change log
//! fed by triggers. Every write runs as one `BEGIN IMMEDIATE` transaction that
//! first assigns itself the next commit id, applies the write, and reads that
//! id back before committing. The id is the write's [`Watermark`]: it is
//! stamped onto every change-log row the transaction produced, and it is what
//! the replicated stream reports as its position.
//!
//! ```text
//!   TodoStore::toggle("a")
//!   ┌──────────────────────────────────────────────────────────┐
//!   │ BEGIN IMMEDIATE                                           │
//!   │ UPDATE commit_clock SET txid = txid + 1   (assign id 42)  │
//!   │ SELECT completed FROM todos WHERE id = 'a'                │
//!   │ UPDATE todos ...  ──trigger──▶ todo_changes(txid = 42)    │
//!   │ SELECT txid FROM commit_clock             (watermark 42)  │
//!   │ COMMIT                                                    │
//!   └──────────────────────────────────────────────────────────┘
//! ```
//!
//! [`Watermark`]: todolog_types::Watermark

pub mod error;
pub mod log;
mod schema;
pub mod store;

pub use error::StoreError;
pub use log::{LogBatch, LogEntry};
pub use store::{Committed, TodoStore};

/// Underlying driver error carried by [`StoreError::Sqlite`].
pub use rusqlite::Error as SqliteError;
