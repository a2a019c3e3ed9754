//! Change-log records and their conversion to shape messages.

use todolog_types::{ChangeHeaders, ChangeMessage, Item, ItemId, LogOffset, Operation, ShapeMessage, Watermark};

/// One row of the change log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub offset: LogOffset,
    pub txid: Watermark,
    pub operation: Operation,
    pub key: ItemId,
    /// Full row after the change; `None` for deletes.
    pub value: Option<Item>,
}

impl LogEntry {
    pub fn to_message(&self) -> ShapeMessage {
        ShapeMessage::Change(ChangeMessage {
            key: self.key.clone(),
            value: self.value.clone(),
            headers: ChangeHeaders {
                operation: self.operation,
                txid: self.txid,
                offset: self.offset,
            },
        })
    }
}

/// A page of the change log read from one consistent snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogBatch {
    pub entries: Vec<LogEntry>,
    /// Committed clock value in the same snapshot. Only meaningful as an
    /// up-to-date position when `has_more` is false.
    pub txid: Watermark,
    /// The page was cut at the limit; more entries follow.
    pub has_more: bool,
}

impl LogBatch {
    /// Offset of the last entry, or `after` when the page is empty.
    pub fn next_offset(&self, after: LogOffset) -> LogOffset {
        self.entries.last().map(|e| e.offset).unwrap_or(after)
    }
}

/// Raw row as read from SQLite, before validation.
#[derive(Debug)]
pub(crate) struct ChangeRow {
    pub seq: i64,
    pub txid: i64,
    pub operation: String,
    pub key: String,
    pub value: Option<String>,
}

impl ChangeRow {
    /// Validate and convert. Returns a reason string for malformed rows.
    pub(crate) fn into_entry(self) -> Result<LogEntry, String> {
        let operation: Operation = self
            .operation
            .parse()
            .map_err(|_| format!("unknown operation '{}'", self.operation))?;

        let value = match (operation, self.value) {
            (Operation::Delete, _) => None,
            (_, Some(json)) => Some(
                serde_json::from_str::<Item>(&json).map_err(|e| format!("bad row value: {e}"))?,
            ),
            (_, None) => return Err(format!("{operation} without a row value")),
        };

        Ok(LogEntry {
            offset: LogOffset(self.seq.max(0) as u64),
            txid: Watermark(self.txid.max(0) as u64),
            operation,
            key: ItemId::new(self.key),
            value,
        })
    }
}
