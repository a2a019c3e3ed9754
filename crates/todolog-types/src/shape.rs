//! Shape log wire messages.
//!
//! The shape log is newline-delimited JSON, one [`ShapeMessage`] per line:
//!
//! ```text
//! {"key":"a","value":{...item...},"headers":{"operation":"insert","txid":42,"offset":7}}
//! {"key":"a","value":null,"headers":{"operation":"delete","txid":43,"offset":8}}
//! {"headers":{"control":"up-to-date","txid":43}}
//! {"headers":{"control":"must-refetch"}}
//! ```
//!
//! Change messages carry the watermark of the transaction that produced them.
//! `up-to-date` carries the committed log position covering everything sent so
//! far, which lets a client retire watermarks of commits that wrote no rows.

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

use crate::{Item, ItemId, LogOffset, Watermark};

/// The single collection this system replicates.
pub const COLLECTION: &str = "todos";

/// Kind of row change recorded in the log.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

/// Stream control signals.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum Control {
    /// The backlog has been fully delivered up to `txid`.
    UpToDate,
    /// The shape handle is stale; the client must re-subscribe from scratch.
    MustRefetch,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeHeaders {
    pub operation: Operation,
    pub txid: Watermark,
    pub offset: LogOffset,
}

/// One row change. `value` is the full row for insert/update, `None` for delete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeMessage {
    pub key: ItemId,
    #[serde(default)]
    pub value: Option<Item>,
    pub headers: ChangeHeaders,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlHeaders {
    pub control: Control,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub txid: Option<Watermark>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlMessage {
    pub headers: ControlHeaders,
}

/// One line of the shape log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ShapeMessage {
    Change(ChangeMessage),
    Control(ControlMessage),
}

impl ShapeMessage {
    pub fn up_to_date(txid: Watermark) -> Self {
        ShapeMessage::Control(ControlMessage {
            headers: ControlHeaders { control: Control::UpToDate, txid: Some(txid) },
        })
    }

    pub fn must_refetch() -> Self {
        ShapeMessage::Control(ControlMessage {
            headers: ControlHeaders { control: Control::MustRefetch, txid: None },
        })
    }

    /// Serialize as one NDJSON line, including the trailing newline.
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}
