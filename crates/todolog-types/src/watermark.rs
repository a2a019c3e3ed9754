//! Log positions.
//!
//! A [`Watermark`] is the commit sequence number of one storage transaction.
//! Every committed write gets exactly one, and they strictly increase in commit
//! order, so reconciliation is plain `<=` comparison. A [`LogOffset`] addresses
//! a single entry of the change log (one transaction can write many entries).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Commit sequence number of a storage transaction.
#[derive(Clone, Copy, Debug, Default, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Watermark(pub u64);

impl Watermark {
    /// Position before any commit.
    pub const ZERO: Watermark = Watermark(0);

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Offset of an entry in the change log. `0` is "before the first entry".
#[derive(Clone, Copy, Debug, Default, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogOffset(pub u64);

impl LogOffset {
    pub const START: LogOffset = LogOffset(0);
}

impl fmt::Display for LogOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Error parsing an `offset` query value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid log offset '{0}'")]
pub struct ParseOffsetError(pub String);

impl FromStr for LogOffset {
    type Err = ParseOffsetError;

    /// Accepts `-1` (from the start) or a non-negative entry offset.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "-1" {
            return Ok(LogOffset::START);
        }
        s.parse::<u64>()
            .map(LogOffset)
            .map_err(|_| ParseOffsetError(s.to_string()))
    }
}
