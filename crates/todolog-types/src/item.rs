//! The todo item and its change sets.

use serde::{Deserialize, Serialize};

use crate::{ItemId, ValidationError};

/// Upper bound on title length, in characters.
pub const TITLE_MAX_LEN: usize = 500;

/// A todo item as stored and replicated.
///
/// Timestamps are Unix milliseconds. `updated_at` never moves backwards for a
/// given id: every write takes `max(now, previous)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    pub id: ItemId,
    pub title: String,
    pub completed: bool,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Item {
    /// Create an incomplete item stamped with the current time.
    pub fn new(id: ItemId, title: impl Into<String>) -> Self {
        let now = crate::now_millis();
        Self {
            id,
            title: title.into(),
            completed: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Check title and id rules.
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.id.validate()?;
        validate_title(&self.title)
    }

    /// Apply a change set in place. Explicit timestamps are taken as given;
    /// otherwise `updated_at` is bumped monotonically.
    pub fn apply_changes(&mut self, changes: &ItemChanges, now: u64) {
        if let Some(title) = &changes.title {
            self.title = title.clone();
        }
        if let Some(completed) = changes.completed {
            self.completed = completed;
        }
        if let Some(created_at) = changes.created_at {
            self.created_at = created_at;
        }
        self.updated_at = changes.updated_at.unwrap_or(self.updated_at.max(now));
    }
}

/// Input for an insert. Timestamps default to write time when absent,
/// matching the column defaults of the items table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewItem {
    pub id: ItemId,
    pub title: String,
    #[serde(default)]
    pub completed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<u64>,
}

impl NewItem {
    pub fn new(id: ItemId, title: impl Into<String>) -> Self {
        Self {
            id,
            title: title.into(),
            completed: false,
            created_at: None,
            updated_at: None,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        self.id.validate()?;
        validate_title(&self.title)
    }

    /// Materialize into a full item, filling missing timestamps with `now`.
    pub fn into_item(self, now: u64) -> Item {
        let created_at = self.created_at.unwrap_or(now);
        Item {
            id: self.id,
            title: self.title,
            completed: self.completed,
            created_at,
            updated_at: self.updated_at.unwrap_or(now).max(created_at),
        }
    }
}

impl From<Item> for NewItem {
    fn from(item: Item) -> Self {
        Self {
            id: item.id,
            title: item.title,
            completed: item.completed,
            created_at: Some(item.created_at),
            updated_at: Some(item.updated_at),
        }
    }
}

/// Partial field set for an update. An empty set is a validation error.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemChanges {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<bool>,
    /// Unix milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<u64>,
}

impl ItemChanges {
    pub fn title(title: impl Into<String>) -> Self {
        Self { title: Some(title.into()), ..Self::default() }
    }

    pub fn completed(completed: bool) -> Self {
        Self { completed: Some(completed), ..Self::default() }
    }

    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.completed.is_none()
            && self.created_at.is_none()
            && self.updated_at.is_none()
    }

    /// Non-empty, and any new title obeys the title rules.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.is_empty() {
            return Err(ValidationError::EmptyChanges);
        }
        if let Some(title) = &self.title {
            validate_title(title)?;
        }
        Ok(())
    }
}

/// Titles must be non-blank and at most [`TITLE_MAX_LEN`] characters.
pub fn validate_title(title: &str) -> Result<(), ValidationError> {
    if title.trim().is_empty() {
        return Err(ValidationError::EmptyTitle);
    }
    let len = title.chars().count();
    if len > TITLE_MAX_LEN {
        return Err(ValidationError::TitleTooLong { len, max: TITLE_MAX_LEN });
    }
    Ok(())
}
