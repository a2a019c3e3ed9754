//! Mutations and their per-mutation state machine.
//!
//! ```text
//!   apply_optimistic ──▶ Pending ──commit(W)──▶ Committed(W) ──position ≥ W──▶ Reconciled
//!                          │                        │
//!                          │ error / timeout        │ (lag: warn, keep overlay)
//!                          ▼                        ▼
//!                        Failed                   (stays Committed)
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use todolog_types::{Item, ItemChanges, ItemId, NewItem, ValidationError, Watermark};

/// Identity of one issued mutation. Bookkeeping is keyed by this, never by
/// issue order.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MutationId(Uuid);

impl MutationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MutationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MutationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

impl fmt::Debug for MutationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MutationId({})", self.0.simple())
    }
}

/// A write the user asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    Create(NewItem),
    Update { id: ItemId, changes: ItemChanges },
    Toggle { id: ItemId },
    Delete { ids: Vec<ItemId> },
    ClearCompleted,
}

impl Mutation {
    /// Same checks the server runs before opening a transaction.
    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            Mutation::Create(new) => new.validate(),
            Mutation::Update { id, changes } => {
                id.validate()?;
                changes.validate()
            }
            Mutation::Toggle { id } => id.validate(),
            Mutation::Delete { ids } => {
                if ids.is_empty() {
                    return Err(ValidationError::EmptyIdList);
                }
                ids.iter().try_for_each(ItemId::validate)
            }
            Mutation::ClearCompleted => Ok(()),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Mutation::Create(_) => "create",
            Mutation::Update { .. } => "update",
            Mutation::Toggle { .. } => "toggle",
            Mutation::Delete { .. } => "delete",
            Mutation::ClearCompleted => "clear_completed",
        }
    }
}

/// The optimistic effect of a mutation on the merged view.
///
/// Toggles are resolved to a concrete value when issued, so applying the
/// overlay on top of a baseline that already reflects the write is a no-op.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Overlay {
    Upsert(Item),
    Patch { id: ItemId, changes: ItemChanges },
    Remove(Vec<ItemId>),
    /// Evaluated against whatever the view holds at that point.
    RemoveCompleted,
}

impl Overlay {
    /// Resolve `mutation` against the current view.
    pub fn resolve(mutation: &Mutation, view: &BTreeMap<ItemId, Item>, now_ms: u64) -> Self {
        match mutation {
            Mutation::Create(new) => Overlay::Upsert(new.clone().into_item(now_ms)),
            Mutation::Update { id, changes } => Overlay::Patch { id: id.clone(), changes: changes.clone() },
            Mutation::Toggle { id } => {
                let completed = view.get(id).map(|item| !item.completed).unwrap_or(true);
                Overlay::Patch { id: id.clone(), changes: ItemChanges::completed(completed) }
            }
            Mutation::Delete { ids } => Overlay::Remove(ids.clone()),
            Mutation::ClearCompleted => Overlay::RemoveCompleted,
        }
    }

    pub fn apply(&self, items: &mut BTreeMap<ItemId, Item>) {
        match self {
            Overlay::Upsert(item) => {
                items.insert(item.id.clone(), item.clone());
            }
            Overlay::Patch { id, changes } => {
                if let Some(item) = items.get_mut(id) {
                    // Timestamps are the server's to move.
                    let updated_at = item.updated_at;
                    item.apply_changes(changes, updated_at);
                }
            }
            Overlay::Remove(ids) => {
                for id in ids {
                    items.remove(id);
                }
            }
            Overlay::RemoveCompleted => items.retain(|_, item| !item.completed),
        }
    }
}

/// Where a tracked mutation is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationState {
    Pending,
    Committed(Watermark),
}

/// A mutation whose overlay is still part of the merged view.
#[derive(Debug, Clone)]
pub struct PendingMutation {
    pub id: MutationId,
    pub mutation: Mutation,
    pub overlay: Overlay,
    pub state: MutationState,
    pub issued_at: Instant,
    pub committed_at: Option<Instant>,
    /// A sync-lag warning has been raised for this mutation.
    pub lagging: bool,
    /// The caller stopped waiting for the outcome.
    pub detached: bool,
}

impl PendingMutation {
    pub fn new(id: MutationId, mutation: Mutation, overlay: Overlay, now: Instant) -> Self {
        Self {
            id,
            mutation,
            overlay,
            state: MutationState::Pending,
            issued_at: now,
            committed_at: None,
            lagging: false,
            detached: false,
        }
    }

    pub fn watermark(&self) -> Option<Watermark> {
        match self.state {
            MutationState::Committed(w) => Some(w),
            MutationState::Pending => None,
        }
    }

    /// `Pending → Committed(W)`. Returns false if already committed.
    pub fn commit(&mut self, watermark: Watermark, now: Instant) -> bool {
        match self.state {
            MutationState::Pending => {
                self.state = MutationState::Committed(watermark);
                self.committed_at = Some(now);
                true
            }
            MutationState::Committed(_) => false,
        }
    }
}
