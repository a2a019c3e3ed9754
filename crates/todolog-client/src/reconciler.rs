//! Optimistic Reconciler.
//!
//! Holds the replicated baseline (what the change log has delivered so far),
//! the known log position, and one overlay per in-flight mutation. The merged
//! view is the baseline with every overlay applied in issue order, so when two
//! pending mutations touch the same id the later-issued one wins.
//!
//! A committed mutation carries the watermark of its transaction. Once the
//! stream has delivered every row of that transaction the baseline contains
//! the write, and the overlay is dropped. One transaction's rows may span
//! several chunks, so a change at `t` only settles transactions below `t`;
//! transaction `t` itself is settled by a later change or by an `up-to-date`
//! carrying `t` or more. Nothing here talks to the network; the session feeds
//! it stream messages and RPC outcomes from one task.
//!
//! ```text
//!   stream ──▶ on_stream_event ──▶ baseline, position, settled ──┐
//!                                                                 ├──▶ reconcile (W ≤ settled)
//!   rpc    ──▶ mark_committed(W) / mark_failed ──────────────────┘
//!
//!   view() = baseline ⊕ overlay₁ ⊕ overlay₂ ⊕ …   (issue order)
//! ```

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use serde::Serialize;
use tracing::{debug, info, warn};

use todolog_types::{
    ChangeMessage, Control, Item, ItemId, Operation, ShapeMessage, ValidationError, Watermark,
    now_millis,
};

use crate::config::ClientConfig;
use crate::pending::{Mutation, MutationId, MutationState, Overlay, PendingMutation};

/// Lifecycle notifications produced by the reconciler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The executor accepted the write at this watermark.
    Committed { id: MutationId, txid: Watermark },
    /// The stream caught up with the write; its overlay is gone.
    Reconciled { id: MutationId, txid: Watermark },
    /// The write committed nothing (clear-completed with nothing to clear).
    NoOp { id: MutationId },
    /// The write was rejected or timed out; its overlay was rolled back.
    Failed { id: MutationId, reason: String },
    /// Committed, but the watermark has not shown up on the stream in time.
    SyncLag { id: MutationId, txid: Watermark },
    /// A re-subscription finished replaying; the baseline was replaced.
    Resynced { position: Watermark },
}

impl SessionEvent {
    pub fn mutation_id(&self) -> Option<MutationId> {
        match self {
            SessionEvent::Committed { id, .. }
            | SessionEvent::Reconciled { id, .. }
            | SessionEvent::NoOp { id }
            | SessionEvent::Failed { id, .. }
            | SessionEvent::SyncLag { id, .. } => Some(*id),
            SessionEvent::Resynced { .. } => None,
        }
    }

    /// The mutation is no longer tracked after this event.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionEvent::Reconciled { .. } | SessionEvent::NoOp { .. } | SessionEvent::Failed { .. }
        )
    }
}

/// Counts behind the sync-lag indicator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    /// Waiting on the executor.
    pub pending: usize,
    /// Committed, waiting on the stream.
    pub committed: usize,
    /// Committed longer than the reconcile timeout.
    pub lagging: usize,
    /// Every transaction up to here is fully in the baseline.
    pub log_position: Watermark,
}

impl SyncStatus {
    /// Nothing in flight.
    pub fn is_idle(&self) -> bool {
        self.pending == 0 && self.committed == 0
    }
}

/// Baseline being rebuilt by a fresh subscription. Hidden until the replay
/// reaches `up-to-date`.
#[derive(Debug, Default)]
struct Resync {
    items: BTreeMap<ItemId, Item>,
    position: Watermark,
}

pub struct Reconciler {
    baseline: BTreeMap<ItemId, Item>,
    /// Highest txid applied to the baseline.
    position: Watermark,
    /// Highest txid whose rows have all been applied.
    settled: Watermark,
    resync: Option<Resync>,
    /// At least one `up-to-date` has been seen.
    synced: bool,
    /// In issue order.
    pending: IndexMap<MutationId, PendingMutation>,
    /// Bumped on every change to the merged view.
    version: u64,
    commit_timeout: Duration,
    reconcile_timeout: Duration,
}

impl Reconciler {
    pub fn new(commit_timeout: Duration, reconcile_timeout: Duration) -> Self {
        Self {
            baseline: BTreeMap::new(),
            position: Watermark::ZERO,
            settled: Watermark::ZERO,
            resync: None,
            synced: false,
            pending: IndexMap::new(),
            version: 0,
            commit_timeout,
            reconcile_timeout,
        }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(config.commit_timeout, config.reconcile_timeout)
    }

    // =========================================================================
    // Read accessors
    // =========================================================================

    /// Merged view, oldest item first.
    pub fn view(&self) -> Vec<Item> {
        let mut items: Vec<Item> = self.merged().into_values().collect();
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        items
    }

    /// Look up one item in the merged view.
    pub fn get(&self, id: &ItemId) -> Option<Item> {
        self.merged().remove(id)
    }

    /// What the stream has delivered, without overlays.
    pub fn baseline(&self) -> &BTreeMap<ItemId, Item> {
        &self.baseline
    }

    pub fn position(&self) -> Watermark {
        self.position
    }

    pub fn settled(&self) -> Watermark {
        self.settled
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn is_synced(&self) -> bool {
        self.synced
    }

    pub fn is_resyncing(&self) -> bool {
        self.resync.is_some()
    }

    /// State of a tracked mutation; `None` once reconciled, failed, or unknown.
    pub fn state(&self, id: &MutationId) -> Option<MutationState> {
        self.pending.get(id).map(|p| p.state)
    }

    pub fn status(&self) -> SyncStatus {
        let mut status = SyncStatus { log_position: self.settled, ..SyncStatus::default() };
        for p in self.pending.values() {
            match p.state {
                MutationState::Pending => status.pending += 1,
                MutationState::Committed(_) => status.committed += 1,
            }
            if p.lagging {
                status.lagging += 1;
            }
        }
        status
    }

    // =========================================================================
    // Mutation lifecycle
    // =========================================================================

    /// Validate `mutation` and apply its overlay to the merged view.
    ///
    /// A validation failure leaves no trace: nothing becomes pending.
    pub fn apply_optimistic(&mut self, mutation: Mutation, now: Instant) -> Result<MutationId, ValidationError> {
        mutation.validate()?;

        let overlay = Overlay::resolve(&mutation, &self.merged(), now_millis());
        let id = MutationId::new();
        debug!(mutation = %id, kind = mutation.kind(), "optimistic apply");
        self.pending.insert(id, PendingMutation::new(id, mutation, overlay, now));
        self.bump();
        Ok(id)
    }

    /// Record the executor's answer. `None` means the write committed nothing.
    pub fn mark_committed(
        &mut self,
        id: MutationId,
        txid: Option<Watermark>,
        now: Instant,
    ) -> Vec<SessionEvent> {
        let Some(entry) = self.pending.get_mut(&id) else {
            warn!(mutation = %id, "commit for a mutation no longer tracked");
            return Vec::new();
        };

        let Some(txid) = txid else {
            debug!(mutation = %id, "committed nothing, reconciled immediately");
            self.pending.shift_remove(&id);
            self.bump();
            return vec![SessionEvent::NoOp { id }];
        };

        if !entry.commit(txid, now) {
            warn!(mutation = %id, %txid, "duplicate commit ignored");
            return Vec::new();
        }
        debug!(mutation = %id, %txid, settled = %self.settled, "committed");

        let mut events = vec![SessionEvent::Committed { id, txid }];
        if txid <= self.settled {
            events.extend(self.reconcile());
        }
        events
    }

    /// The executor rejected the write (or the call failed). Rolls back the overlay.
    pub fn mark_failed(&mut self, id: MutationId, reason: impl Into<String>) -> Option<SessionEvent> {
        let reason = reason.into();
        let Some(entry) = self.pending.shift_remove(&id) else {
            debug!(mutation = %id, %reason, "failure for a mutation no longer tracked");
            return None;
        };
        warn!(mutation = %id, kind = entry.mutation.kind(), %reason, "mutation failed, rolled back");
        self.bump();
        Some(SessionEvent::Failed { id, reason })
    }

    /// The caller stopped waiting. The mutation keeps being tracked and is
    /// still reconciled against the stream.
    pub fn detach(&mut self, id: &MutationId) -> bool {
        match self.pending.get_mut(id) {
            Some(entry) => {
                entry.detached = true;
                true
            }
            None => false,
        }
    }

    /// Enforce the commit deadline and raise sync-lag warnings.
    pub fn check_timeouts(&mut self, now: Instant) -> Vec<SessionEvent> {
        let mut events = Vec::new();

        let expired: Vec<MutationId> = self
            .pending
            .values()
            .filter(|p| {
                p.state == MutationState::Pending
                    && now.saturating_duration_since(p.issued_at) >= self.commit_timeout
            })
            .map(|p| p.id)
            .collect();
        for id in expired {
            events.extend(self.mark_failed(id, "commit timed out"));
        }

        for p in self.pending.values_mut() {
            let (MutationState::Committed(txid), Some(committed_at)) = (p.state, p.committed_at) else {
                continue;
            };
            if !p.lagging && now.saturating_duration_since(committed_at) >= self.reconcile_timeout {
                p.lagging = true;
                warn!(mutation = %p.id, %txid, settled = %self.settled, "watermark not yet on the stream");
                events.push(SessionEvent::SyncLag { id: p.id, txid });
            }
        }

        events
    }

    // =========================================================================
    // Stream input
    // =========================================================================

    /// Apply one message from the change stream. Malformed and stale changes
    /// are logged and skipped; this never fails.
    pub fn on_stream_event(&mut self, message: &ShapeMessage) -> Vec<SessionEvent> {
        match message {
            ShapeMessage::Change(change) => {
                if self.apply_change(change) && self.resync.is_none() {
                    self.reconcile()
                } else {
                    Vec::new()
                }
            }
            ShapeMessage::Control(control) => match control.headers.control {
                Control::UpToDate => match control.headers.txid {
                    Some(txid) => self.up_to_date(txid),
                    None => {
                        debug!("up-to-date without a position");
                        Vec::new()
                    }
                },
                Control::MustRefetch => {
                    self.begin_resync();
                    Vec::new()
                }
            },
        }
    }

    /// Start rebuilding the baseline from a fresh subscription. The visible
    /// baseline and all overlays stay until the replay is complete.
    pub fn begin_resync(&mut self) {
        if self.resync.is_some() {
            debug!("resync restarted");
        } else {
            info!(position = %self.position, "resync started");
        }
        self.resync = Some(Resync::default());
    }

    // =========================================================================
    // Internal helpers
    // =========================================================================

    fn apply_change(&mut self, change: &ChangeMessage) -> bool {
        let live = self.resync.is_none();
        let (items, position) = match &mut self.resync {
            Some(resync) => (&mut resync.items, &mut resync.position),
            None => (&mut self.baseline, &mut self.position),
        };

        let txid = change.headers.txid;
        if txid < *position {
            warn!(key = %change.key, %txid, position = %*position, "skipping stale change");
            return false;
        }

        match change.headers.operation {
            Operation::Insert | Operation::Update => match &change.value {
                Some(item) if item.id == change.key => {
                    items.insert(change.key.clone(), item.clone());
                }
                Some(item) => {
                    warn!(key = %change.key, row = %item.id, "change key does not match its row, skipping");
                    return false;
                }
                None => {
                    warn!(key = %change.key, operation = %change.headers.operation, "change without a row, skipping");
                    return false;
                }
            },
            Operation::Delete => {
                items.remove(&change.key);
            }
        }
        *position = txid;

        if live {
            // Rows of earlier transactions are never sent after a later one.
            self.settled = self.settled.max(Watermark(txid.0.saturating_sub(1)));
            self.bump();
        }
        true
    }

    fn up_to_date(&mut self, txid: Watermark) -> Vec<SessionEvent> {
        let mut events = Vec::new();

        if let Some(resync) = self.resync.take() {
            let replayed = resync.position.max(txid);
            self.baseline = resync.items;
            if replayed < self.position {
                warn!(%replayed, position = %self.position, "resubscribed log is behind, keeping position");
            } else {
                self.position = replayed;
            }
            self.settled = self.settled.max(replayed);
            self.synced = true;
            self.bump();
            info!(position = %self.position, items = self.baseline.len(), "resync complete");
            events.push(SessionEvent::Resynced { position: self.position });
        } else {
            self.position = self.position.max(txid);
            self.settled = self.settled.max(txid);
            self.synced = true;
        }

        events.extend(self.reconcile());
        events
    }

    /// Drop every committed overlay whose transaction is fully in the baseline.
    fn reconcile(&mut self) -> Vec<SessionEvent> {
        let position = self.settled;
        let done: Vec<(MutationId, Watermark)> = self
            .pending
            .values()
            .filter_map(|p| p.watermark().filter(|w| *w <= position).map(|w| (p.id, w)))
            .collect();
        if done.is_empty() {
            return Vec::new();
        }

        for (id, _) in &done {
            self.pending.shift_remove(id);
        }
        self.bump();

        done.into_iter()
            .map(|(id, txid)| {
                debug!(mutation = %id, %txid, %position, "reconciled");
                SessionEvent::Reconciled { id, txid }
            })
            .collect()
    }

    fn merged(&self) -> BTreeMap<ItemId, Item> {
        let mut items = self.baseline.clone();
        for p in self.pending.values() {
            p.overlay.apply(&mut items);
        }
        items
    }

    fn bump(&mut self) {
        self.version += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use todolog_types::{ChangeHeaders, ItemChanges, LogOffset, NewItem};

    const COMMIT: Duration = Duration::from_secs(10);
    const RECONCILE: Duration = Duration::from_secs(30);

    fn reconciler() -> Reconciler {
        Reconciler::new(COMMIT, RECONCILE)
    }

    fn item(id: &str, title: &str, completed: bool) -> Item {
        Item {
            id: ItemId::new(id),
            title: title.to_string(),
            completed,
            created_at: 1_000,
            updated_at: 1_000,
        }
    }

    fn change(operation: Operation, key: &str, value: Option<Item>, txid: u64) -> ShapeMessage {
        ShapeMessage::Change(ChangeMessage {
            key: ItemId::new(key),
            value,
            headers: ChangeHeaders { operation, txid: Watermark(txid), offset: LogOffset(txid) },
        })
    }

    fn insert(value: Item, txid: u64) -> ShapeMessage {
        let key = value.id.as_str().to_string();
        change(Operation::Insert, &key, Some(value), txid)
    }

    fn up_to_date(txid: u64) -> ShapeMessage {
        ShapeMessage::up_to_date(Watermark(txid))
    }

    fn create(title: &str, id: &str) -> Mutation {
        Mutation::Create(NewItem::new(ItemId::new(id), title))
    }

    fn titles(r: &Reconciler) -> Vec<String> {
        r.view().into_iter().map(|i| i.title).collect()
    }

    // =========================================================================
    // Scenarios
    // =========================================================================

    #[test]
    fn test_insert_overlay_until_stream_reaches_watermark() {
        let mut r = reconciler();
        let now = Instant::now();

        let id = r.apply_optimistic(create("Buy milk", "a"), now).unwrap();
        assert_eq!(titles(&r), vec!["Buy milk"]);
        assert_eq!(r.state(&id), Some(MutationState::Pending));

        let events = r.mark_committed(id, Some(Watermark(42)), now);
        assert_eq!(events, vec![SessionEvent::Committed { id, txid: Watermark(42) }]);

        // Stream at 40: overlay still shown.
        assert!(r.on_stream_event(&up_to_date(40)).is_empty());
        assert_eq!(titles(&r), vec!["Buy milk"]);
        assert!(r.baseline().is_empty());

        // The insert arrives at 42 with its up-to-date: overlay dropped,
        // baseline carries it.
        assert!(r.on_stream_event(&insert(item("a", "Buy milk", false), 42)).is_empty());
        let events = r.on_stream_event(&up_to_date(42));
        assert_eq!(events, vec![SessionEvent::Reconciled { id, txid: Watermark(42) }]);
        assert_eq!(r.state(&id), None);
        assert_eq!(titles(&r), vec!["Buy milk"]);
        assert!(r.baseline().contains_key(&ItemId::new("a")));
        assert!(r.status().is_idle());
    }

    #[test]
    fn test_failed_update_rolls_back() {
        let mut r = reconciler();
        r.on_stream_event(&insert(item("a", "keep", false), 1));
        let before = r.view();

        let id = r
            .apply_optimistic(
                Mutation::Update { id: ItemId::new("zzz"), changes: ItemChanges::completed(true) },
                Instant::now(),
            )
            .unwrap();
        let event = r.mark_failed(id, "item not found: zzz").unwrap();

        assert!(matches!(event, SessionEvent::Failed { id: failed, .. } if failed == id));
        assert_eq!(r.view(), before);
        assert!(r.status().is_idle());
    }

    #[test]
    fn test_failed_insert_visibly_reverts() {
        let mut r = reconciler();
        let id = r.apply_optimistic(create("x", "a"), Instant::now()).unwrap();
        assert_eq!(r.view().len(), 1);
        r.mark_failed(id, "boom");
        assert!(r.view().is_empty());
    }

    #[test]
    fn test_clear_completed_without_watermark_is_noop() {
        let mut r = reconciler();
        r.on_stream_event(&insert(item("a", "open", false), 1));

        let id = r.apply_optimistic(Mutation::ClearCompleted, Instant::now()).unwrap();
        let events = r.mark_committed(id, None, Instant::now());
        assert_eq!(events, vec![SessionEvent::NoOp { id }]);
        assert_eq!(r.state(&id), None);
        assert_eq!(titles(&r), vec!["open"]);
    }

    // =========================================================================
    // Properties
    // =========================================================================

    #[test]
    fn test_validation_failure_never_pending() {
        let mut r = reconciler();
        let version = r.version();
        let err = r.apply_optimistic(create("   ", "a"), Instant::now()).unwrap_err();
        assert_eq!(err, ValidationError::EmptyTitle);
        assert!(r.status().is_idle());
        assert!(r.view().is_empty());
        assert_eq!(r.version(), version);
    }

    #[test]
    fn test_transaction_split_across_batches_stays_hidden_until_complete() {
        let mut r = reconciler();
        let now = Instant::now();
        r.on_stream_event(&insert(item("a", "one", true), 1));
        r.on_stream_event(&insert(item("b", "two", true), 2));
        r.on_stream_event(&up_to_date(2));

        let id = r.apply_optimistic(Mutation::ClearCompleted, now).unwrap();
        assert!(r.view().is_empty());
        r.mark_committed(id, Some(Watermark(3)), now);

        // First row of transaction 3 only: "b" must not come back.
        assert!(r.on_stream_event(&change(Operation::Delete, "a", None, 3)).is_empty());
        assert_eq!(r.state(&id), Some(MutationState::Committed(Watermark(3))));
        assert!(r.view().is_empty());
        assert_eq!(r.status().log_position, Watermark(2));

        r.on_stream_event(&change(Operation::Delete, "b", None, 3));
        assert!(r.view().is_empty());

        let events = r.on_stream_event(&up_to_date(3));
        assert_eq!(events, vec![SessionEvent::Reconciled { id, txid: Watermark(3) }]);
        assert!(r.view().is_empty());
        assert!(r.baseline().is_empty());
    }

    #[test]
    fn test_redelivery_is_idempotent() {
        let events = [
            insert(item("a", "one", false), 1),
            insert(item("b", "two", false), 2),
            change(Operation::Update, "a", Some(item("a", "uno", true)), 3),
            change(Operation::Delete, "b", None, 4),
            up_to_date(4),
        ];

        let mut once = reconciler();
        for e in &events {
            once.on_stream_event(e);
        }

        let mut twice = reconciler();
        for e in &events {
            twice.on_stream_event(e);
            twice.on_stream_event(e);
        }

        assert_eq!(once.view(), twice.view());
        assert_eq!(once.position(), twice.position());
    }

    #[test]
    fn test_overlay_tracks_position_not_event_count() {
        let mut r = reconciler();
        let now = Instant::now();
        let id = r.apply_optimistic(create("mine", "m"), now).unwrap();
        r.mark_committed(id, Some(Watermark(10)), now);

        for (n, txid) in [5u64, 8, 9].into_iter().enumerate() {
            r.on_stream_event(&insert(item(&format!("other-{n}"), "other", false), txid));
            assert_eq!(r.state(&id), Some(MutationState::Committed(Watermark(10))));
            assert!(r.get(&ItemId::new("m")).is_some());
        }

        let events = r.on_stream_event(&up_to_date(10));
        assert_eq!(events, vec![SessionEvent::Reconciled { id, txid: Watermark(10) }]);
        // The stream never delivered "m" (it was, say, deleted elsewhere).
        assert!(r.get(&ItemId::new("m")).is_none());
    }

    #[test]
    fn test_commit_behind_position_reconciles_immediately() {
        let mut r = reconciler();
        let now = Instant::now();
        let id = r.apply_optimistic(create("x", "a"), now).unwrap();
        r.on_stream_event(&insert(item("a", "x", false), 7));
        r.on_stream_event(&up_to_date(7));

        let events = r.mark_committed(id, Some(Watermark(7)), now);
        assert_eq!(
            events,
            vec![
                SessionEvent::Committed { id, txid: Watermark(7) },
                SessionEvent::Reconciled { id, txid: Watermark(7) },
            ]
        );
    }

    #[test]
    fn test_stale_change_is_skipped() {
        let mut r = reconciler();
        r.on_stream_event(&insert(item("a", "x", false), 1));
        r.on_stream_event(&change(Operation::Delete, "a", None, 5));

        // Late re-delivery of the original insert must not resurrect "a".
        assert!(r.on_stream_event(&insert(item("a", "x", false), 1)).is_empty());
        assert!(r.view().is_empty());
        assert_eq!(r.position(), Watermark(5));
    }

    #[test]
    fn test_malformed_change_is_skipped() {
        let mut r = reconciler();
        r.on_stream_event(&change(Operation::Insert, "a", None, 3));
        r.on_stream_event(&change(Operation::Update, "a", Some(item("b", "x", false)), 3));
        assert!(r.view().is_empty());
        assert_eq!(r.position(), Watermark::ZERO);
    }

    #[test]
    fn test_later_issued_overlay_wins() {
        let mut r = reconciler();
        let now = Instant::now();
        r.on_stream_event(&insert(item("a", "base", false), 1));

        let first = r
            .apply_optimistic(Mutation::Update { id: ItemId::new("a"), changes: ItemChanges::title("x") }, now)
            .unwrap();
        let _second = r
            .apply_optimistic(Mutation::Update { id: ItemId::new("a"), changes: ItemChanges::title("y") }, now)
            .unwrap();
        assert_eq!(titles(&r), vec!["y"]);

        // The first lands on the stream; the second is still in flight.
        r.mark_committed(first, Some(Watermark(2)), now);
        r.on_stream_event(&change(Operation::Update, "a", Some(item("a", "x", false)), 2));
        assert_eq!(titles(&r), vec!["y"]);
    }

    #[test]
    fn test_commits_out_of_issue_order() {
        let mut r = reconciler();
        let now = Instant::now();
        let m1 = r.apply_optimistic(create("one", "a"), now).unwrap();
        let m2 = r.apply_optimistic(create("two", "b"), now).unwrap();

        r.mark_committed(m2, Some(Watermark(5)), now);
        r.mark_committed(m1, Some(Watermark(6)), now);

        // A row of transaction 6 proves transaction 5 is complete.
        assert!(r.on_stream_event(&insert(item("b", "two", false), 5)).is_empty());
        let events = r.on_stream_event(&insert(item("a", "one", false), 6));
        assert_eq!(events, vec![SessionEvent::Reconciled { id: m2, txid: Watermark(5) }]);
        assert_eq!(r.state(&m1), Some(MutationState::Committed(Watermark(6))));
        assert_eq!(r.view().len(), 2);
    }

    #[test]
    fn test_toggle_echo_does_not_double_flip() {
        let mut r = reconciler();
        let now = Instant::now();
        r.on_stream_event(&insert(item("a", "x", false), 1));

        let id = r.apply_optimistic(Mutation::Toggle { id: ItemId::new("a") }, now).unwrap();
        assert!(r.get(&ItemId::new("a")).unwrap().completed);

        // Echo arrives before the RPC answer.
        r.on_stream_event(&change(Operation::Update, "a", Some(item("a", "x", true)), 2));
        r.on_stream_event(&up_to_date(2));
        assert!(r.get(&ItemId::new("a")).unwrap().completed);

        let events = r.mark_committed(id, Some(Watermark(2)), now);
        assert!(events.contains(&SessionEvent::Reconciled { id, txid: Watermark(2) }));
        assert!(r.get(&ItemId::new("a")).unwrap().completed);
    }

    #[test]
    fn test_reconciled_mutation_never_reintroduced() {
        let mut r = reconciler();
        let now = Instant::now();
        let id = r.apply_optimistic(create("x", "a"), now).unwrap();
        r.mark_committed(id, Some(Watermark(1)), now);
        r.on_stream_event(&up_to_date(1));
        assert_eq!(r.state(&id), None);

        // Late duplicates from the executor side change nothing.
        assert!(r.mark_committed(id, Some(Watermark(1)), now).is_empty());
        assert!(r.mark_failed(id, "late").is_none());
        assert!(r.view().is_empty());
    }

    // =========================================================================
    // Timeouts
    // =========================================================================

    #[test]
    fn test_commit_timeout_fails_and_rolls_back() {
        let mut r = reconciler();
        let start = Instant::now();
        let id = r.apply_optimistic(create("x", "a"), start).unwrap();

        assert!(r.check_timeouts(start + COMMIT / 2).is_empty());
        let events = r.check_timeouts(start + COMMIT);
        assert!(matches!(&events[..], [SessionEvent::Failed { id: failed, .. }] if *failed == id));
        assert!(r.view().is_empty());
    }

    #[test]
    fn test_reconcile_timeout_is_soft_and_reported_once() {
        let mut r = reconciler();
        let start = Instant::now();
        let id = r.apply_optimistic(create("x", "a"), start).unwrap();
        r.mark_committed(id, Some(Watermark(9)), start);

        let later = start + RECONCILE;
        assert_eq!(r.check_timeouts(later), vec![SessionEvent::SyncLag { id, txid: Watermark(9) }]);
        assert!(r.check_timeouts(later + RECONCILE).is_empty());

        let status = r.status();
        assert_eq!((status.committed, status.lagging), (1, 1));
        assert_eq!(titles(&r), vec!["x"]);

        // Still reconciles when the stream finally catches up.
        let events = r.on_stream_event(&up_to_date(9));
        assert_eq!(events, vec![SessionEvent::Reconciled { id, txid: Watermark(9) }]);
    }

    #[test]
    fn test_detached_mutation_still_reconciles() {
        let mut r = reconciler();
        let now = Instant::now();
        let id = r.apply_optimistic(create("x", "a"), now).unwrap();
        assert!(r.detach(&id));

        r.mark_committed(id, Some(Watermark(3)), now);
        let events = r.on_stream_event(&up_to_date(3));
        assert_eq!(events, vec![SessionEvent::Reconciled { id, txid: Watermark(3) }]);
        assert!(!r.detach(&id));
    }

    // =========================================================================
    // Resync
    // =========================================================================

    #[test]
    fn test_resync_swaps_baseline_on_up_to_date() {
        let mut r = reconciler();
        let now = Instant::now();
        r.on_stream_event(&insert(item("old", "old", false), 3));
        r.on_stream_event(&up_to_date(3));
        let pending = r.apply_optimistic(create("mine", "m"), now).unwrap();

        r.begin_resync();
        r.on_stream_event(&insert(item("new", "new", false), 1));
        // Partial replay stays hidden.
        assert!(r.baseline().contains_key(&ItemId::new("old")));
        assert!(r.get(&ItemId::new("new")).is_none());

        let events = r.on_stream_event(&up_to_date(4));
        assert_eq!(events, vec![SessionEvent::Resynced { position: Watermark(4) }]);
        assert!(!r.baseline().contains_key(&ItemId::new("old")));
        assert!(r.get(&ItemId::new("new")).is_some());
        // Overlays survive the swap.
        assert!(r.get(&ItemId::new("m")).is_some());
        assert_eq!(r.state(&pending), Some(MutationState::Pending));
    }

    #[test]
    fn test_must_refetch_starts_resync() {
        let mut r = reconciler();
        r.on_stream_event(&ShapeMessage::must_refetch());
        assert!(r.is_resyncing());
        r.on_stream_event(&up_to_date(0));
        assert!(!r.is_resyncing());
        assert!(r.is_synced());
    }

    // =========================================================================
    // Convergence against a model executor
    // =========================================================================

    /// Minimal executor with a commit clock and change log.
    #[derive(Default)]
    struct ModelServer {
        items: BTreeMap<ItemId, Item>,
        txid: u64,
        log: Vec<ShapeMessage>,
    }

    impl ModelServer {
        fn execute(&mut self, mutation: &Mutation) -> Result<Option<Watermark>, String> {
            let next = Watermark(self.txid + 1);
            let mut rows = Vec::new();
            match mutation {
                Mutation::Create(new) => {
                    if self.items.contains_key(&new.id) {
                        return Err("exists".into());
                    }
                    let item = new.clone().into_item(5_000 + self.txid);
                    self.items.insert(item.id.clone(), item.clone());
                    rows.push((Operation::Insert, item.id.clone(), Some(item)));
                }
                Mutation::Update { id, changes } => {
                    let item = self.items.get_mut(id).ok_or("not found")?;
                    item.apply_changes(changes, 9_000);
                    rows.push((Operation::Update, id.clone(), Some(item.clone())));
                }
                Mutation::Toggle { id } => {
                    let item = self.items.get_mut(id).ok_or("not found")?;
                    item.completed = !item.completed;
                    rows.push((Operation::Update, id.clone(), Some(item.clone())));
                }
                Mutation::Delete { ids } => {
                    for id in ids {
                        if self.items.remove(id).is_some() {
                            rows.push((Operation::Delete, id.clone(), None));
                        }
                    }
                }
                Mutation::ClearCompleted => {
                    let done: Vec<ItemId> =
                        self.items.values().filter(|i| i.completed).map(|i| i.id.clone()).collect();
                    if done.is_empty() {
                        return Ok(None);
                    }
                    for id in done {
                        self.items.remove(&id);
                        rows.push((Operation::Delete, id, None));
                    }
                }
            }
            self.txid = next.0;
            for (operation, key, value) in rows {
                self.log.push(change(operation, key.as_str(), value, next.0));
            }
            Ok(Some(next))
        }

        fn drain(&mut self) -> Vec<ShapeMessage> {
            let mut out = std::mem::take(&mut self.log);
            out.push(up_to_date(self.txid));
            out
        }

        fn state(&self) -> Vec<Item> {
            let mut items: Vec<Item> = self.items.values().cloned().collect();
            items.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
            items
        }
    }

    #[test]
    fn test_converges_to_store_state() {
        let mut server = ModelServer::default();
        let mut r = reconciler();
        let now = Instant::now();

        let script = vec![
            create("Buy milk", "a"),
            create("Walk dog", "b"),
            create("Write report", "c"),
            Mutation::Toggle { id: ItemId::new("b") },
            Mutation::Update { id: ItemId::new("a"), changes: ItemChanges::title("Buy oat milk") },
            Mutation::Update { id: ItemId::new("zzz"), changes: ItemChanges::title("ghost") },
            Mutation::Toggle { id: ItemId::new("c") },
            Mutation::ClearCompleted,
            Mutation::ClearCompleted,
            Mutation::Delete { ids: vec![ItemId::new("a"), ItemId::new("nope")] },
            create("Call mom", "d"),
        ];

        // Issue everything optimistically, answer in reverse order, deliver
        // the stream in halves between answers.
        let ids: Vec<MutationId> =
            script.iter().map(|m| r.apply_optimistic(m.clone(), now).unwrap()).collect();
        let results: Vec<_> = script.iter().map(|m| server.execute(m)).collect();

        let stream = server.drain();
        let (early, late) = stream.split_at(stream.len() / 2);
        for e in early {
            r.on_stream_event(e);
        }
        for (id, result) in ids.iter().zip(results).rev() {
            match result {
                Ok(txid) => {
                    r.mark_committed(*id, txid, now);
                }
                Err(reason) => {
                    r.mark_failed(*id, reason);
                }
            }
        }
        for e in late {
            r.on_stream_event(e);
        }

        assert!(r.status().is_idle());
        assert_eq!(r.view(), server.state());
    }
}
