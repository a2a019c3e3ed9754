//! The mutation executor and log reader.

use std::path::Path;
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::{Connection, ErrorCode, OptionalExtension, Row, Transaction, TransactionBehavior, params};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use todolog_types::{Item, ItemChanges, ItemId, LogOffset, NewItem, ValidationError, Watermark, now_millis};

use crate::error::StoreError;
use crate::log::{ChangeRow, LogBatch, LogEntry};
use crate::schema::SCHEMA;

/// How long a writer waits on a locked database before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const ITEM_COLUMNS: &str = "id, title, completed, created_at, updated_at";

/// A write result paired with the watermark of the transaction that made it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Committed<T> {
    pub value: T,
    pub txid: Watermark,
}

/// Database handle for items and their change log.
///
/// Cheap to share behind an `Arc`. All access is serialized through one
/// connection; SQLite is the unit of isolation.
pub struct TodoStore {
    conn: Mutex<Connection>,
    /// Latest committed watermark, for live log readers.
    commits: watch::Sender<Watermark>,
}

impl std::fmt::Debug for TodoStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TodoStore")
            .field("committed", &*self.commits.borrow())
            .finish_non_exhaustive()
    }
}

impl TodoStore {
    /// Open or create a database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path.as_ref())?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        debug!(path = %path.as_ref().display(), journal_mode = %mode, "opened store");
        Self::init(conn)
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        let txid = read_clock(&conn)?;
        info!(%txid, "store ready");
        let (commits, _) = watch::channel(txid);
        Ok(Self { conn: Mutex::new(conn), commits })
    }

    /// Watch the latest committed watermark.
    pub fn subscribe_commits(&self) -> watch::Receiver<Watermark> {
        self.commits.subscribe()
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Insert a new item. Missing timestamps default to write time.
    pub fn create(&self, new: NewItem) -> Result<Committed<Item>, StoreError> {
        new.validate()?;
        let item = new.into_item(now_millis());

        let committed = self.write("create", |tx| {
            let inserted = tx.execute(
                "INSERT INTO todos (id, title, completed, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    item.id.as_str(),
                    item.title,
                    item.completed,
                    item.created_at as i64,
                    item.updated_at as i64,
                ],
            );
            match inserted {
                Ok(_) => Ok(Some(item.clone())),
                Err(e) if is_constraint_violation(&e) => Err(StoreError::AlreadyExists(item.id.clone())),
                Err(e) => Err(e.into()),
            }
        })?;
        always_committed(committed)
    }

    /// Apply a partial change set. Fails with `NotFound` if no row was modified.
    pub fn update(&self, id: &ItemId, changes: &ItemChanges) -> Result<Committed<Item>, StoreError> {
        id.validate()?;
        changes.validate()?;
        let now = now_millis() as i64;

        let committed = self.write("update", |tx| {
            let item = tx
                .query_row(
                    &format!(
                        "UPDATE todos
                         SET title = COALESCE(?2, title),
                             completed = COALESCE(?3, completed),
                             created_at = COALESCE(?5, created_at),
                             updated_at = COALESCE(?6, MAX(updated_at, ?4))
                         WHERE id = ?1
                         RETURNING {ITEM_COLUMNS}"
                    ),
                    params![
                        id.as_str(),
                        changes.title,
                        changes.completed,
                        now,
                        changes.created_at.map(|ms| ms as i64),
                        changes.updated_at.map(|ms| ms as i64),
                    ],
                    item_from_row,
                )
                .optional()?;
            item.map(Some).ok_or_else(|| StoreError::NotFound(id.clone()))
        })?;
        always_committed(committed)
    }

    /// Flip the completion flag. Reads the current state first.
    pub fn toggle(&self, id: &ItemId) -> Result<Committed<Item>, StoreError> {
        id.validate()?;
        let now = now_millis() as i64;

        let committed = self.write("toggle", |tx| {
            let completed: Option<bool> = tx
                .query_row("SELECT completed FROM todos WHERE id = ?1", params![id.as_str()], |row| {
                    row.get(0)
                })
                .optional()?;
            let Some(completed) = completed else {
                return Err(StoreError::NotFound(id.clone()));
            };

            let item = tx.query_row(
                &format!(
                    "UPDATE todos SET completed = ?2, updated_at = MAX(updated_at, ?3)
                     WHERE id = ?1
                     RETURNING {ITEM_COLUMNS}"
                ),
                params![id.as_str(), !completed, now],
                item_from_row,
            )?;
            Ok(Some(item))
        })?;
        always_committed(committed)
    }

    /// Delete one or more items. Unknown ids are ignored; the write still commits.
    pub fn delete(&self, ids: &[ItemId]) -> Result<Watermark, StoreError> {
        if ids.is_empty() {
            return Err(ValidationError::EmptyIdList.into());
        }
        for id in ids {
            id.validate()?;
        }

        let committed = self.write("delete", |tx| {
            let mut stmt = tx.prepare_cached("DELETE FROM todos WHERE id = ?1")?;
            let mut removed = 0;
            for id in ids {
                removed += stmt.execute(params![id.as_str()])?;
            }
            debug!(requested = ids.len(), removed, "delete applied");
            Ok(Some(()))
        })?;
        always_committed(committed).map(|c| c.txid)
    }

    /// Delete every completed item. Returns `None` (and writes nothing) when no
    /// item is completed.
    pub fn clear_completed(&self) -> Result<Option<Watermark>, StoreError> {
        let committed = self.write("clear_completed", |tx| {
            let mut stmt = tx.prepare_cached("SELECT id FROM todos WHERE completed = 1")?;
            let ids = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            if ids.is_empty() {
                return Ok(None);
            }

            let mut delete = tx.prepare_cached("DELETE FROM todos WHERE id = ?1")?;
            for id in &ids {
                delete.execute(params![id])?;
            }
            debug!(cleared = ids.len(), "clear completed applied");
            Ok(Some(()))
        })?;
        Ok(committed.map(|c| c.txid))
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// All items, oldest first.
    pub fn list(&self) -> Result<Vec<Item>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {ITEM_COLUMNS} FROM todos ORDER BY created_at, id"
        ))?;
        let rows = stmt.query_map([], item_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Get an item by id.
    pub fn get(&self, id: &ItemId) -> Result<Option<Item>, StoreError> {
        let conn = self.conn.lock();
        let item = conn
            .query_row(
                &format!("SELECT {ITEM_COLUMNS} FROM todos WHERE id = ?1"),
                params![id.as_str()],
                item_from_row,
            )
            .optional()?;
        Ok(item)
    }

    /// Latest committed watermark.
    pub fn current_txid(&self) -> Result<Watermark, StoreError> {
        let conn = self.conn.lock();
        read_clock(&conn)
    }

    /// Read up to `limit` change-log entries after `after`, together with the
    /// committed clock value from the same snapshot.
    ///
    /// Malformed rows are logged and skipped.
    pub fn read_log(&self, after: LogOffset, limit: usize) -> Result<LogBatch, StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let rows = {
            let mut stmt = tx.prepare_cached(
                "SELECT seq, txid, operation, key, value FROM todo_changes
                 WHERE seq > ?1 ORDER BY seq LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![after.0 as i64, (limit as i64).saturating_add(1)], |row| {
                Ok(ChangeRow {
                    seq: row.get(0)?,
                    txid: row.get(1)?,
                    operation: row.get(2)?,
                    key: row.get(3)?,
                    value: row.get(4)?,
                })
            })?;
            rows.collect::<Result<Vec<_>, _>>()?
        };
        let txid = current_txid(&tx)?;
        tx.commit()?;
        drop(conn);

        let has_more = rows.len() > limit;
        let mut entries: Vec<LogEntry> = Vec::with_capacity(rows.len().min(limit));
        for row in rows.into_iter().take(limit) {
            let seq = row.seq;
            match row.into_entry() {
                Ok(entry) => entries.push(entry),
                Err(reason) => warn!(seq, %reason, "skipping malformed change-log row"),
            }
        }

        Ok(LogBatch { entries, txid, has_more })
    }

    // =========================================================================
    // Internal helpers
    // =========================================================================

    /// Run `apply` inside one immediate transaction.
    ///
    /// The transaction assigns itself the next commit id before any write, so
    /// trigger-written log rows carry it. `apply` returning `Ok(None)` means
    /// there was nothing to write: the transaction (and its id) is rolled back.
    /// Errors roll back as well.
    fn write<T>(
        &self,
        op: &'static str,
        apply: impl FnOnce(&Transaction<'_>) -> Result<Option<T>, StoreError>,
    ) -> Result<Option<Committed<T>>, StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        assign_txid(&tx)?;

        let Some(value) = apply(&tx)? else {
            tx.rollback()?;
            debug!(op, "nothing to write, rolled back");
            return Ok(None);
        };

        // Read inside the transaction: the value lower-bounds the point at
        // which this write becomes visible in the change log.
        let txid = current_txid(&tx)?;
        tx.commit()?;
        drop(conn);

        self.commits.send_if_modified(|latest| {
            if txid > *latest {
                *latest = txid;
                true
            } else {
                false
            }
        });
        info!(op, %txid, "committed");
        Ok(Some(Committed { value, txid }))
    }
}

/// Assign the running transaction its commit id.
fn assign_txid(tx: &Transaction<'_>) -> Result<(), StoreError> {
    tx.execute("UPDATE commit_clock SET txid = txid + 1 WHERE id = 1", [])?;
    Ok(())
}

/// Introspect the current transaction's commit id.
fn current_txid(tx: &Transaction<'_>) -> Result<Watermark, StoreError> {
    read_clock(tx)
}

fn read_clock(conn: &Connection) -> Result<Watermark, StoreError> {
    let txid: i64 = conn.query_row("SELECT txid FROM commit_clock WHERE id = 1", [], |row| row.get(0))?;
    Ok(Watermark(txid.max(0) as u64))
}

/// Writes that always produce a value never hit the rollback branch.
fn always_committed<T>(committed: Option<Committed<T>>) -> Result<Committed<T>, StoreError> {
    committed.ok_or(StoreError::Sqlite(rusqlite::Error::QueryReturnedNoRows))
}

fn item_from_row(row: &Row<'_>) -> rusqlite::Result<Item> {
    Ok(Item {
        id: ItemId::new(row.get::<_, String>(0)?),
        title: row.get(1)?,
        completed: row.get(2)?,
        created_at: row.get::<_, i64>(3)?.max(0) as u64,
        updated_at: row.get::<_, i64>(4)?.max(0) as u64,
    })
}

fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(e, rusqlite::Error::SqliteFailure(err, _) if err.code == ErrorCode::ConstraintViolation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use todolog_types::Operation;

    fn store() -> TodoStore {
        TodoStore::in_memory().expect("in-memory store")
    }

    fn add(store: &TodoStore, id: &str, title: &str) -> Committed<Item> {
        store.create(NewItem::new(ItemId::new(id), title)).expect("create")
    }

    fn log(store: &TodoStore) -> Vec<LogEntry> {
        store.read_log(LogOffset::START, 1000).expect("read log").entries
    }

    // =========================================================================
    // Watermarks
    // =========================================================================

    #[test]
    fn test_watermarks_strictly_increase() {
        let store = store();
        let a = add(&store, "a", "one");
        let b = store.toggle(&ItemId::new("a")).unwrap();
        let c = add(&store, "b", "two");
        let d = store.delete(&[ItemId::new("b")]).unwrap();

        assert!(a.txid < b.txid);
        assert!(b.txid < c.txid);
        assert!(c.txid < d);
        assert_eq!(store.current_txid().unwrap(), d);
    }

    #[test]
    fn test_log_rows_carry_the_returned_watermark() {
        let store = store();
        let created = add(&store, "a", "Buy milk");
        let updated = store.update(&ItemId::new("a"), &ItemChanges::title("Buy oat milk")).unwrap();

        let entries = log(&store);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].operation, Operation::Insert);
        assert_eq!(entries[0].txid, created.txid);
        assert_eq!(entries[0].value.as_ref(), Some(&created.value));
        assert_eq!(entries[1].operation, Operation::Update);
        assert_eq!(entries[1].txid, updated.txid);
        assert_eq!(entries[1].value.as_ref().unwrap().title, "Buy oat milk");
    }

    #[test]
    fn test_commit_watch_tracks_latest() {
        let store = store();
        let rx = store.subscribe_commits();
        assert_eq!(*rx.borrow(), Watermark::ZERO);
        let created = add(&store, "a", "x");
        assert_eq!(*rx.borrow(), created.txid);
    }

    // =========================================================================
    // Validation and failures
    // =========================================================================

    #[test]
    fn test_validation_never_reaches_storage() {
        let store = store();
        let err = store.create(NewItem::new(ItemId::new("a"), "  ")).unwrap_err();
        assert!(matches!(err, StoreError::Validation(ValidationError::EmptyTitle)));

        add(&store, "b", "ok");
        let before = store.current_txid().unwrap();
        let err = store.update(&ItemId::new("b"), &ItemChanges::default()).unwrap_err();
        assert!(matches!(err, StoreError::Validation(ValidationError::EmptyChanges)));
        let err = store.delete(&[]).unwrap_err();
        assert!(matches!(err, StoreError::Validation(ValidationError::EmptyIdList)));

        assert_eq!(store.current_txid().unwrap(), before);
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn test_update_unknown_rolls_back() {
        let store = store();
        add(&store, "a", "x");
        let before = store.current_txid().unwrap();

        let err = store.update(&ItemId::new("zzz"), &ItemChanges::completed(true)).unwrap_err();
        assert!(matches!(err, StoreError::NotFound(ref id) if id.as_str() == "zzz"));
        assert_eq!(store.current_txid().unwrap(), before);
        assert_eq!(log(&store).len(), 1);
    }

    #[test]
    fn test_update_sets_explicit_timestamps() {
        let store = store();
        add(&store, "a", "x");

        let changes = ItemChanges { created_at: Some(10), updated_at: Some(20), ..ItemChanges::default() };
        let committed = store.update(&ItemId::new("a"), &changes).unwrap();
        assert_eq!((committed.value.created_at, committed.value.updated_at), (10, 20));
        assert_eq!(committed.value.title, "x");
        assert_eq!(store.get(&ItemId::new("a")).unwrap().unwrap(), committed.value);
    }

    #[test]
    fn test_toggle_flips_and_rejects_unknown() {
        let store = store();
        add(&store, "a", "x");

        let first = store.toggle(&ItemId::new("a")).unwrap();
        assert!(first.value.completed);
        let second = store.toggle(&ItemId::new("a")).unwrap();
        assert!(!second.value.completed);
        assert!(second.value.updated_at >= first.value.updated_at);

        let err = store.toggle(&ItemId::new("nope")).unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn test_duplicate_create_is_rejected() {
        let store = store();
        add(&store, "a", "x");
        let before = store.current_txid().unwrap();
        let err = store.create(NewItem::new(ItemId::new("a"), "y")).unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));
        assert_eq!(store.current_txid().unwrap(), before);
        assert_eq!(store.get(&ItemId::new("a")).unwrap().unwrap().title, "x");
    }

    // =========================================================================
    // Delete and clear completed
    // =========================================================================

    #[test]
    fn test_delete_unknown_ids_still_commits() {
        let store = store();
        let before = store.current_txid().unwrap();
        let txid = store.delete(&[ItemId::new("ghost")]).unwrap();
        assert!(txid > before);
        assert!(log(&store).is_empty());
    }

    #[test]
    fn test_clear_completed_noop_returns_none() {
        let store = store();
        add(&store, "a", "x");
        let before = store.current_txid().unwrap();

        assert_eq!(store.clear_completed().unwrap(), None);
        assert_eq!(store.current_txid().unwrap(), before);
    }

    #[test]
    fn test_clear_completed_removes_only_completed() {
        let store = store();
        add(&store, "a", "keep");
        add(&store, "b", "done");
        add(&store, "c", "also done");
        store.toggle(&ItemId::new("b")).unwrap();
        store.toggle(&ItemId::new("c")).unwrap();

        let txid = store.clear_completed().unwrap().expect("watermark");
        let remaining: Vec<_> = store.list().unwrap().into_iter().map(|i| i.id).collect();
        assert_eq!(remaining, vec![ItemId::new("a")]);

        let deletes: Vec<_> = log(&store)
            .into_iter()
            .filter(|e| e.operation == Operation::Delete)
            .collect();
        assert_eq!(deletes.len(), 2);
        assert!(deletes.iter().all(|e| e.txid == txid && e.value.is_none()));
    }

    // =========================================================================
    // Log reads
    // =========================================================================

    #[test]
    fn test_read_log_pages() {
        let store = store();
        for i in 0..5 {
            add(&store, &format!("item-{i}"), "x");
        }

        let first = store.read_log(LogOffset::START, 2).unwrap();
        assert_eq!(first.entries.len(), 2);
        assert!(first.has_more);

        let rest = store.read_log(first.next_offset(LogOffset::START), 10).unwrap();
        assert_eq!(rest.entries.len(), 3);
        assert!(!rest.has_more);
        assert_eq!(rest.txid, store.current_txid().unwrap());
        assert_eq!(rest.next_offset(LogOffset(99)), rest.entries[2].offset);
    }

    #[test]
    fn test_list_orders_by_creation() {
        let store = store();
        let mut late = NewItem::new(ItemId::new("late"), "late");
        late.created_at = Some(2_000);
        let mut early = NewItem::new(ItemId::new("early"), "early");
        early.created_at = Some(1_000);
        store.create(late).unwrap();
        store.create(early).unwrap();

        let ids: Vec<_> = store.list().unwrap().into_iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![ItemId::new("early"), ItemId::new("late")]);
    }

    #[test]
    fn test_file_store_persists_clock() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("todos.db");

        let txid = {
            let store = TodoStore::open(&path).unwrap();
            add(&store, "a", "x").txid
        };

        let store = TodoStore::open(&path).unwrap();
        assert_eq!(store.current_txid().unwrap(), txid);
        let next = add(&store, "b", "y");
        assert!(next.txid > txid);
        assert_eq!(store.list().unwrap().len(), 2);
    }
}
