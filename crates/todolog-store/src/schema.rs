//! Table, clock, and trigger definitions.

pub(crate) const SCHEMA: &str = r#"
-- Items (one row per todo)
CREATE TABLE IF NOT EXISTS todos (
    id TEXT PRIMARY KEY,
    title TEXT NOT NULL,
    completed INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL DEFAULT (CAST(unixepoch('subsec') * 1000 AS INTEGER)),
    updated_at INTEGER NOT NULL DEFAULT (CAST(unixepoch('subsec') * 1000 AS INTEGER))
);
CREATE INDEX IF NOT EXISTS idx_todos_created ON todos(created_at);

-- Commit clock (single row). Bumped first thing in every write transaction.
CREATE TABLE IF NOT EXISTS commit_clock (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    txid INTEGER NOT NULL
);
INSERT OR IGNORE INTO commit_clock (id, txid) VALUES (1, 0);

-- Change log (append-only, immutable)
CREATE TABLE IF NOT EXISTS todo_changes (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    txid INTEGER NOT NULL,
    operation TEXT NOT NULL,
    key TEXT NOT NULL,
    value TEXT
);
CREATE INDEX IF NOT EXISTS idx_todo_changes_txid ON todo_changes(txid);

CREATE TRIGGER IF NOT EXISTS todos_log_insert AFTER INSERT ON todos
BEGIN
    INSERT INTO todo_changes (txid, operation, key, value)
    VALUES (
        (SELECT txid FROM commit_clock WHERE id = 1),
        'insert',
        NEW.id,
        json_object(
            'id', NEW.id,
            'title', NEW.title,
            'completed', json(CASE WHEN NEW.completed THEN 'true' ELSE 'false' END),
            'createdAt', NEW.created_at,
            'updatedAt', NEW.updated_at
        )
    );
END;

CREATE TRIGGER IF NOT EXISTS todos_log_update AFTER UPDATE ON todos
BEGIN
    INSERT INTO todo_changes (txid, operation, key, value)
    VALUES (
        (SELECT txid FROM commit_clock WHERE id = 1),
        'update',
        NEW.id,
        json_object(
            'id', NEW.id,
            'title', NEW.title,
            'completed', json(CASE WHEN NEW.completed THEN 'true' ELSE 'false' END),
            'createdAt', NEW.created_at,
            'updatedAt', NEW.updated_at
        )
    );
END;

CREATE TRIGGER IF NOT EXISTS todos_log_delete AFTER DELETE ON todos
BEGIN
    INSERT INTO todo_changes (txid, operation, key, value)
    VALUES ((SELECT txid FROM commit_clock WHERE id = 1), 'delete', OLD.id, NULL);
END;
"#;
