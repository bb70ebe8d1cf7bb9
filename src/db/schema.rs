/// Schema for the key-value store.
pub const SCHEMA: &str = r#"
-- One JSON-serialized StorageEntry per key
CREATE TABLE IF NOT EXISTS kv_entries (
    key TEXT PRIMARY KEY,
    entry TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Store bookkeeping (statistics), kept out of the user key space
CREATE TABLE IF NOT EXISTS kv_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;
