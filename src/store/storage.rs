//! SQLite and in-memory implementations of `KvBackend`.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, OptionalExtension};

use super::traits::KvBackend;
use crate::db::Database;
use crate::error::{StoreError, StoreResult};

/// SQLite-based storage implementation.
pub struct SqliteBackend {
  db: Mutex<Database>,
}

impl SqliteBackend {
  /// Open or create the store at `path`.
  pub fn open(path: &Path) -> StoreResult<Self> {
    Ok(Self {
      db: Mutex::new(Database::open(path)?),
    })
  }

  pub fn open_in_memory() -> StoreResult<Self> {
    Ok(Self {
      db: Mutex::new(Database::open_in_memory()?),
    })
  }

  fn lock(&self) -> StoreResult<MutexGuard<'_, Database>> {
    self
      .db
      .lock()
      .map_err(|e| StoreError::Backend(format!("Lock poisoned: {}", e)))
  }
}

impl KvBackend for SqliteBackend {
  fn get_raw(&self, key: &str) -> StoreResult<Option<String>> {
    let db = self.lock()?;
    let entry = db
      .conn()
      .query_row(
        "SELECT entry FROM kv_entries WHERE key = ?",
        params![key],
        |row| row.get(0),
      )
      .optional()?;
    Ok(entry)
  }

  fn put_raw(&self, key: &str, entry: &str) -> StoreResult<()> {
    let db = self.lock()?;
    db.conn()
      .execute(
        "INSERT OR REPLACE INTO kv_entries (key, entry, updated_at)
         VALUES (?, ?, datetime('now'))",
        params![key, entry],
      )
      .map_err(|e| StoreError::Backend(format!("Failed to store entry {}: {}", key, e)))?;
    Ok(())
  }

  fn delete_raw(&self, key: &str) -> StoreResult<bool> {
    let db = self.lock()?;
    let removed = db
      .conn()
      .execute("DELETE FROM kv_entries WHERE key = ?", params![key])?;
    Ok(removed > 0)
  }

  fn contains(&self, key: &str) -> StoreResult<bool> {
    let db = self.lock()?;
    let exists: bool = db.conn().query_row(
      "SELECT EXISTS(SELECT 1 FROM kv_entries WHERE key = ?)",
      params![key],
      |row| row.get(0),
    )?;
    Ok(exists)
  }

  fn keys(&self) -> StoreResult<Vec<String>> {
    let db = self.lock()?;
    let mut stmt = db.conn().prepare("SELECT key FROM kv_entries ORDER BY key")?;
    let keys = stmt
      .query_map([], |row| row.get(0))?
      .collect::<Result<Vec<String>, _>>()?;
    Ok(keys)
  }

  fn count(&self) -> StoreResult<usize> {
    let db = self.lock()?;
    let count: i64 = db
      .conn()
      .query_row("SELECT COUNT(*) FROM kv_entries", [], |row| row.get(0))?;
    Ok(count as usize)
  }

  fn clear(&self) -> StoreResult<()> {
    let db = self.lock()?;
    db.conn().execute("DELETE FROM kv_entries", [])?;
    Ok(())
  }

  fn get_meta(&self, key: &str) -> StoreResult<Option<String>> {
    let db = self.lock()?;
    let value = db
      .conn()
      .query_row(
        "SELECT value FROM kv_meta WHERE key = ?",
        params![key],
        |row| row.get(0),
      )
      .optional()?;
    Ok(value)
  }

  fn set_meta(&self, key: &str, value: &str) -> StoreResult<()> {
    let db = self.lock()?;
    db.conn().execute(
      "INSERT OR REPLACE INTO kv_meta (key, value) VALUES (?, ?)",
      params![key, value],
    )?;
    Ok(())
  }
}

/// Storage implementation that keeps everything in process memory.
#[derive(Default)]
pub struct MemoryBackend {
  entries: parking_lot::Mutex<BTreeMap<String, String>>,
  meta: parking_lot::Mutex<HashMap<String, String>>,
}

impl MemoryBackend {
  pub fn new() -> Self {
    Self::default()
  }
}

impl KvBackend for MemoryBackend {
  fn get_raw(&self, key: &str) -> StoreResult<Option<String>> {
    Ok(self.entries.lock().get(key).cloned())
  }

  fn put_raw(&self, key: &str, entry: &str) -> StoreResult<()> {
    self
      .entries
      .lock()
      .insert(key.to_string(), entry.to_string());
    Ok(())
  }

  fn delete_raw(&self, key: &str) -> StoreResult<bool> {
    Ok(self.entries.lock().remove(key).is_some())
  }

  fn contains(&self, key: &str) -> StoreResult<bool> {
    Ok(self.entries.lock().contains_key(key))
  }

  fn keys(&self) -> StoreResult<Vec<String>> {
    Ok(self.entries.lock().keys().cloned().collect())
  }

  fn count(&self) -> StoreResult<usize> {
    Ok(self.entries.lock().len())
  }

  fn clear(&self) -> StoreResult<()> {
    self.entries.lock().clear();
    Ok(())
  }

  fn get_meta(&self, key: &str) -> StoreResult<Option<String>> {
    Ok(self.meta.lock().get(key).cloned())
  }

  fn set_meta(&self, key: &str, value: &str) -> StoreResult<()> {
    self.meta.lock().insert(key.to_string(), value.to_string());
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn exercise(backend: &dyn KvBackend) {
    assert_eq!(backend.get_raw("a").unwrap(), None);
    assert!(!backend.contains("a").unwrap());

    backend.put_raw("b", "2").unwrap();
    backend.put_raw("a", "1").unwrap();
    backend.put_raw("a", "1b").unwrap();
    assert_eq!(backend.get_raw("a").unwrap().as_deref(), Some("1b"));
    assert!(backend.contains("a").unwrap());
    assert_eq!(backend.keys().unwrap(), vec!["a".to_string(), "b".to_string()]);
    assert_eq!(backend.count().unwrap(), 2);

    assert!(backend.delete_raw("a").unwrap());
    assert!(!backend.delete_raw("a").unwrap());
    assert_eq!(backend.count().unwrap(), 1);

    backend.set_meta("stats", "{}").unwrap();
    backend.clear().unwrap();
    assert_eq!(backend.count().unwrap(), 0);
    assert!(backend.keys().unwrap().is_empty());
    assert_eq!(backend.get_meta("stats").unwrap().as_deref(), Some("{}"));
  }

  #[test]
  fn memory_backend_contract() {
    exercise(&MemoryBackend::new());
  }

  #[test]
  fn sqlite_backend_contract() {
    exercise(&SqliteBackend::open_in_memory().unwrap());
  }

  #[test]
  fn sqlite_backend_persists_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.db");
    {
      let backend = SqliteBackend::open(&path).unwrap();
      backend.put_raw("k", "v").unwrap();
      backend.set_meta("m", "1").unwrap();
    }
    let backend = SqliteBackend::open(&path).unwrap();
    assert_eq!(backend.get_raw("k").unwrap().as_deref(), Some("v"));
    assert_eq!(backend.get_meta("m").unwrap().as_deref(), Some("1"));
  }
}
