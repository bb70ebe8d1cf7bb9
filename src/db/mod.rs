pub mod schema;

use rusqlite::Connection;
use std::path::Path;

use crate::error::{StoreError, StoreResult};

/// SQLite connection with the store schema applied
pub struct Database {
  conn: Connection,
}

impl Database {
  /// Open or create the database at `path`
  pub fn open(path: &Path) -> StoreResult<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      if !parent.as_os_str().is_empty() {
        std::fs::create_dir_all(parent).map_err(|e| {
          StoreError::Backend(format!("Failed to create database directory: {}", e))
        })?;
      }
    }

    let conn = Connection::open(path).map_err(|e| {
      StoreError::Backend(format!(
        "Failed to open database at {}: {}",
        path.display(),
        e
      ))
    })?;

    let db = Self { conn };
    db.run_migrations()?;

    Ok(db)
  }

  /// Private in-memory database, discarded on drop
  pub fn open_in_memory() -> StoreResult<Self> {
    let db = Self {
      conn: Connection::open_in_memory()?,
    };
    db.run_migrations()?;
    Ok(db)
  }

  /// Run database migrations
  fn run_migrations(&self) -> StoreResult<()> {
    self
      .conn
      .execute_batch(schema::SCHEMA)
      .map_err(|e| StoreError::Backend(format!("Failed to run migrations: {}", e)))?;
    Ok(())
  }

  /// Get a reference to the connection
  pub fn conn(&self) -> &Connection {
    &self.conn
  }
}
