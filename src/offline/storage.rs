//! Durable key/value storage for the offline queue.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use rusqlite::{params, Connection, OptionalExtension};

use crate::config::Config;
use crate::error::PersistenceError;

/// Minimal key/value store. Values are serialized JSON.
pub trait DurableStore: Send + Sync {
  fn get(&self, key: &str) -> Result<Option<String>, PersistenceError>;

  fn put(&self, key: &str, value: &str) -> Result<(), PersistenceError>;

  fn remove(&self, key: &str) -> Result<(), PersistenceError>;
}

/// SQLite-backed store in the user data directory.
pub struct SqliteStore {
  conn: Mutex<Connection>,
}

impl SqliteStore {
  /// Open the store at the default location.
  pub fn open() -> Result<Self, PersistenceError> {
    Self::open_at(&Self::default_path()?)
  }

  pub fn open_at(path: &Path) -> Result<Self, PersistenceError> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)?;
    }

    let conn = Connection::open(path)?;
    let store = Self {
      conn: Mutex::new(conn),
    };
    store.run_migrations()?;

    Ok(store)
  }

  pub fn default_path() -> Result<PathBuf, PersistenceError> {
    let data_dir =
      Config::data_dir().map_err(|e| PersistenceError::Unavailable(e.to_string()))?;

    Ok(data_dir.join("queue.db"))
  }

  fn run_migrations(&self) -> Result<(), PersistenceError> {
    let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
    conn.execute_batch(SCHEMA)?;
    Ok(())
  }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv_store (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

impl DurableStore for SqliteStore {
  fn get(&self, key: &str) -> Result<Option<String>, PersistenceError> {
    let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
    let value = conn
      .query_row(
        "SELECT value FROM kv_store WHERE key = ?",
        params![key],
        |row| row.get(0),
      )
      .optional()?;
    Ok(value)
  }

  fn put(&self, key: &str, value: &str) -> Result<(), PersistenceError> {
    let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
    conn.execute(
      "INSERT OR REPLACE INTO kv_store (key, value, updated_at) VALUES (?, ?, datetime('now'))",
      params![key, value],
    )?;
    Ok(())
  }

  fn remove(&self, key: &str) -> Result<(), PersistenceError> {
    let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
    conn.execute("DELETE FROM kv_store WHERE key = ?", params![key])?;
    Ok(())
  }
}

/// Process-local store, used when the data directory is unavailable.
#[derive(Default)]
pub struct MemoryStore {
  values: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }
}

impl DurableStore for MemoryStore {
  fn get(&self, key: &str) -> Result<Option<String>, PersistenceError> {
    let values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
    Ok(values.get(key).cloned())
  }

  fn put(&self, key: &str, value: &str) -> Result<(), PersistenceError> {
    let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
    values.insert(key.to_string(), value.to_string());
    Ok(())
  }

  fn remove(&self, key: &str) -> Result<(), PersistenceError> {
    let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
    values.remove(key);
    Ok(())
  }
}
