//! Durable key-value store trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// A stored value with its bookkeeping.
#[derive(Debug, Clone)]
pub struct StoredBlob {
  /// Encoded payload
  pub value: String,
  /// Digest of the decoded payload
  pub digest: String,
  /// When the value was written
  pub written_at: DateTime<Utc>,
}

/// Trait for durable store backends.
pub trait DurableStore: Send + Sync {
  /// Get the value stored under a key.
  fn get(&self, key: &str) -> Result<Option<StoredBlob>>;

  /// Store a value. Returns false if the stored digest already matched and nothing was written.
  fn put(&self, key: &str, value: &str, digest: &str) -> Result<bool>;

  /// Remove a single key.
  fn remove(&self, key: &str) -> Result<()>;

  /// Remove everything.
  fn clear(&self) -> Result<()>;
}

/// Store that doesn't persist anything.
/// Used when caching is disabled - all operations are no-ops.
pub struct NoopStore;

impl DurableStore for NoopStore {
  fn get(&self, _key: &str) -> Result<Option<StoredBlob>> {
    Ok(None) // Always miss
  }

  fn put(&self, _key: &str, _value: &str, _digest: &str) -> Result<bool> {
    Ok(false) // Discard
  }

  fn remove(&self, _key: &str) -> Result<()> {
    Ok(())
  }

  fn clear(&self) -> Result<()> {
    Ok(())
  }
}

/// SQLite-backed durable store.
pub struct SqliteStore {
  conn: Mutex<Connection>,
}

impl SqliteStore {
  /// Open the store at the given path, or the default location.
  pub fn open(path: Option<&Path>) -> Result<Self> {
    let path = match path {
      Some(p) => p.to_path_buf(),
      None => Self::default_path()?,
    };

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(&path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Open a throwaway in-memory store.
  pub fn open_in_memory() -> Result<Self> {
    let conn =
      Connection::open_in_memory().map_err(|e| eyre!("Failed to open in-memory cache: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let store = Self {
      conn: Mutex::new(conn),
    };
    store.run_migrations()?;
    Ok(store)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("draftcache").join("cache.db"))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute_batch(STORE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }
}

/// Schema for the key-value table.
const STORE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv_store (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    digest TEXT NOT NULL,
    written_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

impl DurableStore for SqliteStore {
  fn get(&self, key: &str) -> Result<Option<StoredBlob>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let row: Option<(String, String, String)> = conn
      .query_row(
        "SELECT value, digest, written_at FROM kv_store WHERE key = ?",
        params![key],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read {}: {}", key, e))?;

    match row {
      Some((value, digest, written_at)) => Ok(Some(StoredBlob {
        value,
        digest,
        written_at: parse_datetime(&written_at)?,
      })),
      None => Ok(None),
    }
  }

  fn put(&self, key: &str, value: &str, digest: &str) -> Result<bool> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let existing: Option<String> = conn
      .query_row(
        "SELECT digest FROM kv_store WHERE key = ?",
        params![key],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read digest for {}: {}", key, e))?;

    if existing.as_deref() == Some(digest) {
      return Ok(false);
    }

    conn
      .execute(
        "INSERT OR REPLACE INTO kv_store (key, value, digest, written_at)
         VALUES (?, ?, ?, datetime('now'))",
        params![key, value, digest],
      )
      .map_err(|e| eyre!("Failed to write {}: {}", key, e))?;

    Ok(true)
  }

  fn remove(&self, key: &str) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute("DELETE FROM kv_store WHERE key = ?", params![key])
      .map_err(|e| eyre!("Failed to remove {}: {}", key, e))?;

    Ok(())
  }

  fn clear(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute("DELETE FROM kv_store", [])
      .map_err(|e| eyre!("Failed to clear cache: {}", e))?;

    Ok(())
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_put_get_remove() {
    let store = SqliteStore::open_in_memory().unwrap();
    assert!(store.get("kind:prompt").unwrap().is_none());

    assert!(store.put("kind:prompt", "payload", "d1").unwrap());
    let blob = store.get("kind:prompt").unwrap().unwrap();
    assert_eq!(blob.value, "payload");
    assert_eq!(blob.digest, "d1");

    store.remove("kind:prompt").unwrap();
    assert!(store.get("kind:prompt").unwrap().is_none());
  }

  #[test]
  fn test_unchanged_digest_skips_write() {
    let store = SqliteStore::open_in_memory().unwrap();
    assert!(store.put("k", "v1", "same").unwrap());
    assert!(!store.put("k", "v2", "same").unwrap());
    assert_eq!(store.get("k").unwrap().unwrap().value, "v1");
    assert!(store.put("k", "v3", "other").unwrap());
    assert_eq!(store.get("k").unwrap().unwrap().value, "v3");
  }

  #[test]
  fn test_clear() {
    let store = SqliteStore::open_in_memory().unwrap();
    store.put("a", "1", "x").unwrap();
    store.put("b", "2", "y").unwrap();
    store.clear().unwrap();
    assert!(store.get("a").unwrap().is_none());
    assert!(store.get("b").unwrap().is_none());
  }

  #[test]
  fn test_open_on_disk_creates_parent() {
    let dir = std::env::temp_dir().join(format!("draftcache-test-{}", uuid::Uuid::new_v4()));
    let path = dir.join("nested").join("cache.db");
    {
      let store = SqliteStore::open(Some(&path)).unwrap();
      store.put("k", "v", "d").unwrap();
    }
    let reopened = SqliteStore::open(Some(&path)).unwrap();
    assert_eq!(reopened.get("k").unwrap().unwrap().value, "v");
    let _ = std::fs::remove_dir_all(&dir);
  }

  #[test]
  fn test_noop_store() {
    let store = NoopStore;
    assert!(!store.put("k", "v", "d").unwrap());
    assert!(store.get("k").unwrap().is_none());
  }
}
