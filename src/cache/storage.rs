//! Cache storage backends: in-memory map and SQLite persistence.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

use crate::envelope::ResultEnvelope;

/// A stored cache entry: the envelope plus its lifecycle metadata.
///
/// Owned exclusively by the cache store; mutated only through store operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
  pub value: ResultEnvelope,
  pub created_at: DateTime<Utc>,
  pub expires_at: DateTime<Utc>,
  pub last_accessed: DateTime<Utc>,
  pub tags: BTreeSet<String>,
}

impl CacheEntry {
  /// An entry is expired iff `now` is strictly past `expires_at`.
  pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
    now > self.expires_at
  }
}

/// Per-entry metadata used for eviction and invalidation sweeps.
#[derive(Debug, Clone)]
pub struct EntryMeta {
  pub key: String,
  pub last_accessed: DateTime<Utc>,
  pub tags: BTreeSet<String>,
}

/// Trait for cache storage backends.
pub trait StorageBackend: Send + Sync {
  /// Get an entry by key. A corrupt persisted entry is deleted and reported
  /// as a miss, never as an error.
  fn get(&self, key: &str) -> Result<Option<CacheEntry>>;

  /// Insert or replace an entry.
  fn set(&self, key: &str, entry: CacheEntry) -> Result<()>;

  /// Remove an entry; returns whether it existed.
  fn remove(&self, key: &str) -> Result<bool>;

  /// Remove all entries.
  fn clear(&self) -> Result<()>;

  /// Number of stored entries, expired or not.
  fn len(&self) -> Result<usize>;

  /// Whether a key is present (expiry is not considered here).
  fn contains(&self, key: &str) -> Result<bool>;

  /// Metadata for every entry, for eviction and invalidation sweeps.
  fn meta(&self) -> Result<Vec<EntryMeta>>;

  /// Update an entry's last-accessed timestamp.
  fn touch(&self, key: &str, at: DateTime<Utc>) -> Result<()>;
}

/// In-memory backend; entries die with the client.
#[derive(Default)]
pub struct MemoryBackend {
  entries: Mutex<HashMap<String, CacheEntry>>,
}

impl MemoryBackend {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, CacheEntry>>> {
    self.entries.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

impl StorageBackend for MemoryBackend {
  fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
    Ok(self.lock()?.get(key).cloned())
  }

  fn set(&self, key: &str, entry: CacheEntry) -> Result<()> {
    self.lock()?.insert(key.to_string(), entry);
    Ok(())
  }

  fn remove(&self, key: &str) -> Result<bool> {
    Ok(self.lock()?.remove(key).is_some())
  }

  fn clear(&self) -> Result<()> {
    self.lock()?.clear();
    Ok(())
  }

  fn len(&self) -> Result<usize> {
    Ok(self.lock()?.len())
  }

  fn contains(&self, key: &str) -> Result<bool> {
    Ok(self.lock()?.contains_key(key))
  }

  fn meta(&self) -> Result<Vec<EntryMeta>> {
    Ok(
      self
        .lock()?
        .iter()
        .map(|(key, entry)| EntryMeta {
          key: key.clone(),
          last_accessed: entry.last_accessed,
          tags: entry.tags.clone(),
        })
        .collect(),
    )
  }

  fn touch(&self, key: &str, at: DateTime<Utc>) -> Result<()> {
    if let Some(entry) = self.lock()?.get_mut(key) {
      entry.last_accessed = at;
    }
    Ok(())
  }
}

/// SQLite-backed persistent storage.
pub struct SqliteBackend {
  conn: Mutex<Connection>,
}

/// Schema for the response cache table.
const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS response_cache (
    key_hash TEXT PRIMARY KEY,
    cache_key TEXT NOT NULL,
    entry BLOB NOT NULL,
    expires_at TEXT NOT NULL,
    last_accessed TEXT NOT NULL,
    tags TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_response_cache_accessed
    ON response_cache(last_accessed);
"#;

const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

impl SqliteBackend {
  /// Open or create the cache database at the default location.
  pub fn open() -> Result<Self> {
    let path = Self::default_path()?;

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(&path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::from_connection(conn)
  }

  /// Open an in-memory database (used by tests).
  pub fn open_in_memory() -> Result<Self> {
    let conn =
      Connection::open_in_memory().map_err(|e| eyre!("Failed to open in-memory database: {}", e))?;
    Self::from_connection(conn)
  }

  fn from_connection(conn: Connection) -> Result<Self> {
    let backend = Self {
      conn: Mutex::new(conn),
    };
    backend.run_migrations()?;
    Ok(backend)
  }

  /// Get the default database path.
  fn default_path() -> Result<std::path::PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("lazyfetch").join("cache.db"))
  }

  /// Run database migrations for the cache table.
  fn run_migrations(&self) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;
    Ok(())
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

impl StorageBackend for SqliteBackend {
  fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
    let hash = super::key::persist_hash(key);
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare("SELECT entry FROM response_cache WHERE key_hash = ?")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let blob: Option<Vec<u8>> = stmt.query_row(params![hash], |row| row.get(0)).ok();

    let blob = match blob {
      Some(b) => b,
      None => return Ok(None),
    };

    match serde_json::from_slice(&blob) {
      Ok(entry) => Ok(Some(entry)),
      Err(e) => {
        // Corrupt entry: delete it and report a miss.
        tracing::warn!(key, error = %e, "deleting corrupt cache entry");
        conn
          .execute("DELETE FROM response_cache WHERE key_hash = ?", params![hash])
          .map_err(|e| eyre!("Failed to delete corrupt entry: {}", e))?;
        Ok(None)
      }
    }
  }

  fn set(&self, key: &str, entry: CacheEntry) -> Result<()> {
    let hash = super::key::persist_hash(key);
    let blob =
      serde_json::to_vec(&entry).map_err(|e| eyre!("Failed to serialize cache entry: {}", e))?;
    let tags = serde_json::to_string(&entry.tags)
      .map_err(|e| eyre!("Failed to serialize entry tags: {}", e))?;

    let conn = self.lock()?;
    conn
      .execute(
        "INSERT OR REPLACE INTO response_cache (key_hash, cache_key, entry, expires_at, last_accessed, tags)
         VALUES (?, ?, ?, ?, ?, ?)",
        params![
          hash,
          key,
          blob,
          entry.expires_at.format(DATETIME_FORMAT).to_string(),
          entry.last_accessed.format(DATETIME_FORMAT).to_string(),
          tags
        ],
      )
      .map_err(|e| eyre!("Failed to store cache entry: {}", e))?;

    Ok(())
  }

  fn remove(&self, key: &str) -> Result<bool> {
    let hash = super::key::persist_hash(key);
    let conn = self.lock()?;
    let removed = conn
      .execute("DELETE FROM response_cache WHERE key_hash = ?", params![hash])
      .map_err(|e| eyre!("Failed to remove cache entry: {}", e))?;
    Ok(removed > 0)
  }

  fn clear(&self) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute("DELETE FROM response_cache", [])
      .map_err(|e| eyre!("Failed to clear cache: {}", e))?;
    Ok(())
  }

  fn len(&self) -> Result<usize> {
    let conn = self.lock()?;
    let count: i64 = conn
      .query_row("SELECT COUNT(*) FROM response_cache", [], |row| row.get(0))
      .map_err(|e| eyre!("Failed to count cache entries: {}", e))?;
    Ok(count as usize)
  }

  fn contains(&self, key: &str) -> Result<bool> {
    let hash = super::key::persist_hash(key);
    let conn = self.lock()?;
    let count: i64 = conn
      .query_row(
        "SELECT COUNT(*) FROM response_cache WHERE key_hash = ?",
        params![hash],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to check cache entry: {}", e))?;
    Ok(count > 0)
  }

  fn meta(&self) -> Result<Vec<EntryMeta>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT cache_key, last_accessed, tags FROM response_cache")
      .map_err(|e| eyre!("Failed to prepare meta query: {}", e))?;

    let rows: Vec<(String, String, String)> = stmt
      .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
      .map_err(|e| eyre!("Failed to query entry metadata: {}", e))?
      .filter_map(|r| r.ok())
      .collect();

    let mut meta = Vec::with_capacity(rows.len());
    for (key, accessed, tags) in rows {
      meta.push(EntryMeta {
        key,
        last_accessed: parse_datetime(&accessed)?,
        tags: serde_json::from_str(&tags).unwrap_or_default(),
      });
    }
    Ok(meta)
  }

  fn touch(&self, key: &str, at: DateTime<Utc>) -> Result<()> {
    let hash = super::key::persist_hash(key);
    let conn = self.lock()?;
    conn
      .execute(
        "UPDATE response_cache SET last_accessed = ? WHERE key_hash = ?",
        params![at.format(DATETIME_FORMAT).to_string(), hash],
      )
      .map_err(|e| eyre!("Failed to touch cache entry: {}", e))?;
    Ok(())
  }
}

/// Parse a datetime string in the stored format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  chrono::NaiveDateTime::parse_from_str(s, DATETIME_FORMAT)
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;
  use std::time::Duration;

  fn entry(data: serde_json::Value, ttl: Duration, tags: &[&str]) -> CacheEntry {
    let now = Utc::now();
    CacheEntry {
      value: ResultEnvelope::success(data, 200),
      created_at: now,
      expires_at: now + chrono::Duration::from_std(ttl).unwrap(),
      last_accessed: now,
      tags: tags.iter().map(|t| t.to_string()).collect(),
    }
  }

  #[test]
  fn test_memory_round_trip() {
    let backend = MemoryBackend::new();
    backend
      .set("GET:/users", entry(json!([1, 2]), Duration::from_secs(60), &["users"]))
      .unwrap();

    let stored = backend.get("GET:/users").unwrap().unwrap();
    assert_eq!(stored.value.data, Some(json!([1, 2])));
    assert!(stored.tags.contains("users"));
    assert_eq!(backend.len().unwrap(), 1);

    assert!(backend.remove("GET:/users").unwrap());
    assert!(backend.get("GET:/users").unwrap().is_none());
  }

  #[test]
  fn test_sqlite_round_trip() {
    let backend = SqliteBackend::open_in_memory().unwrap();
    backend
      .set("GET:/users", entry(json!({"a": 1}), Duration::from_secs(60), &["users"]))
      .unwrap();

    let stored = backend.get("GET:/users").unwrap().unwrap();
    assert_eq!(stored.value.data, Some(json!({"a": 1})));
    assert_eq!(backend.len().unwrap(), 1);
    assert!(backend.contains("GET:/users").unwrap());

    backend.clear().unwrap();
    assert_eq!(backend.len().unwrap(), 0);
  }

  #[test]
  fn test_sqlite_corrupt_entry_is_deleted_miss() {
    let backend = SqliteBackend::open_in_memory().unwrap();
    let hash = crate::cache::key::persist_hash("GET:/bad");

    {
      let conn = backend.lock().unwrap();
      conn
        .execute(
          "INSERT INTO response_cache (key_hash, cache_key, entry, expires_at, last_accessed, tags)
           VALUES (?, ?, ?, ?, ?, ?)",
          params![hash, "GET:/bad", b"not json".to_vec(), "x", "x", "[]"],
        )
        .unwrap();
    }

    assert!(backend.get("GET:/bad").unwrap().is_none());
    // The corrupt row must be gone.
    assert!(!backend.contains("GET:/bad").unwrap());
  }

  #[test]
  fn test_sqlite_meta_and_touch() {
    let backend = SqliteBackend::open_in_memory().unwrap();
    backend
      .set("GET:/a", entry(json!(1), Duration::from_secs(60), &["x"]))
      .unwrap();
    backend
      .set("GET:/b", entry(json!(2), Duration::from_secs(60), &["y"]))
      .unwrap();

    let later = Utc::now() + chrono::Duration::seconds(30);
    backend.touch("GET:/a", later).unwrap();

    let meta = backend.meta().unwrap();
    assert_eq!(meta.len(), 2);
    let a = meta.iter().find(|m| m.key == "GET:/a").unwrap();
    assert!(a.tags.contains("x"));
    let b = meta.iter().find(|m| m.key == "GET:/b").unwrap();
    assert!(a.last_accessed > b.last_accessed);
  }

  #[test]
  fn test_entry_expiry_boundary() {
    let e = entry(json!(1), Duration::from_secs(10), &[]);
    assert!(!e.is_expired_at(e.expires_at));
    assert!(e.is_expired_at(e.expires_at + chrono::Duration::milliseconds(1)));
  }
}
