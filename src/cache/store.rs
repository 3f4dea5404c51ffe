//! Cache store: TTL, tag annotations, size-bounded LRU eviction, and
//! pattern/tag invalidation over a pluggable storage backend.
//!
//! Backend failures never reach the caller: a failing read is a miss, a
//! failing write is a no-op, both logged.

use chrono::Utc;
use regex::Regex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::config::{CacheConfig, StorageKind};
use crate::envelope::ResultEnvelope;

use super::storage::{CacheEntry, MemoryBackend, SqliteBackend, StorageBackend};

/// Per-write cache options.
#[derive(Debug, Clone, Default)]
pub struct CacheWriteOptions {
  /// TTL override; the configured default applies when absent.
  pub ttl: Option<Duration>,
  /// Tags to annotate the entry with, for tag-based invalidation.
  pub tags: Vec<String>,
}

/// Counters for cache behavior, readable as a snapshot.
#[derive(Debug, Default)]
pub struct CacheStats {
  hits: AtomicU64,
  misses: AtomicU64,
  evictions: AtomicU64,
  expirations: AtomicU64,
}

/// Point-in-time view of [`CacheStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
  pub hits: u64,
  pub misses: u64,
  pub evictions: u64,
  pub expirations: u64,
}

impl CacheStats {
  fn snapshot(&self) -> StatsSnapshot {
    StatsSnapshot {
      hits: self.hits.load(Ordering::Relaxed),
      misses: self.misses.load(Ordering::Relaxed),
      evictions: self.evictions.load(Ordering::Relaxed),
      expirations: self.expirations.load(Ordering::Relaxed),
    }
  }
}

/// Key/value store of time-limited, tag-annotated response envelopes.
pub struct CacheStore {
  backend: Box<dyn StorageBackend>,
  config: CacheConfig,
  stats: CacheStats,
}

impl CacheStore {
  /// Create a store with the backend selected by the configuration.
  pub fn new(config: CacheConfig) -> color_eyre::Result<Self> {
    let backend: Box<dyn StorageBackend> = match config.storage {
      StorageKind::Memory => Box::new(MemoryBackend::new()),
      StorageKind::Persistent => Box::new(SqliteBackend::open()?),
    };
    Ok(Self::with_backend(config, backend))
  }

  /// Create a store over an explicit backend.
  pub fn with_backend(config: CacheConfig, backend: Box<dyn StorageBackend>) -> Self {
    Self {
      backend,
      config,
      stats: CacheStats::default(),
    }
  }

  pub fn config(&self) -> &CacheConfig {
    &self.config
  }

  pub fn stats(&self) -> StatsSnapshot {
    self.stats.snapshot()
  }

  /// Get a value. Expired entries are treated as absent and lazily removed.
  pub fn get(&self, key: &str) -> Option<ResultEnvelope> {
    let entry = match self.backend.get(key) {
      Ok(entry) => entry,
      Err(e) => {
        tracing::warn!(key, error = %e, "cache read failed, treating as miss");
        None
      }
    };

    let entry = match entry {
      Some(entry) => entry,
      None => {
        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        return None;
      }
    };

    let now = Utc::now();
    if entry.is_expired_at(now) {
      if let Err(e) = self.backend.remove(key) {
        tracing::warn!(key, error = %e, "failed to remove expired cache entry");
      }
      self.stats.misses.fetch_add(1, Ordering::Relaxed);
      self.stats.expirations.fetch_add(1, Ordering::Relaxed);
      return None;
    }

    if let Err(e) = self.backend.touch(key, now) {
      tracing::warn!(key, error = %e, "failed to touch cache entry");
    }
    self.stats.hits.fetch_add(1, Ordering::Relaxed);
    Some(entry.value)
  }

  /// Store a value, evicting old entries first if the insert would exceed
  /// the configured size bound.
  pub fn set(&self, key: &str, value: ResultEnvelope, options: &CacheWriteOptions) {
    if !self.config.enabled {
      return;
    }

    let is_new = !self.backend.contains(key).unwrap_or(false);
    let len = self.backend.len().unwrap_or(0);
    if is_new && len >= self.config.max_size {
      self.evict_oldest();
    }

    let now = Utc::now();
    let ttl = options.ttl.unwrap_or(self.config.default_ttl);
    let expires_at = chrono::Duration::from_std(ttl)
      .ok()
      .and_then(|ttl| now.checked_add_signed(ttl))
      .unwrap_or(chrono::DateTime::<Utc>::MAX_UTC);
    let entry = CacheEntry {
      value,
      created_at: now,
      expires_at,
      last_accessed: now,
      tags: options.tags.iter().cloned().collect(),
    };

    if let Err(e) = self.backend.set(key, entry) {
      tracing::warn!(key, error = %e, "cache write failed");
    }
  }

  /// Remove a single entry.
  pub fn remove(&self, key: &str) {
    if let Err(e) = self.backend.remove(key) {
      tracing::warn!(key, error = %e, "cache remove failed");
    }
  }

  /// Remove every entry.
  pub fn clear(&self) {
    if let Err(e) = self.backend.clear() {
      tracing::warn!(error = %e, "cache clear failed");
    }
  }

  /// Number of stored entries (expired entries included until swept).
  pub fn len(&self) -> usize {
    self.backend.len().unwrap_or(0)
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Remove entries whose key matches a glob pattern, where `*` matches any
  /// substring and every other character is literal.
  pub fn invalidate(&self, pattern: &str) {
    let regex = match glob_to_regex(pattern) {
      Ok(regex) => regex,
      Err(e) => {
        tracing::warn!(pattern, error = %e, "invalid invalidation pattern");
        return;
      }
    };

    for meta in self.meta_sweep() {
      if regex.is_match(&meta.key) {
        self.remove(&meta.key);
      }
    }
  }

  /// Remove entries whose tag set intersects `tags` (OR semantics).
  pub fn invalidate_by_tags(&self, tags: &[String]) {
    if tags.is_empty() {
      return;
    }

    for meta in self.meta_sweep() {
      if tags.iter().any(|tag| meta.tags.contains(tag)) {
        self.remove(&meta.key);
      }
    }
  }

  fn meta_sweep(&self) -> Vec<super::storage::EntryMeta> {
    match self.backend.meta() {
      Ok(meta) => meta,
      Err(e) => {
        tracing::warn!(error = %e, "cache metadata sweep failed");
        Vec::new()
      }
    }
  }

  /// Bulk-evict the oldest entries by last access until at most
  /// `max_size − ceil(0.1·max_size)` remain.
  fn evict_oldest(&self) {
    let target = self.config.max_size - self.config.max_size.div_ceil(10);

    let mut meta = self.meta_sweep();
    meta.sort_by_key(|m| m.last_accessed);

    let len = meta.len();
    if len <= target {
      return;
    }

    for m in meta.into_iter().take(len - target) {
      self.remove(&m.key);
      self.stats.evictions.fetch_add(1, Ordering::Relaxed);
    }
  }
}

/// Translate a `*`-glob into a regex, escaping all other metacharacters.
fn glob_to_regex(pattern: &str) -> Result<Regex, regex::Error> {
  let translated: Vec<String> = pattern.split('*').map(|chunk| regex::escape(chunk)).collect();
  Regex::new(&translated.join(".*"))
}
