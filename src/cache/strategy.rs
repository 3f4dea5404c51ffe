//! Consistency strategies that arbitrate between the cache store and a
//! network fetch.
//!
//! Each strategy takes a cache key and a network-fetch closure and decides
//! when to read or write the store versus calling the network. Only
//! successful envelopes are ever written to cache.

use std::future::Future;
use std::sync::Arc;

use crate::config::CacheStrategy;
use crate::envelope::ResultEnvelope;

use super::store::{CacheStore, CacheWriteOptions};

/// Message returned by `cache-only` when the key is absent.
const CACHE_ONLY_MISS: &str = "No hay datos en caché";

/// Applies a consistency strategy per request over a shared cache store.
#[derive(Clone)]
pub struct CacheStrategyEngine {
  store: Arc<CacheStore>,
}

impl CacheStrategyEngine {
  pub fn new(store: Arc<CacheStore>) -> Self {
    Self { store }
  }

  pub fn store(&self) -> &CacheStore {
    &self.store
  }

  /// Dispatch to the strategy's implementation.
  pub async fn execute<F, Fut>(
    &self,
    strategy: CacheStrategy,
    key: &str,
    options: CacheWriteOptions,
    fetch: F,
  ) -> ResultEnvelope
  where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = ResultEnvelope> + Send + 'static,
  {
    match strategy {
      CacheStrategy::CacheFirst => self.cache_first(key, options, fetch).await,
      CacheStrategy::NetworkFirst => self.network_first(key, options, fetch).await,
      CacheStrategy::StaleWhileRevalidate => {
        self.stale_while_revalidate(key, options, fetch).await
      }
      CacheStrategy::NetworkOnly => self.network_only(key, options, true, fetch).await,
      CacheStrategy::CacheOnly => self.cache_only(key),
    }
  }

  /// Serve from cache when present; otherwise fetch, store on success, return.
  pub async fn cache_first<F, Fut>(
    &self,
    key: &str,
    options: CacheWriteOptions,
    fetch: F,
  ) -> ResultEnvelope
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = ResultEnvelope>,
  {
    if let Some(cached) = self.store.get(key) {
      return cached;
    }

    let response = fetch().await;
    if response.is_success() {
      self.store.set(key, response.clone(), &options);
    }
    response
  }

  /// Fetch from the network; on failure fall back to the cached value.
  pub async fn network_first<F, Fut>(
    &self,
    key: &str,
    options: CacheWriteOptions,
    fetch: F,
  ) -> ResultEnvelope
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = ResultEnvelope>,
  {
    let response = fetch().await;
    if response.is_success() {
      self.store.set(key, response.clone(), &options);
      return response;
    }

    match self.store.get(key) {
      Some(cached) => cached.tagged_from_cache(false, response.error.clone()),
      None => response,
    }
  }

  /// Serve stale cache immediately and revalidate in the background; with an
  /// empty cache, behave like cache-first.
  pub async fn stale_while_revalidate<F, Fut>(
    &self,
    key: &str,
    options: CacheWriteOptions,
    fetch: F,
  ) -> ResultEnvelope
  where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = ResultEnvelope> + Send + 'static,
  {
    if let Some(cached) = self.store.get(key) {
      let store = Arc::clone(&self.store);
      let key = key.to_string();
      tokio::spawn(async move {
        let fresh = fetch().await;
        if fresh.is_success() {
          store.set(&key, fresh, &options);
        } else {
          tracing::warn!(key, error = ?fresh.error, "background revalidation failed");
        }
      });

      return cached.tagged_from_cache(true, None);
    }

    let response = fetch().await;
    if response.is_success() {
      self.store.set(key, response.clone(), &options);
    }
    response
  }

  /// Always fetch; still write the success through unless disabled, so other
  /// strategies reading the same key benefit.
  pub async fn network_only<F, Fut>(
    &self,
    key: &str,
    options: CacheWriteOptions,
    write_through: bool,
    fetch: F,
  ) -> ResultEnvelope
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = ResultEnvelope>,
  {
    let response = fetch().await;
    if response.is_success() && write_through {
      self.store.set(key, response.clone(), &options);
    }
    response
  }

  /// Never call the network; a miss is a not-found envelope.
  pub fn cache_only(&self, key: &str) -> ResultEnvelope {
    match self.store.get(key) {
      Some(cached) => cached,
      None => ResultEnvelope {
        data: None,
        error: Some(CACHE_ONLY_MISS.to_string()),
        status: 404,
        meta: None,
        details: None,
      },
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::storage::MemoryBackend;
  use crate::config::CacheConfig;
  use serde_json::json;
  use std::sync::atomic::{AtomicU32, Ordering};
  use std::time::Duration;

  fn engine() -> CacheStrategyEngine {
    let config = CacheConfig::new().enabled(true).build().unwrap();
    let store = CacheStore::with_backend(config, Box::new(MemoryBackend::new()));
    CacheStrategyEngine::new(Arc::new(store))
  }

  fn counted_fetch(
    counter: Arc<AtomicU32>,
    response: ResultEnvelope,
  ) -> impl FnOnce() -> futures::future::BoxFuture<'static, ResultEnvelope> + Send + 'static {
    move || {
      counter.fetch_add(1, Ordering::SeqCst);
      Box::pin(async move { response })
    }
  }

  #[tokio::test]
  async fn test_cache_first_fetches_once_then_serves_cache() {
    let engine = engine();
    let calls = Arc::new(AtomicU32::new(0));

    let first = engine
      .cache_first(
        "k",
        CacheWriteOptions::default(),
        counted_fetch(calls.clone(), ResultEnvelope::success(json!("fresh"), 200)),
      )
      .await;
    assert_eq!(first.data, Some(json!("fresh")));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let second = engine
      .cache_first(
        "k",
        CacheWriteOptions::default(),
        counted_fetch(calls.clone(), ResultEnvelope::success(json!("newer"), 200)),
      )
      .await;
    assert_eq!(second.data, Some(json!("fresh")));
    // Served from cache, no second fetch.
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_cache_first_does_not_store_errors() {
    let engine = engine();
    let calls = Arc::new(AtomicU32::new(0));

    let failed = ResultEnvelope {
      data: None,
      error: Some("boom".to_string()),
      status: 500,
      meta: None,
      details: None,
    };

    let response = engine
      .cache_first("k", CacheWriteOptions::default(), counted_fetch(calls.clone(), failed))
      .await;
    assert!(!response.is_success());
    assert!(engine.store().is_empty());
  }

  #[tokio::test]
  async fn test_network_first_falls_back_to_cache_on_failure() {
    let engine = engine();
    engine.store().set(
      "k",
      ResultEnvelope::success(json!("old"), 200),
      &CacheWriteOptions::default(),
    );

    let failed = ResultEnvelope {
      data: None,
      error: Some("connection refused".to_string()),
      status: 0,
      meta: None,
      details: None,
    };

    let calls = Arc::new(AtomicU32::new(0));
    let response = engine
      .network_first("k", CacheWriteOptions::default(), counted_fetch(calls, failed))
      .await;

    assert_eq!(response.data, Some(json!("old")));
    let meta = response.meta.unwrap();
    assert!(meta.from_cache);
    assert_eq!(meta.network_error.as_deref(), Some("connection refused"));
  }

  #[tokio::test]
  async fn test_network_first_success_overwrites_cache() {
    let engine = engine();
    engine.store().set(
      "k",
      ResultEnvelope::success(json!("old"), 200),
      &CacheWriteOptions::default(),
    );

    let calls = Arc::new(AtomicU32::new(0));
    let response = engine
      .network_first(
        "k",
        CacheWriteOptions::default(),
        counted_fetch(calls, ResultEnvelope::success(json!("fresh"), 200)),
      )
      .await;

    assert_eq!(response.data, Some(json!("fresh")));
    assert!(response.meta.is_none());
    assert_eq!(engine.store().get("k").unwrap().data, Some(json!("fresh")));
  }

  #[tokio::test]
  async fn test_stale_while_revalidate_serves_stale_then_updates() {
    let engine = engine();
    engine.store().set(
      "k",
      ResultEnvelope::success(json!("old"), 200),
      &CacheWriteOptions::default(),
    );

    let calls = Arc::new(AtomicU32::new(0));
    let response = engine
      .stale_while_revalidate(
        "k",
        CacheWriteOptions::default(),
        counted_fetch(calls.clone(), ResultEnvelope::success(json!("fresh"), 200)),
      )
      .await;

    // Stale value returned immediately, tagged.
    assert_eq!(response.data, Some(json!("old")));
    let meta = response.meta.unwrap();
    assert!(meta.from_cache);
    assert!(meta.refreshing);

    // Let the background revalidation settle, then the cache holds the
    // fresh value.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(engine.store().get("k").unwrap().data, Some(json!("fresh")));
  }

  #[tokio::test]
  async fn test_stale_while_revalidate_empty_cache_waits_for_network() {
    let engine = engine();
    let calls = Arc::new(AtomicU32::new(0));

    let response = engine
      .stale_while_revalidate(
        "k",
        CacheWriteOptions::default(),
        counted_fetch(calls.clone(), ResultEnvelope::success(json!("fresh"), 200)),
      )
      .await;

    assert_eq!(response.data, Some(json!("fresh")));
    assert!(response.meta.is_none());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_stale_while_revalidate_swallows_background_errors() {
    let engine = engine();
    engine.store().set(
      "k",
      ResultEnvelope::success(json!("old"), 200),
      &CacheWriteOptions::default(),
    );

    let failed = ResultEnvelope {
      data: None,
      error: Some("boom".to_string()),
      status: 500,
      meta: None,
      details: None,
    };

    let calls = Arc::new(AtomicU32::new(0));
    let response = engine
      .stale_while_revalidate("k", CacheWriteOptions::default(), counted_fetch(calls, failed))
      .await;
    assert_eq!(response.data, Some(json!("old")));

    tokio::time::sleep(Duration::from_millis(20)).await;
    // The failed revalidation must not clobber the cached value.
    assert_eq!(engine.store().get("k").unwrap().data, Some(json!("old")));
  }

  #[tokio::test]
  async fn test_network_only_writes_through_for_other_strategies() {
    let engine = engine();
    let calls = Arc::new(AtomicU32::new(0));

    engine
      .network_only(
        "k",
        CacheWriteOptions::default(),
        true,
        counted_fetch(calls.clone(), ResultEnvelope::success(json!("fresh"), 200)),
      )
      .await;

    assert_eq!(engine.store().get("k").unwrap().data, Some(json!("fresh")));

    // A later cache-only read of the same key sees the written value.
    let cached = engine.cache_only("k");
    assert_eq!(cached.data, Some(json!("fresh")));
  }

  #[tokio::test]
  async fn test_network_only_write_through_can_be_disabled() {
    let engine = engine();
    let calls = Arc::new(AtomicU32::new(0));

    engine
      .network_only(
        "k",
        CacheWriteOptions::default(),
        false,
        counted_fetch(calls, ResultEnvelope::success(json!("fresh"), 200)),
      )
      .await;

    assert!(engine.store().is_empty());
  }

  #[tokio::test]
  async fn test_cache_only_miss_is_not_found_envelope() {
    let engine = engine();
    let response = engine.cache_only("k");

    assert_eq!(response.error.as_deref(), Some("No hay datos en caché"));
    assert_eq!(response.status, 404);
    assert!(response.data.is_none());
  }
}
