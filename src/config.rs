//! Configuration for the cache, retry, and auth subsystems.
//!
//! Each concern has one canonical config struct with defaults applied once at
//! construction through a chained builder. Invalid configuration fails fast
//! when the client is built, never at request time.

use color_eyre::{eyre::eyre, Result};
use std::collections::BTreeSet;
use std::time::Duration;

/// Consistency strategy applied when a cacheable request is issued.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CacheStrategy {
  /// Serve from cache when present, otherwise fetch and store.
  #[default]
  CacheFirst,
  /// Fetch from the network; fall back to cache on failure.
  NetworkFirst,
  /// Serve stale cache immediately and revalidate in the background.
  StaleWhileRevalidate,
  /// Always fetch; still write the result through for other strategies.
  NetworkOnly,
  /// Never touch the network; miss means a not-found envelope.
  CacheOnly,
}

/// Where cache entries live.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StorageKind {
  /// Process-local map; entries die with the client.
  #[default]
  Memory,
  /// SQLite-backed store that survives restarts.
  Persistent,
}

/// Cache subsystem configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
  pub enabled: bool,
  pub default_strategy: CacheStrategy,
  pub default_ttl: Duration,
  pub storage: StorageKind,
  pub max_size: usize,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      enabled: false,
      default_strategy: CacheStrategy::CacheFirst,
      default_ttl: Duration::from_secs(5 * 60),
      storage: StorageKind::Memory,
      max_size: 100,
    }
  }
}

impl CacheConfig {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn enabled(mut self, enabled: bool) -> Self {
    self.enabled = enabled;
    self
  }

  pub fn default_strategy(mut self, strategy: CacheStrategy) -> Self {
    self.default_strategy = strategy;
    self
  }

  pub fn default_ttl(mut self, ttl: Duration) -> Self {
    self.default_ttl = ttl;
    self
  }

  pub fn storage(mut self, kind: StorageKind) -> Self {
    self.storage = kind;
    self
  }

  pub fn max_size(mut self, max_size: usize) -> Self {
    self.max_size = max_size;
    self
  }

  /// Validate and return the final configuration.
  pub fn build(self) -> Result<Self> {
    if self.max_size == 0 {
      return Err(eyre!("cache max_size must be greater than zero"));
    }
    if self.default_ttl.is_zero() {
      return Err(eyre!("cache default_ttl must be greater than zero"));
    }
    Ok(self)
  }
}

/// Retry subsystem configuration.
#[derive(Debug, Clone)]
pub struct RetryConfig {
  pub enabled: bool,
  pub max_retries: u32,
  pub initial_delay: Duration,
  pub backoff_factor: f64,
  /// HTTP statuses that justify another attempt.
  pub retryable_status_codes: BTreeSet<u16>,
  /// Transport-level error codes that justify another attempt.
  pub retryable_errors: BTreeSet<String>,
}

impl Default for RetryConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      max_retries: 3,
      initial_delay: Duration::from_millis(500),
      backoff_factor: 2.0,
      retryable_status_codes: [408, 429, 500, 502, 503, 504].into_iter().collect(),
      retryable_errors: ["ECONNRESET", "ETIMEDOUT", "ECONNREFUSED"]
        .into_iter()
        .map(String::from)
        .collect(),
    }
  }
}

impl RetryConfig {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn enabled(mut self, enabled: bool) -> Self {
    self.enabled = enabled;
    self
  }

  pub fn max_retries(mut self, max_retries: u32) -> Self {
    self.max_retries = max_retries;
    self
  }

  pub fn initial_delay(mut self, delay: Duration) -> Self {
    self.initial_delay = delay;
    self
  }

  pub fn backoff_factor(mut self, factor: f64) -> Self {
    self.backoff_factor = factor;
    self
  }

  pub fn retryable_status_codes(mut self, codes: impl IntoIterator<Item = u16>) -> Self {
    self.retryable_status_codes = codes.into_iter().collect();
    self
  }

  pub fn retryable_errors<S: Into<String>>(mut self, codes: impl IntoIterator<Item = S>) -> Self {
    self.retryable_errors = codes.into_iter().map(Into::into).collect();
    self
  }

  /// Validate and return the final configuration.
  pub fn build(self) -> Result<Self> {
    if self.backoff_factor < 1.0 {
      return Err(eyre!("retry backoff_factor must be at least 1.0"));
    }
    if self.max_retries > 10 {
      return Err(eyre!("retry max_retries must not exceed 10"));
    }
    Ok(self)
  }
}

/// Auth subsystem configuration: endpoints and token storage keys.
#[derive(Debug, Clone)]
pub struct AuthConfig {
  /// Base URL prepended to the endpoints below. Empty means the endpoints
  /// share the client's base URL.
  pub base_url: String,
  pub login_endpoint: String,
  pub refresh_endpoint: String,
  pub logout_endpoint: String,
  pub user_info_endpoint: String,
  /// Storage key under which the access token is persisted.
  pub token_key: String,
  /// Storage key for the refresh token. Empty disables refresh persistence.
  pub refresh_token_key: String,
}

impl Default for AuthConfig {
  fn default() -> Self {
    Self {
      base_url: String::new(),
      login_endpoint: "/auth/login".to_string(),
      refresh_endpoint: "/auth/refresh".to_string(),
      logout_endpoint: "/auth/logout".to_string(),
      user_info_endpoint: "/auth/me".to_string(),
      token_key: "token".to_string(),
      refresh_token_key: "refreshToken".to_string(),
    }
  }
}

impl AuthConfig {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
    self.base_url = base_url.into();
    self
  }

  pub fn login_endpoint(mut self, endpoint: impl Into<String>) -> Self {
    self.login_endpoint = endpoint.into();
    self
  }

  pub fn refresh_endpoint(mut self, endpoint: impl Into<String>) -> Self {
    self.refresh_endpoint = endpoint.into();
    self
  }

  pub fn logout_endpoint(mut self, endpoint: impl Into<String>) -> Self {
    self.logout_endpoint = endpoint.into();
    self
  }

  pub fn user_info_endpoint(mut self, endpoint: impl Into<String>) -> Self {
    self.user_info_endpoint = endpoint.into();
    self
  }

  pub fn token_key(mut self, key: impl Into<String>) -> Self {
    self.token_key = key.into();
    self
  }

  pub fn refresh_token_key(mut self, key: impl Into<String>) -> Self {
    self.refresh_token_key = key.into();
    self
  }

  /// Validate and return the final configuration.
  pub fn build(self) -> Result<Self> {
    if self.token_key.is_empty() {
      return Err(eyre!("auth token_key must not be empty"));
    }
    if self.login_endpoint.is_empty() || self.refresh_endpoint.is_empty() {
      return Err(eyre!("auth login and refresh endpoints must not be empty"));
    }
    Ok(self)
  }
}
