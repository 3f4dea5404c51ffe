//! The client facade: one pipeline from logical request to result envelope.
//!
//! A request flows cache-strategy → retry engine → transport; a 401 outcome
//! consults the auth manager's refresh protocol before a single re-issue, and
//! successful write methods invalidate the matching GET keys.

use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use crate::auth::{AuthState, AuthTokenManager, Credentials, MemoryTokenStorage, TokenStorage};
use crate::cache::{cache_key, CacheStore, CacheStrategyEngine, CacheWriteOptions, StatsSnapshot};
use crate::config::{AuthConfig, CacheConfig, CacheStrategy, RetryConfig};
use crate::envelope::ResultEnvelope;
use crate::error::ErrorKind;
use crate::retry::{RetryEngine, RetryRequest};
use crate::transport::{HttpMethod, ReqwestTransport, Transport};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-request cache options.
#[derive(Debug, Clone, Default)]
pub struct CacheRequestOptions {
  /// Per-request override of cache participation.
  pub enabled: Option<bool>,
  /// Strategy override; precedence: per-call > client default > cache-first.
  pub strategy: Option<CacheStrategy>,
  pub ttl: Option<Duration>,
  pub tags: Vec<String>,
  /// Caller-provided cache key, overriding the generated one.
  pub key: Option<String>,
}

/// Options recognized by [`HttpClient::request`].
#[derive(Debug, Clone)]
pub struct RequestOptions {
  pub method: HttpMethod,
  pub params: BTreeMap<String, String>,
  pub headers: HashMap<String, String>,
  pub body: Option<Value>,
  pub timeout: Option<Duration>,
  /// Per-call override of the retry budget.
  pub retries: Option<u32>,
  /// Attach the bearer token when a session exists.
  pub with_auth: bool,
  pub cache: CacheRequestOptions,
}

impl Default for RequestOptions {
  fn default() -> Self {
    Self {
      method: HttpMethod::Get,
      params: BTreeMap::new(),
      headers: HashMap::new(),
      body: None,
      timeout: None,
      retries: None,
      with_auth: true,
      cache: CacheRequestOptions::default(),
    }
  }
}

impl RequestOptions {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn method(mut self, method: HttpMethod) -> Self {
    self.method = method;
    self
  }

  pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
    self.params.insert(key.into(), value.into());
    self
  }

  pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.insert(name.into(), value.into());
    self
  }

  pub fn body(mut self, body: Value) -> Self {
    self.body = Some(body);
    self
  }

  pub fn timeout(mut self, timeout: Duration) -> Self {
    self.timeout = Some(timeout);
    self
  }

  pub fn retries(mut self, retries: u32) -> Self {
    self.retries = Some(retries);
    self
  }

  pub fn with_auth(mut self, with_auth: bool) -> Self {
    self.with_auth = with_auth;
    self
  }

  pub fn strategy(mut self, strategy: CacheStrategy) -> Self {
    self.cache.strategy = Some(strategy);
    self
  }

  pub fn ttl(mut self, ttl: Duration) -> Self {
    self.cache.ttl = Some(ttl);
    self
  }

  pub fn tag(mut self, tag: impl Into<String>) -> Self {
    self.cache.tags.push(tag.into());
    self
  }

  pub fn cache_key(mut self, key: impl Into<String>) -> Self {
    self.cache.key = Some(key.into());
    self
  }

  pub fn no_cache(mut self) -> Self {
    self.cache.enabled = Some(false);
    self
  }
}

struct ClientInner {
  base_url: String,
  default_timeout: Duration,
  default_headers: HashMap<String, String>,
  retry: RetryEngine,
  store: Arc<CacheStore>,
  strategies: CacheStrategyEngine,
  auth: Option<Arc<AuthTokenManager>>,
}

/// HTTP client with transparent caching, bounded retry, and session
/// management. Cloning is cheap and clones share all state.
#[derive(Clone)]
pub struct HttpClient {
  inner: Arc<ClientInner>,
}

/// Builder for [`HttpClient`]; invalid configuration fails here, not at
/// request time.
pub struct HttpClientBuilder {
  base_url: String,
  timeout: Duration,
  default_headers: HashMap<String, String>,
  cache: CacheConfig,
  retry: RetryConfig,
  auth: Option<AuthConfig>,
  token_storage: Option<Box<dyn TokenStorage>>,
  transport: Option<Arc<dyn Transport>>,
}

impl HttpClientBuilder {
  fn new() -> Self {
    Self {
      base_url: String::new(),
      timeout: DEFAULT_TIMEOUT,
      default_headers: HashMap::new(),
      cache: CacheConfig::default(),
      retry: RetryConfig::default(),
      auth: None,
      token_storage: None,
      transport: None,
    }
  }

  pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
    self.base_url = base_url.into();
    self
  }

  pub fn timeout(mut self, timeout: Duration) -> Self {
    self.timeout = timeout;
    self
  }

  pub fn default_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.default_headers.insert(name.into(), value.into());
    self
  }

  pub fn cache(mut self, config: CacheConfig) -> Self {
    self.cache = config;
    self
  }

  pub fn retry(mut self, config: RetryConfig) -> Self {
    self.retry = config;
    self
  }

  pub fn auth(mut self, config: AuthConfig) -> Self {
    self.auth = Some(config);
    self
  }

  /// Token persistence for the auth manager; in-memory when not provided.
  pub fn token_storage(mut self, storage: Box<dyn TokenStorage>) -> Self {
    self.token_storage = Some(storage);
    self
  }

  /// Replace the default reqwest transport (used by tests and embedders).
  pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
    self.transport = Some(transport);
    self
  }

  pub fn build(self) -> Result<HttpClient> {
    if self.timeout.is_zero() {
      return Err(eyre!("client timeout must be greater than zero"));
    }

    let cache = self.cache.build()?;
    let retry = self.retry.build()?;

    let transport = self
      .transport
      .unwrap_or_else(|| Arc::new(ReqwestTransport::new()));

    let store = Arc::new(CacheStore::new(cache)?);
    let strategies = CacheStrategyEngine::new(Arc::clone(&store));
    let retry = RetryEngine::new(retry, Arc::clone(&transport));

    let auth = match self.auth {
      Some(config) => {
        let config = config.build()?;
        let storage = self
          .token_storage
          .unwrap_or_else(|| Box::new(MemoryTokenStorage::new()));
        Some(Arc::new(AuthTokenManager::new(
          config,
          storage,
          Arc::clone(&transport),
        )))
      }
      None => None,
    };

    Ok(HttpClient {
      inner: Arc::new(ClientInner {
        base_url: self.base_url,
        default_timeout: self.timeout,
        default_headers: self.default_headers,
        retry,
        store,
        strategies,
        auth,
      }),
    })
  }
}

impl HttpClient {
  pub fn builder() -> HttpClientBuilder {
    HttpClientBuilder::new()
  }

  /// GET with default options.
  pub async fn get(&self, endpoint: &str) -> ResultEnvelope {
    self.request(endpoint, RequestOptions::new()).await
  }

  /// GET with explicit options (the method field is forced to GET).
  pub async fn get_with(&self, endpoint: &str, options: RequestOptions) -> ResultEnvelope {
    self.request(endpoint, options.method(HttpMethod::Get)).await
  }

  /// GET a collection; identical to [`HttpClient::get`], kept for symmetry
  /// with by-id accessors.
  pub async fn get_all(&self, endpoint: &str) -> ResultEnvelope {
    self.get(endpoint).await
  }

  pub async fn post(&self, endpoint: &str, body: Value) -> ResultEnvelope {
    self
      .request(endpoint, RequestOptions::new().method(HttpMethod::Post).body(body))
      .await
  }

  pub async fn put(&self, endpoint: &str, body: Value) -> ResultEnvelope {
    self
      .request(endpoint, RequestOptions::new().method(HttpMethod::Put).body(body))
      .await
  }

  pub async fn patch(&self, endpoint: &str, body: Value) -> ResultEnvelope {
    self
      .request(endpoint, RequestOptions::new().method(HttpMethod::Patch).body(body))
      .await
  }

  pub async fn delete(&self, endpoint: &str) -> ResultEnvelope {
    self
      .request(endpoint, RequestOptions::new().method(HttpMethod::Delete))
      .await
  }

  /// Issue a logical request through the full pipeline.
  pub async fn request(&self, endpoint: &str, options: RequestOptions) -> ResultEnvelope {
    let method = options.method;
    let url = self.build_url(endpoint, &options.params);

    let mut headers = self.inner.default_headers.clone();
    headers.extend(options.headers.clone());

    let timeout = options.timeout.unwrap_or(self.inner.default_timeout);
    let fetch = network_fetch(
      Arc::clone(&self.inner),
      method,
      url,
      headers,
      options.body.clone(),
      timeout,
      options.retries,
      options.with_auth,
    );

    let use_cache = self.inner.store.config().enabled
      && method == HttpMethod::Get
      && options.cache.enabled.unwrap_or(true);

    let envelope = if use_cache {
      let key = cache_key(
        method,
        endpoint,
        &options.params,
        &options.cache.tags,
        options.cache.key.as_deref(),
      );
      let strategy = options
        .cache
        .strategy
        .unwrap_or(self.inner.store.config().default_strategy);
      let write = CacheWriteOptions {
        ttl: options.cache.ttl,
        tags: options.cache.tags.clone(),
      };
      self.inner.strategies.execute(strategy, &key, write, fetch).await
    } else {
      fetch().await
    };

    if method.is_write() && envelope.is_success() {
      self.invalidate_after_write(endpoint);
    }

    envelope
  }

  /// Typed accessor for a REST-ish resource collection.
  pub fn resource(&self, name: &str) -> Resource {
    Resource {
      client: self.clone(),
      base: format!("/{}", name.trim_matches('/')),
    }
  }

  /// Log in through the configured auth manager.
  pub async fn login(&self, credentials: &Credentials) -> Result<AuthState> {
    match &self.inner.auth {
      Some(auth) => auth.login(credentials).await,
      None => Err(eyre!("auth is not configured for this client")),
    }
  }

  /// Log out (best-effort against the logout endpoint) and clear the session.
  pub async fn logout(&self) {
    if let Some(auth) = &self.inner.auth {
      auth.logout().await;
    }
  }

  pub fn is_authenticated(&self) -> bool {
    self
      .inner
      .auth
      .as_ref()
      .is_some_and(|auth| auth.is_authenticated())
  }

  /// Fetch (and memoize) the authenticated user's info.
  pub async fn get_authenticated_user(&self) -> Option<Value> {
    match &self.inner.auth {
      Some(auth) => auth.get_authenticated_user().await,
      None => None,
    }
  }

  /// Remove cached entries whose key matches a `*`-glob.
  pub fn invalidate_cache(&self, pattern: &str) {
    self.inner.store.invalidate(pattern);
  }

  /// Remove cached entries annotated with any of these tags.
  pub fn invalidate_cache_by_tags(&self, tags: &[String]) {
    self.inner.store.invalidate_by_tags(tags);
  }

  pub fn clear_cache(&self) {
    self.inner.store.clear();
  }

  pub fn cache_stats(&self) -> StatsSnapshot {
    self.inner.store.stats()
  }

  fn build_url(&self, endpoint: &str, params: &BTreeMap<String, String>) -> String {
    let path = if endpoint.starts_with('/') || self.inner.base_url.is_empty() {
      endpoint.to_string()
    } else {
      format!("/{endpoint}")
    };

    let mut url = format!("{}{}", self.inner.base_url, path);
    if !params.is_empty() {
      let query = url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(params)
        .finish();
      url.push('?');
      url.push_str(&query);
    }
    url
  }

  /// A successful write invalidates the GET keys under the resource's base
  /// path (e.g. POST /users/1 invalidates `GET:/users*`).
  fn invalidate_after_write(&self, endpoint: &str) {
    let normalized = if endpoint.starts_with('/') {
      endpoint.to_string()
    } else {
      format!("/{endpoint}")
    };

    let base = match normalized.rsplit_once('/') {
      Some((head, _)) if !head.is_empty() => head.to_string(),
      _ => normalized,
    };

    self.inner.store.invalidate(&format!("GET:{base}*"));
  }
}

/// Build the network-fetch closure handed to the strategy engine.
#[allow(clippy::too_many_arguments)]
fn network_fetch(
  inner: Arc<ClientInner>,
  method: HttpMethod,
  url: String,
  headers: HashMap<String, String>,
  body: Option<Value>,
  timeout: Duration,
  retries: Option<u32>,
  with_auth: bool,
) -> impl FnOnce() -> BoxFuture<'static, ResultEnvelope> + Send + 'static {
  move || Box::pin(dispatch(inner, method, url, headers, body, timeout, retries, with_auth))
}

/// One auth-aware pass through the retry engine: attach the bearer, call,
/// and on a 401 consult the refresh protocol before a single re-issue.
#[allow(clippy::too_many_arguments)]
async fn dispatch(
  inner: Arc<ClientInner>,
  method: HttpMethod,
  url: String,
  mut headers: HashMap<String, String>,
  body: Option<Value>,
  timeout: Duration,
  retries: Option<u32>,
  with_auth: bool,
) -> ResultEnvelope {
  let mut observed_generation = None;
  if with_auth {
    if let Some(auth) = &inner.auth {
      if let Some((token, generation)) = auth.bearer() {
        headers.insert("Authorization".to_string(), format!("Bearer {token}"));
        observed_generation = Some(generation);
      }
    }
  }

  let request = RetryRequest {
    method,
    url,
    headers,
    body,
    timeout,
    retries,
  };
  let response = inner.retry.execute_with_retry(&request).await;

  if response.status != 401 {
    return response;
  }

  let (auth, generation) = match (&inner.auth, observed_generation) {
    (Some(auth), Some(generation)) => (auth, generation),
    _ => return response,
  };

  match auth.refresh_after_unauthorized(generation).await {
    Ok(token) => {
      let mut request = request;
      request
        .headers
        .insert("Authorization".to_string(), format!("Bearer {token}"));
      inner.retry.execute_with_retry(&request).await
    }
    Err(_) => ResultEnvelope::failure(
      ErrorKind::SessionExpired,
      None,
      None,
      Some(format!("no fue posible refrescar la sesión para {}", request.url)),
    ),
  }
}

/// Typed resource accessor returned by [`HttpClient::resource`].
pub struct Resource {
  client: HttpClient,
  base: String,
}

impl Resource {
  /// GET the collection.
  pub async fn list(&self) -> ResultEnvelope {
    self.client.get(&self.base).await
  }

  /// GET one element by id.
  pub async fn get_by_id(&self, id: &str) -> ResultEnvelope {
    self.client.get(&format!("{}/{id}", self.base)).await
  }

  /// POST a new element.
  pub async fn create(&self, body: Value) -> ResultEnvelope {
    self.client.post(&self.base, body).await
  }

  /// PUT an element by id.
  pub async fn update(&self, id: &str, body: Value) -> ResultEnvelope {
    self.client.put(&format!("{}/{id}", self.base), body).await
  }

  /// DELETE an element by id.
  pub async fn remove(&self, id: &str) -> ResultEnvelope {
    self.client.delete(&format!("{}/{id}", self.base)).await
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::auth::token::testing::token_expiring_in;
  use crate::transport::testing::{MockTransport, Script};
  use serde_json::json;

  fn cached_client(transport: Arc<MockTransport>) -> HttpClient {
    HttpClient::builder()
      .base_url("http://api.test")
      .cache(CacheConfig::new().enabled(true))
      .retry(RetryConfig::new().initial_delay(Duration::from_millis(5)))
      .transport(transport)
      .build()
      .unwrap()
  }

  fn auth_client(transport: Arc<MockTransport>) -> HttpClient {
    let storage = MemoryTokenStorage::new();
    storage.set("token", &token_expiring_in(3600));
    storage.set("refreshToken", "refresh-1");

    HttpClient::builder()
      .base_url("http://api.test")
      .auth(AuthConfig::new())
      .token_storage(Box::new(storage))
      .transport(transport)
      .build()
      .unwrap()
  }

  #[tokio::test]
  async fn test_get_is_cached_across_calls() {
    let transport = Arc::new(MockTransport::always(200, json!([1, 2, 3])));
    let client = cached_client(transport.clone());

    let first = client.get("/users").await;
    assert_eq!(first.data, Some(json!([1, 2, 3])));

    let second = client.get("/users").await;
    assert_eq!(second.data, Some(json!([1, 2, 3])));
    // Second call was served from cache.
    assert_eq!(transport.call_count(), 1);
    assert_eq!(client.cache_stats().hits, 1);
  }

  #[tokio::test]
  async fn test_distinct_params_use_distinct_cache_keys() {
    let transport = Arc::new(MockTransport::always(200, json!("page")));
    let client = cached_client(transport.clone());

    client
      .get_with("/users", RequestOptions::new().param("page", "1"))
      .await;
    client
      .get_with("/users", RequestOptions::new().param("page", "2"))
      .await;

    assert_eq!(transport.call_count(), 2);
  }

  #[tokio::test]
  async fn test_write_invalidates_get_keys_under_base_path() {
    let transport = Arc::new(MockTransport::always(200, json!({"ok": true})));
    let client = cached_client(transport.clone());

    client.get("/users").await;
    assert_eq!(transport.call_count(), 1);

    // Successful write under /users invalidates the cached GET.
    client.post("/users", json!({"name": "Ada"})).await;
    client.get("/users").await;

    assert_eq!(transport.call_count(), 3);
  }

  #[tokio::test]
  async fn test_failed_write_does_not_invalidate() {
    let transport = Arc::new(MockTransport::new(vec![
      Script::Respond(200, json!([1])),
      Script::Respond(422, json!({"message": "invalid"})),
      Script::Respond(200, json!([1])),
    ]));
    let client = cached_client(transport.clone());

    client.get("/users").await;
    let write = client.post("/users", json!({})).await;
    assert!(!write.is_success());

    client.get("/users").await;
    // The GET is still cached: only the failed write hit the network after it.
    assert_eq!(transport.call_count(), 2);
  }

  #[tokio::test]
  async fn test_per_call_no_cache_bypasses_store() {
    let transport = Arc::new(MockTransport::always(200, json!(1)));
    let client = cached_client(transport.clone());

    client.get_with("/users", RequestOptions::new().no_cache()).await;
    client.get_with("/users", RequestOptions::new().no_cache()).await;

    assert_eq!(transport.call_count(), 2);
  }

  #[tokio::test]
  async fn test_401_triggers_refresh_and_single_reissue() {
    let new_access = token_expiring_in(7200);
    let transport = Arc::new(MockTransport::new(vec![
      Script::Respond(401, json!({"message": "expired"})),
      Script::Respond(200, json!({"access_token": new_access})),
      Script::Respond(200, json!({"secret": 42})),
    ]));
    let client = auth_client(transport.clone());

    let response = client.get("/secrets").await;

    assert!(response.is_success());
    assert_eq!(response.data, Some(json!({"secret": 42})));
    assert_eq!(transport.call_count(), 3);

    let urls = transport.seen_urls.lock().unwrap().clone();
    assert_eq!(urls[1], "/auth/refresh");

    // The re-issued request carried the refreshed token.
    let auth_headers = transport.seen_auth.lock().unwrap().clone();
    assert_eq!(auth_headers[2], format!("Bearer {new_access}"));
  }

  #[tokio::test]
  async fn test_refresh_failure_yields_session_expired_envelope() {
    let transport = Arc::new(MockTransport::new(vec![
      Script::Respond(401, json!({"message": "expired"})),
      Script::Respond(401, json!({"message": "refresh revoked"})),
    ]));
    let client = auth_client(transport.clone());

    let response = client.get("/secrets").await;

    assert!(!response.is_success());
    assert_eq!(response.status, 401);
    assert_eq!(
      response.error.as_deref(),
      Some(ErrorKind::SessionExpired.default_message())
    );
    // Original request + one refresh attempt, no further auto-retry.
    assert_eq!(transport.call_count(), 2);
    assert!(!client.is_authenticated());
  }

  #[tokio::test]
  async fn test_401_without_auth_configured_passes_through() {
    let transport = Arc::new(MockTransport::always(401, json!({"message": "nope"})));
    let client = cached_client(transport.clone());

    let response = client.get("/secrets").await;

    assert_eq!(response.status, 401);
    assert_eq!(transport.call_count(), 1);
  }

  #[tokio::test]
  async fn test_resource_accessor_builds_paths() {
    let transport = Arc::new(MockTransport::always(200, json!({"ok": true})));
    let client = cached_client(transport.clone());
    let users = client.resource("users");

    users.list().await;
    users.get_by_id("7").await;
    users.create(json!({"name": "Ada"})).await;
    users.update("7", json!({"name": "Ada L."})).await;
    users.remove("7").await;

    let urls = transport.seen_urls.lock().unwrap().clone();
    assert_eq!(
      urls,
      vec![
        "http://api.test/users",
        "http://api.test/users/7",
        "http://api.test/users",
        "http://api.test/users/7",
        "http://api.test/users/7",
      ]
    );
  }

  #[tokio::test]
  async fn test_params_are_rendered_sorted_in_url() {
    let transport = Arc::new(MockTransport::always(200, json!(null)));
    let client = cached_client(transport.clone());

    client
      .get_with(
        "/users",
        RequestOptions::new().param("page", "2").param("limit", "10").no_cache(),
      )
      .await;

    let urls = transport.seen_urls.lock().unwrap().clone();
    assert_eq!(urls[0], "http://api.test/users?limit=10&page=2");
  }

  #[tokio::test]
  async fn test_default_headers_are_applied() {
    let transport = Arc::new(MockTransport::always(200, json!(null)));
    let client = HttpClient::builder()
      .default_header("Authorization", "Bearer static-key")
      .transport(transport.clone())
      .build()
      .unwrap();

    client.get("/ping").await;

    assert_eq!(
      transport.seen_auth.lock().unwrap().first().map(String::as_str),
      Some("Bearer static-key")
    );
  }

  #[test]
  fn test_builder_rejects_invalid_config() {
    assert!(HttpClient::builder()
      .cache(CacheConfig::new().max_size(0))
      .build()
      .is_err());
    assert!(HttpClient::builder()
      .retry(RetryConfig::new().backoff_factor(0.1))
      .build()
      .is_err());
    assert!(HttpClient::builder()
      .timeout(Duration::ZERO)
      .build()
      .is_err());
  }

  #[tokio::test]
  async fn test_login_requires_auth_configuration() {
    let transport = Arc::new(MockTransport::always(200, json!(null)));
    let client = cached_client(transport);

    let credentials = Credentials {
      username: "ada".to_string(),
      password: "secret".to_string(),
    };
    assert!(client.login(&credentials).await.is_err());
  }
}
