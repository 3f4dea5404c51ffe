//! Session-token lifecycle: login, logout, storage restore, and a
//! single-flight refresh protocol for concurrent 401s.
//!
//! All state lives in one mutable record guarded by a synchronous mutex that
//! is never held across an await, so readers always observe a consistent
//! token/refresh-token pair. The refresh gate (an async mutex) serializes
//! refresh attempts; a generation counter tells queued callers whether a
//! refresh already completed while they waited.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

use crate::config::AuthConfig;
use crate::transport::{HttpMethod, Transport};

use super::token;

/// Pluggable persistence for tokens.
pub trait TokenStorage: Send + Sync {
  fn get(&self, key: &str) -> Option<String>;
  fn set(&self, key: &str, value: &str);
  fn remove(&self, key: &str);
}

/// Process-local token storage; tokens die with the client.
#[derive(Default)]
pub struct MemoryTokenStorage {
  values: Mutex<HashMap<String, String>>,
}

impl MemoryTokenStorage {
  pub fn new() -> Self {
    Self::default()
  }
}

impl TokenStorage for MemoryTokenStorage {
  fn get(&self, key: &str) -> Option<String> {
    self.values.lock().ok()?.get(key).cloned()
  }

  fn set(&self, key: &str, value: &str) {
    if let Ok(mut values) = self.values.lock() {
      values.insert(key.to_string(), value.to_string());
    }
  }

  fn remove(&self, key: &str) {
    if let Ok(mut values) = self.values.lock() {
      values.remove(key);
    }
  }
}

/// Login credentials posted to the login endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct Credentials {
  pub username: String,
  pub password: String,
}

/// Where the manager is in the session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthPhase {
  Unauthenticated,
  Authenticated,
  Refreshing,
}

/// The session state, replaced atomically on login/refresh/logout.
#[derive(Debug, Clone, Default)]
pub struct AuthState {
  pub access_token: Option<String>,
  pub refresh_token: Option<String>,
  pub expires_at: Option<DateTime<Utc>>,
  pub user: Option<Value>,
  pub is_authenticated: bool,
}

/// The session could not be refreshed; the caller must log in again.
#[derive(Debug, Clone, thiserror::Error)]
#[error("la sesión ha expirado")]
pub struct SessionExpired;

struct Inner {
  phase: AuthPhase,
  state: AuthState,
  /// Bumped on every login/refresh/logout; lets queued refresh callers see
  /// that the token changed while they waited.
  generation: u64,
}

/// Owns access/refresh token state and the refresh protocol.
pub struct AuthTokenManager {
  config: AuthConfig,
  storage: Box<dyn TokenStorage>,
  transport: Arc<dyn Transport>,
  inner: Mutex<Inner>,
  /// Serializes refresh attempts; held across the refresh network call.
  refresh_gate: tokio::sync::Mutex<()>,
}

impl AuthTokenManager {
  /// Configure the manager and restore any persisted session.
  ///
  /// A non-expired stored access token transitions straight to
  /// `Authenticated`; stale tokens are purged from storage.
  pub fn new(
    config: AuthConfig,
    storage: Box<dyn TokenStorage>,
    transport: Arc<dyn Transport>,
  ) -> Self {
    let manager = Self {
      config,
      storage,
      transport,
      inner: Mutex::new(Inner {
        phase: AuthPhase::Unauthenticated,
        state: AuthState::default(),
        generation: 0,
      }),
      refresh_gate: tokio::sync::Mutex::new(()),
    };
    manager.restore_from_storage();
    manager
  }

  fn restore_from_storage(&self) {
    let access_token = match self.storage.get(&self.config.token_key) {
      Some(token) => token,
      None => return,
    };

    if token::is_expired(&access_token) {
      self.purge_stored_tokens();
      return;
    }

    let refresh_token = if self.config.refresh_token_key.is_empty() {
      None
    } else {
      self.storage.get(&self.config.refresh_token_key)
    };

    let mut inner = self.lock();
    inner.state = AuthState {
      expires_at: token::expires_at(&access_token),
      access_token: Some(access_token),
      refresh_token,
      user: None,
      is_authenticated: true,
    };
    inner.phase = AuthPhase::Authenticated;
  }

  fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
    // The inner mutex is only held across synchronous sections; a panic
    // while holding it is a bug, so propagate the poison.
    self.inner.lock().expect("auth state lock poisoned")
  }

  fn purge_stored_tokens(&self) {
    self.storage.remove(&self.config.token_key);
    if !self.config.refresh_token_key.is_empty() {
      self.storage.remove(&self.config.refresh_token_key);
    }
  }

  fn endpoint_url(&self, endpoint: &str) -> String {
    format!("{}{}", self.config.base_url, endpoint)
  }

  /// Current access token and the generation it belongs to.
  pub fn bearer(&self) -> Option<(String, u64)> {
    let inner = self.lock();
    inner
      .state
      .access_token
      .clone()
      .map(|token| (token, inner.generation))
  }

  pub fn generation(&self) -> u64 {
    self.lock().generation
  }

  pub fn phase(&self) -> AuthPhase {
    self.lock().phase
  }

  /// Snapshot of the session state.
  pub fn state(&self) -> AuthState {
    self.lock().state.clone()
  }

  /// Authenticated, and the token (if it carries an expiry) is still valid.
  pub fn is_authenticated(&self) -> bool {
    let inner = self.lock();
    inner.phase == AuthPhase::Authenticated
      && inner.state.expires_at.is_none_or(|at| at > Utc::now())
  }

  /// Log in with credentials against the login endpoint.
  ///
  /// On success the tokens are stored and the manager transitions to
  /// `Authenticated`; on failure the state is untouched and the error
  /// propagates.
  pub async fn login(&self, credentials: &Credentials) -> Result<AuthState> {
    let url = self.endpoint_url(&self.config.login_endpoint);
    let body = serde_json::to_value(credentials)?;

    let response = self
      .transport
      .call(HttpMethod::Post, &url, &HashMap::new(), Some(&body))
      .await
      .map_err(|e| eyre!("Login request failed: {}", e))?;

    if !response.is_success() {
      return Err(eyre!("Login failed with status {}", response.status));
    }

    let access_token = extract_token(&response.data)
      .ok_or_else(|| eyre!("Login response carried no access token"))?;
    if token::is_expired(&access_token) {
      self.purge_stored_tokens();
      return Err(eyre!("Login returned an expired token"));
    }

    let refresh_token = response
      .data
      .get("refresh_token")
      .and_then(Value::as_str)
      .map(String::from);

    self.storage.set(&self.config.token_key, &access_token);
    if let Some(refresh) = refresh_token.as_deref() {
      if !self.config.refresh_token_key.is_empty() {
        self.storage.set(&self.config.refresh_token_key, refresh);
      }
    }

    let state = AuthState {
      expires_at: token::expires_at(&access_token),
      access_token: Some(access_token),
      refresh_token,
      user: None,
      is_authenticated: true,
    };

    let mut inner = self.lock();
    inner.state = state.clone();
    inner.phase = AuthPhase::Authenticated;
    inner.generation += 1;

    Ok(state)
  }

  /// Log out: notify the logout endpoint best-effort, then clear the session.
  pub async fn logout(&self) {
    if let Some((access_token, _)) = self.bearer() {
      let url = self.endpoint_url(&self.config.logout_endpoint);
      let mut headers = HashMap::new();
      headers.insert("Authorization".to_string(), format!("Bearer {access_token}"));

      if let Err(e) = self
        .transport
        .call(HttpMethod::Post, &url, &headers, None)
        .await
      {
        tracing::warn!(error = %e, "logout endpoint call failed, clearing session anyway");
      }
    }

    self.purge_stored_tokens();
    let mut inner = self.lock();
    inner.state = AuthState::default();
    inner.phase = AuthPhase::Unauthenticated;
    inner.generation += 1;
  }

  /// Handle a 401 observed elsewhere in the pipeline.
  ///
  /// Exactly one refresh call is in flight at a time: the first caller takes
  /// the gate, marks the state `Refreshing` before suspending, and performs
  /// the refresh; concurrent callers queue on the gate and, once it opens,
  /// pick up the already-refreshed token via the generation check. On
  /// failure every queued caller gets `SessionExpired` and the session is
  /// cleared.
  pub async fn refresh_after_unauthorized(
    &self,
    observed_generation: u64,
  ) -> std::result::Result<String, SessionExpired> {
    let _gate = self.refresh_gate.lock().await;

    let refresh_token = {
      let mut inner = self.lock();

      if inner.generation != observed_generation {
        // A refresh (or login/logout) completed while we queued.
        return match (&inner.state.access_token, inner.state.is_authenticated) {
          (Some(token), true) => Ok(token.clone()),
          _ => Err(SessionExpired),
        };
      }

      match inner.state.refresh_token.clone() {
        Some(token) => {
          // Mark before suspending: the flag must be visible synchronously.
          inner.phase = AuthPhase::Refreshing;
          token
        }
        None => {
          self.clear_session_locked(&mut inner);
          return Err(SessionExpired);
        }
      }
    };

    let url = self.endpoint_url(&self.config.refresh_endpoint);
    // The refresh call never carries the (expired) bearer header.
    let body = json!({ "refreshToken": refresh_token });
    let outcome = self
      .transport
      .call(HttpMethod::Post, &url, &HashMap::new(), Some(&body))
      .await;

    let mut inner = self.lock();
    inner.generation += 1;

    let response = match outcome {
      Ok(response) if response.is_success() => response,
      Ok(response) => {
        tracing::warn!(status = response.status, "token refresh rejected");
        self.clear_session_locked(&mut inner);
        return Err(SessionExpired);
      }
      Err(e) => {
        tracing::warn!(error = %e, "token refresh failed");
        self.clear_session_locked(&mut inner);
        return Err(SessionExpired);
      }
    };

    let access_token = match extract_token(&response.data) {
      Some(token) => token,
      None => {
        self.clear_session_locked(&mut inner);
        return Err(SessionExpired);
      }
    };

    let new_refresh = response
      .data
      .get("refresh_token")
      .and_then(Value::as_str)
      .map(String::from)
      .or(Some(refresh_token));

    self.storage.set(&self.config.token_key, &access_token);
    if let (Some(refresh), false) = (new_refresh.as_deref(), self.config.refresh_token_key.is_empty())
    {
      self.storage.set(&self.config.refresh_token_key, refresh);
    }

    inner.state = AuthState {
      expires_at: token::expires_at(&access_token),
      access_token: Some(access_token.clone()),
      refresh_token: new_refresh,
      user: inner.state.user.take(),
      is_authenticated: true,
    };
    inner.phase = AuthPhase::Authenticated;

    Ok(access_token)
  }

  fn clear_session_locked(&self, inner: &mut Inner) {
    self.purge_stored_tokens();
    inner.state = AuthState::default();
    inner.phase = AuthPhase::Unauthenticated;
  }

  /// Fetch (and memoize) the authenticated user's info.
  pub async fn get_authenticated_user(&self) -> Option<Value> {
    if !self.is_authenticated() {
      return None;
    }

    if let Some(user) = self.lock().state.user.clone() {
      return Some(user);
    }

    let (access_token, _) = self.bearer()?;
    let url = self.endpoint_url(&self.config.user_info_endpoint);
    let mut headers = HashMap::new();
    headers.insert("Authorization".to_string(), format!("Bearer {access_token}"));

    match self
      .transport
      .call(HttpMethod::Get, &url, &headers, None)
      .await
    {
      Ok(response) if response.is_success() => {
        let user = response.data;
        self.lock().state.user = Some(user.clone());
        Some(user)
      }
      Ok(response) => {
        tracing::warn!(status = response.status, "user info request rejected");
        None
      }
      Err(e) => {
        tracing::warn!(error = %e, "user info request failed");
        None
      }
    }
  }
}

/// The refresh/login response carries the token as `access_token` or `token`.
fn extract_token(data: &Value) -> Option<String> {
  data
    .get("access_token")
    .or_else(|| data.get("token"))
    .and_then(Value::as_str)
    .map(String::from)
}
