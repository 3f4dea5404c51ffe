//! Uniform result envelope returned by every public operation.
//!
//! Callers distinguish success from failure via `error == None`, never via
//! panics or raised errors. Envelopes are serializable so the persistent cache
//! backend can store them as-is.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ErrorDetails, ErrorKind};

/// Metadata describing where a response came from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseMeta {
  /// The value was served from cache rather than the network.
  #[serde(default, skip_serializing_if = "std::ops::Not::not")]
  pub from_cache: bool,
  /// A background revalidation was started for this key.
  #[serde(default, skip_serializing_if = "std::ops::Not::not")]
  pub refreshing: bool,
  /// The network error that forced a cache fallback, if any.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub network_error: Option<String>,
}

/// Uniform result of a request: data on success, classified error on failure.
///
/// The body is kept as raw JSON so envelopes round-trip through any storage
/// backend; [`ResultEnvelope::data_as`] decodes into a typed value at the edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultEnvelope {
  pub data: Option<Value>,
  pub error: Option<String>,
  pub status: u16,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub meta: Option<ResponseMeta>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub details: Option<ErrorDetails>,
}

impl ResultEnvelope {
  /// Successful outcome with a body and status.
  pub fn success(data: Value, status: u16) -> Self {
    Self {
      data: Some(data),
      error: None,
      status,
      meta: None,
      details: None,
    }
  }

  /// Failure outcome classified under `kind`, logged before being returned.
  ///
  /// `message` overrides the kind's default text; `status` overrides the
  /// kind's default status; `cause` feeds the details block.
  pub fn failure(
    kind: ErrorKind,
    message: Option<String>,
    status: Option<u16>,
    cause: Option<String>,
  ) -> Self {
    let envelope = Self {
      data: None,
      error: Some(message.unwrap_or_else(|| kind.default_message().to_string())),
      status: status.unwrap_or_else(|| kind.default_status()),
      meta: None,
      details: Some(ErrorDetails::for_kind(kind, cause.as_deref())),
    };

    tracing::error!(
      status = envelope.status,
      error = envelope.error.as_deref().unwrap_or(""),
      kind = ?kind,
      "request failed"
    );

    envelope
  }

  /// Whether this envelope represents a successful outcome.
  pub fn is_success(&self) -> bool {
    self.error.is_none()
  }

  /// Decode the body into a typed value.
  pub fn data_as<T: DeserializeOwned>(&self) -> Option<T> {
    self
      .data
      .as_ref()
      .and_then(|v| serde_json::from_value(v.clone()).ok())
  }

  /// Tag this envelope as served from cache.
  pub fn tagged_from_cache(mut self, refreshing: bool, network_error: Option<String>) -> Self {
    let meta = self.meta.get_or_insert_with(ResponseMeta::default);
    meta.from_cache = true;
    meta.refreshing = refreshing;
    if network_error.is_some() {
      meta.network_error = network_error;
    }
    self
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_success_envelope() {
    let envelope = ResultEnvelope::success(json!({"id": 7}), 200);
    assert!(envelope.is_success());
    assert_eq!(envelope.status, 200);
    assert!(envelope.details.is_none());
  }

  #[test]
  fn test_failure_uses_kind_defaults() {
    let envelope = ResultEnvelope::failure(ErrorKind::Timeout, None, None, None);
    assert!(!envelope.is_success());
    assert_eq!(envelope.status, 408);
    assert_eq!(
      envelope.error.as_deref(),
      Some(ErrorKind::Timeout.default_message())
    );
    assert!(envelope.details.is_some());
  }

  #[test]
  fn test_data_as_decodes_typed_body() {
    #[derive(Deserialize)]
    struct User {
      id: u64,
    }

    let envelope = ResultEnvelope::success(json!({"id": 42, "name": "ada"}), 200);
    let user: User = envelope.data_as().unwrap();
    assert_eq!(user.id, 42);
  }

  #[test]
  fn test_from_cache_tagging_preserves_body() {
    let envelope = ResultEnvelope::success(json!("old"), 200)
      .tagged_from_cache(true, Some("connection refused".to_string()));

    let meta = envelope.meta.as_ref().unwrap();
    assert!(meta.from_cache);
    assert!(meta.refreshing);
    assert_eq!(meta.network_error.as_deref(), Some("connection refused"));
    assert_eq!(envelope.data, Some(json!("old")));
  }

  #[test]
  fn test_envelope_round_trips_through_json() {
    let envelope = ResultEnvelope::failure(
      ErrorKind::Network,
      Some("boom".to_string()),
      Some(503),
      Some("ECONNRESET".to_string()),
    );

    let serialized = serde_json::to_string(&envelope).unwrap();
    let restored: ResultEnvelope = serde_json::from_str(&serialized).unwrap();
    assert_eq!(restored, envelope);
  }
}
