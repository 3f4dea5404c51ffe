//! Deterministic cache key generation.
//!
//! Identical logical requests must collide on the same key, so query
//! parameters and tags are sorted before they are rendered. The persistent
//! backend additionally hashes keys to a stable fixed length.

use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::transport::HttpMethod;

/// Build the cache key for a logical request:
/// `"<METHOD>:<path>[?<sorted-query>][:tags=<sorted-tag-list>]"`.
///
/// A caller-provided `custom` key wins outright.
pub fn cache_key(
  method: HttpMethod,
  endpoint: &str,
  params: &BTreeMap<String, String>,
  tags: &[String],
  custom: Option<&str>,
) -> String {
  if let Some(key) = custom {
    return key.to_string();
  }

  let mut path = if endpoint.starts_with('/') {
    endpoint.to_string()
  } else {
    format!("/{endpoint}")
  };

  // BTreeMap iterates in sorted key order.
  if !params.is_empty() {
    let query: Vec<String> = params.iter().map(|(k, v)| format!("{k}={v}")).collect();
    path.push('?');
    path.push_str(&query.join("&"));
  }

  let mut key = format!("{}:{}", method.as_str(), path);

  if !tags.is_empty() {
    let mut sorted: Vec<&str> = tags.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    key.push_str(":tags=");
    key.push_str(&sorted.join(","));
  }

  key
}

/// Stable fixed-length hash of a cache key, used as the persisted primary key.
pub fn persist_hash(key: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(key.as_bytes());
  hex::encode(hasher.finalize())
}
