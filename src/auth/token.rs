//! Token payload decoding and expiry checks.
//!
//! Tokens are treated as opaque three-part dot-separated strings whose middle
//! segment is a base64url JSON object. Decode failures yield "no claims"
//! rather than an error; a token without an `exp` claim never expires.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{Map, Value};

/// Decode the claims object from a token's payload segment.
///
/// Returns `None` when the token is not three dot-separated parts, the
/// payload is not valid base64url, or the decoded bytes are not a JSON
/// object.
pub fn decode_claims(token: &str) -> Option<Map<String, Value>> {
  let mut parts = token.split('.');
  let (_header, payload, _signature) = (parts.next()?, parts.next()?, parts.next()?);
  if parts.next().is_some() {
    return None;
  }

  let bytes = URL_SAFE_NO_PAD.decode(payload.as_bytes()).ok()?;
  match serde_json::from_slice::<Value>(&bytes).ok()? {
    Value::Object(claims) => Some(claims),
    _ => None,
  }
}

/// Expiry instant from the `exp` claim (seconds since epoch), if present.
pub fn expires_at(token: &str) -> Option<DateTime<Utc>> {
  let claims = decode_claims(token)?;
  let exp = claims.get("exp")?.as_i64()?;
  Utc.timestamp_millis_opt(exp * 1000).single()
}

/// Whether the token has expired. Tokens without an `exp` claim (or without
/// decodable claims at all) are treated as non-expiring.
pub fn is_expired(token: &str) -> bool {
  match expires_at(token) {
    Some(at) => at <= Utc::now(),
    None => false,
  }
}
