//! Transport collaborator: the raw HTTP call primitive.
//!
//! The request layer never issues socket-level requests itself; it hands a
//! method, URL, headers and body to a [`Transport`] and gets back either a
//! [`RawResponse`] (any HTTP status counts as a response) or a
//! [`TransportError`] when nothing usable came back.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

/// HTTP method of a logical request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum HttpMethod {
  #[default]
  Get,
  Post,
  Put,
  Patch,
  Delete,
  Head,
}

impl HttpMethod {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::Get => "GET",
      Self::Post => "POST",
      Self::Put => "PUT",
      Self::Patch => "PATCH",
      Self::Delete => "DELETE",
      Self::Head => "HEAD",
    }
  }

  /// Whether this method mutates server state (and so invalidates cache).
  pub fn is_write(self) -> bool {
    matches!(self, Self::Post | Self::Put | Self::Patch | Self::Delete)
  }
}

impl fmt::Display for HttpMethod {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// A response the transport actually received, regardless of status.
#[derive(Debug, Clone)]
pub struct RawResponse {
  pub status: u16,
  pub headers: HashMap<String, String>,
  /// Body decoded as JSON; non-JSON bodies arrive as a JSON string.
  pub data: Value,
}

impl RawResponse {
  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }
}

/// Failure below the HTTP layer: nothing usable came back.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct TransportError {
  pub message: String,
  /// OS-level error code when the failure happened below HTTP
  /// (e.g. `ECONNRESET`, `ETIMEDOUT`, `ECONNREFUSED`).
  pub code: Option<String>,
  /// Status of a partially received response, if any bytes came back.
  pub status: Option<u16>,
}

impl TransportError {
  pub fn new(message: impl Into<String>) -> Self {
    Self {
      message: message.into(),
      code: None,
      status: None,
    }
  }

  pub fn with_code(mut self, code: impl Into<String>) -> Self {
    self.code = Some(code.into());
    self
  }
}

/// The raw call primitive the request layer is built on.
///
/// Cancellation is driven from above: each attempt is wrapped in a
/// `tokio::time::timeout`, which drops the in-flight future on expiry.
#[async_trait]
pub trait Transport: Send + Sync {
  async fn call(
    &self,
    method: HttpMethod,
    url: &str,
    headers: &HashMap<String, String>,
    body: Option<&Value>,
  ) -> Result<RawResponse, TransportError>;
}

/// Default transport backed by a shared `reqwest` client.
pub struct ReqwestTransport {
  client: reqwest::Client,
}

impl ReqwestTransport {
  pub fn new() -> Self {
    Self {
      client: reqwest::Client::new(),
    }
  }

  pub fn with_client(client: reqwest::Client) -> Self {
    Self { client }
  }
}

impl Default for ReqwestTransport {
  fn default() -> Self {
    Self::new()
  }
}

#[async_trait]
impl Transport for ReqwestTransport {
  async fn call(
    &self,
    method: HttpMethod,
    url: &str,
    headers: &HashMap<String, String>,
    body: Option<&Value>,
  ) -> Result<RawResponse, TransportError> {
    let method = match method {
      HttpMethod::Get => reqwest::Method::GET,
      HttpMethod::Post => reqwest::Method::POST,
      HttpMethod::Put => reqwest::Method::PUT,
      HttpMethod::Patch => reqwest::Method::PATCH,
      HttpMethod::Delete => reqwest::Method::DELETE,
      HttpMethod::Head => reqwest::Method::HEAD,
    };

    let mut request = self.client.request(method, url);
    for (name, value) in headers {
      request = request.header(name, value);
    }
    if let Some(body) = body {
      request = request.json(body);
    }

    let response = request.send().await.map_err(map_reqwest_error)?;

    let status = response.status().as_u16();
    let headers = response
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.to_string(), v.to_string()))
      })
      .collect();

    let text = response.text().await.map_err(map_reqwest_error)?;
    let data = if text.is_empty() {
      Value::Null
    } else {
      serde_json::from_str(&text).unwrap_or(Value::String(text))
    };

    Ok(RawResponse {
      status,
      headers,
      data,
    })
  }
}

/// Map a reqwest failure to a transport error with an OS-level code.
fn map_reqwest_error(err: reqwest::Error) -> TransportError {
  TransportError {
    message: err.to_string(),
    code: errno_code(&err),
    status: err.status().map(|s| s.as_u16()),
  }
}

/// Walk the source chain looking for an `io::Error` to name the failure.
fn errno_code(err: &reqwest::Error) -> Option<String> {
  if err.is_timeout() {
    return Some("ETIMEDOUT".to_string());
  }

  let mut source = std::error::Error::source(err);
  while let Some(inner) = source {
    if let Some(io) = inner.downcast_ref::<std::io::Error>() {
      let code = match io.kind() {
        std::io::ErrorKind::ConnectionReset => "ECONNRESET",
        std::io::ErrorKind::ConnectionRefused => "ECONNREFUSED",
        std::io::ErrorKind::ConnectionAborted => "ECONNABORTED",
        std::io::ErrorKind::TimedOut => "ETIMEDOUT",
        _ => return None,
      };
      return Some(code.to_string());
    }
    source = inner.source();
  }

  if err.is_connect() {
    return Some("ECONNREFUSED".to_string());
  }
  None
}
