//! Bounded retry with exponential backoff around a single transport call.
//!
//! Each attempt runs under its own deadline; a timed-out attempt consumes
//! retry budget exactly like any other retryable failure. The backoff delay
//! is one canonical formula: `initial_delay × backoff_factor^attempt`, with
//! the exponent counted 0-based from the first retry.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::config::RetryConfig;
use crate::envelope::ResultEnvelope;
use crate::error::ErrorKind;
use crate::transport::{HttpMethod, RawResponse, Transport, TransportError};

/// One logical request, as handed to the retry engine.
#[derive(Debug, Clone)]
pub struct RetryRequest {
  pub method: HttpMethod,
  pub url: String,
  pub headers: HashMap<String, String>,
  pub body: Option<Value>,
  /// Per-attempt deadline.
  pub timeout: Duration,
  /// Per-call override of the configured retry budget.
  pub retries: Option<u32>,
}

/// Executes transport calls under the configured retry policy.
#[derive(Clone)]
pub struct RetryEngine {
  config: Arc<RetryConfig>,
  transport: Arc<dyn Transport>,
}

impl RetryEngine {
  pub fn new(config: RetryConfig, transport: Arc<dyn Transport>) -> Self {
    Self {
      config: Arc::new(config),
      transport,
    }
  }

  pub fn config(&self) -> &RetryConfig {
    &self.config
  }

  /// Run the request, retrying retryable failures up to the budget, and
  /// normalize the final outcome into an envelope.
  pub async fn execute_with_retry(&self, request: &RetryRequest) -> ResultEnvelope {
    let budget = if self.config.enabled {
      request.retries.unwrap_or(self.config.max_retries)
    } else {
      0
    };

    let mut attempt: u32 = 0;
    loop {
      let outcome = tokio::time::timeout(
        request.timeout,
        self.transport.call(
          request.method,
          &request.url,
          &request.headers,
          request.body.as_ref(),
        ),
      )
      .await;

      let failure = match outcome {
        Ok(Ok(response)) if response.is_success() => {
          return ResultEnvelope::success(response.data, response.status);
        }
        Ok(Ok(response)) => Failure::Status(response),
        Ok(Err(err)) => Failure::Transport(err),
        Err(_) => Failure::Deadline,
      };

      if attempt < budget && self.is_retryable(&failure) {
        let delay = self.backoff_delay(attempt);
        tracing::warn!(
          url = request.url,
          attempt = attempt + 1,
          remaining = budget - attempt,
          delay_ms = delay.as_millis() as u64,
          "retrying request"
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
        continue;
      }

      return self.normalize_failure(request, failure);
    }
  }

  /// Retryable iff no response was received, the status is in the retryable
  /// set, or the transport named a retryable error code.
  fn is_retryable(&self, failure: &Failure) -> bool {
    match failure {
      Failure::Deadline => true,
      Failure::Status(response) => self.config.retryable_status_codes.contains(&response.status),
      Failure::Transport(err) => {
        let code_retryable = err
          .code
          .as_deref()
          .is_some_and(|code| self.config.retryable_errors.contains(code));
        err.status.is_none() || code_retryable
      }
    }
  }

  /// `initial_delay × backoff_factor^attempt`, attempt 0-based from the
  /// first retry.
  fn backoff_delay(&self, attempt: u32) -> Duration {
    self
      .config
      .initial_delay
      .mul_f64(self.config.backoff_factor.powi(attempt as i32))
  }

  fn normalize_failure(&self, request: &RetryRequest, failure: Failure) -> ResultEnvelope {
    match failure {
      Failure::Deadline => ResultEnvelope::failure(
        ErrorKind::Timeout,
        None,
        None,
        Some(format!("deadline of {:?} elapsed for {}", request.timeout, request.url)),
      ),
      Failure::Status(response) => {
        let message = response
          .data
          .get("message")
          .or_else(|| response.data.get("error"))
          .and_then(Value::as_str)
          .map(String::from);
        ResultEnvelope::failure(
          ErrorKind::Transport,
          message,
          Some(response.status),
          Some(format!("HTTP {} from {}", response.status, request.url)),
        )
      }
      Failure::Transport(err) => {
        // An OS-level code means connectivity failed below HTTP.
        let kind = if err.code.is_some() {
          ErrorKind::Network
        } else {
          ErrorKind::Transport
        };
        ResultEnvelope::failure(
          kind,
          Some(err.message.clone()),
          err.status,
          err.code.clone().or_else(|| Some(err.message.clone())),
        )
      }
    }
  }
}

enum Failure {
  /// The attempt exceeded its deadline.
  Deadline,
  /// A response arrived with a non-success status.
  Status(RawResponse),
  /// The transport failed without a usable response.
  Transport(TransportError),
}
