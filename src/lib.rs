//! A client-side HTTP request layer.
//!
//! Sits between application code and a raw transport to provide:
//!
//! - transparent response caching with five consistency strategies
//!   (cache-first, network-first, stale-while-revalidate, network-only,
//!   cache-only) over a memory or SQLite-backed store,
//! - bounded automatic retry with exponential backoff and a typed error
//!   taxonomy,
//! - session-token lifecycle management with single-flight refresh on 401.
//!
//! Every public operation resolves to a [`ResultEnvelope`]; callers
//! distinguish success from failure via `error == None`, never via panics.
//!
//! ```no_run
//! use lazyfetch::{CacheConfig, CacheStrategy, HttpClient};
//!
//! # async fn run() -> color_eyre::Result<()> {
//! let client = HttpClient::builder()
//!   .base_url("https://api.example.com")
//!   .cache(CacheConfig::new().enabled(true).default_strategy(CacheStrategy::CacheFirst))
//!   .build()?;
//!
//! let users = client.get("/users").await;
//! if users.is_success() {
//!   println!("{:?}", users.data);
//! }
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod cache;
mod client;
mod config;
mod envelope;
mod error;
mod retry;
pub mod transport;

pub use auth::{AuthState, AuthTokenManager, Credentials, TokenStorage};
pub use cache::{CacheStore, CacheStrategyEngine, CacheWriteOptions, StatsSnapshot};
pub use client::{CacheRequestOptions, HttpClient, HttpClientBuilder, RequestOptions, Resource};
pub use config::{AuthConfig, CacheConfig, CacheStrategy, RetryConfig, StorageKind};
pub use envelope::{ResponseMeta, ResultEnvelope};
pub use error::{ErrorDetails, ErrorKind};
pub use retry::{RetryEngine, RetryRequest};
pub use transport::{HttpMethod, RawResponse, ReqwestTransport, Transport, TransportError};
