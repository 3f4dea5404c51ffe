//! Session-token lifecycle: decoding, storage, and the refresh protocol.

mod manager;
pub mod token;

pub use manager::{
  AuthPhase, AuthState, AuthTokenManager, Credentials, MemoryTokenStorage, SessionExpired,
  TokenStorage,
};
