//! Error taxonomy surfaced through result envelopes.
//!
//! Every failed operation is classified into one of these kinds before it
//! reaches the caller. Each kind carries a default human-readable message, a
//! default status code, and an actionable suggestion. Messages are kept
//! byte-compatible with the wire surface of the original service.

use serde::{Deserialize, Serialize};

/// Classification of a failed request outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
  /// An attempt exceeded its deadline.
  Timeout,
  /// Generic connectivity failure (no usable response).
  Network,
  /// The underlying call primitive reported an error, with or without a response.
  Transport,
  /// The caller or a timeout cancelled the attempt.
  Aborted,
  /// Refresh failed or no refresh was possible.
  SessionExpired,
  /// Fallback for anything unclassifiable.
  Unknown,
}

impl ErrorKind {
  /// Default human-readable message for this kind.
  pub fn default_message(self) -> &'static str {
    match self {
      Self::Timeout => "La solicitud ha excedido el tiempo de espera",
      Self::Network => "Error de conexión con el servidor",
      Self::Transport => "Error de conexión del transporte HTTP",
      Self::Aborted => "La solicitud fue cancelada por timeout",
      Self::SessionExpired => "La sesión ha expirado",
      Self::Unknown => "Error desconocido",
    }
  }

  /// Actionable suggestion surfaced alongside the message.
  pub fn suggestion(self) -> &'static str {
    match self {
      Self::Timeout => "Aumente el timeout de la petición o verifique la latencia del servidor",
      Self::Network => "Compruebe la conexión de red y que el servidor esté disponible",
      Self::Transport => "Revise la URL y el estado del servidor de destino",
      Self::Aborted => "Reintente la petición; considere un timeout mayor",
      Self::SessionExpired => "Inicie sesión de nuevo para obtener un token válido",
      Self::Unknown => "Revise los logs para más detalles",
    }
  }

  /// Status code used when the failure produced no HTTP response.
  pub fn default_status(self) -> u16 {
    match self {
      Self::Timeout => 408,
      Self::SessionExpired => 401,
      // No response was received; there is no meaningful HTTP status.
      Self::Network | Self::Transport | Self::Aborted | Self::Unknown => 0,
    }
  }
}

/// Structured error detail attached to failure envelopes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetails {
  /// What went wrong.
  pub description: String,
  /// Why it went wrong, as far as the layer can tell.
  pub cause: String,
  /// What the caller can do about it.
  pub solution: String,
}

impl ErrorDetails {
  /// Build details for a kind, with an optional underlying cause.
  pub fn for_kind(kind: ErrorKind, cause: Option<&str>) -> Self {
    Self {
      description: kind.default_message().to_string(),
      cause: cause.unwrap_or("desconocida").to_string(),
      solution: kind.suggestion().to_string(),
    }
  }
}
