//! Error types shared by the synchronization core.

use std::time::Duration;

use thiserror::Error;

/// Maximum length for response bodies carried in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

/// Coarse classification of a [`SyncError`], used for propagation policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
  Timeout,
  Cancelled,
  TransportError,
  Unauthenticated,
  Unknown,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
  #[error("Request timed out after {}ms", .0.as_millis())]
  Timeout(Duration),

  /// The backend (or a proxy in front of it) answered 408 or 504
  #[error("Backend timed out: {0}")]
  GatewayTimeout(String),

  #[error("Request was cancelled")]
  Cancelled,

  #[error("Network error: {0}")]
  Transport(String),

  #[error("Session is not authenticated: {0}")]
  Unauthenticated(String),

  #[error("Invalid configuration: {0}")]
  Config(String),

  #[error("{0}")]
  Unknown(String),
}

impl SyncError {
  pub fn kind(&self) -> ErrorKind {
    match self {
      SyncError::Timeout(_) | SyncError::GatewayTimeout(_) => ErrorKind::Timeout,
      SyncError::Cancelled => ErrorKind::Cancelled,
      SyncError::Transport(_) => ErrorKind::TransportError,
      SyncError::Unauthenticated(_) => ErrorKind::Unauthenticated,
      SyncError::Config(_) | SyncError::Unknown(_) => ErrorKind::Unknown,
    }
  }

  /// Errors that say something about backend reachability.
  pub fn is_connectivity(&self) -> bool {
    matches!(self.kind(), ErrorKind::Timeout | ErrorKind::TransportError)
  }

  pub fn is_cancelled(&self) -> bool {
    matches!(self, SyncError::Cancelled)
  }

  pub fn is_unauthenticated(&self) -> bool {
    matches!(self, SyncError::Unauthenticated(_))
  }

  /// Truncate a response body to avoid logging excessive data
  fn truncate_body(body: &str) -> String {
    if body.len() <= MAX_ERROR_BODY_LENGTH {
      return body.to_string();
    }
    let mut end = MAX_ERROR_BODY_LENGTH;
    while !body.is_char_boundary(end) {
      end -= 1;
    }
    format!(
      "{}... (truncated, {} total bytes)",
      &body[..end],
      body.len()
    )
  }

  pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
    let truncated = Self::truncate_body(body);
    match status.as_u16() {
      401 | 403 => SyncError::Unauthenticated(format!("status {}", status)),
      408 | 504 => SyncError::GatewayTimeout(format!("status {}", status)),
      429 | 500..=599 => SyncError::Transport(format!("status {}: {}", status, truncated)),
      _ => SyncError::Unknown(format!("unexpected status {}: {}", status, truncated)),
    }
  }

  /// Classify a transport error. `timeout` is the client's request timeout,
  /// reported when reqwest gave up waiting.
  pub fn from_reqwest(err: reqwest::Error, timeout: Duration) -> Self {
    if err.is_timeout() {
      SyncError::Timeout(timeout)
    } else if let Some(status) = err.status() {
      SyncError::from_status(status, "")
    } else if err.is_decode() {
      SyncError::Unknown(format!("Invalid response: {}", err))
    } else {
      SyncError::Transport(err.to_string())
    }
  }
}
