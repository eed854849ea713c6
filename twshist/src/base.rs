// twshist/src/base.rs
// Base error definitions for the history client

use thiserror::Error;

/// Errors that can occur while talking to TWS / IB Gateway.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TwsError {
  #[error("Configuration error: {0}")]
  ConfigurationError(String),

  /// The handshake failed or timed out.
  #[error("Connection failed: {0}")]
  ConnectionFailed(String),

  #[error("Not connected to TWS")]
  NotConnected,

  #[error("Already connected to TWS")]
  AlreadyConnected,

  #[error("Socket error: {0}")]
  SocketError(String),

  #[error("Message parse error: {0}")]
  ParseError(String),

  /// A received value could not be normalized (e.g. unparseable bar timestamp).
  #[error("Format error: {0}")]
  FormatError(String),

  #[error("Request timeout: {0}")]
  Timeout(String),

  #[error("Duplicate request ID: {0}")]
  DuplicateRequestId(i32),

  #[error("Invalid parameter: {0}")]
  InvalidParameter(String),

  #[error("Logging error: {0}")]
  LoggingError(String),

  #[error("Rate limit exceeded")]
  RateLimitExceeded,

  #[error("Internal error: {0}")]
  InternalError(String),

  /// The gateway rejected one request; the session remains usable.
  #[error("Request rejected: code={0}, msg={1}")]
  RequestFatal(i32, String),

  /// The session is unusable; every pending request fails with this.
  #[error("Connection lost: code={0}, msg={1}")]
  ConnectionFatal(i32, String),
}

impl TwsError {
  /// True when the error means the session can no longer be used.
  pub fn is_connection_fatal(&self) -> bool {
    matches!(self, TwsError::ConnectionFatal(..) | TwsError::NotConnected)
  }

  /// Gateway error code, when the error originated from one.
  pub fn code(&self) -> Option<i32> {
    match self {
      TwsError::RequestFatal(code, _) | TwsError::ConnectionFatal(code, _) => Some(*code),
      _ => None,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn fatal_errors_expose_code() {
    let e = TwsError::RequestFatal(162, "HMDS query returned no data".to_string());
    assert_eq!(e.code(), Some(162));
    assert!(!e.is_connection_fatal());
    assert_eq!(e.to_string(), "Request rejected: code=162, msg=HMDS query returned no data");

    let e = TwsError::ConnectionFatal(1100, "Connectivity lost".to_string());
    assert!(e.is_connection_fatal());
    assert!(TwsError::NotConnected.is_connection_fatal());
    assert_eq!(TwsError::Timeout("x".into()).code(), None);
  }
}
