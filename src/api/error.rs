//! Failure classification for remote calls.

use std::fmt;

/// Class of a failed remote call. Drives retry and user-signal decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
  /// Session invalid or missing
  Auth,
  /// Request rejected as malformed
  Validation,
  /// Request conflicts with current server state
  Conflict,
  /// Too many requests
  RateLimit,
  /// 5xx
  Server,
  /// Could not reach the backend
  Network,
  /// Overall deadline elapsed
  Timeout,
  Unknown,
}

impl ErrorClass {
  /// Whether a failure of this class may succeed if attempted again.
  pub fn is_retryable(self) -> bool {
    matches!(
      self,
      ErrorClass::Network | ErrorClass::Timeout | ErrorClass::Server | ErrorClass::RateLimit
    )
  }

  /// Classes the caller is expected to handle in context (login redirect,
  /// inline field errors). These never produce a user-visible signal here.
  pub fn is_locally_handled(self) -> bool {
    matches!(
      self,
      ErrorClass::Auth | ErrorClass::Validation | ErrorClass::Conflict
    )
  }

  /// Classify from a transport status code alone.
  pub fn from_status(status: u16) -> Self {
    match status {
      401 | 403 => ErrorClass::Auth,
      400 | 422 => ErrorClass::Validation,
      409 => ErrorClass::Conflict,
      408 => ErrorClass::Timeout,
      429 => ErrorClass::RateLimit,
      500..=599 => ErrorClass::Server,
      _ => ErrorClass::Unknown,
    }
  }

  /// Classify from a payload error code. Returns `None` for codes we don't recognise.
  pub fn from_code(code: &str) -> Option<Self> {
    let code = code.trim().to_ascii_uppercase();
    let class = match code.as_str() {
      "UNAUTHORIZED" | "FORBIDDEN" | "TOKEN_EXPIRED" | "INVALID_TOKEN" => ErrorClass::Auth,
      c if c.starts_with("AUTH_") => ErrorClass::Auth,
      "VALIDATION_ERROR" | "INVALID_INPUT" | "BAD_REQUEST" => ErrorClass::Validation,
      c if c.starts_with("DUPLICATE") => ErrorClass::Conflict,
      "CONFLICT" => ErrorClass::Conflict,
      "RATE_LIMITED" | "TOO_MANY_REQUESTS" => ErrorClass::RateLimit,
      "INTERNAL_ERROR" | "SERVER_ERROR" | "SERVICE_UNAVAILABLE" => ErrorClass::Server,
      "TIMEOUT" | "REQUEST_TIMEOUT" => ErrorClass::Timeout,
      "NETWORK_ERROR" => ErrorClass::Network,
      _ => return None,
    };
    Some(class)
  }

  /// Payload code wins when it is recognised, the status code decides otherwise.
  pub fn classify(status: Option<u16>, code: Option<&str>) -> Self {
    code
      .and_then(Self::from_code)
      .or_else(|| status.map(Self::from_status))
      .unwrap_or(ErrorClass::Unknown)
  }

  pub fn as_str(self) -> &'static str {
    match self {
      ErrorClass::Auth => "AUTH",
      ErrorClass::Validation => "VALIDATION",
      ErrorClass::Conflict => "CONFLICT",
      ErrorClass::RateLimit => "RATE_LIMIT",
      ErrorClass::Server => "SERVER",
      ErrorClass::Network => "NETWORK",
      ErrorClass::Timeout => "TIMEOUT",
      ErrorClass::Unknown => "UNKNOWN",
    }
  }
}

impl fmt::Display for ErrorClass {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// A classified remote failure.
///
/// Cloneable so that every caller joined onto one coalesced fetch receives
/// the same error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{class}: {message}")]
pub struct ApiError {
  pub class: ErrorClass,
  /// Transport status, when the backend answered at all
  pub status: Option<u16>,
  /// Payload error code from the response envelope
  pub code: Option<String>,
  pub message: String,
}

impl ApiError {
  pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
    Self {
      class,
      status: None,
      code: None,
      message: message.into(),
    }
  }

  /// Build from a response status and the envelope's error payload.
  pub fn from_response(status: u16, code: Option<String>, message: impl Into<String>) -> Self {
    Self {
      class: ErrorClass::classify(Some(status), code.as_deref()),
      status: Some(status),
      code,
      message: message.into(),
    }
  }

  pub fn timeout(after: std::time::Duration) -> Self {
    Self::new(
      ErrorClass::Timeout,
      format!("request timed out after {}s", after.as_secs()),
    )
  }

  /// A pending fetch that was aborted before it settled.
  pub fn cancelled() -> Self {
    Self {
      class: ErrorClass::Unknown,
      status: None,
      code: Some("CANCELLED".to_string()),
      message: "fetch was cancelled".to_string(),
    }
  }

  pub fn is_cancelled(&self) -> bool {
    self.code.as_deref() == Some("CANCELLED")
  }

  /// Cached payload did not match the requested type.
  pub fn decode(err: serde_json::Error) -> Self {
    Self {
      class: ErrorClass::Unknown,
      status: None,
      code: Some("DECODE".to_string()),
      message: format!("failed to decode payload: {}", err),
    }
  }

  pub fn is_retryable(&self) -> bool {
    self.class.is_retryable()
  }
}

impl From<reqwest::Error> for ApiError {
  fn from(err: reqwest::Error) -> Self {
    let status = err.status().map(|s| s.as_u16());
    let class = if err.is_timeout() {
      ErrorClass::Timeout
    } else if err.is_connect() || err.is_request() {
      ErrorClass::Network
    } else if let Some(status) = status {
      ErrorClass::from_status(status)
    } else if err.is_decode() {
      ErrorClass::Unknown
    } else {
      ErrorClass::Network
    };

    Self {
      class,
      status,
      code: None,
      message: err.to_string(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_status_classification() {
    assert_eq!(ErrorClass::from_status(401), ErrorClass::Auth);
    assert_eq!(ErrorClass::from_status(403), ErrorClass::Auth);
    assert_eq!(ErrorClass::from_status(422), ErrorClass::Validation);
    assert_eq!(ErrorClass::from_status(409), ErrorClass::Conflict);
    assert_eq!(ErrorClass::from_status(429), ErrorClass::RateLimit);
    assert_eq!(ErrorClass::from_status(503), ErrorClass::Server);
    assert_eq!(ErrorClass::from_status(418), ErrorClass::Unknown);
  }

  #[test]
  fn test_payload_code_wins_over_status() {
    // A 400 carrying an expired-token code is an auth failure
    assert_eq!(
      ErrorClass::classify(Some(400), Some("TOKEN_EXPIRED")),
      ErrorClass::Auth
    );
    assert_eq!(
      ErrorClass::classify(Some(500), Some("something_odd")),
      ErrorClass::Server
    );
    assert_eq!(
      ErrorClass::classify(None, Some("duplicate_entry")),
      ErrorClass::Conflict
    );
    assert_eq!(ErrorClass::classify(None, None), ErrorClass::Unknown);
  }

  #[test]
  fn test_retryability() {
    for class in [
      ErrorClass::Network,
      ErrorClass::Timeout,
      ErrorClass::Server,
      ErrorClass::RateLimit,
    ] {
      assert!(class.is_retryable(), "{class} should retry");
    }
    for class in [
      ErrorClass::Auth,
      ErrorClass::Validation,
      ErrorClass::Conflict,
      ErrorClass::Unknown,
    ] {
      assert!(!class.is_retryable(), "{class} should not retry");
    }
  }

  #[test]
  fn test_display_includes_class() {
    let err = ApiError::from_response(503, None, "maintenance");
    assert_eq!(err.to_string(), "SERVER: maintenance");
    assert_eq!(err.status, Some(503));
  }
}
