//! The `{ success, data?, error? }` response envelope used by every endpoint.

use serde::Deserialize;

use super::error::ApiError;

#[derive(Debug, Clone, Deserialize)]
pub struct ErrorBody {
  #[serde(default)]
  pub code: Option<String>,
  #[serde(default)]
  pub message: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Envelope<T> {
  pub success: bool,
  pub data: Option<T>,
  #[serde(default)]
  pub error: Option<ErrorBody>,
}

impl<T> Envelope<T> {
  /// Unwrap the envelope into its payload, classifying failures.
  ///
  /// `status` is the transport status the envelope arrived with. A 2xx
  /// envelope that reports `success: false` is still a failure.
  pub fn into_data(self, status: u16) -> Result<Option<T>, ApiError> {
    let ok_status = (200..300).contains(&status);
    if self.success && ok_status {
      return Ok(self.data);
    }

    let (code, message) = match self.error {
      Some(body) => (
        body.code,
        body.message.unwrap_or_else(|| format!("request failed ({})", status)),
      ),
      None => (None, format!("request failed ({})", status)),
    };

    Err(ApiError::from_response(status, code, message))
  }
}
