//! Remote call wrapper: overall deadline plus the user-signal policy.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, warn};

use super::error::{ApiError, ErrorClass};

/// Default overall deadline for a remote call.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Receiver of user-visible failure signals (the toast equivalent).
pub trait ErrorReporter: Send + Sync {
  /// A failure the user should see.
  fn report(&self, error: &ApiError);

  /// The session is no longer valid. The surrounding app re-authenticates.
  fn session_expired(&self, _error: &ApiError) {}
}

/// Reporter that writes signals to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl ErrorReporter for TracingReporter {
  fn report(&self, err: &ApiError) {
    match err.class {
      ErrorClass::Server | ErrorClass::Unknown => {
        error!(class = %err.class, status = ?err.status, "{}", err.message)
      }
      _ => warn!(class = %err.class, status = ?err.status, "{}", err.message),
    }
  }

  fn session_expired(&self, err: &ApiError) {
    warn!(status = ?err.status, "session expired: {}", err.message);
  }
}

/// Wraps remote operations with a deadline and decides which failures are
/// signalled to the user.
#[derive(Clone)]
pub struct RemoteCaller {
  reporter: Arc<dyn ErrorReporter>,
  timeout: Duration,
}

impl Default for RemoteCaller {
  fn default() -> Self {
    Self::new(Arc::new(TracingReporter))
  }
}

impl RemoteCaller {
  pub fn new(reporter: Arc<dyn ErrorReporter>) -> Self {
    Self {
      reporter,
      timeout: DEFAULT_TIMEOUT,
    }
  }

  pub fn with_timeout(mut self, timeout: Duration) -> Self {
    self.timeout = timeout;
    self
  }

  pub fn timeout(&self) -> Duration {
    self.timeout
  }

  /// Run the operation under the deadline and surface any failure.
  pub async fn call<T, Fut>(&self, op: Fut) -> Result<T, ApiError>
  where
    Fut: Future<Output = Result<T, ApiError>>,
  {
    let result = self.call_quiet(op).await;
    if let Err(err) = &result {
      self.surface(err);
    }
    result
  }

  /// Run the operation under the deadline without signalling failures.
  ///
  /// Used by callers that surface once after their own retries.
  pub async fn call_quiet<T, Fut>(&self, op: Fut) -> Result<T, ApiError>
  where
    Fut: Future<Output = Result<T, ApiError>>,
  {
    match tokio::time::timeout(self.timeout, op).await {
      Ok(result) => result,
      Err(_) => Err(ApiError::timeout(self.timeout)),
    }
  }

  /// Apply the signal policy to a settled failure.
  pub fn surface(&self, err: &ApiError) {
    if err.is_cancelled() {
      return;
    }
    match err.class {
      ErrorClass::Auth => self.reporter.session_expired(err),
      class if class.is_locally_handled() => {
        debug!(class = %class, "left to caller: {}", err.message)
      }
      _ => self.reporter.report(err),
    }
  }
}
