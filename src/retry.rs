//! Exponential backoff shared by background fetches and channel reconnects.

use std::time::Duration;

use crate::api::ErrorClass;

/// Retry policy parameterized by error class.
///
/// Delays grow as `base * multiplier^attempt`, capped at `max_delay`. The
/// number of extra attempts a failure earns depends on its class.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
  pub base: Duration,
  pub multiplier: u32,
  pub max_delay: Duration,
  /// Extra attempts for server, network and timeout failures
  pub transient_retries: u32,
  /// Extra attempts for rate-limited requests
  pub rate_limit_retries: u32,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      base: Duration::from_millis(1000),
      multiplier: 2,
      max_delay: Duration::from_millis(30_000),
      transient_retries: 3,
      rate_limit_retries: 2,
    }
  }
}

impl RetryPolicy {
  /// Retries allowed after the first failure of this class.
  pub fn max_retries(&self, class: ErrorClass) -> u32 {
    match class {
      ErrorClass::Server | ErrorClass::Network | ErrorClass::Timeout => self.transient_retries,
      ErrorClass::RateLimit => self.rate_limit_retries,
      _ => 0,
    }
  }

  /// Delay before retry number `attempt` (zero-based) from an explicit base.
  pub fn backoff_from(&self, base: Duration, attempt: u32) -> Duration {
    let factor = self.multiplier.checked_pow(attempt).unwrap_or(u32::MAX);
    base
      .checked_mul(factor)
      .unwrap_or(self.max_delay)
      .min(self.max_delay)
  }

  /// Delay before retry number `attempt` using the policy's own base.
  pub fn backoff(&self, attempt: u32) -> Duration {
    self.backoff_from(self.base, attempt)
  }

  /// The delay to wait before retrying, or `None` once the class has no
  /// attempts left (or never retries at all).
  pub fn next_delay(&self, class: ErrorClass, attempt: u32) -> Option<Duration> {
    (attempt < self.max_retries(class)).then(|| self.backoff(attempt))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_backoff_doubles_and_caps() {
    let policy = RetryPolicy::default();
    assert_eq!(policy.backoff(0), Duration::from_millis(1000));
    assert_eq!(policy.backoff(1), Duration::from_millis(2000));
    assert_eq!(policy.backoff(2), Duration::from_millis(4000));
    assert_eq!(policy.backoff(5), Duration::from_millis(30_000));
    assert_eq!(policy.backoff(64), Duration::from_millis(30_000));
  }

  #[test]
  fn test_backoff_from_server_base() {
    let policy = RetryPolicy::default();
    let base = Duration::from_millis(2000);
    assert_eq!(policy.backoff_from(base, 0), Duration::from_millis(2000));
    assert_eq!(policy.backoff_from(base, 3), Duration::from_millis(16_000));
    assert_eq!(policy.backoff_from(base, 4), Duration::from_millis(30_000));
  }

  #[test]
  fn test_retry_budget_by_class() {
    let policy = RetryPolicy::default();
    assert!(policy.next_delay(ErrorClass::Server, 2).is_some());
    assert!(policy.next_delay(ErrorClass::Server, 3).is_none());
    assert!(policy.next_delay(ErrorClass::RateLimit, 1).is_some());
    assert!(policy.next_delay(ErrorClass::RateLimit, 2).is_none());
    assert!(policy.next_delay(ErrorClass::Auth, 0).is_none());
    assert!(policy.next_delay(ErrorClass::Unknown, 0).is_none());
  }
}
