//! Bulk invalidation, eviction and diagnostics across the whole cache.

use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use regex::Regex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::entry::{CacheEvent, QueryStatus};
use super::manager::{InvalidateFilter, QueryCache};

/// Pattern matched against the JSON text of each cache key.
#[derive(Debug, Clone)]
pub enum KeyPattern {
  Substring(String),
  Regex(Regex),
}

impl KeyPattern {
  pub fn regex(pattern: &str) -> Result<Self, regex::Error> {
    Regex::new(pattern).map(KeyPattern::Regex)
  }

  pub fn is_match(&self, serialized_key: &str) -> bool {
    match self {
      KeyPattern::Substring(s) => serialized_key.contains(s.as_str()),
      KeyPattern::Regex(re) => re.is_match(serialized_key),
    }
  }
}

impl From<&str> for KeyPattern {
  fn from(s: &str) -> Self {
    KeyPattern::Substring(s.to_string())
  }
}

impl From<String> for KeyPattern {
  fn from(s: String) -> Self {
    KeyPattern::Substring(s)
  }
}

impl From<Regex> for KeyPattern {
  fn from(re: Regex) -> Self {
    KeyPattern::Regex(re)
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizeReport {
  pub total_queries: usize,
  pub removed_queries: usize,
  pub active_queries: usize,
}

/// Diagnostic counts. Not meant for correctness decisions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheMetrics {
  pub total: usize,
  pub idle: usize,
  pub pending: usize,
  pub success: usize,
  pub error: usize,
  pub stale: usize,
  /// Entries with at least one observer
  pub active: usize,
  /// Sum of the serialized payload lengths
  pub approx_size_bytes: usize,
}

impl QueryCache {
  /// Invalidate every entry whose serialized key matches. Returns the count.
  pub fn invalidate_by_pattern(&self, pattern: impl Into<KeyPattern>) -> usize {
    let pattern = pattern.into();
    let count = self.invalidate(InvalidateFilter::predicate(move |key| {
      pattern.is_match(&key.serialized())
    }));
    debug!(count, "invalidated by pattern");
    count
  }

  /// Evict unobserved entries older than the configured threshold.
  pub fn optimize_cache(&self) -> OptimizeReport {
    self.optimize_cache_older_than(self.config().eviction_threshold)
  }

  /// Evict entries with no observers and no pending fetch whose last update
  /// (or creation, if never updated) is older than `threshold`.
  pub fn optimize_cache_older_than(&self, threshold: Duration) -> OptimizeReport {
    let now = Utc::now();
    let (report, removed) = {
      let mut slots = self.slots();
      let total_queries = slots.len();
      let mut removed = Vec::new();

      slots.retain(|_, slot| {
        let age = now - slot.last_updated_at.unwrap_or(slot.created_at);
        let cold = slot.observer_count == 0 && !slot.is_pending() && age > threshold;
        if cold {
          removed.push(slot.key.clone());
        }
        !cold
      });

      let active_queries = slots.values().filter(|s| s.observer_count > 0).count();
      let report = OptimizeReport {
        total_queries,
        removed_queries: removed.len(),
        active_queries,
      };
      (report, removed)
    };

    for key in removed {
      self.emit(CacheEvent::Removed(key));
    }
    if report.removed_queries > 0 {
      info!(
        removed = report.removed_queries,
        total = report.total_queries,
        "evicted cold cache entries"
      );
    }
    report
  }

  pub fn cache_metrics(&self) -> CacheMetrics {
    let now = Utc::now();
    let slots = self.slots();
    let mut metrics = CacheMetrics {
      total: slots.len(),
      ..Default::default()
    };

    for slot in slots.values() {
      match slot.status {
        QueryStatus::Idle => metrics.idle += 1,
        QueryStatus::Pending => metrics.pending += 1,
        QueryStatus::Success => metrics.success += 1,
        QueryStatus::Error => metrics.error += 1,
      }
      if slot.is_stale(now) {
        metrics.stale += 1;
      }
      if slot.observer_count > 0 {
        metrics.active += 1;
      }
      if let Some(data) = &slot.data {
        metrics.approx_size_bytes += data.to_string().len();
      }
    }
    metrics
  }

  /// Run `optimize_cache` every `period` until the handle is aborted.
  pub fn spawn_gc(&self, period: StdDuration) -> JoinHandle<()> {
    let cache = self.clone();
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
      loop {
        ticker.tick().await;
        cache.optimize_cache();
      }
    })
  }
}
