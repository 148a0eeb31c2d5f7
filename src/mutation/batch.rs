//! Bounded-concurrency execution of many queued writes.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use futures::future::{join_all, FutureExt};
use serde::Serialize;
use tracing::{debug, info};

use super::pipeline::MutationFn;
use crate::api::ApiError;
use crate::cache::{InvalidateFilter, QueryCache};

pub const DEFAULT_CONCURRENCY: usize = 5;

/// Failure of one queued item, with its position in the drained queue.
#[derive(Debug, Clone)]
pub struct BatchItemError {
  pub index: usize,
  pub error: ApiError,
}

#[derive(Debug)]
pub struct BatchResult<R> {
  pub results: Vec<R>,
  pub errors: Vec<BatchItemError>,
}

impl<R> BatchResult<R> {
  pub fn summary(&self) -> BatchSummary {
    BatchSummary {
      results_count: self.results.len(),
      errors_count: self.errors.len(),
    }
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSummary {
  pub results_count: usize,
  pub errors_count: usize,
}

/// Queues mutation inputs and runs them in fixed-size concurrent chunks.
///
/// Chunks run one after another; the items of one chunk run concurrently.
/// A failing item never cancels its siblings.
pub struct BatchRunner<V, R> {
  cache: QueryCache,
  mutation_fn: MutationFn<V, R>,
  concurrency: usize,
  queue: Mutex<Vec<V>>,
  last_summary: Mutex<Option<BatchSummary>>,
}

impl<V, R> BatchRunner<V, R>
where
  V: Send + 'static,
  R: Send + 'static,
{
  pub fn new<F, Fut>(cache: QueryCache, mutation_fn: F) -> Self
  where
    F: Fn(V) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, ApiError>> + Send + 'static,
  {
    Self {
      cache,
      mutation_fn: Arc::new(move |vars| mutation_fn(vars).boxed()),
      concurrency: DEFAULT_CONCURRENCY,
      queue: Mutex::new(Vec::new()),
      last_summary: Mutex::new(None),
    }
  }

  /// Items per chunk. Zero is treated as one.
  pub fn with_concurrency(mut self, concurrency: usize) -> Self {
    self.concurrency = concurrency.max(1);
    self
  }

  pub fn add_to_batch(&self, item: V) {
    self
      .queue
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .push(item);
  }

  pub fn pending(&self) -> usize {
    self.queue.lock().unwrap_or_else(PoisonError::into_inner).len()
  }

  pub fn last_summary(&self) -> Option<BatchSummary> {
    *self
      .last_summary
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
  }

  /// Drop queued items and the previous summary without running anything.
  pub fn clear_batch(&self) {
    self.queue.lock().unwrap_or_else(PoisonError::into_inner).clear();
    *self
      .last_summary
      .lock()
      .unwrap_or_else(PoisonError::into_inner) = None;
  }

  /// Drain the queue once and run every item.
  pub async fn process_batch(&self) -> BatchResult<R> {
    let items = std::mem::take(&mut *self.queue.lock().unwrap_or_else(PoisonError::into_inner));
    let total = items.len();

    let mut result = BatchResult {
      results: Vec::with_capacity(total),
      errors: Vec::new(),
    };

    let mut items = items.into_iter().enumerate().peekable();
    let mut chunk_no = 0;
    while items.peek().is_some() {
      let chunk: Vec<(usize, V)> = items.by_ref().take(self.concurrency).collect();
      debug!(chunk = chunk_no, size = chunk.len(), "running batch chunk");

      let outcomes = join_all(chunk.into_iter().map(|(index, item)| {
        let caller = self.cache.caller().clone();
        let fut = (self.mutation_fn)(item);
        async move { (index, caller.call(fut).await) }
      }))
      .await;

      for (index, outcome) in outcomes {
        match outcome {
          Ok(value) => result.results.push(value),
          Err(error) => result.errors.push(BatchItemError { index, error }),
        }
      }
      chunk_no += 1;
    }

    let summary = result.summary();
    info!(
      total,
      results = summary.results_count,
      errors = summary.errors_count,
      "batch processed"
    );
    *self
      .last_summary
      .lock()
      .unwrap_or_else(PoisonError::into_inner) = Some(summary);

    self.cache.invalidate(InvalidateFilter::All);
    result
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::api::ErrorClass;
  use crate::cache::CacheKey;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::time::Duration;

  #[tokio::test]
  async fn test_one_failure_does_not_sink_the_batch() {
    let cache = QueryCache::default();
    let runner = BatchRunner::new(cache, |n: u32| async move {
      if n == 2 {
        Err(ApiError::new(ErrorClass::Validation, "bad item"))
      } else {
        Ok(n * 10)
      }
    });

    runner.add_to_batch(1);
    runner.add_to_batch(2);
    assert_eq!(runner.pending(), 2);

    let result = runner.process_batch().await;
    assert_eq!(result.results, vec![10]);
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].index, 1);
    assert_eq!(runner.pending(), 0);
    assert_eq!(
      runner.last_summary(),
      Some(BatchSummary {
        results_count: 1,
        errors_count: 1
      })
    );
  }

  #[tokio::test]
  async fn test_concurrency_is_bounded_and_chunks_are_sequential() {
    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let order = Arc::new(Mutex::new(Vec::new()));

    let runner = {
      let in_flight = in_flight.clone();
      let peak = peak.clone();
      let order = order.clone();
      BatchRunner::new(QueryCache::default(), move |n: usize| {
        let in_flight = in_flight.clone();
        let peak = peak.clone();
        let order = order.clone();
        async move {
          let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
          peak.fetch_max(now, Ordering::SeqCst);
          // Later items in a chunk finish first
          tokio::time::sleep(Duration::from_millis(20 - (n % 3) as u64 * 5)).await;
          order.lock().unwrap().push(n);
          in_flight.fetch_sub(1, Ordering::SeqCst);
          Ok::<_, ApiError>(n)
        }
      })
      .with_concurrency(3)
    };

    for n in 0..7 {
      runner.add_to_batch(n);
    }
    let result = runner.process_batch().await;

    assert_eq!(result.results.len(), 7);
    assert_eq!(peak.load(Ordering::SeqCst), 3);

    // Every item of chunk N settles before any item of chunk N+1
    let order = order.lock().unwrap().clone();
    let chunk_of = |n: &usize| n / 3;
    assert!(order.windows(2).all(|w| chunk_of(&w[0]) <= chunk_of(&w[1])));
  }

  #[tokio::test]
  async fn test_batch_invalidates_everything_afterwards() {
    let cache = QueryCache::default();
    cache.set_data(&CacheKey::from(["a"]), &1).unwrap();
    cache.set_data(&CacheKey::from(["b"]), &2).unwrap();

    let runner = BatchRunner::new(cache.clone(), |n: u32| async move { Ok::<_, ApiError>(n) });
    runner.add_to_batch(1);
    runner.process_batch().await;

    assert!(cache.entry(&CacheKey::from(["a"])).unwrap().is_stale);
    assert!(cache.entry(&CacheKey::from(["b"])).unwrap().is_stale);
  }

  #[tokio::test]
  async fn test_clear_batch_drops_items_unexecuted() {
    let calls = Arc::new(AtomicUsize::new(0));
    let runner = {
      let calls = calls.clone();
      BatchRunner::new(QueryCache::default(), move |n: u32| {
        calls.fetch_add(1, Ordering::SeqCst);
        async move { Ok::<_, ApiError>(n) }
      })
    };

    runner.add_to_batch(1);
    runner.process_batch().await;
    runner.add_to_batch(2);
    runner.add_to_batch(3);
    runner.clear_batch();

    assert_eq!(runner.pending(), 0);
    assert_eq!(runner.last_summary(), None);
    let result = runner.process_batch().await;
    assert!(result.results.is_empty());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }
}
