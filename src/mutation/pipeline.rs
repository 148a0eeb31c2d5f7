//! Remote writes with optimistic cache updates and rollback.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use futures::future::{BoxFuture, FutureExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use super::context::MutationContext;
use crate::api::ApiError;
use crate::cache::{CacheKey, InvalidateFilter, QueryCache};

/// The remote write itself.
pub type MutationFn<V, R> = Arc<dyn Fn(V) -> BoxFuture<'static, Result<R, ApiError>> + Send + Sync>;

type ApplyFn<V> =
  Arc<dyn Fn(Option<&Value>, &V) -> Result<Option<Value>, ApiError> + Send + Sync>;

/// Optimistic change to one cache key, computed from the key's prior data
/// and the mutation variables only.
pub struct OptimisticUpdate<V> {
  key: CacheKey,
  apply: ApplyFn<V>,
}

impl<V: 'static> OptimisticUpdate<V> {
  /// `update` returns the optimistic value, or `None` to leave the key as is.
  pub fn new<T, F>(key: CacheKey, update: F) -> Self
  where
    T: Serialize + DeserializeOwned + 'static,
    F: Fn(Option<T>, &V) -> Option<T> + Send + Sync + 'static,
  {
    let apply = move |previous: Option<&Value>, vars: &V| -> Result<Option<Value>, ApiError> {
      let previous = previous
        .cloned()
        .map(serde_json::from_value::<T>)
        .transpose()
        .map_err(ApiError::decode)?;
      update(previous, vars)
        .map(|next| serde_json::to_value(next).map_err(ApiError::decode))
        .transpose()
    };

    Self {
      key,
      apply: Arc::new(apply),
    }
  }

  pub fn key(&self) -> &CacheKey {
    &self.key
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationStatus {
  Idle,
  Pending,
  Success,
  Error,
}

/// A remote write bound to a cache.
///
/// Each `mutate` call: cancels pending fetches of the optimistically updated
/// keys, snapshots them, applies the optimistic values in one write, runs
/// the remote call, then either invalidates the affected keys or restores
/// the snapshots.
pub struct Mutation<V, R> {
  cache: QueryCache,
  mutation_fn: MutationFn<V, R>,
  optimistic: Vec<OptimisticUpdate<V>>,
  related: Vec<InvalidateFilter>,
  silent: bool,
  status: Mutex<MutationStatus>,
}

impl<V, R> Mutation<V, R>
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
      optimistic: Vec::new(),
      related: Vec::new(),
      silent: false,
      status: Mutex::new(MutationStatus::Idle),
    }
  }

  /// Mutation over several related keys, each with its own optimistic
  /// update. A failure restores the full set.
  pub fn synchronized<F, Fut>(
    cache: QueryCache,
    mutation_fn: F,
    updates: Vec<OptimisticUpdate<V>>,
  ) -> Self
  where
    F: Fn(V) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, ApiError>> + Send + 'static,
  {
    let mut mutation = Self::new(cache, mutation_fn);
    mutation.optimistic = updates;
    mutation
  }

  pub fn optimistic(mut self, update: OptimisticUpdate<V>) -> Self {
    self.optimistic.push(update);
    self
  }

  /// Also invalidate these entries after a successful write.
  pub fn invalidates(mut self, filter: impl Into<InvalidateFilter>) -> Self {
    self.related.push(filter.into());
    self
  }

  /// Do not surface failures; the caller handles them.
  pub fn silent(mut self) -> Self {
    self.silent = true;
    self
  }

  pub fn status(&self) -> MutationStatus {
    *self.status.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn set_status(&self, status: MutationStatus) {
    *self.status.lock().unwrap_or_else(PoisonError::into_inner) = status;
  }

  fn optimistic_keys(&self) -> Vec<CacheKey> {
    let mut keys: Vec<CacheKey> = Vec::with_capacity(self.optimistic.len());
    for update in &self.optimistic {
      if !keys.contains(&update.key) {
        keys.push(update.key.clone());
      }
    }
    keys
  }

  pub async fn mutate(&self, vars: V) -> Result<R, ApiError> {
    self.set_status(MutationStatus::Pending);

    let keys = self.optimistic_keys();
    let interrupted: Vec<CacheKey> = keys
      .iter()
      .filter(|key| self.cache.cancel(key))
      .cloned()
      .collect();

    let context = MutationContext::capture(&self.cache, &keys, &interrupted);
    if let Err(err) = self.apply_optimistic(&context, &vars) {
      self.set_status(MutationStatus::Error);
      return Err(err);
    }

    let result = self
      .cache
      .caller()
      .call_quiet((self.mutation_fn)(vars))
      .await;

    match result {
      Ok(data) => {
        context.commit();
        for key in &keys {
          self.cache.invalidate(key);
        }
        for filter in &self.related {
          self.cache.invalidate(filter.clone());
        }
        self.set_status(MutationStatus::Success);
        Ok(data)
      }
      Err(err) => {
        debug!(keys = context.len(), class = %err.class, "mutation failed, rolling back");
        context.rollback(&self.cache);
        if !self.silent {
          self.cache.caller().surface(&err);
        }
        self.set_status(MutationStatus::Error);
        Err(err)
      }
    }
  }

  /// Evaluate every update against the snapshot, then write them together.
  fn apply_optimistic(&self, context: &MutationContext, vars: &V) -> Result<(), ApiError> {
    let mut writes = Vec::with_capacity(self.optimistic.len());
    for update in &self.optimistic {
      if let Some(next) = (update.apply)(context.previous(&update.key), vars)? {
        writes.push((update.key.clone(), next));
      }
    }
    if !writes.is_empty() {
      self.cache.write_all(writes);
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::api::testing::RecordingReporter;
  use crate::api::{ErrorClass, RemoteCaller};
  use crate::cache::{CacheConfig, QueryStatus, ReadOptions};
  use std::time::Duration;
  use tokio::sync::oneshot;

  fn list_key() -> CacheKey {
    CacheKey::from(["todos", "list"])
  }

  fn count_key() -> CacheKey {
    CacheKey::from(["todos", "count"])
  }

  fn seeded() -> QueryCache {
    let cache = QueryCache::default();
    cache.set_data(&list_key(), &vec!["a".to_string(), "b".to_string()]).unwrap();
    cache.set_data(&count_key(), &2u32).unwrap();
    cache
  }

  fn add_item_updates() -> Vec<OptimisticUpdate<String>> {
    vec![
      OptimisticUpdate::new(list_key(), |prev: Option<Vec<String>>, item: &String| {
        let mut list = prev.unwrap_or_default();
        list.push(item.clone());
        Some(list)
      }),
      OptimisticUpdate::new(count_key(), |prev: Option<u32>, _: &String| {
        Some(prev.unwrap_or(0) + 1)
      }),
    ]
  }

  #[tokio::test]
  async fn test_failed_synchronized_mutation_restores_both_keys_exactly() {
    let cache = seeded();
    let list_before = cache.entry(&list_key()).unwrap();
    let count_before = cache.entry(&count_key()).unwrap();

    let mutation = Mutation::synchronized(
      cache.clone(),
      |_item: String| async { Err::<(), _>(ApiError::from_response(500, None, "down")) },
      add_item_updates(),
    );

    let err = mutation.mutate("c".to_string()).await.unwrap_err();
    assert_eq!(err.class, ErrorClass::Server);
    assert_eq!(mutation.status(), MutationStatus::Error);

    let list_after = cache.entry(&list_key()).unwrap();
    let count_after = cache.entry(&count_key()).unwrap();
    assert_eq!(list_after.data, list_before.data);
    assert_eq!(count_after.data, count_before.data);
    assert_eq!(list_after.last_updated_at, list_before.last_updated_at);
    assert_eq!(list_after.status, QueryStatus::Success);
  }

  #[tokio::test]
  async fn test_optimistic_value_visible_before_call_resolves() {
    let cache = seeded();
    let (tx, rx) = oneshot::channel::<Result<(), ApiError>>();
    let rx = Arc::new(Mutex::new(Some(rx)));

    let mutation = Arc::new(Mutation::synchronized(
      cache.clone(),
      move |_item: String| {
        let rx = rx.lock().unwrap().take();
        async move {
          match rx {
            Some(rx) => rx.await.unwrap_or(Ok(())),
            None => Ok(()),
          }
        }
      },
      add_item_updates(),
    ));

    let task = {
      let mutation = mutation.clone();
      tokio::spawn(async move { mutation.mutate("c".to_string()).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(mutation.status(), MutationStatus::Pending);
    assert_eq!(
      cache.get_data::<Vec<String>>(&list_key()).unwrap(),
      vec!["a", "b", "c"]
    );
    assert_eq!(cache.get_data::<u32>(&count_key()), Some(3));

    tx.send(Err(ApiError::new(ErrorClass::Network, "offline"))).unwrap();
    assert!(task.await.unwrap().is_err());

    assert_eq!(
      cache.get_data::<Vec<String>>(&list_key()).unwrap(),
      vec!["a", "b"]
    );
    assert_eq!(cache.get_data::<u32>(&count_key()), Some(2));
  }

  #[tokio::test]
  async fn test_success_keeps_optimistic_value_and_invalidates() {
    let cache = seeded();
    cache.set_data(&CacheKey::from(["todos", "stats"]), &0u32).unwrap();

    let mutation = Mutation::synchronized(
      cache.clone(),
      |_item: String| async { Ok::<_, ApiError>(()) },
      add_item_updates(),
    )
    .invalidates(CacheKey::from(["todos", "stats"]));

    mutation.mutate("c".to_string()).await.unwrap();
    assert_eq!(mutation.status(), MutationStatus::Success);

    assert_eq!(cache.get_data::<u32>(&count_key()), Some(3));
    assert!(cache.entry(&count_key()).unwrap().is_stale);
    assert!(cache.entry(&list_key()).unwrap().is_stale);
    assert!(cache.entry(&CacheKey::from(["todos", "stats"])).unwrap().is_stale);
  }

  #[tokio::test]
  async fn test_pending_fetch_cannot_clobber_optimistic_value() {
    let cache = seeded();
    cache.invalidate(&count_key());

    // Slow refetch that would return an outdated count
    let snapshot = cache
      .read::<u32, _, _>(
        &count_key(),
        || async {
          tokio::time::sleep(Duration::from_millis(30)).await;
          Ok(100u32)
        },
        ReadOptions::default(),
      )
      .unwrap();
    assert!(snapshot.is_fetching());

    let mutation = Mutation::new(cache.clone(), |_: String| async { Ok::<_, ApiError>(()) })
      .optimistic(OptimisticUpdate::new(count_key(), |prev: Option<u32>, _: &String| {
        Some(prev.unwrap_or(0) + 1)
      }));
    mutation.mutate("c".to_string()).await.unwrap();

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(cache.get_data::<u32>(&count_key()), Some(3));
  }

  #[tokio::test]
  async fn test_rollback_keeps_invalidated_entry_stale() {
    let cache = QueryCache::default();
    let key = CacheKey::from(["stock", "level"]);
    cache.set_data(&key, &2u32).unwrap();
    cache.invalidate(&key);

    let mutation = Mutation::new(cache.clone(), |_: u32| async {
      Err::<(), _>(ApiError::new(ErrorClass::Network, "offline"))
    })
    .optimistic(OptimisticUpdate::new(key.clone(), |prev: Option<u32>, n: &u32| {
      Some(prev.unwrap_or(0) + n)
    }));

    assert!(mutation.mutate(1).await.is_err());
    let entry = cache.entry(&key).unwrap();
    assert_eq!(entry.data, Some(serde_json::json!(2)));
    assert!(entry.is_stale);
  }

  #[tokio::test]
  async fn test_rollback_restarts_cancelled_fetch() {
    let cache = seeded();
    cache.invalidate(&count_key());
    let snapshot = cache
      .read::<u32, _, _>(
        &count_key(),
        || async {
          tokio::time::sleep(Duration::from_millis(30)).await;
          Ok(7u32)
        },
        ReadOptions::default(),
      )
      .unwrap();
    assert!(snapshot.is_fetching());

    let mutation = Mutation::new(cache.clone(), |_: String| async {
      Err::<(), _>(ApiError::new(ErrorClass::Network, "offline"))
    })
    .optimistic(OptimisticUpdate::new(count_key(), |prev: Option<u32>, _: &String| {
      Some(prev.unwrap_or(0) + 1)
    }));
    assert!(mutation.mutate("c".to_string()).await.is_err());

    let entry = cache.entry(&count_key()).unwrap();
    assert_eq!(entry.data, Some(serde_json::json!(2)));
    assert_eq!(entry.status, QueryStatus::Pending);

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(cache.get_data::<u32>(&count_key()), Some(7));
    assert!(!cache.entry(&count_key()).unwrap().is_stale);
  }

  #[tokio::test]
  async fn test_rollback_of_key_that_did_not_exist() {
    let cache = QueryCache::default();
    let key = CacheKey::from(["fresh"]);

    let mutation = Mutation::new(cache.clone(), |_: u32| async {
      Err::<(), _>(ApiError::new(ErrorClass::Conflict, "taken"))
    })
    .optimistic(OptimisticUpdate::new(key.clone(), |_: Option<u32>, v: &u32| Some(*v)));

    assert!(mutation.mutate(5).await.is_err());
    assert!(cache.entry(&key).is_none());
  }

  #[tokio::test]
  async fn test_silent_mutation_does_not_surface() {
    let reporter = Arc::new(RecordingReporter::default());
    let cache = QueryCache::new(CacheConfig::default(), RemoteCaller::new(reporter.clone()));
    let failing = |_: u32| async { Err::<(), _>(ApiError::from_response(503, None, "busy")) };

    let loud = Mutation::new(cache.clone(), failing);
    let quiet = Mutation::new(cache.clone(), failing).silent();

    let _ = quiet.mutate(1).await;
    assert!(reporter.reported_classes().is_empty());

    let _ = loud.mutate(1).await;
    assert_eq!(reporter.reported_classes(), vec![ErrorClass::Server]);
  }
}
