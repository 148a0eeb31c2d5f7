//! In-memory query cache with request de-duplication and background refetch.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Duration, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use super::entry::{encode, CacheEntry, CacheEvent, QuerySnapshot, QueryStatus, ReadOptions};
use super::key::CacheKey;
use crate::api::{ApiError, ErrorClass, RemoteCaller};
use crate::config::CacheSettings;
use crate::retry::RetryPolicy;

/// Type-erased fetcher remembered per key so invalidation can refetch.
pub(crate) type ErasedFetcher =
  Arc<dyn Fn() -> BoxFuture<'static, Result<Value, ApiError>> + Send + Sync>;

type SharedFetch = Shared<BoxFuture<'static, Result<Value, ApiError>>>;

#[derive(Debug, Clone)]
pub struct CacheConfig {
  /// How long before cached data is considered stale
  pub stale_time: Duration,
  /// How long an unobserved entry survives `optimize_cache`
  pub eviction_threshold: Duration,
  pub retry: RetryPolicy,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      stale_time: Duration::minutes(5),
      eviction_threshold: Duration::minutes(30),
      retry: RetryPolicy::default(),
    }
  }
}

impl From<&CacheSettings> for CacheConfig {
  fn from(settings: &CacheSettings) -> Self {
    Self {
      stale_time: Duration::minutes(settings.stale_minutes),
      eviction_threshold: Duration::minutes(settings.eviction_minutes),
      retry: RetryPolicy::default(),
    }
  }
}

/// Which entries an invalidation applies to.
#[derive(Clone)]
pub enum InvalidateFilter {
  All,
  /// Exactly this key
  Key(CacheKey),
  /// Every key whose leading parts equal this one
  Prefix(CacheKey),
  Predicate(Arc<dyn Fn(&CacheKey) -> bool + Send + Sync>),
}

impl InvalidateFilter {
  pub fn predicate<F>(f: F) -> Self
  where
    F: Fn(&CacheKey) -> bool + Send + Sync + 'static,
  {
    InvalidateFilter::Predicate(Arc::new(f))
  }

  pub fn matches(&self, key: &CacheKey) -> bool {
    match self {
      InvalidateFilter::All => true,
      InvalidateFilter::Key(k) => k == key,
      InvalidateFilter::Prefix(prefix) => key.starts_with(prefix),
      InvalidateFilter::Predicate(f) => f(key),
    }
  }
}

impl From<CacheKey> for InvalidateFilter {
  fn from(key: CacheKey) -> Self {
    InvalidateFilter::Key(key)
  }
}

impl From<&CacheKey> for InvalidateFilter {
  fn from(key: &CacheKey) -> Self {
    InvalidateFilter::Key(key.clone())
  }
}

struct InFlight {
  generation: u64,
  future: SharedFetch,
  abort: AbortHandle,
  /// Status to return to if the fetch is cancelled
  previous_status: QueryStatus,
}

pub(super) struct Slot {
  pub(super) key: CacheKey,
  pub(super) data: Option<Value>,
  pub(super) status: QueryStatus,
  pub(super) error: Option<ApiError>,
  pub(super) created_at: DateTime<Utc>,
  pub(super) last_updated_at: Option<DateTime<Utc>>,
  pub(super) observer_count: usize,
  pub(super) invalidated: bool,
  stale_time: Duration,
  fetcher: Option<ErasedFetcher>,
  inflight: Option<InFlight>,
}

impl Slot {
  fn new(key: CacheKey, stale_time: Duration) -> Self {
    Self {
      key,
      data: None,
      status: QueryStatus::Idle,
      error: None,
      created_at: Utc::now(),
      last_updated_at: None,
      observer_count: 0,
      invalidated: false,
      stale_time,
      fetcher: None,
      inflight: None,
    }
  }

  pub(super) fn is_stale(&self, now: DateTime<Utc>) -> bool {
    if self.invalidated {
      return true;
    }
    match self.last_updated_at {
      Some(updated) => now - updated > self.stale_time,
      None => true,
    }
  }

  pub(super) fn is_pending(&self) -> bool {
    self.inflight.is_some()
  }

  /// Replace the payload with a value that is now current.
  fn write(&mut self, data: Value, now: DateTime<Utc>) {
    self.data = Some(data);
    self.status = if self.is_pending() {
      QueryStatus::Pending
    } else {
      QueryStatus::Success
    };
    self.error = None;
    self.last_updated_at = Some(now);
    self.invalidated = false;
  }

  fn snapshot(&self, now: DateTime<Utc>) -> CacheEntry {
    CacheEntry {
      key: self.key.clone(),
      data: self.data.clone(),
      status: self.status,
      error: self.error.clone(),
      last_updated_at: self.last_updated_at,
      observer_count: self.observer_count,
      is_stale: self.is_stale(now),
    }
  }
}

/// Copy of one entry taken before an optimistic write.
#[derive(Debug, Clone)]
pub(crate) struct SlotSnapshot {
  pub(crate) key: CacheKey,
  pub(crate) data: Option<Value>,
  status: QueryStatus,
  error: Option<ApiError>,
  last_updated_at: Option<DateTime<Utc>>,
  invalidated: bool,
  /// A fetch was in flight and got cancelled to make room for the write
  interrupted: bool,
  existed: bool,
}

struct Inner {
  slots: Mutex<HashMap<String, Slot>>,
  config: CacheConfig,
  caller: RemoteCaller,
  events: broadcast::Sender<CacheEvent>,
  generation: AtomicU64,
}

/// Keyed cache of remote reads.
///
/// Cheap to clone; all clones share one store. Fetches run on the tokio
/// runtime, so reads must happen inside one.
#[derive(Clone)]
pub struct QueryCache {
  inner: Arc<Inner>,
}

impl Default for QueryCache {
  fn default() -> Self {
    Self::new(CacheConfig::default(), RemoteCaller::default())
  }
}

impl QueryCache {
  pub fn new(config: CacheConfig, caller: RemoteCaller) -> Self {
    let (events, _) = broadcast::channel(256);
    Self {
      inner: Arc::new(Inner {
        slots: Mutex::new(HashMap::new()),
        config,
        caller,
        events,
        generation: AtomicU64::new(0),
      }),
    }
  }

  pub fn config(&self) -> &CacheConfig {
    &self.inner.config
  }

  pub fn caller(&self) -> &RemoteCaller {
    &self.inner.caller
  }

  /// Subscribe to entry changes.
  pub fn events(&self) -> broadcast::Receiver<CacheEvent> {
    self.inner.events.subscribe()
  }

  pub(super) fn slots(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
    self
      .inner
      .slots
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
  }

  pub(super) fn emit(&self, event: CacheEvent) {
    // No receivers is fine
    let _ = self.inner.events.send(event);
  }

  fn slot_for<'a>(&self, slots: &'a mut HashMap<String, Slot>, key: &CacheKey) -> &'a mut Slot {
    let stale_time = self.inner.config.stale_time;
    slots
      .entry(key.cache_hash())
      .or_insert_with(|| Slot::new(key.clone(), stale_time))
  }

  fn erase<T, F, Fut>(fetcher: F) -> ErasedFetcher
  where
    T: Serialize + Send + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, ApiError>> + Send + 'static,
  {
    Arc::new(move || {
      let fut = fetcher();
      async move {
        let value = fut.await?;
        encode(&value)
      }
      .boxed()
    })
  }

  /// Return the current entry immediately, starting a background fetch when
  /// the entry is missing or stale and none is already pending.
  pub fn read<T, F, Fut>(
    &self,
    key: &CacheKey,
    fetcher: F,
    options: ReadOptions,
  ) -> Result<QuerySnapshot<T>, ApiError>
  where
    T: Serialize + DeserializeOwned + Send + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, ApiError>> + Send + 'static,
  {
    let fetcher = Self::erase(fetcher);
    let now = Utc::now();
    let entry = {
      let mut slots = self.slots();
      let slot = self.slot_for(&mut slots, key);
      slot.fetcher = Some(fetcher);
      if let Some(stale_time) = options.stale_time {
        slot.stale_time = stale_time;
      }
      if !options.disabled && !slot.is_pending() && slot.is_stale(now) {
        self.start_fetch(slot);
      }
      slot.snapshot(now)
    };
    entry.decode()
  }

  /// Resolve with fresh data, joining the pending fetch if there is one.
  pub async fn fetch<T, F, Fut>(&self, key: &CacheKey, fetcher: F) -> Result<T, ApiError>
  where
    T: Serialize + DeserializeOwned + Send + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, ApiError>> + Send + 'static,
  {
    let fetcher = Self::erase(fetcher);
    let (fresh, pending) = {
      let mut slots = self.slots();
      let slot = self.slot_for(&mut slots, key);
      slot.fetcher = Some(fetcher);
      let usable = !slot.is_pending() && !slot.is_stale(Utc::now());
      match slot.data.clone().filter(|_| usable) {
        Some(data) => (Some(data), None),
        None => (None, self.start_fetch(slot)),
      }
    };

    let value = match (fresh, pending) {
      (Some(data), _) => data,
      (None, Some(shared)) => shared.await?,
      (None, None) => return Err(no_fetcher(key)),
    };
    serde_json::from_value(value).map_err(ApiError::decode)
  }

  /// Fetch again with the remembered fetcher, even if the data is fresh.
  pub async fn refetch(&self, key: &CacheKey) -> Result<(), ApiError> {
    let pending = {
      let mut slots = self.slots();
      match slots.get_mut(&key.cache_hash()) {
        Some(slot) => self.start_fetch(slot),
        None => None,
      }
    };

    match pending {
      Some(shared) => shared.await.map(|_| ()),
      None => Err(no_fetcher(key)),
    }
  }

  /// Start a fetch for `slot` or join the one in flight. Called with the
  /// store locked.
  fn start_fetch(&self, slot: &mut Slot) -> Option<SharedFetch> {
    if let Some(inflight) = &slot.inflight {
      return Some(inflight.future.clone());
    }
    let fetcher = slot.fetcher.clone()?;
    let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed) + 1;

    let cache = self.clone();
    let key = slot.key.clone();
    let handle = tokio::spawn(async move {
      let result = cache.fetch_with_retry(&key, fetcher).await;
      cache.settle(&key, generation, &result);
      result
    });

    let abort = handle.abort_handle();
    let future = async move { handle.await.unwrap_or_else(|_| Err(ApiError::cancelled())) }
      .boxed()
      .shared();

    debug!(key = %slot.key, generation, "fetch started");
    slot.inflight = Some(InFlight {
      generation,
      future: future.clone(),
      abort,
      previous_status: slot.status,
    });
    slot.status = QueryStatus::Pending;
    Some(future)
  }

  async fn fetch_with_retry(&self, key: &CacheKey, fetcher: ErasedFetcher) -> Result<Value, ApiError> {
    let policy = &self.inner.config.retry;
    let mut attempt = 0;
    loop {
      match self.inner.caller.call_quiet(fetcher()).await {
        Ok(value) => return Ok(value),
        Err(err) => match policy.next_delay(err.class, attempt) {
          Some(delay) => {
            debug!(
              key = %key,
              class = %err.class,
              attempt,
              delay_ms = delay.as_millis() as u64,
              "fetch failed, retrying"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
          }
          None => return Err(err),
        },
      }
    }
  }

  /// Apply a finished fetch, unless it was cancelled or superseded.
  fn settle(&self, key: &CacheKey, generation: u64, result: &Result<Value, ApiError>) {
    {
      let mut slots = self.slots();
      let Some(slot) = slots.get_mut(&key.cache_hash()) else {
        return;
      };
      if slot.inflight.as_ref().map(|f| f.generation) != Some(generation) {
        debug!(key = %key, generation, "discarding superseded fetch");
        return;
      }
      slot.inflight = None;
      match result {
        Ok(value) => slot.write(value.clone(), Utc::now()),
        Err(err) => {
          // Keep the last known data
          slot.status = QueryStatus::Error;
          slot.error = Some(err.clone());
        }
      }
    }

    if let Err(err) = result {
      warn!(key = %key, class = %err.class, "fetch failed: {}", err.message);
      self.inner.caller.surface(err);
    }
    self.emit(CacheEvent::Updated(key.clone()));
  }

  /// Best-effort abort of the pending fetch for `key`. The entry returns to
  /// the status it had before the fetch started.
  pub fn cancel(&self, key: &CacheKey) -> bool {
    let mut slots = self.slots();
    let Some(slot) = slots.get_mut(&key.cache_hash()) else {
      return false;
    };
    let Some(inflight) = slot.inflight.take() else {
      return false;
    };
    inflight.abort.abort();
    slot.status = inflight.previous_status;
    debug!(key = %key, generation = inflight.generation, "fetch cancelled");
    true
  }

  /// Mark matching entries stale and refetch the observed ones.
  /// Returns how many entries matched.
  pub fn invalidate(&self, filter: impl Into<InvalidateFilter>) -> usize {
    let filter = filter.into();
    let mut touched = Vec::new();
    {
      let mut slots = self.slots();
      for slot in slots.values_mut() {
        if !filter.matches(&slot.key) {
          continue;
        }
        slot.invalidated = true;
        if slot.observer_count > 0 {
          self.start_fetch(slot);
        }
        touched.push(slot.key.clone());
      }
    }

    debug!(count = touched.len(), "invalidated");
    let count = touched.len();
    for key in touched {
      self.emit(CacheEvent::Invalidated(key));
    }
    count
  }

  /// Write data directly, creating the entry if needed.
  pub fn set_data<T: Serialize>(&self, key: &CacheKey, data: &T) -> Result<(), ApiError> {
    let value = encode(data)?;
    {
      let mut slots = self.slots();
      self.slot_for(&mut slots, key).write(value, Utc::now());
    }
    self.emit(CacheEvent::Updated(key.clone()));
    Ok(())
  }

  pub fn get_data<T: DeserializeOwned>(&self, key: &CacheKey) -> Option<T> {
    let value = {
      let slots = self.slots();
      slots.get(&key.cache_hash())?.data.clone()?
    };
    match serde_json::from_value(value) {
      Ok(data) => Some(data),
      Err(err) => {
        warn!(key = %key, "cached data has unexpected shape: {}", err);
        None
      }
    }
  }

  /// Replace an entry's data through an explicit merge function.
  ///
  /// `merge` receives the current data and returns the replacement;
  /// returning `None` leaves the entry untouched.
  pub fn update_data<T, F>(&self, key: &CacheKey, merge: F) -> Result<Option<T>, ApiError>
  where
    T: Serialize + DeserializeOwned,
    F: FnOnce(Option<T>) -> Option<T>,
  {
    let updated = {
      let mut slots = self.slots();
      let slot = self.slot_for(&mut slots, key);
      let current = slot
        .data
        .clone()
        .map(serde_json::from_value::<T>)
        .transpose()
        .map_err(ApiError::decode)?;

      match merge(current) {
        Some(next) => {
          slot.write(encode(&next)?, Utc::now());
          Some(next)
        }
        None => None,
      }
    };

    if updated.is_some() {
      self.emit(CacheEvent::Updated(key.clone()));
    }
    Ok(updated)
  }

  pub fn entry(&self, key: &CacheKey) -> Option<CacheEntry> {
    let slots = self.slots();
    slots
      .get(&key.cache_hash())
      .map(|slot| slot.snapshot(Utc::now()))
  }

  /// Drop an entry, aborting its pending fetch.
  pub fn remove(&self, key: &CacheKey) -> bool {
    let removed = {
      let mut slots = self.slots();
      slots.remove(&key.cache_hash())
    };
    match removed {
      Some(slot) => {
        if let Some(inflight) = slot.inflight {
          inflight.abort.abort();
        }
        self.emit(CacheEvent::Removed(key.clone()));
        true
      }
      None => false,
    }
  }

  /// Register interest in `key` for as long as the observer lives.
  pub fn observe(&self, key: &CacheKey) -> QueryObserver {
    {
      let mut slots = self.slots();
      self.slot_for(&mut slots, key).observer_count += 1;
    }
    QueryObserver {
      cache: self.clone(),
      key: key.clone(),
    }
  }

  /// Snapshot `keys`. `interrupted` lists the keys whose pending fetch the
  /// caller just cancelled.
  pub(crate) fn capture(&self, keys: &[CacheKey], interrupted: &[CacheKey]) -> Vec<SlotSnapshot> {
    let slots = self.slots();
    keys
      .iter()
      .map(|key| match slots.get(&key.cache_hash()) {
        Some(slot) => SlotSnapshot {
          key: key.clone(),
          data: slot.data.clone(),
          status: slot.status,
          error: slot.error.clone(),
          last_updated_at: slot.last_updated_at,
          invalidated: slot.invalidated,
          interrupted: interrupted.contains(key),
          existed: true,
        },
        None => SlotSnapshot {
          key: key.clone(),
          data: None,
          status: QueryStatus::Idle,
          error: None,
          last_updated_at: None,
          invalidated: false,
          interrupted: false,
          existed: false,
        },
      })
      .collect()
  }

  /// Write several entries under one lock.
  pub(crate) fn write_all(&self, writes: Vec<(CacheKey, Value)>) {
    let now = Utc::now();
    let keys: Vec<CacheKey> = {
      let mut slots = self.slots();
      writes
        .into_iter()
        .map(|(key, value)| {
          self.slot_for(&mut slots, &key).write(value, now);
          key
        })
        .collect()
    };
    for key in keys {
      self.emit(CacheEvent::Updated(key));
    }
  }

  /// Put every snapshot back under one lock: all keys are restored or none.
  ///
  /// Interrupted fetches are restarted, as are fetches for observed keys
  /// that come back stale.
  pub(crate) fn restore_all(&self, snapshots: &[SlotSnapshot]) {
    let now = Utc::now();
    {
      let mut slots = self.slots();
      for snap in snapshots {
        let hash = snap.key.cache_hash();
        if !snap.existed {
          let vacant = slots
            .get(&hash)
            .is_some_and(|slot| slot.observer_count == 0 && !slot.is_pending());
          if vacant {
            slots.remove(&hash);
            continue;
          }
        }
        let slot = self.slot_for(&mut slots, &snap.key);
        slot.data = snap.data.clone();
        slot.status = snap.status;
        slot.error = snap.error.clone();
        slot.last_updated_at = snap.last_updated_at;
        slot.invalidated = snap.invalidated;
        if snap.interrupted || (slot.observer_count > 0 && slot.is_stale(now)) {
          self.start_fetch(slot);
        }
      }
    }
    for snap in snapshots {
      self.emit(CacheEvent::Updated(snap.key.clone()));
    }
  }
}

fn no_fetcher(key: &CacheKey) -> ApiError {
  ApiError::new(
    ErrorClass::Unknown,
    format!("no fetcher registered for {}", key),
  )
}

/// Keeps an entry's observer count raised while alive.
#[derive(Debug)]
pub struct QueryObserver {
  cache: QueryCache,
  key: CacheKey,
}

impl QueryObserver {
  pub fn key(&self) -> &CacheKey {
    &self.key
  }

  pub fn entry(&self) -> Option<CacheEntry> {
    self.cache.entry(&self.key)
  }

  pub fn snapshot<T: DeserializeOwned>(&self) -> Result<Option<QuerySnapshot<T>>, ApiError> {
    self.entry().map(CacheEntry::decode).transpose()
  }
}

impl Drop for QueryObserver {
  fn drop(&mut self) {
    let mut slots = self.cache.slots();
    if let Some(slot) = slots.get_mut(&self.key.cache_hash()) {
      slot.observer_count = slot.observer_count.saturating_sub(1);
    }
  }
}

impl std::fmt::Debug for QueryCache {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("QueryCache")
      .field("entries", &self.slots().len())
      .field("config", &self.inner.config)
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::AtomicU32;
  use std::time::Duration as StdDuration;

  fn key(name: &str) -> CacheKey {
    CacheKey::from(["test", name])
  }

  /// Fetcher that counts invocations and answers after a short delay.
  fn counting(
    counter: Arc<AtomicU32>,
    value: u32,
  ) -> impl Fn() -> BoxFuture<'static, Result<u32, ApiError>> + Send + Sync + 'static {
    move || {
      let counter = counter.clone();
      async move {
        counter.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(StdDuration::from_millis(20)).await;
        Ok(value)
      }
      .boxed()
    }
  }

  /// Fetcher that fails `failures` times with `class`, then answers `value`.
  fn flaky(
    counter: Arc<AtomicU32>,
    failures: u32,
    class: ErrorClass,
    value: u32,
  ) -> impl Fn() -> BoxFuture<'static, Result<u32, ApiError>> + Send + Sync + 'static {
    move || {
      let counter = counter.clone();
      async move {
        let call = counter.fetch_add(1, Ordering::SeqCst);
        if call < failures {
          Err(ApiError::new(class, "flaky"))
        } else {
          Ok(value)
        }
      }
      .boxed()
    }
  }

  #[tokio::test]
  async fn test_concurrent_fetches_share_one_request() {
    let cache = QueryCache::default();
    let counter = Arc::new(AtomicU32::new(0));
    let k = key("dedupe");

    let (a, b) = tokio::join!(
      cache.fetch(&k, counting(counter.clone(), 7)),
      cache.fetch(&k, counting(counter.clone(), 7)),
    );

    assert_eq!(a.unwrap(), 7);
    assert_eq!(b.unwrap(), 7);
    assert_eq!(counter.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_read_returns_immediately_then_settles() {
    let cache = QueryCache::default();
    let counter = Arc::new(AtomicU32::new(0));
    let k = key("read");

    let first = cache
      .read::<u32, _, _>(&k, counting(counter.clone(), 3), ReadOptions::default())
      .unwrap();
    assert!(first.is_loading());
    assert_eq!(first.data(), None);

    // A second read while pending joins the same fetch
    let second = cache
      .read::<u32, _, _>(&k, counting(counter.clone(), 3), ReadOptions::default())
      .unwrap();
    assert!(second.is_fetching());

    tokio::time::sleep(StdDuration::from_millis(50)).await;

    let settled = cache
      .read::<u32, _, _>(&k, counting(counter.clone(), 3), ReadOptions::default())
      .unwrap();
    assert!(settled.is_success());
    assert!(!settled.is_stale);
    assert_eq!(settled.data(), Some(&3));
    assert_eq!(counter.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_stale_entry_is_refetched_in_background() {
    let cache = QueryCache::default();
    let counter = Arc::new(AtomicU32::new(0));
    let k = key("stale");
    cache.set_data(&k, &1u32).unwrap();

    let options = ReadOptions::default().stale_time(Duration::zero());
    tokio::time::sleep(StdDuration::from_millis(5)).await;

    let snapshot = cache
      .read::<u32, _, _>(&k, counting(counter.clone(), 2), options)
      .unwrap();
    // Stale data is served while revalidating
    assert_eq!(snapshot.data(), Some(&1));
    assert!(snapshot.is_fetching());

    tokio::time::sleep(StdDuration::from_millis(50)).await;
    assert_eq!(cache.get_data::<u32>(&k), Some(2));
    assert_eq!(counter.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_failed_fetch_keeps_last_known_data() {
    let cache = QueryCache::default();
    let counter = Arc::new(AtomicU32::new(0));
    let k = key("stale-while-error");
    cache.set_data(&k, &1u32).unwrap();
    cache.invalidate(&k);

    let result = cache
      .fetch(&k, flaky(counter.clone(), 10, ErrorClass::Validation, 0))
      .await;
    assert_eq!(result.unwrap_err().class, ErrorClass::Validation);

    let entry = cache.entry(&k).unwrap();
    assert_eq!(entry.status, QueryStatus::Error);
    assert_eq!(entry.data, Some(serde_json::json!(1)));
    assert_eq!(counter.load(Ordering::SeqCst), 1, "validation errors are not retried");
  }

  #[tokio::test(start_paused = true)]
  async fn test_retryable_errors_back_off_and_recover() {
    let cache = QueryCache::default();
    let counter = Arc::new(AtomicU32::new(0));
    let k = key("retry");

    let started = tokio::time::Instant::now();
    let value = cache
      .fetch(&k, flaky(counter.clone(), 2, ErrorClass::Server, 9))
      .await
      .unwrap();

    assert_eq!(value, 9);
    assert_eq!(counter.load(Ordering::SeqCst), 3);
    // 1000ms + 2000ms of backoff
    assert!(started.elapsed() >= StdDuration::from_millis(3000));
  }

  #[tokio::test(start_paused = true)]
  async fn test_retries_exhaust_after_three() {
    let cache = QueryCache::default();
    let counter = Arc::new(AtomicU32::new(0));
    let k = key("exhaust");

    let err = cache
      .fetch(&k, flaky(counter.clone(), 100, ErrorClass::Network, 0))
      .await
      .unwrap_err();

    assert_eq!(err.class, ErrorClass::Network);
    assert_eq!(counter.load(Ordering::SeqCst), 4);
    assert_eq!(cache.entry(&k).unwrap().status, QueryStatus::Error);
  }

  #[tokio::test(start_paused = true)]
  async fn test_rate_limit_gets_two_retries() {
    let cache = QueryCache::default();
    let counter = Arc::new(AtomicU32::new(0));

    let _ = cache
      .fetch(&key("rate"), flaky(counter.clone(), 100, ErrorClass::RateLimit, 0))
      .await;
    assert_eq!(counter.load(Ordering::SeqCst), 3);
  }

  #[tokio::test]
  async fn test_invalidate_refetches_only_observed_entries() {
    let cache = QueryCache::default();
    let watched_calls = Arc::new(AtomicU32::new(0));
    let idle_calls = Arc::new(AtomicU32::new(0));
    let watched = key("watched");
    let idle = key("idle");

    cache.fetch(&watched, counting(watched_calls.clone(), 1)).await.unwrap();
    cache.fetch(&idle, counting(idle_calls.clone(), 1)).await.unwrap();

    let _observer = cache.observe(&watched);
    let count = cache.invalidate(InvalidateFilter::Prefix(CacheKey::from(["test"])));
    assert_eq!(count, 2);

    tokio::time::sleep(StdDuration::from_millis(50)).await;
    assert_eq!(watched_calls.load(Ordering::SeqCst), 2);
    assert_eq!(idle_calls.load(Ordering::SeqCst), 1);
    assert!(cache.entry(&idle).unwrap().is_stale);
    assert!(!cache.entry(&watched).unwrap().is_stale);
  }

  #[tokio::test]
  async fn test_cancel_discards_late_result() {
    let cache = QueryCache::default();
    let counter = Arc::new(AtomicU32::new(0));
    let k = key("cancel");
    cache.set_data(&k, &1u32).unwrap();
    cache.invalidate(&k);

    let snapshot = cache
      .read::<u32, _, _>(&k, counting(counter.clone(), 2), ReadOptions::default())
      .unwrap();
    assert!(snapshot.is_fetching());

    assert!(cache.cancel(&k));
    assert_eq!(cache.entry(&k).unwrap().status, QueryStatus::Success);

    tokio::time::sleep(StdDuration::from_millis(50)).await;
    assert_eq!(cache.get_data::<u32>(&k), Some(1));
    assert!(!cache.cancel(&k));
  }

  #[tokio::test]
  async fn test_observer_count_follows_guards() {
    let cache = QueryCache::default();
    let k = key("observers");

    let a = cache.observe(&k);
    let b = cache.observe(&k);
    assert_eq!(cache.entry(&k).unwrap().observer_count, 2);

    drop(a);
    assert_eq!(b.entry().unwrap().observer_count, 1);
    drop(b);
    assert_eq!(cache.entry(&k).unwrap().observer_count, 0);
  }

  #[tokio::test]
  async fn test_update_data_uses_merge_function() {
    let cache = QueryCache::default();
    let k = key("merge");
    cache.set_data(&k, &vec![2u32, 3]).unwrap();

    let merged = cache
      .update_data::<Vec<u32>, _>(&k, |current| {
        let mut list = current.unwrap_or_default();
        list.insert(0, 1);
        Some(list)
      })
      .unwrap();
    assert_eq!(merged, Some(vec![1, 2, 3]));

    // Declining to merge leaves data alone
    let untouched = cache.update_data::<Vec<u32>, _>(&k, |_| None).unwrap();
    assert_eq!(untouched, None);
    assert_eq!(cache.get_data::<Vec<u32>>(&k), Some(vec![1, 2, 3]));
  }

  #[tokio::test]
  async fn test_events_are_broadcast() {
    let cache = QueryCache::default();
    let mut events = cache.events();
    let k = key("events");

    cache.set_data(&k, &1u32).unwrap();
    cache.invalidate(&k);
    cache.remove(&k);

    assert_eq!(events.recv().await.unwrap(), CacheEvent::Updated(k.clone()));
    assert_eq!(events.recv().await.unwrap(), CacheEvent::Invalidated(k.clone()));
    assert_eq!(events.recv().await.unwrap(), CacheEvent::Removed(k));
  }
}
