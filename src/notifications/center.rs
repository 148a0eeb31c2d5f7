//! Notification state held in the query cache.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use tracing::{debug, warn};

use super::desktop::{wants_desktop, DesktopNotifier, Permission};
use super::grouping::{group_notifications, NotificationGroup};
use crate::api::types::{Notification, NotificationFilter, NotificationStats, Preferences};
use crate::api::{ApiError, NotificationBackend};
use crate::cache::{CacheKey, QueryCache, QueryObserver, QuerySnapshot, ReadOptions};
use crate::mutation::{Mutation, OptimisticUpdate};
use crate::realtime::PushSink;

pub fn list_key(filter: &NotificationFilter) -> CacheKey {
  CacheKey::from(["notifications", "list"]).with(serde_json::to_value(filter).unwrap_or_default())
}

pub fn unread_key() -> CacheKey {
  CacheKey::from(["notifications", "unread-count"])
}

pub fn stats_key() -> CacheKey {
  CacheKey::from(["notifications", "stats"])
}

pub fn preferences_key() -> CacheKey {
  CacheKey::from(["notifications", "preferences"])
}

/// Which item a single-item write targets, and whether it counted as unread
/// when the write was issued.
#[derive(Debug, Clone, Copy)]
struct ItemTarget {
  id: u64,
  was_unread: bool,
}

/// Keeps the list and unread-count entries alive while held.
#[derive(Debug)]
pub struct NotificationWatch {
  pub list: QueryObserver,
  pub unread: QueryObserver,
}

/// The notification list and unread count for one filter, with optimistic
/// writes that keep the two consistent.
#[derive(Clone)]
pub struct NotificationCenter {
  cache: QueryCache,
  backend: Arc<dyn NotificationBackend>,
  filter: NotificationFilter,
  notifier: Option<Arc<dyn DesktopNotifier>>,
}

impl NotificationCenter {
  pub fn new(cache: QueryCache, backend: Arc<dyn NotificationBackend>) -> Self {
    Self {
      cache,
      backend,
      filter: NotificationFilter::default(),
      notifier: None,
    }
  }

  pub fn with_filter(mut self, filter: NotificationFilter) -> Self {
    self.filter = filter;
    self
  }

  pub fn with_notifier(mut self, notifier: Arc<dyn DesktopNotifier>) -> Self {
    self.notifier = Some(notifier);
    self
  }

  pub fn cache(&self) -> &QueryCache {
    &self.cache
  }

  pub fn filter(&self) -> &NotificationFilter {
    &self.filter
  }

  pub fn list_key(&self) -> CacheKey {
    list_key(&self.filter)
  }

  fn list_fetcher(
    &self,
  ) -> impl Fn() -> BoxFuture<'static, Result<Vec<Notification>, ApiError>> + Send + Sync + 'static {
    let backend = self.backend.clone();
    let filter = self.filter.clone();
    move || {
      let backend = backend.clone();
      let filter = filter.clone();
      async move { backend.list(&filter).await.map(|page| page.items) }.boxed()
    }
  }

  fn unread_fetcher(&self) -> impl Fn() -> BoxFuture<'static, Result<u64, ApiError>> + Send + Sync + 'static {
    let backend = self.backend.clone();
    move || {
      let backend = backend.clone();
      async move { backend.unread_count().await }.boxed()
    }
  }

  /// Cached list, refetched in the background when stale.
  pub fn notifications(&self) -> Result<QuerySnapshot<Vec<Notification>>, ApiError> {
    self
      .cache
      .read(&self.list_key(), self.list_fetcher(), ReadOptions::default())
  }

  /// Cached unread count, refetched in the background when stale.
  pub fn unread_count(&self) -> Result<QuerySnapshot<u64>, ApiError> {
    self
      .cache
      .read(&unread_key(), self.unread_fetcher(), ReadOptions::default())
  }

  /// Wait for the list and the count, using cached values when fresh.
  pub async fn load(&self) -> Result<(Vec<Notification>, u64), ApiError> {
    let list_key = self.list_key();
    let unread_key = unread_key();
    tokio::try_join!(
      self.cache.fetch(&list_key, self.list_fetcher()),
      self.cache.fetch(&unread_key, self.unread_fetcher()),
    )
  }

  /// Refetch the list and the count regardless of freshness.
  pub async fn refresh(&self) -> Result<(), ApiError> {
    let list_key = self.list_key();
    let unread_key = unread_key();
    self.cache.invalidate(&list_key);
    self.cache.invalidate(&unread_key);

    let (list, unread) = tokio::join!(
      self.cache.fetch(&list_key, self.list_fetcher()),
      self.cache.fetch(&unread_key, self.unread_fetcher()),
    );
    list?;
    unread?;
    debug!("notifications refreshed");
    Ok(())
  }

  /// Register interest in the list and the count, loading them if needed.
  pub fn observe(&self) -> NotificationWatch {
    let watch = NotificationWatch {
      list: self.cache.observe(&self.list_key()),
      unread: self.cache.observe(&unread_key()),
    };
    // Registers the fetchers so invalidation can refetch
    if let Err(err) = self.notifications().and(self.unread_count()) {
      warn!("cached notifications could not be decoded: {}", err);
    }
    watch
  }

  pub async fn stats(&self) -> Result<NotificationStats, ApiError> {
    let backend = self.backend.clone();
    self
      .cache
      .fetch(&stats_key(), move || {
        let backend = backend.clone();
        async move { backend.stats().await }
      })
      .await
  }

  pub async fn preferences(&self) -> Result<Preferences, ApiError> {
    let backend = self.backend.clone();
    self
      .cache
      .fetch(&preferences_key(), move || {
        let backend = backend.clone();
        async move { backend.preferences().await }
      })
      .await
  }

  /// Aggregate the cached list by type and category.
  pub fn groups(&self) -> Vec<NotificationGroup> {
    let items = self
      .cache
      .get_data::<Vec<Notification>>(&self.list_key())
      .unwrap_or_default();
    group_notifications(&items)
  }

  /// Merge a pushed notification into the cached state. Returns false when
  /// the notification was already known.
  pub fn apply_push(&self, notification: Notification) -> Result<bool, ApiError> {
    let mut duplicate = false;
    if self.filter.matches(&notification) {
      self
        .cache
        .update_data::<Vec<Notification>, _>(&self.list_key(), |current| {
          let mut list = current?;
          if list.iter().any(|n| n.id == notification.id) {
            duplicate = true;
            return None;
          }
          list.insert(0, notification.clone());
          Some(list)
        })?;
    }
    if duplicate {
      debug!(id = notification.id, "ignoring duplicate push");
      return Ok(false);
    }

    if !notification.is_read {
      self
        .cache
        .update_data::<u64, _>(&unread_key(), |count| count.map(|c| c + 1))?;
    }
    self.show_on_desktop(&notification);
    Ok(true)
  }

  fn show_on_desktop(&self, notification: &Notification) {
    let Some(notifier) = &self.notifier else {
      return;
    };
    if notifier.permission() != Permission::Granted {
      return;
    }
    let prefs = self
      .cache
      .get_data::<Preferences>(&preferences_key())
      .unwrap_or_default();
    if wants_desktop(&prefs, notification) {
      notifier.show(notification);
    }
  }

  fn is_unread(&self, id: u64) -> bool {
    self
      .cache
      .get_data::<Vec<Notification>>(&self.list_key())
      .and_then(|list| list.into_iter().find(|n| n.id == id))
      .is_some_and(|n| !n.is_read)
  }

  fn list_update<V, F>(&self, update: F) -> OptimisticUpdate<V>
  where
    V: 'static,
    F: Fn(&mut Vec<Notification>, &V) + Send + Sync + 'static,
  {
    let filter = self.filter.clone();
    OptimisticUpdate::new(
      self.list_key(),
      move |previous: Option<Vec<Notification>>, vars: &V| {
        previous.map(|mut list| {
          update(&mut list, vars);
          // Items that no longer match the filter leave the list
          list.retain(|n| filter.matches(n));
          list
        })
      },
    )
  }

  fn unread_update<V, F>(update: F) -> OptimisticUpdate<V>
  where
    V: 'static,
    F: Fn(u64, &V) -> u64 + Send + Sync + 'static,
  {
    OptimisticUpdate::new(unread_key(), move |previous: Option<u64>, vars: &V| {
      previous.map(|count| update(count, vars))
    })
  }

  pub async fn mark_as_read(&self, id: u64) -> Result<(), ApiError> {
    let target = ItemTarget {
      id,
      was_unread: self.is_unread(id),
    };
    let backend = self.backend.clone();
    Mutation::synchronized(
      self.cache.clone(),
      move |t: ItemTarget| {
        let backend = backend.clone();
        async move { backend.mark_read(t.id).await }
      },
      vec![
        self.list_update(|list, t: &ItemTarget| {
          for n in list.iter_mut().filter(|n| n.id == t.id) {
            n.is_read = true;
          }
        }),
        Self::unread_update(|count, t: &ItemTarget| {
          if t.was_unread {
            count.saturating_sub(1)
          } else {
            count
          }
        }),
      ],
    )
    .invalidates(stats_key())
    .mutate(target)
    .await
  }

  pub async fn mark_all_as_read(&self) -> Result<(), ApiError> {
    let backend = self.backend.clone();
    Mutation::synchronized(
      self.cache.clone(),
      move |_: ()| {
        let backend = backend.clone();
        async move { backend.mark_all_read().await }
      },
      vec![
        self.list_update(|list, _: &()| {
          for n in list.iter_mut() {
            n.is_read = true;
          }
        }),
        Self::unread_update(|_, _: &()| 0),
      ],
    )
    .invalidates(stats_key())
    .mutate(())
    .await
  }

  pub async fn dismiss(&self, id: u64) -> Result<(), ApiError> {
    let target = ItemTarget {
      id,
      was_unread: self.is_unread(id),
    };
    let backend = self.backend.clone();
    Mutation::synchronized(
      self.cache.clone(),
      move |t: ItemTarget| {
        let backend = backend.clone();
        async move { backend.dismiss(t.id).await }
      },
      vec![
        self.list_update(|list, t: &ItemTarget| list.retain(|n| n.id != t.id)),
        Self::unread_update(|count, t: &ItemTarget| {
          if t.was_unread {
            count.saturating_sub(1)
          } else {
            count
          }
        }),
      ],
    )
    .invalidates(stats_key())
    .mutate(target)
    .await
  }

  pub async fn dismiss_all(&self) -> Result<(), ApiError> {
    let backend = self.backend.clone();
    Mutation::synchronized(
      self.cache.clone(),
      move |_: ()| {
        let backend = backend.clone();
        async move { backend.dismiss_all().await }
      },
      vec![
        self.list_update(|list, _: &()| list.clear()),
        Self::unread_update(|_, _: &()| 0),
      ],
    )
    .invalidates(stats_key())
    .mutate(())
    .await
  }

  pub async fn update_preferences(&self, prefs: Preferences) -> Result<Preferences, ApiError> {
    let backend = self.backend.clone();
    Mutation::new(self.cache.clone(), move |prefs: Preferences| {
      let backend = backend.clone();
      async move { backend.update_preferences(&prefs).await }
    })
    .optimistic(OptimisticUpdate::new(
      preferences_key(),
      |_: Option<Preferences>, prefs: &Preferences| Some(prefs.clone()),
    ))
    .mutate(prefs)
    .await
  }
}

#[async_trait]
impl PushSink for NotificationCenter {
  async fn deliver(&self, notification: Notification) {
    if let Err(err) = self.apply_push(notification) {
      warn!("failed to apply pushed notification: {}", err);
    }
  }

  async fn resync(&self) {
    if let Err(err) = self.refresh().await {
      debug!(class = %err.class, "resync failed: {}", err.message);
    }
  }
}
