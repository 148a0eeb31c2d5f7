//! In-memory backend for notification tests.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};

use crate::api::types::{
  Notification, NotificationFilter, NotificationPage, NotificationStats, Preferences, Priority,
};
use crate::api::{ApiError, ErrorClass, NotificationBackend};

pub(crate) fn sample(id: u64, is_read: bool) -> Notification {
  Notification {
    id,
    title: format!("Notification {}", id),
    message: "Stock level below threshold".to_string(),
    kind: "stock".to_string(),
    priority: Priority::Medium,
    category: "inventory".to_string(),
    is_read,
    dismissed: false,
    created_at: Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap() + chrono::Duration::seconds(id as i64),
  }
}

/// Serves a fixed set of notifications. Writes take `latency_ms`; while
/// `offline` is set they fail with a network error.
#[derive(Default)]
pub(crate) struct FakeBackend {
  pub items: Mutex<Vec<Notification>>,
  pub prefs: Mutex<Preferences>,
  pub offline: AtomicBool,
  pub latency_ms: AtomicU64,
  pub calls: Mutex<Vec<String>>,
}

impl FakeBackend {
  pub fn with_items(items: Vec<Notification>) -> Self {
    Self {
      items: Mutex::new(items),
      ..Default::default()
    }
  }

  pub fn set_offline(&self, offline: bool) {
    self.offline.store(offline, Ordering::SeqCst);
  }

  pub fn set_latency(&self, latency: Duration) {
    self.latency_ms.store(latency.as_millis() as u64, Ordering::SeqCst);
  }

  pub fn count_calls(&self, name: &str) -> usize {
    self.calls.lock().unwrap().iter().filter(|c| *c == name).count()
  }

  fn record(&self, name: &str) {
    self.calls.lock().unwrap().push(name.to_string());
  }

  async fn write(&self, name: &str) -> Result<(), ApiError> {
    self.record(name);
    let latency = self.latency_ms.load(Ordering::SeqCst);
    if latency > 0 {
      tokio::time::sleep(Duration::from_millis(latency)).await;
    }
    if self.offline.load(Ordering::SeqCst) {
      return Err(ApiError::new(ErrorClass::Network, "offline"));
    }
    Ok(())
  }
}

#[async_trait]
impl NotificationBackend for FakeBackend {
  async fn list(&self, filter: &NotificationFilter) -> Result<NotificationPage, ApiError> {
    self.record("list");
    let items: Vec<Notification> = self
      .items
      .lock()
      .unwrap()
      .iter()
      .filter(|n| !n.dismissed && filter.matches(n))
      .cloned()
      .collect();
    Ok(NotificationPage {
      total: items.len() as u64,
      items,
      page: 1,
      limit: 20,
    })
  }

  async fn unread_count(&self) -> Result<u64, ApiError> {
    self.record("unread_count");
    let items = self.items.lock().unwrap();
    Ok(items.iter().filter(|n| !n.is_read && !n.dismissed).count() as u64)
  }

  async fn stats(&self) -> Result<NotificationStats, ApiError> {
    self.record("stats");
    let items = self.items.lock().unwrap();
    Ok(NotificationStats {
      total: items.len() as u64,
      unread: items.iter().filter(|n| !n.is_read).count() as u64,
      ..Default::default()
    })
  }

  async fn mark_read(&self, id: u64) -> Result<(), ApiError> {
    self.write("mark_read").await?;
    for n in self.items.lock().unwrap().iter_mut().filter(|n| n.id == id) {
      n.is_read = true;
    }
    Ok(())
  }

  async fn mark_all_read(&self) -> Result<(), ApiError> {
    self.write("mark_all_read").await?;
    for n in self.items.lock().unwrap().iter_mut() {
      n.is_read = true;
    }
    Ok(())
  }

  async fn dismiss(&self, id: u64) -> Result<(), ApiError> {
    self.write("dismiss").await?;
    for n in self.items.lock().unwrap().iter_mut().filter(|n| n.id == id) {
      n.dismissed = true;
    }
    Ok(())
  }

  async fn dismiss_all(&self) -> Result<(), ApiError> {
    self.write("dismiss_all").await?;
    for n in self.items.lock().unwrap().iter_mut() {
      n.dismissed = true;
    }
    Ok(())
  }

  async fn preferences(&self) -> Result<Preferences, ApiError> {
    self.record("preferences");
    Ok(self.prefs.lock().unwrap().clone())
  }

  async fn update_preferences(&self, prefs: &Preferences) -> Result<Preferences, ApiError> {
    self.write("update_preferences").await?;
    *self.prefs.lock().unwrap() = prefs.clone();
    Ok(prefs.clone())
  }
}
