//! Notification endpoints.

use async_trait::async_trait;

use super::client::ApiClient;
use super::error::ApiError;
use super::types::{
  NotificationFilter, NotificationPage, NotificationStats, Preferences, UnreadCount,
};

/// The REST surface the notification subsystem consumes.
#[async_trait]
pub trait NotificationBackend: Send + Sync {
  async fn list(&self, filter: &NotificationFilter) -> Result<NotificationPage, ApiError>;
  async fn unread_count(&self) -> Result<u64, ApiError>;
  async fn stats(&self) -> Result<NotificationStats, ApiError>;
  async fn mark_read(&self, id: u64) -> Result<(), ApiError>;
  async fn mark_all_read(&self) -> Result<(), ApiError>;
  async fn dismiss(&self, id: u64) -> Result<(), ApiError>;
  async fn dismiss_all(&self) -> Result<(), ApiError>;
  async fn preferences(&self) -> Result<Preferences, ApiError>;
  async fn update_preferences(&self, prefs: &Preferences) -> Result<Preferences, ApiError>;
}

#[async_trait]
impl NotificationBackend for ApiClient {
  async fn list(&self, filter: &NotificationFilter) -> Result<NotificationPage, ApiError> {
    self.get("notifications", &filter.query_pairs()).await
  }

  async fn unread_count(&self) -> Result<u64, ApiError> {
    let response: UnreadCount = self.get("notifications/unread-count", &[]).await?;
    Ok(response.count)
  }

  async fn stats(&self) -> Result<NotificationStats, ApiError> {
    self.get("notifications/stats", &[]).await
  }

  async fn mark_read(&self, id: u64) -> Result<(), ApiError> {
    self.patch(&format!("notifications/{}/read", id)).await
  }

  async fn mark_all_read(&self) -> Result<(), ApiError> {
    self.patch("notifications/read-all").await
  }

  async fn dismiss(&self, id: u64) -> Result<(), ApiError> {
    self.patch(&format!("notifications/{}/dismiss", id)).await
  }

  async fn dismiss_all(&self) -> Result<(), ApiError> {
    self.patch("notifications/dismiss-all").await
  }

  async fn preferences(&self) -> Result<Preferences, ApiError> {
    self.get("notifications/preferences", &[]).await
  }

  async fn update_preferences(&self, prefs: &Preferences) -> Result<Preferences, ApiError> {
    let updated: Option<Preferences> = self.put("notifications/preferences", prefs).await?;
    // Some deployments answer with an empty envelope
    Ok(updated.unwrap_or_else(|| prefs.clone()))
  }
}
