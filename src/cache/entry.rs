//! Entry state as seen by cache consumers.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use super::key::CacheKey;
use crate::api::ApiError;

/// The state of a cached read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryStatus {
  /// Entry exists but has never been fetched
  Idle,
  /// A fetch is in flight
  Pending,
  /// Last fetch (or direct write) succeeded
  Success,
  /// Last fetch failed; `data` still holds the last known value
  Error,
}

/// Point-in-time copy of one cache entry, with the payload still encoded.
#[derive(Debug, Clone)]
pub struct CacheEntry {
  pub key: CacheKey,
  pub data: Option<Value>,
  pub status: QueryStatus,
  pub error: Option<ApiError>,
  pub last_updated_at: Option<DateTime<Utc>>,
  pub observer_count: usize,
  pub is_stale: bool,
}

impl CacheEntry {
  /// Decode into a typed snapshot.
  pub fn decode<T: DeserializeOwned>(self) -> Result<QuerySnapshot<T>, ApiError> {
    let data = self
      .data
      .map(serde_json::from_value::<T>)
      .transpose()
      .map_err(ApiError::decode)?;

    Ok(QuerySnapshot {
      key: self.key,
      data,
      status: self.status,
      error: self.error,
      last_updated_at: self.last_updated_at,
      observer_count: self.observer_count,
      is_stale: self.is_stale,
    })
  }
}

/// Typed view of a cache entry returned by reads.
#[derive(Debug, Clone)]
pub struct QuerySnapshot<T> {
  pub key: CacheKey,
  pub data: Option<T>,
  pub status: QueryStatus,
  pub error: Option<ApiError>,
  pub last_updated_at: Option<DateTime<Utc>>,
  pub observer_count: usize,
  pub is_stale: bool,
}

impl<T> QuerySnapshot<T> {
  pub fn is_loading(&self) -> bool {
    self.status == QueryStatus::Pending && self.data.is_none()
  }

  pub fn is_fetching(&self) -> bool {
    self.status == QueryStatus::Pending
  }

  pub fn is_success(&self) -> bool {
    self.status == QueryStatus::Success
  }

  pub fn is_error(&self) -> bool {
    self.status == QueryStatus::Error
  }

  pub fn data(&self) -> Option<&T> {
    self.data.as_ref()
  }

  pub fn error(&self) -> Option<&ApiError> {
    self.error.as_ref()
  }
}

/// Per-read options.
#[derive(Debug, Clone, Default)]
pub struct ReadOptions {
  /// Overrides the cache-wide stale time for this key
  pub stale_time: Option<chrono::Duration>,
  /// When set the entry is registered but never fetched
  pub disabled: bool,
}

impl ReadOptions {
  pub fn stale_time(mut self, stale_time: chrono::Duration) -> Self {
    self.stale_time = Some(stale_time);
    self
  }

  pub fn disabled(mut self) -> Self {
    self.disabled = true;
    self
  }
}

/// Change notifications broadcast by the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
  Updated(CacheKey),
  Invalidated(CacheKey),
  Removed(CacheKey),
}

/// Encode a value for storage in the cache.
pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Value, ApiError> {
  serde_json::to_value(value).map_err(ApiError::decode)
}
