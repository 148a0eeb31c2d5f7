use serde_json::Value;

use crate::cache::{CacheKey, QueryCache, SlotSnapshot};

/// Prior state of every key a mutation attempt touches optimistically.
///
/// Created before the optimistic write, consumed by either `commit` (the
/// remote call succeeded) or `rollback`.
#[derive(Debug)]
pub struct MutationContext {
  previous_snapshots: Vec<SlotSnapshot>,
}

impl MutationContext {
  pub(crate) fn capture(cache: &QueryCache, keys: &[CacheKey], interrupted: &[CacheKey]) -> Self {
    Self {
      previous_snapshots: cache.capture(keys, interrupted),
    }
  }

  /// The data `key` held when the context was captured.
  pub fn previous(&self, key: &CacheKey) -> Option<&Value> {
    self
      .previous_snapshots
      .iter()
      .find(|snap| &snap.key == key)
      .and_then(|snap| snap.data.as_ref())
  }

  pub fn keys(&self) -> impl Iterator<Item = &CacheKey> {
    self.previous_snapshots.iter().map(|snap| &snap.key)
  }

  pub fn len(&self) -> usize {
    self.previous_snapshots.len()
  }

  pub fn is_empty(&self) -> bool {
    self.previous_snapshots.is_empty()
  }

  /// Discard the snapshots; the optimistic state stands.
  pub fn commit(self) {}

  /// Restore every captured entry in one cache write.
  pub fn rollback(self, cache: &QueryCache) {
    cache.restore_all(&self.previous_snapshots);
  }
}
