//! Structured cache keys.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Identifies one cached read, e.g. `["notifications", "list", {"isRead": false}]`.
///
/// Equality is structural. Objects compare by content regardless of field
/// order because `serde_json` keeps object keys sorted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(Vec<Value>);

/// Build a [`CacheKey`] from heterogeneous parts.
///
/// ```ignore
/// let key = cache_key!["notifications", "list", { "page": 2 }];
/// ```
#[macro_export]
macro_rules! cache_key {
  ($($part:tt),* $(,)?) => {
    $crate::cache::CacheKey::from_parts(vec![$(::serde_json::json!($part)),*])
  };
}

impl CacheKey {
  pub fn from_parts(parts: Vec<Value>) -> Self {
    Self(parts)
  }

  pub fn new<I, V>(parts: I) -> Self
  where
    I: IntoIterator<Item = V>,
    V: Into<Value>,
  {
    Self(parts.into_iter().map(Into::into).collect())
  }

  /// Append one part, returning the longer key.
  pub fn with(mut self, part: impl Into<Value>) -> Self {
    self.0.push(part.into());
    self
  }

  pub fn parts(&self) -> &[Value] {
    &self.0
  }

  /// Whether `prefix` matches the leading parts of this key.
  pub fn starts_with(&self, prefix: &CacheKey) -> bool {
    self.0.starts_with(&prefix.0)
  }

  /// JSON text of the key. Used for pattern matching and diagnostics.
  pub fn serialized(&self) -> String {
    Value::Array(self.0.clone()).to_string()
  }

  /// Stable fixed-length identity of the key.
  pub fn cache_hash(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.serialized().as_bytes());
    hex::encode(hasher.finalize())
  }
}

impl fmt::Display for CacheKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.serialized())
  }
}

impl From<&[&str]> for CacheKey {
  fn from(parts: &[&str]) -> Self {
    Self::new(parts.iter().copied())
  }
}

impl<const N: usize> From<[&str; N]> for CacheKey {
  fn from(parts: [&str; N]) -> Self {
    Self::new(parts)
  }
}
