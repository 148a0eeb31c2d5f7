//! Read-only access to the persisted auth token.
//!
//! Tokens are issued and written by the surrounding app; this crate only
//! checks for one and attaches it to outgoing requests.

use std::path::PathBuf;

pub const TOKEN_ENV: &str = "SYNQ_TOKEN";

pub trait TokenSource: Send + Sync {
  fn token(&self) -> Option<String>;
}

/// Looks up `SYNQ_TOKEN`, then `$XDG_DATA_HOME/synq/token`.
#[derive(Debug, Clone, Default)]
pub struct StoredToken {
  path: Option<PathBuf>,
}

impl StoredToken {
  pub fn new() -> Self {
    Self {
      path: Self::default_path(),
    }
  }

  pub fn at(path: PathBuf) -> Self {
    Self { path: Some(path) }
  }

  fn default_path() -> Option<PathBuf> {
    dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .map(|dir| dir.join("synq").join("token"))
  }
}

impl TokenSource for StoredToken {
  fn token(&self) -> Option<String> {
    if let Ok(token) = std::env::var(TOKEN_ENV) {
      if !token.trim().is_empty() {
        return Some(token.trim().to_string());
      }
    }

    let path = self.path.as_ref()?;
    let contents = std::fs::read_to_string(path).ok()?;
    let token = contents.trim();
    (!token.is_empty()).then(|| token.to_string())
  }
}

/// Fixed token, for tests and embedding.
#[derive(Debug, Clone)]
pub struct StaticToken(pub Option<String>);

impl TokenSource for StaticToken {
  fn token(&self) -> Option<String> {
    self.0.clone()
  }
}
