use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub api: ApiConfig,
  #[serde(default)]
  pub realtime: RealtimeConfig,
  #[serde(default)]
  pub cache: CacheSettings,
  #[serde(default)]
  pub batch: BatchConfig,
  #[serde(default)]
  pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  /// Base URL of the REST API, e.g. https://dash.example.org/api
  pub base_url: String,
  /// Overall deadline per request
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
  30
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
  /// Push endpoint. Derived from the API base URL when unset.
  pub url: Option<String>,
  pub heartbeat_secs: u64,
  pub poll_secs: u64,
  pub max_reconnect_attempts: u32,
  /// Reconnect base delay after network-class closures
  pub network_base_ms: u64,
  /// Reconnect base delay after server-class closures
  pub server_base_ms: u64,
  pub max_delay_ms: u64,
}

impl Default for RealtimeConfig {
  fn default() -> Self {
    Self {
      url: None,
      heartbeat_secs: 30,
      poll_secs: 60,
      max_reconnect_attempts: 5,
      network_base_ms: 1000,
      server_base_ms: 2000,
      max_delay_ms: 30_000,
    }
  }
}

impl RealtimeConfig {
  pub fn heartbeat_interval(&self) -> Duration {
    Duration::from_secs(self.heartbeat_secs)
  }

  pub fn poll_interval(&self) -> Duration {
    Duration::from_secs(self.poll_secs)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
  /// Age after which a cached read is refetched
  pub stale_minutes: i64,
  /// Age after which an unobserved entry is evicted
  pub eviction_minutes: i64,
  pub gc_interval_secs: u64,
}

impl Default for CacheSettings {
  fn default() -> Self {
    Self {
      stale_minutes: 5,
      eviction_minutes: 30,
      gc_interval_secs: 60,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
  /// Items executed concurrently per chunk
  pub concurrency: usize,
}

impl Default for BatchConfig {
  fn default() -> Self {
    Self { concurrency: 5 }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
  pub level: String,
  /// Log to $XDG_DATA_HOME/synq/synq.log instead of stderr
  pub file: bool,
}

impl Default for LoggingConfig {
  fn default() -> Self {
    Self {
      level: "info".to_string(),
      file: false,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./synq.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/synq/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/synq/config.yaml\n\
                 See config.example.yaml for the format."
      )),
    }
  }

  /// Minimal configuration pointing at one backend, everything else defaulted.
  pub fn for_base_url(base_url: &str) -> Self {
    Self {
      api: ApiConfig {
        base_url: base_url.to_string(),
        timeout_secs: default_timeout_secs(),
      },
      realtime: RealtimeConfig::default(),
      cache: CacheSettings::default(),
      batch: BatchConfig::default(),
      logging: LoggingConfig::default(),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("synq.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("synq").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    Ok(config)
  }

  pub fn api_base_url(&self) -> Result<Url> {
    Url::parse(&self.api.base_url)
      .map_err(|e| eyre!("Invalid api.base_url '{}': {}", self.api.base_url, e))
  }

  /// The push endpoint: `realtime.url`, or the API host with a ws scheme and
  /// `/ws/notifications` path.
  pub fn realtime_url(&self) -> Result<Url> {
    if let Some(url) = &self.realtime.url {
      return Url::parse(url).map_err(|e| eyre!("Invalid realtime.url '{}': {}", url, e));
    }

    let mut url = self.api_base_url()?;
    let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
    url
      .set_scheme(scheme)
      .map_err(|_| eyre!("Cannot derive a websocket URL from {}", self.api.base_url))?;
    url.set_path("/ws/notifications");
    url.set_query(None);
    Ok(url)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_parse_minimal_config_uses_defaults() {
    let config = Config::parse("api:\n  base_url: https://dash.example.org/api\n").unwrap();
    assert_eq!(config.api.timeout_secs, 30);
    assert_eq!(config.realtime.heartbeat_secs, 30);
    assert_eq!(config.realtime.poll_secs, 60);
    assert_eq!(config.realtime.max_reconnect_attempts, 5);
    assert_eq!(config.cache.stale_minutes, 5);
    assert_eq!(config.cache.eviction_minutes, 30);
    assert_eq!(config.batch.concurrency, 5);
  }

  #[test]
  fn test_parse_overrides() {
    let yaml = r#"
api:
  base_url: http://localhost:4000/api
  timeout_secs: 10
realtime:
  poll_secs: 15
batch:
  concurrency: 2
"#;
    let config = Config::parse(yaml).unwrap();
    assert_eq!(config.api.timeout_secs, 10);
    assert_eq!(config.realtime.poll_secs, 15);
    assert_eq!(config.realtime.heartbeat_secs, 30);
    assert_eq!(config.batch.concurrency, 2);
  }

  #[test]
  fn test_realtime_url_derived_from_api() {
    let config = Config::for_base_url("https://dash.example.org/api?x=1");
    assert_eq!(
      config.realtime_url().unwrap().as_str(),
      "wss://dash.example.org/ws/notifications"
    );

    let config = Config::for_base_url("http://localhost:4000/api");
    assert_eq!(
      config.realtime_url().unwrap().as_str(),
      "ws://localhost:4000/ws/notifications"
    );
  }

  #[test]
  fn test_missing_explicit_path_is_an_error() {
    let err = Config::load(Some(Path::new("/definitely/not/here.yaml"))).unwrap_err();
    assert!(err.to_string().contains("Config file not found"));
  }
}
