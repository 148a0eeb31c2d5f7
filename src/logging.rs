//! Process-wide tracing subscriber.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::OnceLock;

use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Overrides the configured level, in `EnvFilter` syntax.
pub const LOG_ENV: &str = "SYNQ_LOG";

#[derive(Debug, Clone, Default)]
pub struct LogConfig {
  pub level: String,
  /// Append to this file instead of writing to stderr
  pub file: Option<PathBuf>,
}

impl From<&LoggingConfig> for LogConfig {
  fn from(config: &LoggingConfig) -> Self {
    Self {
      level: config.level.clone(),
      file: config.file.then(default_log_path).flatten(),
    }
  }
}

/// `$XDG_DATA_HOME/synq/synq.log`
pub fn default_log_path() -> Option<PathBuf> {
  dirs::data_dir().map(|dir| dir.join("synq").join("synq.log"))
}

#[derive(Debug, Error)]
pub enum InitError {
  #[error("failed to open log file {path:?}: {source}")]
  Io {
    path: PathBuf,
    source: std::io::Error,
  },
  #[error("invalid log filter '{0}'")]
  Filter(String),
  #[error("failed to install subscriber: {0}")]
  Install(String),
}

static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Install the global subscriber. Later calls are no-ops.
///
/// The log writer runs on a background thread that is flushed when the
/// process exits.
pub fn init(config: &LogConfig) -> Result<(), InitError> {
  if GUARD.get().is_some() {
    return Ok(());
  }

  let directives = std::env::var(LOG_ENV).unwrap_or_else(|_| config.level.clone());
  let filter = EnvFilter::try_new(&directives).map_err(|_| InitError::Filter(directives.clone()))?;

  let (writer, guard) = match &config.file {
    Some(path) => {
      if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| InitError::Io {
          path: path.clone(),
          source,
        })?;
      }
      let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| InitError::Io {
          path: path.clone(),
          source,
        })?;
      tracing_appender::non_blocking(file)
    }
    None => tracing_appender::non_blocking(std::io::stderr()),
  };

  let subscriber = tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_target(false)
    .with_ansi(config.file.is_none())
    .with_writer(writer)
    .finish();

  tracing::subscriber::set_global_default(subscriber)
    .map_err(|err| InitError::Install(err.to_string()))?;

  let _ = GUARD.set(guard);
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_file_logging_uses_data_dir() {
    let config = LoggingConfig {
      level: "debug".to_string(),
      file: true,
    };
    let log = LogConfig::from(&config);
    assert_eq!(log.level, "debug");
    assert_eq!(log.file, default_log_path());

    let stderr = LogConfig::from(&LoggingConfig::default());
    assert_eq!(stderr.file, None);
  }
}
