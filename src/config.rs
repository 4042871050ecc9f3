//! Configuration loader and validator for the sync engine.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::backoff::Backoff;
use crate::coordinator::CoordinatorSettings;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    #[serde(default)]
    pub sync: SyncPolicy,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
}

/// Queue draining and retry policy.
///
/// `max_retries` and `backoff_base_secs` shape how the queue is read, so the
/// inspection CLI honours them. The remaining fields only matter to an
/// application that embeds a [`SyncCoordinator`](crate::coordinator::SyncCoordinator)
/// and [`SyncWorker`](crate::worker::SyncWorker); hand them over through
/// [`SyncPolicy::coordinator_settings`] and [`SyncPolicy::poll_interval`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SyncPolicy {
    pub max_retries: i32,
    pub backoff_base_secs: u64,
    /// Per-action remote timeout of an embedded coordinator.
    pub apply_timeout_ms: u64,
    /// Tick interval of an embedded worker.
    pub poll_interval_ms: u64,
    /// Actions attempted per tick by an embedded coordinator; 0 = unlimited.
    pub batch_limit: usize,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self {
            max_retries: crate::backoff::DEFAULT_MAX_RETRIES,
            backoff_base_secs: 60,
            apply_timeout_ms: 30_000,
            poll_interval_ms: 60_000,
            batch_limit: 0,
        }
    }
}

impl SyncPolicy {
    pub fn backoff(&self) -> Backoff {
        let secs = i64::try_from(self.backoff_base_secs).unwrap_or(i64::MAX);
        Backoff::new(chrono::Duration::try_seconds(secs).unwrap_or(chrono::Duration::MAX))
    }

    pub fn coordinator_settings(&self) -> CoordinatorSettings {
        CoordinatorSettings {
            max_retries: self.max_retries,
            apply_timeout: Duration::from_millis(self.apply_timeout_ms),
            batch_limit: self.batch_limit,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    /// `DATABASE_URL` wins; otherwise a file under `app.data_dir`.
    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| self.default_database_url())
    }

    pub fn default_database_url(&self) -> String {
        format!(
            "sqlite://{}/fintrack-sync.db",
            self.app.data_dir.trim_end_matches('/')
        )
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.sync.max_retries < 1 {
        return Err(ConfigError::Invalid("sync.max_retries must be >= 1"));
    }
    if cfg.sync.backoff_base_secs == 0 {
        return Err(ConfigError::Invalid("sync.backoff_base_secs must be > 0"));
    }
    if cfg.sync.apply_timeout_ms == 0 {
        return Err(ConfigError::Invalid("sync.apply_timeout_ms must be > 0"));
    }
    if cfg.sync.poll_interval_ms == 0 {
        return Err(ConfigError::Invalid("sync.poll_interval_ms must be > 0"));
    }
    // batch_limit is usize; 0 means unlimited

    Ok(())
}

/// Returns the example YAML shipped with the binary.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"

sync:
  max_retries: 5
  backoff_base_secs: 60
  # Used by an embedded coordinator/worker, not by the CLI.
  apply_timeout_ms: 30000
  poll_interval_ms: 60000
  batch_limit: 0          # 0 = unlimited
"#
}
