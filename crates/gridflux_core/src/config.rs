use crate::GridError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GridConfig {
    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub batch: BatchConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Failed attempts tolerated before a mutation is dropped.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay before the first retry; doubled on each further failure.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Upper bound on a single executor call. A timeout counts as a failed attempt.
    #[serde(default = "default_execute_timeout_ms")]
    pub execute_timeout_ms: u64,

    /// Settled mutations the tracker keeps for inspection. Older ones are pruned.
    #[serde(default = "default_tracker_retention")]
    pub tracker_retention: usize,
}

fn default_max_retries() -> u32 {
    5
}

fn default_retry_backoff_ms() -> u64 {
    50
}

fn default_max_backoff_ms() -> u64 {
    2_000
}

fn default_execute_timeout_ms() -> u64 {
    30_000
}

fn default_tracker_retention() -> usize {
    256
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            execute_timeout_ms: default_execute_timeout_ms(),
            tracker_retention: default_tracker_retention(),
        }
    }
}

impl QueueConfig {
    /// Retries immediately, as in-process tests expect.
    pub fn immediate() -> Self {
        Self {
            retry_backoff_ms: 0,
            max_backoff_ms: 0,
            ..Self::default()
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    pub fn execute_timeout(&self) -> Duration {
        Duration::from_millis(self.execute_timeout_ms)
    }

    /// Delay after the given number of failed attempts (1-based).
    pub fn backoff(&self, failed_attempts: u32) -> Duration {
        if self.retry_backoff_ms == 0 || failed_attempts == 0 {
            return Duration::ZERO;
        }

        let exponent = failed_attempts.saturating_sub(1).min(16);
        let delay = self.retry_backoff_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(delay.min(self.max_backoff_ms))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchConfig {
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
}

fn default_flush_interval_ms() -> u64 {
    300
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: default_flush_interval_ms(),
        }
    }
}

impl BatchConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms.max(1))
    }
}

pub struct GridConfigStore {
    path: PathBuf,
}

impl GridConfigStore {
    pub fn new() -> Result<Self, GridError> {
        let config_dir = dirs::config_dir().ok_or_else(|| {
            GridError::IoError(std::io::Error::other("Could not find config directory"))
        })?;

        let app_dir = config_dir.join("gridflux");
        fs::create_dir_all(&app_dir).map_err(GridError::IoError)?;

        Ok(Self {
            path: app_dir.join("config.json"),
        })
    }

    pub fn from_path(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn load(&self) -> Result<GridConfig, GridError> {
        if !self.path.exists() {
            log::debug!("No config at {:?}, using defaults", self.path);
            return Ok(GridConfig::default());
        }

        let content = fs::read_to_string(&self.path).map_err(GridError::IoError)?;
        let config: GridConfig =
            serde_json::from_str(&content).map_err(|e| GridError::InvalidConfig(e.to_string()))?;

        Ok(config)
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_allow_six_attempts() {
        let config = QueueConfig::default();
        assert_eq!(config.max_attempts(), 6);
        assert_eq!(BatchConfig::default().flush_interval(), Duration::from_millis(300));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let config = QueueConfig {
            retry_backoff_ms: 100,
            max_backoff_ms: 350,
            ..QueueConfig::default()
        };

        assert_eq!(config.backoff(1), Duration::from_millis(100));
        assert_eq!(config.backoff(2), Duration::from_millis(200));
        assert_eq!(config.backoff(3), Duration::from_millis(350));
        assert_eq!(QueueConfig::immediate().backoff(4), Duration::ZERO);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let config: GridConfig =
            serde_json::from_str(r#"{"queue":{"max_retries":2},"batch":{}}"#).unwrap();

        assert_eq!(config.queue.max_retries, 2);
        assert_eq!(config.queue.execute_timeout_ms, 30_000);
        assert_eq!(config.queue.tracker_retention, 256);
        assert_eq!(config.batch.flush_interval_ms, 300);
    }

    #[test]
    fn missing_file_loads_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = GridConfigStore::from_path(dir.path().join("config.json"));

        assert_eq!(store.load().unwrap(), GridConfig::default());
    }

    #[test]
    fn malformed_file_is_invalid_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{ not json").unwrap();

        let result = GridConfigStore::from_path(path).load();

        assert!(matches!(result, Err(GridError::InvalidConfig(_))));
    }
}
