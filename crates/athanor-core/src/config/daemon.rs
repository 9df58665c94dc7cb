use super::retry::BackoffStrategy;
use crate::error::{AthanorError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// How the daemon shares shards with other processes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DaemonMode {
    /// No async daemon runs in this process
    Disabled,
    /// Single known owner, no lock contention
    #[default]
    Solo,
    /// One active node holds the shard-set lock, others stand by
    HotCold,
    /// Several nodes driving the same shards; unsupported
    HotHot,
}

/// High-water detection timing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HighWaterConfig {
    /// Poll interval when the mark is caught up
    /// Default: 1000ms
    #[serde(default = "default_polling_interval_ms")]
    pub polling_interval_ms: u64,

    /// Poll interval while the mark is behind the highest sequence
    /// Default: 250ms
    #[serde(default = "default_fast_polling_ms")]
    pub fast_polling_ms: u64,

    /// How long a gap may hold the mark still before it is treated as abandoned
    /// Default: 3000ms
    #[serde(default = "default_stale_timeout_ms")]
    pub stale_timeout_ms: u64,
}

fn default_polling_interval_ms() -> u64 {
    1000
}

fn default_fast_polling_ms() -> u64 {
    250
}

fn default_stale_timeout_ms() -> u64 {
    3000
}

impl Default for HighWaterConfig {
    fn default() -> Self {
        Self {
            polling_interval_ms: default_polling_interval_ms(),
            fast_polling_ms: default_fast_polling_ms(),
            stale_timeout_ms: default_stale_timeout_ms(),
        }
    }
}

impl HighWaterConfig {
    pub fn polling_interval(&self) -> Duration {
        Duration::from_millis(self.polling_interval_ms)
    }

    pub fn fast_polling(&self) -> Duration {
        Duration::from_millis(self.fast_polling_ms)
    }

    pub fn stale_timeout(&self) -> Duration {
        Duration::from_millis(self.stale_timeout_ms)
    }

    pub fn with_polling_interval_ms(mut self, ms: u64) -> Self {
        self.polling_interval_ms = ms;
        self
    }

    pub fn with_fast_polling_ms(mut self, ms: u64) -> Self {
        self.fast_polling_ms = ms;
        self
    }

    pub fn with_stale_timeout_ms(mut self, ms: u64) -> Self {
        self.stale_timeout_ms = ms;
        self
    }
}

/// Configuration for one projection daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Identifier of the database this daemon projects
    /// Default: "Default"
    #[serde(default = "default_database")]
    pub database: String,

    #[serde(default)]
    pub mode: DaemonMode,

    #[serde(default)]
    pub high_water: HighWaterConfig,

    /// Apply/commit attempts beyond the first before a shard is errored
    /// Default: 3
    #[serde(default = "default_max_commit_retries")]
    pub max_commit_retries: usize,

    #[serde(default)]
    pub retry_backoff: BackoffStrategy,

    /// How often a lock holder verifies it still owns the lock
    /// Default: 1000ms
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,

    /// How often a standby node polls for the lock
    /// Default: 5000ms
    #[serde(default = "default_leadership_polling_ms")]
    pub leadership_polling_ms: u64,

    /// Poll interval of `wait_for_non_stale_data`
    /// Default: 100ms
    #[serde(default = "default_non_stale_polling_ms")]
    pub non_stale_polling_ms: u64,
}

fn default_database() -> String {
    "Default".to_string()
}

fn default_max_commit_retries() -> usize {
    3
}

fn default_health_check_interval_ms() -> u64 {
    1000
}

fn default_leadership_polling_ms() -> u64 {
    5000
}

fn default_non_stale_polling_ms() -> u64 {
    100
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            database: default_database(),
            mode: DaemonMode::default(),
            high_water: HighWaterConfig::default(),
            max_commit_retries: default_max_commit_retries(),
            retry_backoff: BackoffStrategy::default(),
            health_check_interval_ms: default_health_check_interval_ms(),
            leadership_polling_ms: default_leadership_polling_ms(),
            non_stale_polling_ms: default_non_stale_polling_ms(),
        }
    }
}

impl DaemonConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from a JSON file; missing fields take their defaults
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = std::fs::read(path.as_ref())?;
        let config: DaemonConfig = serde_json::from_slice(&bytes)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = database.into();
        self
    }

    pub fn with_mode(mut self, mode: DaemonMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_high_water(mut self, high_water: HighWaterConfig) -> Self {
        self.high_water = high_water;
        self
    }

    pub fn with_max_commit_retries(mut self, retries: usize) -> Self {
        self.max_commit_retries = retries;
        self
    }

    pub fn with_retry_backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn with_health_check_interval_ms(mut self, ms: u64) -> Self {
        self.health_check_interval_ms = ms;
        self
    }

    pub fn with_leadership_polling_ms(mut self, ms: u64) -> Self {
        self.leadership_polling_ms = ms;
        self
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn leadership_polling(&self) -> Duration {
        Duration::from_millis(self.leadership_polling_ms)
    }

    pub fn non_stale_polling(&self) -> Duration {
        Duration::from_millis(self.non_stale_polling_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.database.trim().is_empty() {
            return Err(AthanorError::Config("database must not be empty".into()));
        }
        if self.mode == DaemonMode::HotHot {
            return Err(AthanorError::Config(
                "HotHot mode is not supported: a shard may only be driven by one node at a time"
                    .into(),
            ));
        }
        if self.high_water.polling_interval_ms == 0 || self.high_water.fast_polling_ms == 0 {
            return Err(AthanorError::Config(
                "high-water polling intervals must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DaemonConfig::default();
        assert_eq!(config.database, "Default");
        assert_eq!(config.mode, DaemonMode::Solo);
        assert_eq!(config.high_water.stale_timeout(), Duration::from_secs(3));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_hot_hot_rejected() {
        let config = DaemonConfig::default().with_mode(DaemonMode::HotHot);
        assert!(matches!(config.validate(), Err(AthanorError::Config(_))));
    }

    #[test]
    fn test_partial_json() {
        let config: DaemonConfig =
            serde_json::from_str(r#"{"mode":"HotCold","high_water":{"stale_timeout_ms":500}}"#)
                .unwrap();
        assert_eq!(config.mode, DaemonMode::HotCold);
        assert_eq!(config.high_water.stale_timeout_ms, 500);
        assert_eq!(config.high_water.polling_interval_ms, 1000);
        assert_eq!(config.max_commit_retries, 3);
    }
}
