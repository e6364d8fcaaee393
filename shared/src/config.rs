use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_MIN_CHECK_INTERVAL_MS: u64 = 3_000;
pub const DEFAULT_MAX_RETRY_COUNT: u32 = 3;
pub const DEFAULT_PROBE_TIMEOUT_MS: u64 = 2_000;
pub const DEFAULT_INTERNET_CHECK_TIMEOUT_MS: u64 = 2_500;
pub const DEFAULT_BACKEND_CHECK_TIMEOUT_MS: u64 = 4_000;
pub const DEFAULT_NOTIFICATION_SUPPRESSION_WINDOW_MS: u64 = 60_000;
pub const DEFAULT_MONITOR_INTERVAL_MS: u64 = 30_000;
pub const DEFAULT_OFFLINE_DATA_TTL_MS: u64 = 30 * 24 * 60 * 60 * 1000;
pub const DEFAULT_MAX_QUEUE_ENTRIES: usize = 10_000;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("failed to parse configuration: {0}")]
    Parse(String),
}

/// Tunables for probing, replay and notification policy.
///
/// Every timing parameter is injectable so tests can run against paused
/// timers and a manual clock.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OfflineConfig {
    pub min_check_interval_ms: u64,
    pub max_retry_count: u32,
    pub probe_timeout_ms: u64,
    pub internet_check_timeout_ms: u64,
    pub backend_check_timeout_ms: u64,
    pub notification_suppression_window_ms: u64,
    /// Development switch: report connected without issuing any probe.
    pub probing_disabled: bool,
    pub primary_backend_resource: String,
    pub fallback_backend_resource: String,
    pub monitor_interval_ms: u64,
    pub offline_data_ttl_ms: u64,
    pub max_queue_entries: usize,
}

impl Default for OfflineConfig {
    fn default() -> Self {
        Self {
            min_check_interval_ms: DEFAULT_MIN_CHECK_INTERVAL_MS,
            max_retry_count: DEFAULT_MAX_RETRY_COUNT,
            probe_timeout_ms: DEFAULT_PROBE_TIMEOUT_MS,
            internet_check_timeout_ms: DEFAULT_INTERNET_CHECK_TIMEOUT_MS,
            backend_check_timeout_ms: DEFAULT_BACKEND_CHECK_TIMEOUT_MS,
            notification_suppression_window_ms: DEFAULT_NOTIFICATION_SUPPRESSION_WINDOW_MS,
            probing_disabled: false,
            primary_backend_resource: "health_check".to_string(),
            fallback_backend_resource: "profiles".to_string(),
            monitor_interval_ms: DEFAULT_MONITOR_INTERVAL_MS,
            offline_data_ttl_ms: DEFAULT_OFFLINE_DATA_TTL_MS,
            max_queue_entries: DEFAULT_MAX_QUEUE_ENTRIES,
        }
    }
}

impl OfflineConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_retry_count == 0 {
            return Err(ConfigError::Invalid("max_retry_count must be > 0".into()));
        }
        if self.probe_timeout_ms == 0 {
            return Err(ConfigError::Invalid("probe_timeout_ms must be > 0".into()));
        }
        if self.internet_check_timeout_ms < self.probe_timeout_ms {
            return Err(ConfigError::Invalid(format!(
                "internet_check_timeout_ms ({}) must be >= probe_timeout_ms ({})",
                self.internet_check_timeout_ms, self.probe_timeout_ms
            )));
        }
        if self.backend_check_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "backend_check_timeout_ms must be > 0".into(),
            ));
        }
        if self.monitor_interval_ms == 0 {
            return Err(ConfigError::Invalid("monitor_interval_ms must be > 0".into()));
        }
        if self.max_queue_entries == 0 {
            return Err(ConfigError::Invalid("max_queue_entries must be > 0".into()));
        }
        if self.primary_backend_resource.trim().is_empty()
            || self.fallback_backend_resource.trim().is_empty()
        {
            return Err(ConfigError::Invalid(
                "backend resource names cannot be empty".into(),
            ));
        }
        Ok(())
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn internet_check_timeout(&self) -> Duration {
        Duration::from_millis(self.internet_check_timeout_ms)
    }

    pub fn backend_check_timeout(&self) -> Duration {
        Duration::from_millis(self.backend_check_timeout_ms)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }
}
