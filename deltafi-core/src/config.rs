//! Runtime configuration for the execution core.
//!
//! Every field has a default, so a partial JSON document or an empty one is
//! a valid configuration. Environment variables override the file.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

use crate::orchestrator::ConflictRetryConfig;

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("Unable to read config file {path}: {source}")]
    Read {
        /// The path that failed.
        path: String,
        /// The underlying error.
        source: std::io::Error,
    },

    /// The configuration file is not valid JSON for [`CoreConfig`].
    #[error("Invalid config: {0}")]
    Parse(#[from] serde_json::Error),

    /// An environment override could not be parsed.
    #[error("Invalid value {value:?} for {key}")]
    InvalidEnv {
        /// The variable name.
        key: &'static str,
        /// The rejected value.
        value: String,
    },

    /// The configuration is internally inconsistent.
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Logging output settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directive, e.g. `info` or `deltafi_core=debug`.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// Intervals of the background maintenance tasks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceConfig {
    /// How often queue depths are re-read.
    #[serde(default = "default_queue_refresh_interval_ms")]
    pub queue_refresh_interval_ms: u64,
    /// How often cold-queued work is considered for promotion.
    #[serde(default = "default_cold_to_warm_interval_ms")]
    pub cold_to_warm_interval_ms: u64,
    /// How often due auto-resumes are re-queued.
    #[serde(default = "default_auto_resume_interval_ms")]
    pub auto_resume_interval_ms: u64,
    /// How often stale `QUEUED` attempts are re-dispatched.
    #[serde(default = "default_requeue_interval_ms")]
    pub requeue_interval_ms: u64,
}

fn default_queue_refresh_interval_ms() -> u64 {
    2000
}

fn default_cold_to_warm_interval_ms() -> u64 {
    2000
}

fn default_auto_resume_interval_ms() -> u64 {
    1000
}

fn default_requeue_interval_ms() -> u64 {
    5000
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            queue_refresh_interval_ms: default_queue_refresh_interval_ms(),
            cold_to_warm_interval_ms: default_cold_to_warm_interval_ms(),
            auto_resume_interval_ms: default_auto_resume_interval_ms(),
            requeue_interval_ms: default_requeue_interval_ms(),
        }
    }
}

fn default_in_memory_queue_size() -> usize {
    5000
}

fn default_worker_concurrency() -> usize {
    16
}

fn default_max_flow_depth() -> usize {
    32
}

fn default_insert_batch_size() -> usize {
    500
}

fn default_requeue_duration_ms() -> u64 {
    300_000
}

/// Configuration for the execution core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Queue depth above which a queue is cold.
    #[serde(default = "default_in_memory_queue_size")]
    pub in_memory_queue_size: usize,
    /// Worker events handled concurrently.
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,
    /// Deepest successor flow that may be attached.
    #[serde(default = "default_max_flow_depth")]
    pub max_flow_depth: usize,
    /// Split children inserted per batch.
    #[serde(default = "default_insert_batch_size")]
    pub insert_batch_size: usize,
    /// Age after which a `QUEUED` attempt with no result is dispatched again.
    #[serde(default = "default_requeue_duration_ms")]
    pub requeue_duration_ms: u64,
    /// Optimistic concurrency retry settings.
    #[serde(default)]
    pub conflict_retry: ConflictRetryConfig,
    /// Background task intervals.
    #[serde(default)]
    pub maintenance: MaintenanceConfig,
    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            in_memory_queue_size: default_in_memory_queue_size(),
            worker_concurrency: default_worker_concurrency(),
            max_flow_depth: default_max_flow_depth(),
            insert_batch_size: default_insert_batch_size(),
            requeue_duration_ms: default_requeue_duration_ms(),
            conflict_retry: ConflictRetryConfig::default(),
            maintenance: MaintenanceConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl CoreConfig {
    /// Loads configuration from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Applies `DELTAFI_*` environment overrides.
    pub fn apply_env_overrides(self) -> Result<Self, ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides(
        mut self,
        lookup: impl Fn(&'static str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(value) = parse_override(&lookup, "DELTAFI_IN_MEMORY_QUEUE_SIZE")? {
            self.in_memory_queue_size = value;
        }
        if let Some(value) = parse_override(&lookup, "DELTAFI_WORKER_CONCURRENCY")? {
            self.worker_concurrency = value;
        }
        if let Some(value) = parse_override(&lookup, "DELTAFI_REQUEUE_DURATION_MS")? {
            self.requeue_duration_ms = value;
        }
        if let Some(level) = lookup("DELTAFI_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(json) = parse_override(&lookup, "DELTAFI_LOG_JSON")? {
            self.logging.json = json;
        }
        self.validate()?;
        Ok(self)
    }

    /// Rejects settings the core cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_concurrency == 0 {
            return Err(ConfigError::Invalid("worker_concurrency must be at least 1".into()));
        }
        if self.insert_batch_size == 0 {
            return Err(ConfigError::Invalid("insert_batch_size must be at least 1".into()));
        }
        if self.conflict_retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "conflict_retry.max_attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Sets the cold-queue threshold.
    #[must_use]
    pub fn with_in_memory_queue_size(mut self, size: usize) -> Self {
        self.in_memory_queue_size = size;
        self
    }

    /// Sets the worker event concurrency.
    #[must_use]
    pub fn with_worker_concurrency(mut self, concurrency: usize) -> Self {
        self.worker_concurrency = concurrency;
        self
    }

    /// Sets the successor depth limit.
    #[must_use]
    pub fn with_max_flow_depth(mut self, depth: usize) -> Self {
        self.max_flow_depth = depth;
        self
    }

    /// Sets how long a `QUEUED` attempt may wait before it is re-dispatched.
    #[must_use]
    pub fn with_requeue_duration_ms(mut self, duration_ms: u64) -> Self {
        self.requeue_duration_ms = duration_ms;
        self
    }

    /// Sets the conflict retry settings.
    #[must_use]
    pub fn with_conflict_retry(mut self, retry: ConflictRetryConfig) -> Self {
        self.conflict_retry = retry;
        self
    }

    /// Sets the maintenance intervals.
    #[must_use]
    pub fn with_maintenance(mut self, maintenance: MaintenanceConfig) -> Self {
        self.maintenance = maintenance;
        self
    }
}

fn parse_override<T: FromStr>(
    lookup: &impl Fn(&'static str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError> {
    lookup(key)
        .map(|value| {
            value
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidEnv { key, value })
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;
    use std::io::Write;

    fn lookup(vars: &[(&'static str, &str)]) -> impl Fn(&'static str) -> Option<String> {
        let vars: HashMap<&'static str, String> =
            vars.iter().map(|(k, v)| (*k, (*v).to_string())).collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = CoreConfig::default();
        assert_eq!(config.in_memory_queue_size, 5000);
        assert_eq!(config.worker_concurrency, 16);
        assert_eq!(config.max_flow_depth, 32);
        assert_eq!(config.insert_batch_size, 500);
        assert_eq!(config.maintenance.auto_resume_interval_ms, 1000);
        assert_eq!(config.maintenance.requeue_interval_ms, 5000);
        assert_eq!(config.requeue_duration_ms, 300_000);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"in_memory_queue_size": 10, "conflict_retry": {{"max_attempts": 5}}, "logging": {{"json": true}}}}"#
        )
        .unwrap();

        let config = CoreConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.in_memory_queue_size, 10);
        assert_eq!(config.conflict_retry.max_attempts, 5);
        assert_eq!(config.conflict_retry.base_delay_ms, 5);
        assert!(config.logging.json);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.worker_concurrency, 16);
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = CoreConfig::from_json_file(dir.path().join("absent.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_malformed_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{not json").unwrap();
        let err = CoreConfig::from_json_file(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_env_overrides() {
        let config = CoreConfig::default()
            .apply_overrides(lookup(&[
                ("DELTAFI_IN_MEMORY_QUEUE_SIZE", "42"),
                ("DELTAFI_WORKER_CONCURRENCY", " 4 "),
                ("DELTAFI_LOG_LEVEL", "debug"),
                ("DELTAFI_LOG_JSON", "true"),
                ("DELTAFI_REQUEUE_DURATION_MS", "60000"),
            ]))
            .unwrap();
        assert_eq!(config.in_memory_queue_size, 42);
        assert_eq!(config.requeue_duration_ms, 60_000);
        assert_eq!(config.worker_concurrency, 4);
        assert_eq!(config.logging.level, "debug");
        assert!(config.logging.json);
    }

    #[test]
    fn test_invalid_env_override() {
        let err = CoreConfig::default()
            .apply_overrides(lookup(&[("DELTAFI_WORKER_CONCURRENCY", "many")]))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidEnv {
                key: "DELTAFI_WORKER_CONCURRENCY",
                ..
            }
        ));

        let err = CoreConfig::default()
            .apply_overrides(lookup(&[("DELTAFI_WORKER_CONCURRENCY", "0")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }
}
