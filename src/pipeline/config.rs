//! Pipeline configuration from environment variables
//!
//! The host loads this once at startup (after `dotenv`) and passes the
//! individual values into each task.

use std::env;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration value: {0}")]
    InvalidValue(String),
}

/// Configuration for the tiering runtime
///
/// Loaded from environment variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct TieringConfig {
    /// Path to the SQLite event log database
    pub event_log_path: String,

    /// Path to the hot tier SQLite database
    pub hot_db_path: String,

    /// Path to the durable tier SQLite database
    pub durable_db_path: String,

    /// Pre-sorted transaction CSV fed by the ingestion producer
    pub source_csv_path: String,

    /// Days a day's data stays hot before it becomes migration-eligible
    pub retention_days: u32,

    /// Migration sweep interval in milliseconds
    pub migration_interval_ms: u64,

    /// Records per event log append
    pub ingest_batch_size: usize,

    /// Per-record pacing delay in milliseconds (0 disables pacing)
    pub ingest_pacing_ms: u64,

    /// Max records per aggregation fetch
    pub consumer_batch_size: usize,

    /// Bounded wait for a blocking log read, in milliseconds
    pub consumer_poll_timeout_ms: u64,

    /// Consecutive failed sweeps before a day is reported as stuck
    pub stuck_sweep_threshold: u32,

    /// Log append retries before ingestion gives up
    pub log_append_max_retries: u32,
}

impl Default for TieringConfig {
    fn default() -> Self {
        Self {
            event_log_path: "data/event_log.db".to_string(),
            hot_db_path: "data/hot.db".to_string(),
            durable_db_path: "data/durable.db".to_string(),
            source_csv_path: "data/sorted_transactions.csv".to_string(),
            retention_days: 7,
            migration_interval_ms: 10_000,
            ingest_batch_size: 10,
            ingest_pacing_ms: 0,
            consumer_batch_size: 50,
            consumer_poll_timeout_ms: 5_000,
            stuck_sweep_threshold: 5,
            log_append_max_retries: 5,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                log::warn!("Invalid {} '{}', using default", key, raw);
                default
            }
        },
        Err(_) => default,
    }
}

impl TieringConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `LEDGERFLOW_EVENT_LOG_PATH` (default: data/event_log.db)
    /// - `LEDGERFLOW_HOT_DB_PATH` (default: data/hot.db)
    /// - `LEDGERFLOW_DURABLE_DB_PATH` (default: data/durable.db)
    /// - `SOURCE_CSV_PATH` (default: data/sorted_transactions.csv)
    /// - `RETENTION_DAYS` (default: 7)
    /// - `MIGRATION_INTERVAL_MS` (default: 10000)
    /// - `INGEST_BATCH_SIZE` (default: 10)
    /// - `INGEST_PACING_MS` (default: 0)
    /// - `CONSUMER_BATCH_SIZE` (default: 50)
    /// - `CONSUMER_POLL_TIMEOUT_MS` (default: 5000)
    /// - `STUCK_SWEEP_THRESHOLD` (default: 5)
    /// - `LOG_APPEND_MAX_RETRIES` (default: 5)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            event_log_path: env::var("LEDGERFLOW_EVENT_LOG_PATH").unwrap_or(defaults.event_log_path),
            hot_db_path: env::var("LEDGERFLOW_HOT_DB_PATH").unwrap_or(defaults.hot_db_path),
            durable_db_path: env::var("LEDGERFLOW_DURABLE_DB_PATH").unwrap_or(defaults.durable_db_path),
            source_csv_path: env::var("SOURCE_CSV_PATH").unwrap_or(defaults.source_csv_path),
            retention_days: env_parse("RETENTION_DAYS", defaults.retention_days),
            migration_interval_ms: env_parse("MIGRATION_INTERVAL_MS", defaults.migration_interval_ms),
            ingest_batch_size: env_parse("INGEST_BATCH_SIZE", defaults.ingest_batch_size),
            ingest_pacing_ms: env_parse("INGEST_PACING_MS", defaults.ingest_pacing_ms),
            consumer_batch_size: env_parse("CONSUMER_BATCH_SIZE", defaults.consumer_batch_size),
            consumer_poll_timeout_ms: env_parse("CONSUMER_POLL_TIMEOUT_MS", defaults.consumer_poll_timeout_ms),
            stuck_sweep_threshold: env_parse("STUCK_SWEEP_THRESHOLD", defaults.stuck_sweep_threshold),
            log_append_max_retries: env_parse("LOG_APPEND_MAX_RETRIES", defaults.log_append_max_retries),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ingest_batch_size == 0 {
            return Err(ConfigError::InvalidValue("INGEST_BATCH_SIZE must be at least 1".to_string()));
        }
        if self.consumer_batch_size == 0 {
            return Err(ConfigError::InvalidValue("CONSUMER_BATCH_SIZE must be at least 1".to_string()));
        }
        if self.migration_interval_ms == 0 {
            return Err(ConfigError::InvalidValue("MIGRATION_INTERVAL_MS must be positive".to_string()));
        }
        if self.consumer_poll_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue("CONSUMER_POLL_TIMEOUT_MS must be positive".to_string()));
        }
        if self.stuck_sweep_threshold == 0 {
            return Err(ConfigError::InvalidValue("STUCK_SWEEP_THRESHOLD must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn migration_interval(&self) -> Duration {
        Duration::from_millis(self.migration_interval_ms)
    }

    pub fn ingest_pacing(&self) -> Option<Duration> {
        (self.ingest_pacing_ms > 0).then(|| Duration::from_millis(self.ingest_pacing_ms))
    }

    pub fn consumer_poll_timeout(&self) -> Duration {
        Duration::from_millis(self.consumer_poll_timeout_ms)
    }
}
