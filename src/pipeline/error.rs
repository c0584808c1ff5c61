//! Error taxonomy for the tiering pipeline
//!
//! `StoreError` is what a backing store (event log, hot tier, durable tier)
//! reports. `PipelineError` is what the pipeline tasks act on: each variant
//! maps to one recovery policy (skip, retry with backoff, retry next sweep,
//! or halt the task).

use super::types::DayKey;

/// Failure reported by one of the backing stores
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A connection mutex was poisoned by a panicking holder
    #[error("{0} connection lock poisoned")]
    Poisoned(&'static str),

    /// Stored data could not be decoded back into domain types
    #[error("corrupt stored value: {0}")]
    Corrupt(String),

    /// Store unreachable (used by remote/fault-injecting backends)
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Hot tier already holds positions from a different event log
    #[error("hot store is bound to event log {bound:016x}, refusing records from {found:016x}")]
    LogMismatch { bound: i64, found: i64 },
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Which tier or log an error originated from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    EventLog,
    Hot,
    Durable,
}

impl std::fmt::Display for StoreKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreKind::EventLog => write!(f, "event log"),
            StoreKind::Hot => write!(f, "hot"),
            StoreKind::Durable => write!(f, "durable"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Malformed source record: logged, skipped, stream continues
    #[error("malformed source record at line {line}: {reason}")]
    SourceRecord { line: u64, reason: String },

    /// Event log append kept failing after bounded retries (fatal for ingestion)
    #[error("event log append failed after {attempts} attempts: {source}")]
    LogAppend {
        attempts: u32,
        #[source]
        source: StoreError,
    },

    #[error("{store} store unavailable: {source}")]
    StoreUnavailable {
        store: StoreKind,
        #[source]
        source: StoreError,
    },

    /// Durable write was not acknowledged; retried next sweep
    #[error("migration of {day} not confirmed (token {token}): {reason}")]
    MigrationConfirm {
        day: DayKey,
        token: String,
        reason: String,
    },

    /// Durable write confirmed but hot-tier removal failed; day stays tracked
    #[error("hot-tier delete for {day} failed after confirmed upsert: {reason}")]
    MigrationDelete { day: DayKey, reason: String },

    #[error("invalid range: from {from} is after to {to}")]
    InvalidRange { from: DayKey, to: DayKey },

    #[error("configuration error: {0}")]
    Config(#[from] super::config::ConfigError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    pub fn hot(source: StoreError) -> Self {
        PipelineError::StoreUnavailable {
            store: StoreKind::Hot,
            source,
        }
    }

    pub fn durable(source: StoreError) -> Self {
        PipelineError::StoreUnavailable {
            store: StoreKind::Durable,
            source,
        }
    }

    pub fn event_log(source: StoreError) -> Self {
        PipelineError::StoreUnavailable {
            store: StoreKind::EventLog,
            source,
        }
    }
}
