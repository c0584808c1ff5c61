//! # Hot/Cold Tiering Pipeline
//!
//! Ingests a time-ordered stream of financial transactions, keeps per-day
//! aggregates in a low-latency hot tier, and migrates days older than the
//! retention window into a durable tier. Range queries merge both tiers.
//!
//! ## Architecture
//!
//! ```text
//! source ─► IngestionProducer ─► EventLog ─► AggregationConsumer ─► HotStore
//!                                                                    │  ▲
//!                                                  MigrationScheduler│  │
//!                                                                    ▼  │
//!                                        RangeMerger ◄─────────── DurableStore
//! ```
//!
//! **Key Principle:** time is data time. The virtual clock is the highest
//! transaction timestamp aggregated so far, so replaying a month-old dataset
//! produces the same hot/cold transitions as live traffic.
//!
//! Shared scheduling state (virtual clock, tracked days, migration markers)
//! lives in the hot store and is only touched through its atomic
//! operations; tasks never share it through in-process locks.
//!
//! ## Module Organization
//!
//! - `types` - Transaction, DayKey and aggregate maps
//! - `clock` - Virtual clock and retention policy
//! - `event_log` - Append-only log contract + SQLite implementation
//! - `hot_store` - Hot tier contract + SQLite implementation
//! - `durable_store` - Durable tier contract + SQLite implementation
//! - `ingestion` - CSV source and ingestion producer
//! - `aggregation` - Aggregation consumer state machine
//! - `scheduler` - Three-phase migration scheduler
//! - `merger` - Range queries across both tiers
//! - `config` - Environment configuration
//! - `backoff` - Retry policy
//! - `error` - Error taxonomy

pub mod aggregation;
pub mod backoff;
pub mod clock;
pub mod config;
pub mod durable_store;
pub mod error;
pub mod event_log;
pub mod hot_store;
pub mod ingestion;
pub mod merger;
pub mod scheduler;
pub mod types;

// Re-export commonly used types
pub use aggregation::{AggregationConsumer, ConsumerReport};
pub use clock::{RetentionPolicy, VirtualClock};
pub use config::TieringConfig;
pub use durable_store::{DurableStore, SqliteDurableStore};
pub use error::{PipelineError, StoreError};
pub use event_log::{EventLog, SqliteEventLog};
pub use hot_store::{HotStore, SqliteHotStore};
pub use ingestion::{CsvTransactionSource, IngestionProducer, IngestionReport};
pub use merger::RangeMerger;
pub use scheduler::{MigrationScheduler, MigrationStats, SweepReport};
pub use types::{DayKey, DayTotals, RangeResult, Transaction, TransactionType};
