//! Tiering Runtime
//!
//! Runs the whole pipeline in one process on a single-threaded runtime:
//! - Opens the event log, hot store and durable store (SQLite, one file each)
//! - Spawns ingestion (CSV -> event log), aggregation (event log -> hot tier)
//!   and the migration scheduler (hot tier -> durable tier)
//! - On CTRL+C, broadcasts shutdown; every task finishes its current unit
//!   of work before stopping
//!
//! Usage:
//!   cargo run --release --bin tiering_runtime
//!
//! See `TieringConfig::from_env` for environment variables.

use dotenv::dotenv;
use ledgerflow::pipeline::{
    AggregationConsumer, CsvTransactionSource, DurableStore, EventLog, HotStore, IngestionProducer,
    MigrationScheduler, PipelineError, RetentionPolicy, SqliteDurableStore, SqliteEventLog, SqliteHotStore,
    TieringConfig,
};
use log::{error, info, warn};
use std::sync::Arc;
use tokio::sync::watch;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    info!("🚀 Tiering Runtime");

    let config = TieringConfig::from_env();
    config.validate().map_err(PipelineError::from)?;

    info!("📊 Configuration:");
    info!("   ├─ Event log: {}", config.event_log_path);
    info!("   ├─ Hot store: {}", config.hot_db_path);
    info!("   ├─ Durable store: {}", config.durable_db_path);
    info!("   ├─ Source: {}", config.source_csv_path);
    info!("   ├─ Retention: {} days", config.retention_days);
    info!("   ├─ Migration interval: {}ms", config.migration_interval_ms);
    info!("   └─ Ingest batch: {} (pacing {}ms)", config.ingest_batch_size, config.ingest_pacing_ms);

    // Event log unreachable at startup means no forward progress is possible
    let event_log: Arc<dyn EventLog> = Arc::new(SqliteEventLog::open(&config.event_log_path)?);
    let hot: Arc<dyn HotStore> = Arc::new(SqliteHotStore::open(&config.hot_db_path)?);
    let durable: Arc<dyn DurableStore> = Arc::new(SqliteDurableStore::open(&config.durable_db_path)?);
    info!("✅ Stores opened");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Task 1: Ingestion
    let ingestion = match CsvTransactionSource::open(&config.source_csv_path) {
        Ok(source) => {
            let producer = IngestionProducer::new(
                event_log.clone(),
                config.ingest_batch_size,
                config.ingest_pacing(),
                config.log_append_max_retries,
            );
            let rx = shutdown_rx.clone();
            Some(tokio::spawn(async move { producer.run(source.records(), rx).await }))
        }
        Err(e) => {
            warn!("⚠️  Ingestion disabled: {}", e);
            None
        }
    };

    // Task 2: Aggregation
    let consumer = AggregationConsumer::new(
        event_log.clone(),
        hot.clone(),
        config.consumer_batch_size,
        config.consumer_poll_timeout(),
    );
    let aggregation = tokio::spawn(consumer.run(shutdown_rx.clone()));

    // Task 3: Migration
    let scheduler = MigrationScheduler::new(
        hot.clone(),
        durable.clone(),
        RetentionPolicy::new(config.retention_days),
        config.migration_interval(),
        config.stuck_sweep_threshold,
    );
    let migration = tokio::spawn(scheduler.run(shutdown_rx.clone()));

    info!("✅ All background tasks running");
    info!("🔄 Press CTRL+C to shutdown gracefully");

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("⚠️  Received CTRL+C, shutting down..."),
        Err(err) => error!("❌ Failed to listen for CTRL+C: {}", err),
    }

    let _ = shutdown_tx.send(true);

    if let Some(handle) = ingestion {
        match handle.await {
            Ok(Ok(report)) => info!("   ├─ Ingestion: {} published, {} skipped", report.published, report.skipped),
            Ok(Err(e)) => error!("   ├─ ❌ Ingestion failed: {}", e),
            Err(e) => error!("   ├─ ❌ Ingestion task panicked: {}", e),
        }
    }

    match aggregation.await {
        Ok(Ok(report)) => info!("   ├─ Aggregation: {} applied (clock: {:?})", report.applied, report.clock),
        Ok(Err(e)) => error!("   ├─ ❌ Aggregation failed: {}", e),
        Err(e) => error!("   ├─ ❌ Aggregation task panicked: {}", e),
    }

    match migration.await {
        Ok(stats) => {
            info!("   └─ Migration: {} days migrated over {} sweeps", stats.days_migrated, stats.sweeps);
            let stuck = stats.stuck_days();
            if !stuck.is_empty() {
                error!("❌ Days needing repair (stuck in hot tier): {:?}", stuck);
            }
        }
        Err(e) => error!("   └─ ❌ Migration task panicked: {}", e),
    }

    info!("✅ Tiering runtime stopped");
    Ok(())
}
