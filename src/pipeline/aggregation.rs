//! Aggregation consumer: event log -> hot tier
//!
//! ```text
//! Idle -> Fetch -> Apply -> Commit -> Idle
//!   \______ shutdown ______/-> Stopped
//! ```
//!
//! - **Fetch**: bounded blocking read, so shutdown is seen promptly when idle
//! - **Apply**: decode in log order and fold the batch into the hot store in
//!   one atomic call (increments, tracked days, virtual clock, applied position)
//! - **Commit**: acknowledge the last log position, then yield to co-resident tasks
//!
//! If the hot store is unavailable the batch is retried with backoff and
//! never acknowledged before it has been applied.
//!
//! Before the first fetch the hot store is bound to the event log instance.
//! A hot store bound to another log halts the consumer: its dedup position
//! would otherwise swallow the new log's records as redeliveries.

use super::backoff::ExponentialBackoff;
use super::clock::VirtualClock;
use super::error::PipelineError;
use super::event_log::{EventLog, LogRecord};
use super::hot_store::HotStore;
use super::types::{LogEntry, Transaction};
use chrono::NaiveDateTime;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug)]
enum ConsumerState {
    Idle,
    Fetch,
    Apply(Vec<LogRecord>),
    Commit { last_position: i64 },
    Stopped,
}

/// Counts reported when the consumer stops
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ConsumerReport {
    pub batches: u64,
    pub applied: u64,
    /// Undecodable payloads, logged and acknowledged
    pub skipped: u64,
    /// Redelivered records the hot store had already applied
    pub deduplicated: u64,
    pub clock: Option<NaiveDateTime>,
}

pub struct AggregationConsumer {
    log: Arc<dyn EventLog>,
    hot: Arc<dyn HotStore>,
    batch_size: usize,
    poll_timeout: Duration,
    clock: VirtualClock,
    backoff: ExponentialBackoff,
    report: ConsumerReport,
}

impl AggregationConsumer {
    pub fn new(log: Arc<dyn EventLog>, hot: Arc<dyn HotStore>, batch_size: usize, poll_timeout: Duration) -> Self {
        Self {
            log,
            hot,
            batch_size: batch_size.max(1),
            poll_timeout,
            clock: VirtualClock::new(),
            backoff: ExponentialBackoff::unbounded(100, 5_000),
            report: ConsumerReport::default(),
        }
    }

    pub fn report(&self) -> ConsumerReport {
        ConsumerReport {
            clock: self.clock.current(),
            ..self.report
        }
    }

    /// Run until shutdown
    ///
    /// Fails when the event log cannot be read or the hot store belongs to
    /// another event log. Either halts this task; the error is logged here
    /// and returned to the host.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<ConsumerReport, PipelineError> {
        if let Err(e) = self.consume(&mut shutdown).await {
            log::error!("❌ Aggregation halted: {}", e);
            return Err(e);
        }

        let report = self.report();
        log::info!(
            "✅ Aggregation consumer stopped: {} applied, {} skipped, {} deduplicated (clock: {:?})",
            report.applied,
            report.skipped,
            report.deduplicated,
            report.clock
        );
        Ok(report)
    }

    async fn consume(&mut self, shutdown: &mut watch::Receiver<bool>) -> Result<(), PipelineError> {
        self.hot
            .bind_event_log(self.log.instance_id())
            .await
            .map_err(PipelineError::hot)?;

        let initial = self.hot.virtual_clock().await.map_err(PipelineError::hot)?;
        self.clock = VirtualClock::starting_at(initial);
        log::info!("🚀 Aggregation consumer started (clock: {:?})", self.clock.current());

        let mut state = ConsumerState::Idle;
        loop {
            state = match state {
                ConsumerState::Idle => {
                    if *shutdown.borrow() {
                        ConsumerState::Stopped
                    } else {
                        ConsumerState::Fetch
                    }
                }
                ConsumerState::Fetch => {
                    tokio::select! {
                        fetched = self.log.read_next(self.batch_size, self.poll_timeout) => {
                            let records = fetched.map_err(PipelineError::event_log)?;
                            if records.is_empty() {
                                ConsumerState::Idle
                            } else {
                                ConsumerState::Apply(records)
                            }
                        }
                        changed = shutdown.changed() => {
                            // A dropped sender means the host is gone
                            if changed.is_err() { ConsumerState::Stopped } else { ConsumerState::Idle }
                        }
                    }
                }
                ConsumerState::Apply(records) => match self.apply(&records, shutdown).await {
                    Some(last_position) => ConsumerState::Commit { last_position },
                    // Shutdown while the hot store was down: leave unacknowledged
                    None => ConsumerState::Stopped,
                },
                ConsumerState::Commit { last_position } => {
                    if let Err(e) = self.log.acknowledge(last_position).await {
                        // Redelivery is deduplicated by the hot store's applied position
                        log::warn!("⚠️  Acknowledge of position {} failed: {}", last_position, e);
                    }
                    self.report.batches += 1;
                    tokio::task::yield_now().await;
                    ConsumerState::Idle
                }
                ConsumerState::Stopped => return Ok(()),
            };
        }
    }

    /// Decode and apply one fetched batch; returns the position to acknowledge
    async fn apply(&mut self, records: &[LogRecord], shutdown: &watch::Receiver<bool>) -> Option<i64> {
        let last_position = records.last().map(|r| r.position)?;

        let mut entries = Vec::with_capacity(records.len());
        for record in records {
            match serde_json::from_str::<Transaction>(&record.payload) {
                Ok(transaction) => entries.push(LogEntry {
                    position: record.position,
                    transaction,
                }),
                Err(e) => {
                    log::warn!("⚠️  Skipping malformed log record {}: {}", record.position, e);
                    self.report.skipped += 1;
                }
            }
        }

        loop {
            match self.hot.apply_batch(&entries).await {
                Ok(outcome) => {
                    self.report.applied += outcome.applied as u64;
                    self.report.deduplicated += outcome.deduplicated as u64;
                    self.backoff.reset();
                    break;
                }
                Err(e) => {
                    log::warn!("⚠️  Hot store unavailable, batch of {} held back: {}", entries.len(), e);
                    if *shutdown.borrow() {
                        return None;
                    }
                    if let Err(exhausted) = self.backoff.sleep().await {
                        log::warn!("⚠️  Hot store retry counter wrapped ({}), restarting backoff", exhausted);
                        self.backoff.reset();
                    }
                }
            }
        }

        for entry in &entries {
            self.clock.advance(entry.transaction.timestamp);
        }
        log::debug!(
            "Aggregated {} transactions up to position {} (clock: {:?})",
            entries.len(),
            last_position,
            self.clock.current()
        );
        Some(last_position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::event_log::SqliteEventLog;
    use crate::pipeline::hot_store::SqliteHotStore;
    use crate::pipeline::types::TransactionType;
    use chrono::NaiveDate;

    #[tokio::test]
    async fn test_consumer_folds_log_into_hot_store() {
        let log = Arc::new(SqliteEventLog::open_in_memory().unwrap());
        let hot = Arc::new(SqliteHotStore::open_in_memory().unwrap());
        let (stop_tx, stop_rx) = watch::channel(false);

        log.append(&[
            Transaction::from_raw("2026-01-01T10:00:00", "deposit", "paypal", "100").unwrap(),
            Transaction::from_raw("2026-01-01T11:00:00", "deposit", "paypal", "50").unwrap(),
            Transaction::from_raw("2026-01-02T09:00:00", "withdrawal", "visa", "30").unwrap(),
        ])
        .await
        .unwrap();

        let consumer = AggregationConsumer::new(log.clone(), hot.clone(), 2, Duration::from_millis(20));
        let handle = tokio::spawn(consumer.run(stop_rx));

        tokio::time::sleep(Duration::from_millis(100)).await;
        stop_tx.send(true).unwrap();
        let report = handle.await.unwrap().unwrap();

        assert_eq!(report.applied, 3);
        assert_eq!(report.batches, 2);
        assert_eq!(report.clock.unwrap().to_string(), "2026-01-02 09:00:00");

        let day = NaiveDate::from_ymd_opt(2026, 1, 1).unwrap();
        let days = hot.read_days(&[day]).await.unwrap();
        assert_eq!(days[&day].totals[&TransactionType::Deposit]["paypal"], 150.0);
        assert_eq!(log.backlog().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_malformed_payload_is_skipped_and_acknowledged() {
        let log = Arc::new(SqliteEventLog::open_in_memory().unwrap());
        let hot = Arc::new(SqliteHotStore::open_in_memory().unwrap());
        let mut consumer = AggregationConsumer::new(log, hot.clone(), 10, Duration::from_millis(10));
        let (_stop_tx, stop_rx) = watch::channel(false);

        let good = serde_json::to_string(
            &Transaction::from_raw("2026-01-03T10:00:00", "deposit", "wire", "12").unwrap(),
        )
        .unwrap();
        let records = vec![
            LogRecord { position: 1, payload: "{not json".to_string() },
            LogRecord { position: 2, payload: good },
        ];

        assert_eq!(consumer.apply(&records, &stop_rx).await, Some(2));
        assert_eq!(consumer.report().skipped, 1);
        assert_eq!(consumer.report().applied, 1);
    }
}
