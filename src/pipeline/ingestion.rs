//! Ingestion producer: time-ordered source -> event log
//!
//! The source is expected to be sorted by timestamp already (an upstream
//! step owns that). Records are published in source order, in batches of
//! `batch_size`, with optional per-record pacing to emulate live arrival.
//! Malformed records are logged and skipped; an append that keeps failing
//! after bounded retries ends the ingestion task only.

use super::backoff::ExponentialBackoff;
use super::error::PipelineError;
use super::event_log::EventLog;
use super::types::Transaction;
use serde::Deserialize;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// A parsed source record plus its optional pacing override
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRecord {
    pub transaction: Transaction,
    pub pacing: Option<Duration>,
}

#[derive(Debug, Deserialize)]
struct CsvRow {
    timestamp: String,
    #[serde(rename = "type")]
    tx_type: String,
    #[serde(alias = "method")]
    payment_method: String,
    amount: String,
    #[serde(default)]
    sleep_ms: Option<u64>,
}

/// Reads `timestamp,type,payment_method,amount[,sleep_ms]` rows
pub struct CsvTransactionSource {
    reader: csv::Reader<File>,
}

impl CsvTransactionSource {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PipelineError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| {
            PipelineError::Io(std::io::Error::new(
                e.kind(),
                format!("transaction source {}: {}", path.display(), e),
            ))
        })?;
        let reader = csv::ReaderBuilder::new().trim(csv::Trim::All).flexible(true).from_reader(file);
        Ok(Self { reader })
    }

    /// Iterate parsed records; each malformed row yields a `SourceRecord` error
    pub fn records(self) -> impl Iterator<Item = Result<SourceRecord, PipelineError>> {
        self.reader
            .into_deserialize::<CsvRow>()
            .enumerate()
            .map(|(index, row)| {
                // +2: header line, 1-based numbering
                let line = index as u64 + 2;
                let row = row.map_err(|e| PipelineError::SourceRecord {
                    line,
                    reason: e.to_string(),
                })?;
                let transaction = Transaction::from_raw(&row.timestamp, &row.tx_type, &row.payment_method, &row.amount)
                    .map_err(|reason| PipelineError::SourceRecord { line, reason })?;
                Ok(SourceRecord {
                    transaction,
                    pacing: row.sleep_ms.map(Duration::from_millis),
                })
            })
    }
}

/// Counts reported when the producer stops
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestionReport {
    pub published: u64,
    pub skipped: u64,
    pub batches: u64,
    /// Stopped by shutdown before the source was exhausted
    pub interrupted: bool,
}

pub struct IngestionProducer {
    log: Arc<dyn EventLog>,
    batch_size: usize,
    pacing: Option<Duration>,
    max_append_retries: u32,
}

impl IngestionProducer {
    pub fn new(log: Arc<dyn EventLog>, batch_size: usize, pacing: Option<Duration>, max_append_retries: u32) -> Self {
        Self {
            log,
            batch_size: batch_size.max(1),
            pacing,
            max_append_retries,
        }
    }

    /// Append one batch, retrying with bounded backoff
    ///
    /// Exhausting the retries is fatal for ingestion: the error is logged
    /// and returned so the task stops.
    pub async fn publish(&self, batch: &[Transaction]) -> Result<(), PipelineError> {
        let mut backoff = ExponentialBackoff::new(100, 5_000, self.max_append_retries);

        loop {
            match self.log.append(batch).await {
                Ok(_) => return Ok(()),
                Err(e) => {
                    log::warn!("⚠️  Event log append of {} records failed: {}", batch.len(), e);
                    if backoff.sleep().await.is_err() {
                        let err = PipelineError::LogAppend {
                            attempts: backoff.attempts().saturating_add(1),
                            source: e,
                        };
                        log::error!("❌ Ingestion halted: {}", err);
                        return Err(err);
                    }
                }
            }
        }
    }

    /// Drain `source` into the event log until exhausted or shutdown
    ///
    /// Shutdown is observed between records; a partially filled batch is
    /// still published before returning.
    pub async fn run<I>(self, source: I, shutdown: watch::Receiver<bool>) -> Result<IngestionReport, PipelineError>
    where
        I: IntoIterator<Item = Result<SourceRecord, PipelineError>>,
    {
        log::info!(
            "🚀 Ingestion started (batch size: {}, pacing: {:?})",
            self.batch_size,
            self.pacing
        );

        let mut report = IngestionReport::default();
        let mut batch: Vec<Transaction> = Vec::with_capacity(self.batch_size);

        for record in source {
            if *shutdown.borrow() {
                report.interrupted = true;
                break;
            }

            let record = match record {
                Ok(record) => record,
                Err(e) => {
                    log::warn!("⚠️  Skipping record: {}", e);
                    report.skipped += 1;
                    continue;
                }
            };

            if let Some(delay) = record.pacing.or(self.pacing) {
                tokio::time::sleep(delay).await;
            }

            batch.push(record.transaction);
            if batch.len() >= self.batch_size {
                self.publish(&batch).await?;
                report.published += batch.len() as u64;
                report.batches += 1;
                batch.clear();

                if report.batches % 100 == 0 {
                    log::info!("📊 Published {} transactions", report.published);
                }
                tokio::task::yield_now().await;
            }
        }

        if !batch.is_empty() {
            self.publish(&batch).await?;
            report.published += batch.len() as u64;
            report.batches += 1;
        }

        log::info!(
            "✅ Ingestion finished: {} published, {} skipped{}",
            report.published,
            report.skipped,
            if report.interrupted { " (interrupted)" } else { "" }
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::event_log::SqliteEventLog;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_csv(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_csv_source_skips_bad_rows_with_line_numbers() {
        let file = write_csv(
            "timestamp,type,payment_method,amount,sleep_ms\n\
             2026-01-01T10:00:00,deposit,paypal,100,0\n\
             2026-01-01T10:01:00,refund,paypal,5,0\n\
             2026-01-01T10:02:00,withdrawal,visa,20.5,15\n",
        );

        let records: Vec<_> = CsvTransactionSource::open(file.path()).unwrap().records().collect();
        assert_eq!(records.len(), 3);
        assert!(records[0].is_ok());
        match &records[1] {
            Err(PipelineError::SourceRecord { line, .. }) => assert_eq!(*line, 3),
            other => panic!("expected SourceRecord error, got {:?}", other),
        }
        let last = records[2].as_ref().unwrap();
        assert_eq!(last.transaction.amount, 20.5);
        assert_eq!(last.pacing, Some(Duration::from_millis(15)));
    }

    #[test]
    fn test_csv_source_accepts_method_alias_without_sleep_column() {
        let file = write_csv("timestamp,type,method,amount\n2026-01-02T08:00:00,deposit,crypto,3\n");
        let records: Vec<_> = CsvTransactionSource::open(file.path()).unwrap().records().collect();
        let record = records[0].as_ref().unwrap();
        assert_eq!(record.transaction.method, "crypto");
        assert_eq!(record.pacing, None);
    }

    #[tokio::test]
    async fn test_run_publishes_in_source_order() {
        let log = Arc::new(SqliteEventLog::open_in_memory().unwrap());
        let producer = IngestionProducer::new(log.clone(), 2, None, 1);
        let (_tx, shutdown) = watch::channel(false);

        let source: Vec<Result<SourceRecord, PipelineError>> = (1..=5)
            .map(|i| {
                Ok(SourceRecord {
                    transaction: Transaction::from_raw(
                        &format!("2026-01-01T10:0{}:00", i),
                        "deposit",
                        "visa",
                        &i.to_string(),
                    )
                    .unwrap(),
                    pacing: None,
                })
            })
            .chain(std::iter::once(Err(PipelineError::SourceRecord {
                line: 7,
                reason: "broken".into(),
            })))
            .collect();

        let report = producer.run(source, shutdown).await.unwrap();
        assert_eq!(report.published, 5);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.batches, 3);

        let records = log.read_next(10, Duration::from_millis(10)).await.unwrap();
        let amounts: Vec<f64> = records
            .iter()
            .map(|r| serde_json::from_str::<Transaction>(&r.payload).unwrap().amount)
            .collect();
        assert_eq!(amounts, vec![1.0, 2.0, 3.0, 4.0, 5.0]);
    }
}
