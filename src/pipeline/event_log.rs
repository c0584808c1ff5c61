//! Append-only event log between ingestion and aggregation
//!
//! Single consumer group, at-least-once delivery: records stay in the log
//! until acknowledged, and a restarted consumer resumes after the last
//! acknowledged position.
//!
//! Each log database carries a random instance id, written once on
//! creation. Positions are only comparable within one instance, so
//! downstream dedup state is bound to it.

use super::error::{StoreError, StoreResult};
use super::types::Transaction;
use crate::sqlite_pragma::{open_in_memory_with_pragmas, open_with_pragmas};
use async_trait::async_trait;
use rand::Rng;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

const CONSUMER_GROUP: &str = "aggregators";

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS event_log (
        position INTEGER PRIMARY KEY AUTOINCREMENT,
        payload TEXT NOT NULL,
        appended_at TEXT NOT NULL DEFAULT (datetime('now'))
    );
    CREATE TABLE IF NOT EXISTS log_consumers (
        group_name TEXT PRIMARY KEY,
        acked_position INTEGER NOT NULL,
        instance_id INTEGER NOT NULL
    );
";

/// A raw record as stored in the log; decoding happens in the consumer
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub position: i64,
    pub payload: String,
}

#[async_trait]
pub trait EventLog: Send + Sync {
    /// Identity of this log's position sequence
    fn instance_id(&self) -> i64;

    /// Append a batch in order; returns the position of the last record
    async fn append(&self, batch: &[Transaction]) -> StoreResult<Option<i64>>;

    /// Next unacknowledged records, waiting at most `timeout` when none are ready
    async fn read_next(&self, max: usize, timeout: Duration) -> StoreResult<Vec<LogRecord>>;

    /// Mark everything up to and including `position` as consumed
    async fn acknowledge(&self, position: i64) -> StoreResult<()>;
}

/// SQLite-backed event log
pub struct SqliteEventLog {
    conn: Arc<Mutex<Connection>>,
    instance_id: i64,
    /// Highest position handed to the consumer in this process
    delivered: Mutex<i64>,
    appended: Notify,
}

impl SqliteEventLog {
    pub fn open(db_path: impl AsRef<Path>) -> StoreResult<Self> {
        Self::from_connection(open_with_pragmas(db_path)?)
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        Self::from_connection(open_in_memory_with_pragmas()?)
    }

    fn from_connection(conn: Connection) -> StoreResult<Self> {
        conn.execute_batch(SCHEMA)?;
        conn.execute(
            "INSERT OR IGNORE INTO log_consumers (group_name, acked_position, instance_id) VALUES (?1, 0, ?2)",
            params![CONSUMER_GROUP, rand::thread_rng().gen_range(1..i64::MAX)],
        )?;

        let instance_id: i64 = conn.query_row(
            "SELECT instance_id FROM log_consumers WHERE group_name = ?1",
            params![CONSUMER_GROUP],
            |row| row.get(0),
        )?;
        let acked = Self::acked_position(&conn)?;
        log::info!(
            "📥 Event log {:016x} opened: consumer group '{}' resumes after position {}",
            instance_id,
            CONSUMER_GROUP,
            acked
        );

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            instance_id,
            delivered: Mutex::new(acked),
            appended: Notify::new(),
        })
    }

    fn acked_position(conn: &Connection) -> StoreResult<i64> {
        let acked: Option<i64> = conn
            .query_row(
                "SELECT acked_position FROM log_consumers WHERE group_name = ?1",
                params![CONSUMER_GROUP],
                |row| row.get(0),
            )
            .optional()?;
        Ok(acked.unwrap_or(0))
    }

    /// Records appended but not yet acknowledged
    pub fn backlog(&self) -> StoreResult<i64> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned("event log"))?;
        let acked = Self::acked_position(&conn)?;
        let count = conn.query_row(
            "SELECT COUNT(*) FROM event_log WHERE position > ?1",
            params![acked],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    fn fetch_after(&self, max: usize) -> StoreResult<Vec<LogRecord>> {
        let mut delivered = self.delivered.lock().map_err(|_| StoreError::Poisoned("event log cursor"))?;
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned("event log"))?;

        let mut stmt = conn.prepare_cached(
            "SELECT position, payload FROM event_log WHERE position > ?1 ORDER BY position ASC LIMIT ?2",
        )?;
        let limit = i64::try_from(max).unwrap_or(i64::MAX);
        let records = stmt
            .query_map(params![*delivered, limit], |row| {
                Ok(LogRecord {
                    position: row.get(0)?,
                    payload: row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        if let Some(last) = records.last() {
            *delivered = last.position;
        }
        Ok(records)
    }
}

#[async_trait]
impl EventLog for SqliteEventLog {
    fn instance_id(&self) -> i64 {
        self.instance_id
    }

    async fn append(&self, batch: &[Transaction]) -> StoreResult<Option<i64>> {
        if batch.is_empty() {
            return Ok(None);
        }

        let payloads = batch
            .iter()
            .map(serde_json::to_string)
            .collect::<Result<Vec<_>, _>>()?;

        let last = {
            let mut conn = self.conn.lock().map_err(|_| StoreError::Poisoned("event log"))?;
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached("INSERT INTO event_log (payload) VALUES (?1)")?;
                for payload in &payloads {
                    stmt.execute(params![payload])?;
                }
            }
            let last = tx.last_insert_rowid();
            tx.commit()?;
            last
        };

        self.appended.notify_one();
        Ok(Some(last))
    }

    async fn read_next(&self, max: usize, timeout: Duration) -> StoreResult<Vec<LogRecord>> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let records = self.fetch_after(max.max(1))?;
            if !records.is_empty() {
                return Ok(records);
            }

            // A permit stored by an append since the last wait wakes us immediately
            if tokio::time::timeout_at(deadline, self.appended.notified()).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn acknowledge(&self, position: i64) -> StoreResult<()> {
        let mut conn = self.conn.lock().map_err(|_| StoreError::Poisoned("event log"))?;
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE log_consumers SET acked_position = MAX(acked_position, ?1) WHERE group_name = ?2",
            params![position, CONSUMER_GROUP],
        )?;
        tx.execute("DELETE FROM event_log WHERE position <= ?1", params![position])?;
        tx.commit()?;
        Ok(())
    }
}
