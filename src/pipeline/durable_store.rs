//! Durable tier: long-term per-day documents
//!
//! Writes are increment-merges keyed by a migration token. The token ledger
//! is written in the same transaction as the merge, so replaying a token is
//! a no-op and `is_applied` doubles as the read-back confirmation.

use super::error::{StoreError, StoreResult};
use super::hot_store::MigrationMarker;
use super::types::{merge_day_totals, DayKey, DayTotals, RangeResult, TransactionType};
use crate::sqlite_pragma::{open_in_memory_with_pragmas, open_with_pragmas};
use async_trait::async_trait;
use rusqlite::{params, Connection};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Arc, Mutex};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS durable_days (
        day TEXT NOT NULL,
        tx_type TEXT NOT NULL,
        method TEXT NOT NULL,
        amount REAL NOT NULL,
        PRIMARY KEY (day, tx_type, method)
    );
    CREATE TABLE IF NOT EXISTS durable_migrations (
        token TEXT PRIMARY KEY,
        day TEXT NOT NULL,
        epoch INTEGER NOT NULL,
        attempt INTEGER NOT NULL,
        snapshot TEXT NOT NULL,
        applied_at TEXT NOT NULL DEFAULT (datetime('now'))
    );
    CREATE INDEX IF NOT EXISTS idx_durable_migrations_day ON durable_migrations(day, epoch, attempt);
";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Applied,
    /// Token was already in the ledger; nothing changed
    AlreadyApplied,
}

#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Increment-merge the marker's snapshot into the day's document
    async fn upsert_increment(&self, marker: &MigrationMarker) -> StoreResult<UpsertOutcome>;

    /// Read-back check used to confirm an upsert
    async fn is_applied(&self, marker: &MigrationMarker) -> StoreResult<bool>;

    /// Documents for the given days; days with no document are absent
    async fn read_days(&self, days: &[DayKey]) -> StoreResult<RangeResult>;

    /// Sum of the day's ledger contributions that have left the hot tier
    ///
    /// Entries of `epoch` count only up to `through_attempt`; entries written
    /// by any other hot-store epoch always count.
    async fn contributions(&self, day: DayKey, epoch: i64, through_attempt: i64) -> StoreResult<DayTotals>;
}

/// SQLite-backed durable tier
pub struct SqliteDurableStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteDurableStore {
    pub fn open(db_path: impl AsRef<Path>) -> StoreResult<Self> {
        Self::from_connection(open_with_pragmas(db_path)?)
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        Self::from_connection(open_in_memory_with_pragmas()?)
    }

    fn from_connection(conn: Connection) -> StoreResult<Self> {
        conn.execute_batch(SCHEMA)?;
        log::info!("✅ Durable store initialized");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> StoreResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::Poisoned("durable store"))
    }
}

#[async_trait]
impl DurableStore for SqliteDurableStore {
    async fn upsert_increment(&self, marker: &MigrationMarker) -> StoreResult<UpsertOutcome> {
        let token = marker.token();
        let day = marker.day.to_string();
        let snapshot = serde_json::to_string(&marker.snapshot)?;

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let inserted = tx.execute(
            "INSERT OR IGNORE INTO durable_migrations (token, day, epoch, attempt, snapshot)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![token, day, marker.epoch, marker.attempt, snapshot],
        )?;
        if inserted == 0 {
            return Ok(UpsertOutcome::AlreadyApplied);
        }

        {
            let mut merge = tx.prepare_cached(
                "INSERT INTO durable_days (day, tx_type, method, amount) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(day, tx_type, method) DO UPDATE SET amount = amount + excluded.amount",
            )?;
            for (tx_type, methods) in &marker.snapshot {
                for (method, amount) in methods {
                    merge.execute(params![day, tx_type.as_str(), method, amount])?;
                }
            }
        }

        tx.commit()?;
        Ok(UpsertOutcome::Applied)
    }

    async fn is_applied(&self, marker: &MigrationMarker) -> StoreResult<bool> {
        let conn = self.lock()?;
        let applied = conn
            .prepare_cached("SELECT 1 FROM durable_migrations WHERE token = ?1")?
            .exists(params![marker.token()])?;
        Ok(applied)
    }

    async fn read_days(&self, days: &[DayKey]) -> StoreResult<RangeResult> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached("SELECT tx_type, method, amount FROM durable_days WHERE day = ?1")?;
        let mut result = RangeResult::new();

        let unique: BTreeSet<DayKey> = days.iter().copied().collect();
        for day in unique {
            let rows = stmt
                .query_map(params![day.to_string()], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, f64>(2)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            if rows.is_empty() {
                continue;
            }

            let totals = result.entry(day).or_insert_with(DayTotals::new);
            for (tx_type, method, amount) in rows {
                let tx_type: TransactionType = tx_type.parse().map_err(StoreError::Corrupt)?;
                totals.entry(tx_type).or_default().insert(method, amount);
            }
        }
        Ok(result)
    }

    async fn contributions(&self, day: DayKey, epoch: i64, through_attempt: i64) -> StoreResult<DayTotals> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached(
            "SELECT snapshot FROM durable_migrations
             WHERE day = ?1 AND (epoch != ?2 OR attempt <= ?3)
             ORDER BY rowid ASC",
        )?;
        let snapshots = stmt
            .query_map(params![day.to_string(), epoch, through_attempt], |row| {
                row.get::<_, String>(0)
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut totals = DayTotals::new();
        for raw in snapshots {
            let snapshot: DayTotals = serde_json::from_str(&raw)?;
            merge_day_totals(&mut totals, &snapshot);
        }
        Ok(totals)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn day(d: u32) -> DayKey {
        NaiveDate::from_ymd_opt(2026, 1, d).unwrap()
    }

    const EPOCH: i64 = 0x51;

    fn marker(d: u32, attempt: i64, method: &str, amount: f64) -> MigrationMarker {
        let mut snapshot = DayTotals::new();
        snapshot
            .entry(TransactionType::Deposit)
            .or_default()
            .insert(method.to_string(), amount);
        MigrationMarker {
            day: day(d),
            epoch: EPOCH,
            attempt,
            snapshot,
        }
    }

    #[tokio::test]
    async fn test_upsert_merges_by_increment() {
        let store = SqliteDurableStore::open_in_memory().unwrap();
        store.upsert_increment(&marker(1, 1, "visa", 10.0)).await.unwrap();
        store.upsert_increment(&marker(1, 2, "visa", 5.0)).await.unwrap();

        let docs = store.read_days(&[day(1)]).await.unwrap();
        assert_eq!(docs[&day(1)][&TransactionType::Deposit]["visa"], 15.0);
    }

    #[tokio::test]
    async fn test_replayed_token_is_noop() {
        let store = SqliteDurableStore::open_in_memory().unwrap();
        let m = marker(1, 7, "paypal", 42.0);

        assert_eq!(store.upsert_increment(&m).await.unwrap(), UpsertOutcome::Applied);
        assert_eq!(store.upsert_increment(&m).await.unwrap(), UpsertOutcome::AlreadyApplied);
        assert!(store.is_applied(&m).await.unwrap());

        let docs = store.read_days(&[day(1)]).await.unwrap();
        assert_eq!(docs[&day(1)][&TransactionType::Deposit]["paypal"], 42.0);
    }

    #[tokio::test]
    async fn test_missing_days_are_absent() {
        let store = SqliteDurableStore::open_in_memory().unwrap();
        store.upsert_increment(&marker(2, 1, "visa", 1.0)).await.unwrap();

        let docs = store.read_days(&[day(1), day(2), day(3)]).await.unwrap();
        assert_eq!(docs.keys().copied().collect::<Vec<_>>(), vec![day(2)]);
        assert!(!store.is_applied(&marker(1, 1, "visa", 1.0)).await.unwrap());
    }

    #[tokio::test]
    async fn test_contributions_respect_attempt_bound() {
        let store = SqliteDurableStore::open_in_memory().unwrap();
        store.upsert_increment(&marker(1, 3, "visa", 10.0)).await.unwrap();
        store.upsert_increment(&marker(1, 9, "visa", 4.0)).await.unwrap();

        let through_first = store.contributions(day(1), EPOCH, 3).await.unwrap();
        assert_eq!(through_first[&TransactionType::Deposit]["visa"], 10.0);

        let all = store.contributions(day(1), EPOCH, 9).await.unwrap();
        assert_eq!(all[&TransactionType::Deposit]["visa"], 14.0);

        assert!(store.contributions(day(1), EPOCH, 2).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_same_attempt_from_another_epoch_is_a_new_token() {
        let store = SqliteDurableStore::open_in_memory().unwrap();
        let old = marker(1, 1, "visa", 10.0);
        let rebuilt = MigrationMarker {
            epoch: EPOCH + 1,
            ..marker(1, 1, "visa", 5.0)
        };

        assert_eq!(store.upsert_increment(&old).await.unwrap(), UpsertOutcome::Applied);
        assert_eq!(store.upsert_increment(&rebuilt).await.unwrap(), UpsertOutcome::Applied);

        let docs = store.read_days(&[day(1)]).await.unwrap();
        assert_eq!(docs[&day(1)][&TransactionType::Deposit]["visa"], 15.0);

        // The rebuilt store has completed nothing yet: only the old epoch counts
        let migrated = store.contributions(day(1), EPOCH + 1, 0).await.unwrap();
        assert_eq!(migrated[&TransactionType::Deposit]["visa"], 10.0);
    }
}
