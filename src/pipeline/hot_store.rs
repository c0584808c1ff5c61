//! Hot tier: per-day aggregates inside the retention window
//!
//! The hot store owns the shared scheduling state (virtual clock, tracked
//! days, migration markers). Every mutation below is a single SQLite
//! transaction, so the aggregation consumer and the migration scheduler
//! never need an in-process lock to coordinate.
//!
//! ## Migration markers
//!
//! `begin_migration` snapshots a day and persists `{day, attempt, snapshot}`
//! in the same transaction. `complete_migration` subtracts exactly that
//! snapshot, so transactions that landed after the snapshot survive as a
//! residue and are migrated by a later attempt. The last completed attempt
//! per day is kept so readers know which durable contributions have
//! already left the hot tier.
//!
//! Attempt ids are only unique within one hot database, so tokens also
//! carry the store's epoch, a random id written once on creation. A hot
//! store rebuilt next to a surviving durable store can never reuse a token
//! already in the durable ledger.
//!
//! ## Event log binding
//!
//! Redelivery dedup compares raw log positions. The consumer binds the hot
//! store to one event log instance before applying anything; records from a
//! different log are refused instead of being mistaken for duplicates.

use super::error::{StoreError, StoreResult};
use super::types::{is_empty_totals, parse_day, DayKey, DayTotals, LogEntry, TransactionType, AMOUNT_EPSILON};
use crate::sqlite_pragma::{open_in_memory_with_pragmas, open_with_pragmas};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime};
use rand::Rng;
use rusqlite::{params, Connection, OptionalExtension, Transaction as SqlTransaction};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Arc, Mutex};

const META_VIRTUAL_CLOCK: &str = "virtual_clock_us";
const META_APPLIED_POSITION: &str = "applied_position";
const META_MIGRATION_ATTEMPT: &str = "migration_attempt";
const META_EPOCH: &str = "epoch";
const META_LOG_INSTANCE: &str = "event_log_instance";

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS hot_buckets (
        day TEXT NOT NULL,
        tx_type TEXT NOT NULL,
        method TEXT NOT NULL,
        amount REAL NOT NULL,
        PRIMARY KEY (day, tx_type, method)
    );
    CREATE TABLE IF NOT EXISTS tracked_days (
        day TEXT PRIMARY KEY
    );
    CREATE TABLE IF NOT EXISTS hot_meta (
        key TEXT PRIMARY KEY,
        value INTEGER NOT NULL
    );
    CREATE TABLE IF NOT EXISTS pending_migrations (
        day TEXT PRIMARY KEY,
        attempt INTEGER NOT NULL,
        snapshot TEXT NOT NULL,
        started_at TEXT NOT NULL DEFAULT (datetime('now'))
    );
    CREATE TABLE IF NOT EXISTS day_migrations (
        day TEXT PRIMARY KEY,
        last_completed_attempt INTEGER NOT NULL
    );
";

/// A day snapshot that is (or was) on its way to the durable tier
#[derive(Debug, Clone, PartialEq)]
pub struct MigrationMarker {
    pub day: DayKey,
    /// Epoch of the hot store that took the snapshot
    pub epoch: i64,
    pub attempt: i64,
    pub snapshot: DayTotals,
}

impl MigrationMarker {
    /// Idempotency key for the durable upsert
    pub fn token(&self) -> String {
        format!("{}#{:016x}#{}", self.day, self.epoch, self.attempt)
    }
}

/// Hot-tier view of one tracked day
#[derive(Debug, Clone, PartialEq, Default)]
pub struct HotDay {
    pub totals: DayTotals,
    pub epoch: i64,
    /// Durable contributions of this epoch with `attempt <= this` are no
    /// longer in the hot tier
    pub migrated_through: Option<i64>,
}

/// Result of `HotStore::apply_batch`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BatchOutcome {
    pub applied: usize,
    /// Entries at or below the already-applied log position
    pub deduplicated: usize,
}

/// Result of the delete phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// Hot entries and tracked membership are gone
    Removed,
    /// Entries that arrived after the snapshot remain; day stays tracked
    Residual { remaining_entries: usize },
}

#[async_trait]
pub trait HotStore: Send + Sync {
    /// Fold a batch into the hot tier atomically
    ///
    /// Increments buckets, registers days as tracked, advances the virtual
    /// clock (max rule) and records the highest applied log position.
    async fn apply_batch(&self, batch: &[LogEntry]) -> StoreResult<BatchOutcome>;

    /// Tie position dedup to one event log instance
    ///
    /// The first call records `instance_id`; later calls fail with
    /// `StoreError::LogMismatch` for any other instance.
    async fn bind_event_log(&self, instance_id: i64) -> StoreResult<()>;

    async fn virtual_clock(&self) -> StoreResult<Option<NaiveDateTime>>;

    async fn tracked_days(&self) -> StoreResult<Vec<DayKey>>;

    /// Tracked days among `days`, read in one transaction
    async fn read_days(&self, days: &[DayKey]) -> StoreResult<BTreeMap<DayKey, HotDay>>;

    async fn pending_migration(&self, day: DayKey) -> StoreResult<Option<MigrationMarker>>;

    /// Snapshot the day and persist a new migration marker
    async fn begin_migration(&self, day: DayKey) -> StoreResult<MigrationMarker>;

    /// Drop a marker whose snapshot never reached the durable tier
    async fn discard_migration(&self, marker: &MigrationMarker) -> StoreResult<()>;

    /// Remove the marker's snapshot from the hot tier
    async fn complete_migration(&self, marker: &MigrationMarker) -> StoreResult<DeleteOutcome>;
}

/// SQLite-backed hot tier
pub struct SqliteHotStore {
    conn: Arc<Mutex<Connection>>,
    epoch: i64,
}

impl SqliteHotStore {
    pub fn open(db_path: impl AsRef<Path>) -> StoreResult<Self> {
        Self::from_connection(open_with_pragmas(db_path)?)
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        Self::from_connection(open_in_memory_with_pragmas()?)
    }

    fn from_connection(conn: Connection) -> StoreResult<Self> {
        conn.execute_batch(SCHEMA)?;
        conn.execute(
            "INSERT OR IGNORE INTO hot_meta (key, value) VALUES (?1, ?2)",
            params![META_EPOCH, rand::thread_rng().gen_range(1..i64::MAX)],
        )?;
        let epoch = Self::meta_get(&conn, META_EPOCH)?
            .ok_or_else(|| StoreError::Corrupt("hot store epoch missing".to_string()))?;

        log::info!("✅ Hot store initialized (epoch {:016x})", epoch);
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            epoch,
        })
    }

    fn lock(&self) -> StoreResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::Poisoned("hot store"))
    }

    fn meta_get(conn: &Connection, key: &str) -> StoreResult<Option<i64>> {
        Ok(conn
            .query_row("SELECT value FROM hot_meta WHERE key = ?1", params![key], |row| row.get(0))
            .optional()?)
    }

    fn meta_set(conn: &Connection, key: &str, value: i64) -> StoreResult<()> {
        conn.execute(
            "INSERT INTO hot_meta (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    fn read_totals(conn: &Connection, day: &str) -> StoreResult<DayTotals> {
        let mut stmt = conn.prepare_cached("SELECT tx_type, method, amount FROM hot_buckets WHERE day = ?1")?;
        let rows = stmt
            .query_map(params![day], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, f64>(2)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut totals = DayTotals::new();
        for (tx_type, method, amount) in rows {
            let tx_type: TransactionType = tx_type.parse().map_err(StoreError::Corrupt)?;
            totals.entry(tx_type).or_default().insert(method, amount);
        }
        Ok(totals)
    }

    fn is_tracked(conn: &Connection, day: &str) -> StoreResult<bool> {
        Ok(conn
            .prepare_cached("SELECT 1 FROM tracked_days WHERE day = ?1")?
            .exists(params![day])?)
    }

    fn read_marker(&self, conn: &Connection, day: DayKey) -> StoreResult<Option<MigrationMarker>> {
        let row: Option<(i64, String)> = conn
            .query_row(
                "SELECT attempt, snapshot FROM pending_migrations WHERE day = ?1",
                params![day.to_string()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        match row {
            Some((attempt, snapshot)) => Ok(Some(MigrationMarker {
                day,
                epoch: self.epoch,
                attempt,
                snapshot: serde_json::from_str(&snapshot)?,
            })),
            None => Ok(None),
        }
    }

    fn marker_matches(&self, tx: &SqlTransaction<'_>, marker: &MigrationMarker) -> StoreResult<bool> {
        let attempt: Option<i64> = tx
            .query_row(
                "SELECT attempt FROM pending_migrations WHERE day = ?1",
                params![marker.day.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(marker.epoch == self.epoch && attempt == Some(marker.attempt))
    }
}

fn clock_to_micros(ts: NaiveDateTime) -> i64 {
    ts.and_utc().timestamp_micros()
}

fn clock_from_micros(micros: i64) -> StoreResult<NaiveDateTime> {
    DateTime::from_timestamp_micros(micros)
        .map(|dt| dt.naive_utc())
        .ok_or_else(|| StoreError::Corrupt(format!("virtual clock out of range: {}", micros)))
}

#[async_trait]
impl HotStore for SqliteHotStore {
    async fn apply_batch(&self, batch: &[LogEntry]) -> StoreResult<BatchOutcome> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let applied_position = Self::meta_get(&tx, META_APPLIED_POSITION)?.unwrap_or(0);
        let mut highest = applied_position;
        let mut outcome = BatchOutcome::default();

        {
            let mut increment = tx.prepare_cached(
                "INSERT INTO hot_buckets (day, tx_type, method, amount) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(day, tx_type, method) DO UPDATE SET amount = amount + excluded.amount",
            )?;
            let mut track = tx.prepare_cached("INSERT OR IGNORE INTO tracked_days (day) VALUES (?1)")?;
            let mut advance = tx.prepare_cached(
                "INSERT INTO hot_meta (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = MAX(value, excluded.value)",
            )?;

            for entry in batch {
                if entry.position <= applied_position {
                    outcome.deduplicated += 1;
                    continue;
                }

                let event = &entry.transaction;
                let day = event.day_key().to_string();
                increment.execute(params![day, event.tx_type.as_str(), event.method, event.amount])?;
                track.execute(params![day])?;
                advance.execute(params![META_VIRTUAL_CLOCK, clock_to_micros(event.timestamp)])?;

                highest = highest.max(entry.position);
                outcome.applied += 1;
            }
        }

        if highest > applied_position {
            Self::meta_set(&tx, META_APPLIED_POSITION, highest)?;
        }
        tx.commit()?;
        Ok(outcome)
    }

    async fn bind_event_log(&self, instance_id: i64) -> StoreResult<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        match Self::meta_get(&tx, META_LOG_INSTANCE)? {
            Some(bound) if bound == instance_id => return Ok(()),
            Some(bound) => return Err(StoreError::LogMismatch { bound, found: instance_id }),
            None => Self::meta_set(&tx, META_LOG_INSTANCE, instance_id)?,
        }
        tx.commit()?;

        log::info!("🔗 Hot store bound to event log {:016x}", instance_id);
        Ok(())
    }

    async fn virtual_clock(&self) -> StoreResult<Option<NaiveDateTime>> {
        let conn = self.lock()?;
        Self::meta_get(&conn, META_VIRTUAL_CLOCK)?
            .map(clock_from_micros)
            .transpose()
    }

    async fn tracked_days(&self) -> StoreResult<Vec<DayKey>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached("SELECT day FROM tracked_days ORDER BY day ASC")?;
        let raw = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        raw.iter()
            .map(|day| parse_day(day).map_err(StoreError::Corrupt))
            .collect()
    }

    async fn read_days(&self, days: &[DayKey]) -> StoreResult<BTreeMap<DayKey, HotDay>> {
        let mut conn = self.lock()?;
        // Deferred read transaction: one consistent snapshot across tables
        let tx = conn.transaction()?;
        let mut result = BTreeMap::new();

        let unique: BTreeSet<DayKey> = days.iter().copied().collect();
        for day in unique {
            let key = day.to_string();
            if !Self::is_tracked(&tx, &key)? {
                continue;
            }

            let migrated_through: Option<i64> = tx
                .query_row(
                    "SELECT last_completed_attempt FROM day_migrations WHERE day = ?1",
                    params![key],
                    |row| row.get(0),
                )
                .optional()?;

            result.insert(
                day,
                HotDay {
                    totals: Self::read_totals(&tx, &key)?,
                    epoch: self.epoch,
                    migrated_through,
                },
            );
        }

        tx.commit()?;
        Ok(result)
    }

    async fn pending_migration(&self, day: DayKey) -> StoreResult<Option<MigrationMarker>> {
        let conn = self.lock()?;
        self.read_marker(&conn, day)
    }

    async fn begin_migration(&self, day: DayKey) -> StoreResult<MigrationMarker> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let key = day.to_string();

        let attempt = Self::meta_get(&tx, META_MIGRATION_ATTEMPT)?.unwrap_or(0) + 1;
        Self::meta_set(&tx, META_MIGRATION_ATTEMPT, attempt)?;

        let snapshot = Self::read_totals(&tx, &key)?;
        tx.execute(
            "INSERT INTO pending_migrations (day, attempt, snapshot) VALUES (?1, ?2, ?3)
             ON CONFLICT(day) DO UPDATE SET attempt = excluded.attempt,
                 snapshot = excluded.snapshot, started_at = datetime('now')",
            params![key, attempt, serde_json::to_string(&snapshot)?],
        )?;
        tx.commit()?;

        Ok(MigrationMarker {
            day,
            epoch: self.epoch,
            attempt,
            snapshot,
        })
    }

    async fn discard_migration(&self, marker: &MigrationMarker) -> StoreResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "DELETE FROM pending_migrations WHERE day = ?1 AND attempt = ?2",
            params![marker.day.to_string(), marker.attempt],
        )?;
        Ok(())
    }

    async fn complete_migration(&self, marker: &MigrationMarker) -> StoreResult<DeleteOutcome> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let key = marker.day.to_string();

        if !self.marker_matches(&tx, marker)? {
            return Err(StoreError::Corrupt(format!(
                "migration marker {} is no longer pending",
                marker.token()
            )));
        }

        {
            let mut subtract = tx.prepare_cached(
                "UPDATE hot_buckets SET amount = amount - ?4 WHERE day = ?1 AND tx_type = ?2 AND method = ?3",
            )?;
            for (tx_type, methods) in &marker.snapshot {
                for (method, amount) in methods {
                    subtract.execute(params![key, tx_type.as_str(), method, amount])?;
                }
            }
        }

        tx.execute(
            "DELETE FROM hot_buckets WHERE day = ?1 AND ABS(amount) < ?2",
            params![key, AMOUNT_EPSILON],
        )?;
        tx.execute("DELETE FROM pending_migrations WHERE day = ?1", params![key])?;

        let remaining: i64 = tx.query_row(
            "SELECT COUNT(*) FROM hot_buckets WHERE day = ?1",
            params![key],
            |row| row.get(0),
        )?;

        let outcome = if remaining == 0 {
            tx.execute("DELETE FROM tracked_days WHERE day = ?1", params![key])?;
            DeleteOutcome::Removed
        } else {
            DeleteOutcome::Residual {
                remaining_entries: usize::try_from(remaining).unwrap_or(usize::MAX),
            }
        };

        if !is_empty_totals(&marker.snapshot) {
            tx.execute(
                "INSERT INTO day_migrations (day, last_completed_attempt) VALUES (?1, ?2)
                 ON CONFLICT(day) DO UPDATE SET last_completed_attempt = excluded.last_completed_attempt",
                params![key, marker.attempt],
            )?;
        }

        tx.commit()?;
        Ok(outcome)
    }
}
