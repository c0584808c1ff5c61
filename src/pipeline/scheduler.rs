//! Migration scheduler: hot tier -> durable tier
//!
//! Wakes on a fixed interval regardless of data volume and moves every
//! migration-eligible tracked day through three phases:
//!
//! 1. **Upsert**: snapshot the day under a persisted migration marker and
//!    increment-merge the snapshot into the durable document
//! 2. **Confirm**: read back the durable ledger for the marker's token
//! 3. **Delete**: subtract exactly the snapshot from the hot tier and
//!    untrack the day once nothing remains
//!
//! A marker left behind by a failed or interrupted sweep is resolved first
//! on the next one: if the durable ledger has it the scheduler resumes at
//! Delete, otherwise the marker is discarded and a fresh snapshot is taken.
//! A single scheduler instance runs sweeps sequentially, so a day is never
//! migrated concurrently with itself.

use super::clock::{RetentionPolicy, VirtualClock};
use super::durable_store::{DurableStore, UpsertOutcome};
use super::error::PipelineError;
use super::hot_store::{DeleteOutcome, HotStore, MigrationMarker};
use super::types::{is_empty_totals, DayKey};
use chrono::NaiveDateTime;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};

/// What happened to one day in a sweep
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DayMigration {
    /// Fully moved to the durable tier and untracked
    Migrated { resumed: bool },
    /// Snapshot moved; later arrivals remain hot for a following sweep
    Residual { resumed: bool, remaining_entries: usize },
    /// Tracked with no hot entries; untracked without a durable write
    Emptied,
}

/// Outcome of one sweep
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepReport {
    pub clock: Option<NaiveDateTime>,
    pub eligible: Vec<DayKey>,
    pub migrated: Vec<DayKey>,
    pub residual: Vec<DayKey>,
    pub failed: Vec<(DayKey, String)>,
    /// Eligible days not visited because shutdown was requested
    pub deferred: Vec<DayKey>,
}

/// Cumulative counters; a day failing sweep after sweep shows up in
/// `consecutive_failures` until it succeeds
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationStats {
    pub sweeps: u64,
    pub days_migrated: u64,
    pub residual_days: u64,
    pub resumed_markers: u64,
    pub upsert_failures: u64,
    pub confirm_failures: u64,
    pub delete_failures: u64,
    pub store_errors: u64,
    pub consecutive_failures: BTreeMap<DayKey, u32>,
    stuck_threshold: u32,
}

impl MigrationStats {
    fn new(stuck_threshold: u32) -> Self {
        Self {
            stuck_threshold: stuck_threshold.max(1),
            ..Self::default()
        }
    }

    /// Days that have failed at least `stuck_threshold` sweeps in a row
    pub fn stuck_days(&self) -> Vec<DayKey> {
        self.consecutive_failures
            .iter()
            .filter(|(_, failures)| **failures >= self.stuck_threshold)
            .map(|(day, _)| *day)
            .collect()
    }
}

pub struct MigrationScheduler {
    hot: Arc<dyn HotStore>,
    durable: Arc<dyn DurableStore>,
    policy: RetentionPolicy,
    interval: Duration,
    stats: MigrationStats,
}

impl MigrationScheduler {
    pub fn new(
        hot: Arc<dyn HotStore>,
        durable: Arc<dyn DurableStore>,
        policy: RetentionPolicy,
        interval: Duration,
        stuck_threshold: u32,
    ) -> Self {
        Self {
            hot,
            durable,
            policy,
            interval,
            stats: MigrationStats::new(stuck_threshold),
        }
    }

    pub fn stats(&self) -> &MigrationStats {
        &self.stats
    }

    /// Sweep every `interval` until shutdown; returns the final counters
    ///
    /// A sweep in progress is never cancelled mid-phase: shutdown is only
    /// checked between days and between sweeps.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> MigrationStats {
        log::info!(
            "⏰ Migration scheduler started (interval: {}ms, retention: {}d)",
            self.interval.as_millis(),
            self.policy.retention_days()
        );

        let mut timer = interval(self.interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    if *shutdown.borrow() {
                        break;
                    }
                    self.run_sweep(Some(&shutdown)).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        log::info!(
            "✅ Migration scheduler stopped: {} sweeps, {} days migrated, {} stuck",
            self.stats.sweeps,
            self.stats.days_migrated,
            self.stats.stuck_days().len()
        );
        self.stats
    }

    /// One pass over the migration-eligible tracked days, oldest first
    pub async fn run_sweep(&mut self, shutdown: Option<&watch::Receiver<bool>>) -> SweepReport {
        self.stats.sweeps += 1;
        log::debug!("Migration sweep #{}: checking for days to archive", self.stats.sweeps);

        let mut report = SweepReport::default();

        let clock = match self.hot.virtual_clock().await {
            Ok(clock) => clock,
            Err(e) => {
                self.stats.store_errors += 1;
                log::error!("❌ Migration sweep skipped, cannot read virtual clock: {}", e);
                return report;
            }
        };
        report.clock = clock;
        if clock.is_none() {
            log::info!("Migration sweep: no virtual clock yet");
            return report;
        }

        let tracked = match self.hot.tracked_days().await {
            Ok(tracked) => tracked,
            Err(e) => {
                self.stats.store_errors += 1;
                log::error!("❌ Migration sweep skipped, cannot read tracked days: {}", e);
                return report;
            }
        };

        report.eligible = self.policy.eligible_days(&VirtualClock::starting_at(clock), &tracked);

        for (index, day) in report.eligible.iter().copied().enumerate() {
            if shutdown.is_some_and(|rx| *rx.borrow()) {
                report.deferred = report.eligible[index..].to_vec();
                log::info!("Migration sweep interrupted by shutdown, {} days deferred", report.deferred.len());
                break;
            }

            log::info!("Day {} identified as historical, migrating...", day);
            match self.migrate_day(day).await {
                Ok(outcome) => {
                    self.stats.consecutive_failures.remove(&day);
                    let resumed = matches!(
                        outcome,
                        DayMigration::Migrated { resumed: true } | DayMigration::Residual { resumed: true, .. }
                    );
                    if resumed {
                        self.stats.resumed_markers += 1;
                    }
                    match outcome {
                        DayMigration::Migrated { .. } | DayMigration::Emptied => {
                            self.stats.days_migrated += 1;
                            report.migrated.push(day);
                        }
                        DayMigration::Residual { remaining_entries, .. } => {
                            self.stats.residual_days += 1;
                            log::warn!(
                                "⚠️  Day {} archived with {} late entries left hot; next sweep picks them up",
                                day,
                                remaining_entries
                            );
                            report.residual.push(day);
                        }
                    }
                }
                Err(e) => {
                    self.record_failure(day, &e);
                    report.failed.push((day, e.to_string()));
                }
            }

            tokio::task::yield_now().await;
        }

        if !report.eligible.is_empty() {
            log::info!(
                "📦 Migration sweep #{}: {} eligible, {} migrated, {} residual, {} failed (clock: {:?})",
                self.stats.sweeps,
                report.eligible.len(),
                report.migrated.len(),
                report.residual.len(),
                report.failed.len(),
                report.clock
            );
        }
        report
    }

    fn record_failure(&mut self, day: DayKey, error: &PipelineError) {
        match error {
            PipelineError::MigrationConfirm { .. } => self.stats.confirm_failures += 1,
            PipelineError::MigrationDelete { .. } => self.stats.delete_failures += 1,
            _ => self.stats.store_errors += 1,
        }

        let failures = self.stats.consecutive_failures.entry(day).or_insert(0);
        *failures += 1;
        let failures = *failures;

        if failures >= self.stats.stuck_threshold {
            log::error!("❌ Day {} stuck: migration failed {} sweeps in a row: {}", day, failures, error);
        } else {
            log::warn!("⚠️  Migration of {} deferred to next sweep: {}", day, error);
        }
    }

    /// Run (or resume) the three-phase migration for one day
    pub async fn migrate_day(&mut self, day: DayKey) -> Result<DayMigration, PipelineError> {
        let pending = self.hot.pending_migration(day).await.map_err(PipelineError::hot)?;

        let marker = match pending {
            Some(marker) => {
                let applied = self.durable.is_applied(&marker).await.map_err(PipelineError::durable)?;
                if applied {
                    log::info!("Resuming migration {} at delete phase", marker.token());
                    return self.delete_phase(&marker, true).await;
                }
                log::info!("Discarding unapplied migration {}, taking fresh snapshot", marker.token());
                self.hot.discard_migration(&marker).await.map_err(PipelineError::hot)?;
                self.hot.begin_migration(day).await.map_err(PipelineError::hot)?
            }
            None => self.hot.begin_migration(day).await.map_err(PipelineError::hot)?,
        };

        if is_empty_totals(&marker.snapshot) {
            return Ok(match self.delete_phase(&marker, false).await? {
                DayMigration::Migrated { .. } => DayMigration::Emptied,
                residual => residual,
            });
        }

        // Phase 1: upsert
        match self.durable.upsert_increment(&marker).await {
            Ok(UpsertOutcome::Applied) => {}
            Ok(UpsertOutcome::AlreadyApplied) => {
                // A fresh snapshot's token must be new; a ledger hit means this
                // snapshot never reached the durable tier, so keep it hot
                self.hot.discard_migration(&marker).await.map_err(PipelineError::hot)?;
                return Err(PipelineError::MigrationConfirm {
                    day,
                    token: marker.token(),
                    reason: "token of a fresh snapshot already in durable ledger".to_string(),
                });
            }
            Err(e) => {
                self.stats.upsert_failures += 1;
                return Err(PipelineError::durable(e));
            }
        }

        // Phase 2: confirm
        match self.durable.is_applied(&marker).await {
            Ok(true) => {}
            Ok(false) => {
                return Err(PipelineError::MigrationConfirm {
                    day,
                    token: marker.token(),
                    reason: "token missing from durable ledger after upsert".to_string(),
                })
            }
            Err(e) => {
                return Err(PipelineError::MigrationConfirm {
                    day,
                    token: marker.token(),
                    reason: e.to_string(),
                })
            }
        }

        // Phase 3: delete
        self.delete_phase(&marker, false).await
    }

    async fn delete_phase(&mut self, marker: &MigrationMarker, resumed: bool) -> Result<DayMigration, PipelineError> {
        let outcome = self
            .hot
            .complete_migration(marker)
            .await
            .map_err(|e| PipelineError::MigrationDelete {
                day: marker.day,
                reason: e.to_string(),
            })?;

        log::info!("Archived {} to durable tier ({})", marker.day, marker.token());
        Ok(match outcome {
            DeleteOutcome::Removed => DayMigration::Migrated { resumed },
            DeleteOutcome::Residual { remaining_entries } => DayMigration::Residual {
                resumed,
                remaining_entries,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::durable_store::SqliteDurableStore;
    use crate::pipeline::hot_store::SqliteHotStore;
    use crate::pipeline::types::{LogEntry, Transaction, TransactionType};
    use chrono::NaiveDate;

    fn day(d: u32) -> DayKey {
        NaiveDate::from_ymd_opt(2026, 1, d).unwrap()
    }

    async fn seed(hot: &SqliteHotStore, days: std::ops::RangeInclusive<u32>) {
        let entries: Vec<LogEntry> = days
            .enumerate()
            .map(|(i, d)| LogEntry {
                position: i as i64 + 1,
                transaction: Transaction::from_raw(&format!("2026-01-{:02}T12:00:00", d), "deposit", "visa", "10")
                    .unwrap(),
            })
            .collect();
        hot.apply_batch(&entries).await.unwrap();
    }

    fn scheduler(hot: Arc<SqliteHotStore>, durable: Arc<SqliteDurableStore>) -> MigrationScheduler {
        MigrationScheduler::new(hot, durable, RetentionPolicy::new(7), Duration::from_millis(10), 3)
    }

    #[tokio::test]
    async fn test_sweep_without_clock_is_noop() {
        let hot = Arc::new(SqliteHotStore::open_in_memory().unwrap());
        let durable = Arc::new(SqliteDurableStore::open_in_memory().unwrap());
        let mut scheduler = scheduler(hot, durable);

        let report = scheduler.run_sweep(None).await;
        assert!(report.clock.is_none());
        assert!(report.eligible.is_empty());
        assert_eq!(scheduler.stats().sweeps, 1);
    }

    #[tokio::test]
    async fn test_sweep_migrates_only_eligible_days() {
        let hot = Arc::new(SqliteHotStore::open_in_memory().unwrap());
        let durable = Arc::new(SqliteDurableStore::open_in_memory().unwrap());
        seed(&hot, 1..=10).await;
        let mut scheduler = scheduler(hot.clone(), durable.clone());

        let report = scheduler.run_sweep(None).await;
        assert_eq!(report.migrated, vec![day(1), day(2), day(3)]);
        assert!(report.failed.is_empty());

        let tracked = hot.tracked_days().await.unwrap();
        assert_eq!(tracked.first().copied(), Some(day(4)));

        let docs = durable.read_days(&[day(1), day(2), day(3), day(4)]).await.unwrap();
        assert_eq!(docs.len(), 3);
        assert_eq!(docs[&day(2)][&TransactionType::Deposit]["visa"], 10.0);

        // Nothing left to do on the next sweep
        let again = scheduler.run_sweep(None).await;
        assert!(again.eligible.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_defers_remaining_days() {
        let hot = Arc::new(SqliteHotStore::open_in_memory().unwrap());
        let durable = Arc::new(SqliteDurableStore::open_in_memory().unwrap());
        seed(&hot, 1..=10).await;
        let mut scheduler = scheduler(hot.clone(), durable);

        let (_tx, rx) = watch::channel(true);
        let report = scheduler.run_sweep(Some(&rx)).await;
        assert!(report.migrated.is_empty());
        assert_eq!(report.deferred.len(), 3);
        assert_eq!(hot.tracked_days().await.unwrap().len(), 10);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let hot = Arc::new(SqliteHotStore::open_in_memory().unwrap());
        let durable = Arc::new(SqliteDurableStore::open_in_memory().unwrap());
        seed(&hot, 1..=10).await;
        let scheduler = scheduler(hot.clone(), durable);

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(scheduler.run(rx));
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();

        let stats = handle.await.unwrap();
        assert!(stats.sweeps >= 1);
        assert_eq!(stats.days_migrated, 3);
        assert!(stats.stuck_days().is_empty());
    }
}
