//! Range merger: date-range queries across both tiers
//!
//! Canonical-source rule, per day:
//! - tracked in the hot tier (hot-only or mid-migration): hot totals are
//!   canonical, plus any durable contributions already subtracted from hot
//!   by completed migration attempts
//! - otherwise: the durable document
//! - neither: the day is omitted, never zero-filled
//!
//! The hot read (tracked flag, buckets, last completed attempt) is a single
//! transaction and durable ledger entries never change once written, so a
//! migration moving the boundary between the two reads cannot make a day
//! count twice or vanish.

use super::durable_store::DurableStore;
use super::error::PipelineError;
use super::hot_store::HotStore;
use super::types::{is_empty_totals, merge_day_totals, DayKey, RangeResult};
use std::sync::Arc;

/// Longest range served in one query
pub const MAX_RANGE_DAYS: i64 = 3_660;

#[derive(Clone)]
pub struct RangeMerger {
    hot: Arc<dyn HotStore>,
    durable: Arc<dyn DurableStore>,
}

impl RangeMerger {
    pub fn new(hot: Arc<dyn HotStore>, durable: Arc<dyn DurableStore>) -> Self {
        Self { hot, durable }
    }

    /// `date -> type -> method -> amount` for every day in `[from, to]` with data
    pub async fn range_query(&self, from: DayKey, to: DayKey) -> Result<RangeResult, PipelineError> {
        if from > to {
            return Err(PipelineError::InvalidRange { from, to });
        }
        if (to - from).num_days() >= MAX_RANGE_DAYS {
            log::warn!("Range {}..={} exceeds {} days, truncating", from, to, MAX_RANGE_DAYS);
        }

        let days: Vec<DayKey> = from.iter_days().take_while(|day| *day <= to).take(MAX_RANGE_DAYS as usize).collect();

        let hot_days = self.hot.read_days(&days).await.map_err(PipelineError::hot)?;
        let cold_days: Vec<DayKey> = days.iter().copied().filter(|day| !hot_days.contains_key(day)).collect();
        let durable_days = self.durable.read_days(&cold_days).await.map_err(PipelineError::durable)?;

        let mut result = RangeResult::new();
        for (day, hot) in hot_days {
            let mut totals = hot.totals;
            // Includes earlier hot-store epochs, e.g. after the hot tier was rebuilt
            let migrated = self
                .durable
                .contributions(day, hot.epoch, hot.migrated_through.unwrap_or(0))
                .await
                .map_err(PipelineError::durable)?;
            merge_day_totals(&mut totals, &migrated);
            if !is_empty_totals(&totals) {
                result.insert(day, totals);
            }
        }

        let hot_count = result.len();
        for (day, totals) in durable_days {
            if !is_empty_totals(&totals) {
                result.insert(day, totals);
            }
        }

        log::info!(
            "Range query [{} -> {}] | {} hot days | {} durable days",
            from,
            to,
            hot_count,
            result.len() - hot_count
        );
        Ok(result)
    }
}
