//! Virtual clock and retention policy
//!
//! The virtual clock is a data-time cursor: the maximum transaction
//! timestamp aggregated so far. Replaying a historical dataset therefore
//! produces the same hot/cold transitions no matter when the replay runs.
//!
//! The authoritative clock lives in the hot store (see
//! `HotStore::apply_batch`), which applies the same max rule atomically.
//! `VirtualClock` is the in-process value type used by the consumer to
//! mirror it, and by the scheduler to reason about eligibility.

use super::types::DayKey;
use chrono::{Days, NaiveDateTime};

/// Monotonic non-decreasing data-time cursor
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VirtualClock {
    current: Option<NaiveDateTime>,
}

impl VirtualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starting_at(ts: Option<NaiveDateTime>) -> Self {
        Self { current: ts }
    }

    /// `clock = max(clock, ts)`; returns whether the clock moved
    pub fn advance(&mut self, ts: NaiveDateTime) -> bool {
        match self.current {
            Some(current) if ts <= current => false,
            _ => {
                self.current = Some(ts);
                true
            }
        }
    }

    pub fn current(&self) -> Option<NaiveDateTime> {
        self.current
    }

    pub fn today(&self) -> Option<DayKey> {
        self.current.map(|ts| ts.date())
    }
}

/// Decides which tracked days are old enough to leave the hot tier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    retention_days: u32,
}

impl RetentionPolicy {
    pub fn new(retention_days: u32) -> Self {
        Self { retention_days }
    }

    pub fn retention_days(&self) -> u32 {
        self.retention_days
    }

    /// Latest day that is migration-eligible: `clock.date - retention_days`
    ///
    /// `None` when the clock has not started yet.
    pub fn boundary(&self, clock: &VirtualClock) -> Option<DayKey> {
        clock
            .today()
            .and_then(|today| today.checked_sub_days(Days::new(u64::from(self.retention_days))))
    }

    pub fn is_eligible(&self, day: DayKey, clock: &VirtualClock) -> bool {
        self.boundary(clock).is_some_and(|boundary| day <= boundary)
    }

    /// Subset of `tracked` satisfying `day <= clock.date - retention_days`, oldest first
    pub fn eligible_days(&self, clock: &VirtualClock, tracked: &[DayKey]) -> Vec<DayKey> {
        let mut eligible: Vec<DayKey> = tracked
            .iter()
            .copied()
            .filter(|day| self.is_eligible(*day, clock))
            .collect();
        eligible.sort();
        eligible.dedup();
        eligible
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn ts(day: u32, hour: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 1, day)
            .unwrap()
            .and_hms_opt(hour, 0, 0)
            .unwrap()
    }

    fn day(d: u32) -> DayKey {
        NaiveDate::from_ymd_opt(2026, 1, d).unwrap()
    }

    #[test]
    fn test_advance_is_monotonic() {
        let mut clock = VirtualClock::new();
        assert!(clock.advance(ts(5, 10)));
        assert!(!clock.advance(ts(3, 10)));
        assert_eq!(clock.current(), Some(ts(5, 10)));
        assert!(!clock.advance(ts(5, 10)));
        assert!(clock.advance(ts(5, 11)));
        assert_eq!(clock.current(), Some(ts(5, 11)));
    }

    #[test]
    fn test_no_clock_means_nothing_eligible() {
        let policy = RetentionPolicy::new(7);
        let clock = VirtualClock::new();
        assert!(policy.eligible_days(&clock, &[day(1), day(2)]).is_empty());
        assert!(!policy.is_eligible(day(1), &clock));
    }

    #[test]
    fn test_eligible_days_boundary_is_inclusive() {
        let policy = RetentionPolicy::new(7);
        let clock = VirtualClock::starting_at(Some(ts(10, 0)));
        let tracked: Vec<DayKey> = (1..=10).rev().map(day).collect();

        assert_eq!(policy.boundary(&clock), Some(day(3)));
        assert_eq!(policy.eligible_days(&clock, &tracked), vec![day(1), day(2), day(3)]);
    }

    #[test]
    fn test_zero_retention_includes_today() {
        let policy = RetentionPolicy::new(0);
        let clock = VirtualClock::starting_at(Some(ts(10, 23)));
        assert!(policy.is_eligible(day(10), &clock));
    }
}
