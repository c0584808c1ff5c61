use rand::Rng;
use std::time::Duration;
use tokio::time::sleep;

#[derive(Debug, thiserror::Error)]
#[error("maximum retry attempts exceeded ({0})")]
pub struct MaxRetriesExceeded(pub u32);

/// Exponential backoff with jitter, bounded by `max_retries`
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial_delay_ms: u64,
    max_delay_ms: u64,
    max_retries: u32,
    current_attempt: u32,
}

impl ExponentialBackoff {
    pub fn new(initial_delay_ms: u64, max_delay_ms: u64, max_retries: u32) -> Self {
        Self {
            initial_delay_ms,
            max_delay_ms,
            max_retries,
            current_attempt: 0,
        }
    }

    /// Unbounded retries; used by tasks that must never drop data
    pub fn unbounded(initial_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self::new(initial_delay_ms, max_delay_ms, u32::MAX)
    }

    pub fn attempts(&self) -> u32 {
        self.current_attempt
    }

    /// Delay for the current attempt, before jitter
    pub fn base_delay(&self) -> Duration {
        let factor = 2_u64.saturating_pow(self.current_attempt.min(32));
        Duration::from_millis(self.initial_delay_ms.saturating_mul(factor).min(self.max_delay_ms))
    }

    pub async fn sleep(&mut self) -> Result<(), MaxRetriesExceeded> {
        if self.current_attempt >= self.max_retries {
            return Err(MaxRetriesExceeded(self.max_retries));
        }

        let base = self.base_delay();
        // Up to 20% jitter so restarted peers do not retry in lockstep
        let jitter_ms = rand::thread_rng().gen_range(0..=base.as_millis() as u64 / 5);
        let delay = base + Duration::from_millis(jitter_ms);

        log::warn!(
            "⏳ Retry attempt {} of {} in {}ms",
            self.current_attempt.saturating_add(1),
            self.max_retries,
            delay.as_millis()
        );

        sleep(delay).await;
        self.current_attempt = self.current_attempt.saturating_add(1);
        Ok(())
    }

    pub fn reset(&mut self) {
        self.current_attempt = 0;
    }
}
