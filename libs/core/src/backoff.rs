use std::time::Duration;

use uuid::Uuid;

/// Bounded exponential backoff for retrying transient failures.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

pub const MAX_ATTEMPTS_LIMIT: u32 = 6;

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(4),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.clamp(1, MAX_ATTEMPTS_LIMIT),
            base_delay,
            max_delay: max_delay.max(base_delay),
        }
    }

    pub fn none() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO)
    }

    /// Whether another attempt is allowed after `attempt` (zero-based) failed.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt.saturating_add(1) < self.max_attempts
    }

    /// Delay before the retry that follows the zero-based `attempt`.
    ///
    /// `base * 2^attempt` plus up to 50% jitter, never above `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let max_ms = self.max_delay.as_millis() as u64;
        let pow = attempt.min(16); // prevent overflow
        let capped = base_ms.saturating_mul(1u64 << pow).min(max_ms);
        let jitter = if capped < 2 {
            0
        } else {
            (Uuid::new_v4().as_u128() % u128::from(capped / 2)) as u64
        };
        Duration::from_millis(capped.saturating_add(jitter).min(max_ms))
    }

    pub async fn sleep(&self, attempt: u32) {
        tokio::time::sleep(self.delay_for(attempt)).await;
    }
}
