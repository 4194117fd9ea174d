//! Retry controller: decides between another attempt and terminal failure.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::time::Duration;

use crate::job::{JobRecord, Settlement};

/// Exponential backoff policy for failed attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay after the first failed attempt.
    pub base_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(3600),
        }
    }
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
        }
    }

    /// Delay before the next claim after `attempts` failed attempts.
    ///
    /// `base_delay * 2^(attempts-1)`, capped at `max_delay`. Saturates
    /// instead of overflowing for large attempt counts.
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(63);
        let multiplier = 1u64 << exponent;
        let base_ms = u64::try_from(self.base_delay.as_millis()).unwrap_or(u64::MAX);
        let delay_ms = base_ms.saturating_mul(multiplier);
        Duration::from_millis(delay_ms).min(self.max_delay)
    }

    /// Turn a failed attempt into a settlement.
    ///
    /// `job.attempts` already includes the attempt that just failed.
    pub fn decide(
        &self,
        job: &JobRecord,
        error: impl Into<String>,
        retryable: bool,
        now: DateTime<Utc>,
    ) -> Settlement {
        let error = error.into();
        if !retryable || job.attempts >= job.max_attempts {
            return Settlement::Failed { error };
        }

        let delay = ChronoDuration::from_std(self.delay_for(job.attempts))
            .unwrap_or(ChronoDuration::MAX);
        Settlement::Retry {
            error,
            available_at: now
                .checked_add_signed(delay)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }
}
