use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;

use taktgeber_core::{RetryConfig, TaskError};

/// Bookkeeping for an instance that has failed at least once.
#[derive(Debug, Clone)]
pub struct RetryState {
    /// Attempt the instance will run as next.
    pub attempt: u32,
    pub last_error: TaskError,
    pub next_backoff_ms: u64,
    pub first_failed_at: DateTime<Utc>,
}

/// What to do with a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { delay: Duration },
    DeadLetter,
}

/// Capped exponential backoff with multiplicative jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    base_ms: u64,
    cap_ms: u64,
    jitter: Option<(f64, f64)>,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            base_ms: config.base_ms,
            cap_ms: config.cap_ms,
            jitter: config.jitter.then_some((config.jitter_min, config.jitter_max)),
        }
    }

    /// `min(base * 2^attempt, cap)` before jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let ms = 2u64
            .checked_pow(attempt)
            .and_then(|factor| self.base_ms.checked_mul(factor))
            .map_or(self.cap_ms, |ms| ms.min(self.cap_ms));
        Duration::from_millis(ms)
    }

    pub fn next_delay<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base = self.base_delay(attempt);
        match self.jitter {
            Some((lo, hi)) => {
                let factor = rng.gen_range(lo..=hi);
                Duration::from_millis((base.as_millis() as f64 * factor).round() as u64)
            }
            None => base,
        }
    }

    /// Permanent errors are never retried. Transient ones are retried while
    /// `attempt < max_retries`, so a task gets `max_retries + 1` attempts.
    pub fn decide<R: Rng + ?Sized>(
        &self,
        attempt: u32,
        max_retries: u32,
        error: &TaskError,
        rng: &mut R,
    ) -> RetryDecision {
        if error.is_permanent() || attempt >= max_retries {
            RetryDecision::DeadLetter
        } else {
            RetryDecision::Retry {
                delay: self.next_delay(attempt, rng),
            }
        }
    }
}
