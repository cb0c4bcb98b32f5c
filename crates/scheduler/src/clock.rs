use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Wall-clock milliseconds derived from tokio's monotonic clock.
///
/// The epoch offset is sampled once; after that, time only moves with
/// `tokio::time::Instant`, so a paused test runtime controls it fully.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    origin: Instant,
    origin_epoch_ms: u64,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            origin_epoch_ms: Utc::now().timestamp_millis().max(0) as u64,
        }
    }

    /// Current time in epoch milliseconds.
    pub fn now_ms(&self) -> u64 {
        let elapsed = u64::try_from(self.origin.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.origin_epoch_ms.saturating_add(elapsed)
    }

    /// The tokio instant at which `now_ms()` reaches `epoch_ms`.
    ///
    /// Times too far out for `Instant` clamp to a point years away.
    pub fn instant_at(&self, epoch_ms: u64) -> Instant {
        let offset = Duration::from_millis(epoch_ms.saturating_sub(self.origin_epoch_ms));
        self.origin
            .checked_add(offset)
            .unwrap_or_else(|| self.origin + FAR_FUTURE)
    }

    pub fn to_utc(&self, epoch_ms: u64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(epoch_ms as i64).unwrap_or_else(Utc::now)
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn follows_paused_time() {
        let clock = Clock::new();
        let t0 = clock.now_ms();

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(clock.now_ms() - t0, 1500);
    }

    #[tokio::test(start_paused = true)]
    async fn instant_at_round_trips() {
        let clock = Clock::new();
        let due = clock.now_ms() + 250;

        tokio::time::sleep_until(clock.instant_at(due)).await;
        assert_eq!(clock.now_ms(), due);
    }

    #[tokio::test]
    async fn far_future_does_not_overflow() {
        let clock = Clock::new();
        assert!(clock.instant_at(u64::MAX) > Instant::now());
    }

    #[tokio::test]
    async fn epoch_matches_wall_clock() {
        let clock = Clock::new();
        let wall = Utc::now().timestamp_millis() as u64;
        assert!(wall.abs_diff(clock.now_ms()) < 1_000);
    }

    #[tokio::test]
    async fn past_times_map_to_origin() {
        let clock = Clock::new();
        assert!(clock.instant_at(0) <= Instant::now());
    }
}
