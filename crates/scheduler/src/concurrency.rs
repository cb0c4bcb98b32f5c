use std::time::Duration;

use taktgeber_core::ConcurrencyConfig;

/// AIMD in-flight limit.
///
/// Grows by `additive_step` after a streak of successes, shrinks by
/// `decrease_factor` on any failure. Owned by the coordinator; not shared.
#[derive(Debug, Clone)]
pub struct ConcurrencyController {
    limit: usize,
    in_flight: usize,
    min: usize,
    max: usize,
    increase_after: u32,
    step: usize,
    decrease_factor: f64,
    slow_call: Option<Duration>,
    streak: u32,
}

impl ConcurrencyController {
    pub fn from_config(config: &ConcurrencyConfig) -> Self {
        let min = config.min.max(1);
        let max = config.max.max(min);
        Self {
            limit: config.initial.clamp(min, max),
            in_flight: 0,
            min,
            max,
            increase_after: config.increase_after.max(1),
            step: config.additive_step,
            decrease_factor: config.decrease_factor,
            slow_call: config.slow_call_ms.map(Duration::from_millis),
            streak: 0,
        }
    }

    pub fn current_limit(&self) -> usize {
        self.limit
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn has_capacity(&self) -> bool {
        self.in_flight < self.limit
    }

    pub fn try_admit(&mut self) -> bool {
        if self.has_capacity() {
            self.in_flight += 1;
            true
        } else {
            false
        }
    }

    /// # Panics
    /// If nothing is in flight: every release must pair with an admit.
    pub fn release(&mut self) {
        assert!(self.in_flight > 0, "release() without a matching try_admit()");
        self.in_flight -= 1;
    }

    /// Feed one attempt's result into the AIMD loop. Returns the new limit if it changed.
    pub fn on_outcome(&mut self, success: bool, latency: Duration) -> Option<usize> {
        let before = self.limit;
        if !success {
            self.streak = 0;
            let shrunk = (self.limit as f64 * self.decrease_factor).floor() as usize;
            self.limit = shrunk.max(self.min);
        } else if self.slow_call.is_some_and(|slow| latency > slow) {
            self.streak = 0;
        } else {
            self.streak += 1;
            if self.streak >= self.increase_after {
                self.streak = 0;
                self.limit = (self.limit + self.step).min(self.max);
            }
        }
        (self.limit != before).then_some(self.limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FAST: Duration = Duration::from_millis(5);

    fn controller(initial: usize, min: usize, max: usize) -> ConcurrencyController {
        ConcurrencyController::from_config(&ConcurrencyConfig {
            initial,
            min,
            max,
            increase_after: 3,
            ..ConcurrencyConfig::default()
        })
    }

    #[test]
    fn admits_up_to_limit() {
        let mut c = controller(2, 1, 8);
        assert!(c.try_admit());
        assert!(c.try_admit());
        assert!(!c.try_admit());
        assert_eq!(c.in_flight(), 2);

        c.release();
        assert!(c.try_admit());
        assert!(c.in_flight() <= c.current_limit());
    }

    #[test]
    fn grows_after_success_streak() {
        let mut c = controller(2, 1, 3);
        assert_eq!(c.on_outcome(true, FAST), None);
        assert_eq!(c.on_outcome(true, FAST), None);
        assert_eq!(c.on_outcome(true, FAST), Some(3));

        for _ in 0..3 {
            c.on_outcome(true, FAST);
        }
        assert_eq!(c.current_limit(), 3, "capped at max");
    }

    #[test]
    fn halves_on_failure_with_floor() {
        let mut c = controller(8, 2, 16);
        assert_eq!(c.on_outcome(false, FAST), Some(4));
        assert_eq!(c.on_outcome(false, FAST), Some(2));
        assert_eq!(c.on_outcome(false, FAST), None);
        assert_eq!(c.current_limit(), 2);
    }

    #[test]
    fn failure_resets_streak() {
        let mut c = controller(4, 1, 16);
        c.on_outcome(true, FAST);
        c.on_outcome(true, FAST);
        c.on_outcome(false, FAST);
        c.on_outcome(true, FAST);
        c.on_outcome(true, FAST);
        assert_eq!(c.current_limit(), 2);
        assert_eq!(c.on_outcome(true, FAST), Some(3));
    }

    #[test]
    fn slow_success_resets_streak_without_shrinking() {
        let mut c = ConcurrencyController::from_config(&ConcurrencyConfig {
            initial: 4,
            increase_after: 2,
            slow_call_ms: Some(100),
            ..ConcurrencyConfig::default()
        });
        c.on_outcome(true, FAST);
        assert_eq!(c.on_outcome(true, Duration::from_millis(500)), None);
        assert_eq!(c.current_limit(), 4);
        c.on_outcome(true, FAST);
        assert_eq!(c.on_outcome(true, FAST), Some(5));
    }

    #[test]
    fn shrinking_below_in_flight_blocks_new_admits() {
        let mut c = controller(4, 1, 8);
        for _ in 0..4 {
            assert!(c.try_admit());
        }
        c.on_outcome(false, FAST);
        assert_eq!(c.current_limit(), 2);
        assert!(!c.try_admit());

        c.release();
        c.release();
        assert!(!c.try_admit());
        c.release();
        assert!(c.try_admit());
    }

    #[test]
    fn initial_is_clamped_into_range() {
        let c = controller(0, 1, 4);
        assert_eq!(c.current_limit(), 1);
    }

    #[test]
    #[should_panic(expected = "without a matching try_admit")]
    fn release_without_admit_panics() {
        let mut c = controller(1, 1, 1);
        c.release();
    }
}
