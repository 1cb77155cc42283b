//! A sliding-window failure counter with a linear delay, capped at a maximum.
//!
//! Used by the primary-open path to damp thrashing: when a storage device is
//! failing new-file creation, each failure stretches the delay before the next attempt, up to a
//! ceiling, rather than spinning.

use std::{
    collections::VecDeque,
    sync::Arc,
    time::Duration,
};

use parking_lot::Mutex;

use blobby_common::Clock;

/// Sliding-window failure counter: `wait()` grows linearly with recent failure count, capped at
/// `max`, and decays back to zero once failures age out of `period`.
pub struct BackOff {
    clock: Arc<dyn Clock>,
    period: Duration,
    step: Duration,
    max: Duration,
    capacity: usize,
    failures: Mutex<VecDeque<Duration>>,
}

impl BackOff {
    /// `period` is the sliding window; `step` is the per-failure linear delay increment; `max`
    /// caps the total delay. The ring buffer's capacity is `period / step` slots, matching the
    /// spec's sizing rationale (no more failures than could occur, one per `step`, within a
    /// single window).
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>, period: Duration, step: Duration, max: Duration) -> Self {
        let capacity = (period.as_nanos() / step.as_nanos().max(1)).max(1) as usize;
        Self {
            clock,
            period,
            step,
            max,
            capacity,
            failures: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Records a failure at the current time.
    pub fn failure(&self) {
        let now = self.clock.now_unix();
        let mut failures = self.failures.lock();
        failures.push_back(now);
        while failures.len() > self.capacity {
            failures.pop_front();
        }
    }

    /// Evicts entries older than `now - period`, then returns the delay to wait before the next
    /// attempt: `step * max(0, len - 1)`, capped at `max`.
    #[must_use]
    pub fn wait(&self) -> Duration {
        let len = self.evict_and_len();
        let multiplier = len.saturating_sub(1) as u32;
        std::cmp::min(self.step.saturating_mul(multiplier), self.max)
    }

    /// `true` iff there are no unexpired failures recorded.
    #[must_use]
    pub fn healthy(&self) -> bool {
        self.evict_and_len() == 0
    }

    fn evict_and_len(&self) -> usize {
        let now = self.clock.now_unix();
        let cutoff = now.saturating_sub(self.period);
        let mut failures = self.failures.lock();
        while matches!(failures.front(), Some(t) if *t < cutoff) {
            failures.pop_front();
        }
        failures.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blobby_common::TestClock;

    #[test]
    fn healthy_with_no_failures() {
        let clock = Arc::new(TestClock::new(Duration::from_secs(0)));
        let backoff = BackOff::new(clock, Duration::from_secs(60), Duration::from_secs(1), Duration::from_secs(10));
        assert!(backoff.healthy());
        assert_eq!(backoff.wait(), Duration::ZERO);
    }

    #[test]
    fn wait_grows_linearly_and_caps() {
        let clock = Arc::new(TestClock::new(Duration::from_secs(0)));
        let backoff = BackOff::new(
            clock.clone(),
            Duration::from_secs(60),
            Duration::from_secs(1),
            Duration::from_secs(3),
        );

        backoff.failure();
        assert_eq!(backoff.wait(), Duration::ZERO); // len=1 -> step*max(0,0)
        backoff.failure();
        assert_eq!(backoff.wait(), Duration::from_secs(1)); // len=2 -> step*1
        backoff.failure();
        assert_eq!(backoff.wait(), Duration::from_secs(2)); // len=3 -> step*2
        backoff.failure();
        backoff.failure();
        backoff.failure();
        assert_eq!(backoff.wait(), Duration::from_secs(3)); // capped at max
        assert!(!backoff.healthy());
    }

    #[test]
    fn failures_age_out_of_the_window() {
        let clock = Arc::new(TestClock::new(Duration::from_secs(0)));
        let backoff = BackOff::new(
            clock.clone(),
            Duration::from_secs(10),
            Duration::from_secs(1),
            Duration::from_secs(10),
        );

        backoff.failure();
        backoff.failure();
        assert!(!backoff.healthy());

        clock.advance(Duration::from_secs(11));
        assert!(backoff.healthy());
        assert_eq!(backoff.wait(), Duration::ZERO);
    }
}
