//! Runtime burst classification.
//!
//! Some devices report a small burst size at open and then deliver callbacks
//! in back-to-back clumps anyway. The profiler watches the inter-callback
//! deltas of the first few playback callbacks after each open: a run of
//! near-zero deltas means the device is bursty and the playback bridge must
//! switch to the jittered strategy. The verdict is locked until the next
//! open/reopen.

use std::time::Duration;

use crate::config::ProfileConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BurstClass {
    Small,
    Large,
}

pub struct BurstProfiler {
    window: u32,
    consecutive_needed: u32,
    /// Compared against whole elapsed milliseconds
    fast_delta_ms: u64,
    observed: u32,
    consecutive_fast: u32,
    verdict: Option<BurstClass>,
}

impl BurstProfiler {
    pub fn new(config: &ProfileConfig) -> Self {
        Self {
            window: config.window_callbacks,
            consecutive_needed: config.consecutive_fast_callbacks.max(1),
            fast_delta_ms: config.fast_delta_ms,
            observed: 0,
            consecutive_fast: 0,
            verdict: None,
        }
    }

    /// Feed one inter-callback delta. Returns the classification only on the
    /// call that decides it.
    pub fn observe(&mut self, delta: Duration) -> Option<BurstClass> {
        if self.verdict.is_some() {
            return None;
        }

        self.observed += 1;
        // Truncated to whole milliseconds: with a 1 ms threshold anything
        // under 2 ms counts as back-to-back.
        if delta.as_millis() <= u128::from(self.fast_delta_ms) {
            self.consecutive_fast += 1;
        } else {
            self.consecutive_fast = 0;
        }

        let decided = if self.consecutive_fast >= self.consecutive_needed {
            BurstClass::Large
        } else if self.observed >= self.window {
            BurstClass::Small
        } else {
            return None;
        };
        self.verdict = Some(decided);
        Some(decided)
    }

    pub fn verdict(&self) -> Option<BurstClass> {
        self.verdict
    }

    pub fn reset(&mut self) {
        self.observed = 0;
        self.consecutive_fast = 0;
        self.verdict = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profiler() -> BurstProfiler {
        BurstProfiler::new(&ProfileConfig::default())
    }

    fn feed(profiler: &mut BurstProfiler, deltas_ms: &[u64]) -> Option<BurstClass> {
        deltas_ms
            .iter()
            .filter_map(|ms| profiler.observe(Duration::from_millis(*ms)))
            .last()
    }

    #[test]
    fn steady_period_classifies_small_after_window() {
        let mut profiler = profiler();
        assert_eq!(feed(&mut profiler, &[8; 9]), None);
        assert_eq!(profiler.verdict(), None);
        assert_eq!(feed(&mut profiler, &[8]), Some(BurstClass::Small));
    }

    #[test]
    fn four_back_to_back_callbacks_classify_large() {
        let mut profiler = profiler();
        let verdict = feed(&mut profiler, &[8, 8, 0, 1, 0, 0]);
        assert_eq!(verdict, Some(BurstClass::Large));
        assert_eq!(profiler.verdict(), Some(BurstClass::Large));
    }

    #[test]
    fn sub_two_millisecond_deltas_count_as_fast() {
        let mut fast = profiler();
        for _ in 0..3 {
            assert_eq!(fast.observe(Duration::from_micros(1_900)), None);
        }
        assert_eq!(
            fast.observe(Duration::from_micros(1_999)),
            Some(BurstClass::Large)
        );

        let mut steady = profiler();
        let verdict = (0..10)
            .filter_map(|_| steady.observe(Duration::from_micros(2_000)))
            .last();
        assert_eq!(verdict, Some(BurstClass::Small));
    }

    #[test]
    fn interrupted_runs_do_not_classify_large() {
        let mut profiler = profiler();
        let verdict = feed(&mut profiler, &[0, 0, 0, 8, 0, 0, 0, 8, 0, 0]);
        assert_eq!(verdict, Some(BurstClass::Small));
    }

    #[test]
    fn verdict_is_locked_until_reset() {
        let mut profiler = profiler();
        feed(&mut profiler, &[0, 0, 0, 0]);
        assert_eq!(profiler.verdict(), Some(BurstClass::Large));

        assert_eq!(feed(&mut profiler, &[8; 20]), None);
        assert_eq!(profiler.verdict(), Some(BurstClass::Large));

        profiler.reset();
        assert_eq!(profiler.verdict(), None);
        assert_eq!(feed(&mut profiler, &[8; 10]), Some(BurstClass::Small));
    }
}
