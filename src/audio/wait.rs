//! Bounded waits on a bridge condition variable.
//!
//! Both bridges block in exactly one place each (capture `read()` and the
//! jittered playback callback) and both go through [`wait_until`]. The wait
//! runs against the monotonic clock inside `Condvar::wait_timeout_while`, so
//! spurious wakeups never extend the deadline.

use std::sync::{Condvar, MutexGuard, PoisonError};
use std::time::Duration;

/// Timeout policy: a base duration, scaled when the stream is large-burst.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitPolicy {
    pub base: Duration,
    pub large_burst_multiplier: u32,
}

impl WaitPolicy {
    pub fn new(base: Duration, large_burst_multiplier: u32) -> Self {
        Self {
            base,
            large_burst_multiplier: large_burst_multiplier.max(1),
        }
    }

    pub fn timeout(&self, large_burst: bool) -> Duration {
        if large_burst {
            self.base * self.large_burst_multiplier
        } else {
            self.base
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Ready,
    TimedOut,
}

/// Block on `condvar` until `ready` holds or `timeout` elapses.
///
/// `ready` is evaluated under the lock before the first sleep and after every
/// wakeup.
pub fn wait_until<'a, T, F>(
    condvar: &Condvar,
    guard: MutexGuard<'a, T>,
    timeout: Duration,
    mut ready: F,
) -> (MutexGuard<'a, T>, WaitOutcome)
where
    F: FnMut(&mut T) -> bool,
{
    let (guard, result) = condvar
        .wait_timeout_while(guard, timeout, |state| !ready(state))
        .unwrap_or_else(PoisonError::into_inner);
    let outcome = if result.timed_out() {
        WaitOutcome::TimedOut
    } else {
        WaitOutcome::Ready
    };
    (guard, outcome)
}
