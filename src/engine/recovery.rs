//! Recovery state: the refresh flag and the single re-entrancy guard.
//!
//! Any callback thread may raise the flag through [`RefreshSignal::request`].
//! Only the holder of a [`RefreshTicket`] clears it, and at most one ticket
//! exists at a time: a second request while a refresh is running is dropped,
//! not queued. A failed refresh halts recovery: further requests are dropped
//! until the driver is started again. The stop/close/reopen/start sequence
//! itself lives in the driver, which owns the stream bindings.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{DriverError, ErrorCode};
use crate::telemetry::{BridgeObserver, MetricEvent, RefreshPhase};

/// Why a refresh was requested.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RefreshReason {
    CallbackStarvation,
    PlaybackUnderrun,
    PlaybackOverrun,
    CaptureTimeout,
    DeviceDisconnected,
    Manual,
}

/// How a refresh attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    Completed,
    /// Another refresh held the guard; this request was dropped.
    AlreadyInProgress,
    /// The driver was not running, so there was nothing to refresh.
    Skipped,
}

/// "Needs refresh" flag shared with the bridges.
pub struct RefreshSignal {
    needed: AtomicBool,
    refreshing: AtomicBool,
    /// Set by a failed refresh, cleared by `resume`
    halted: AtomicBool,
    requests: AtomicU64,
    observer: Arc<dyn BridgeObserver>,
}

impl RefreshSignal {
    pub fn new(observer: Arc<dyn BridgeObserver>) -> Self {
        Self {
            needed: AtomicBool::new(false),
            refreshing: AtomicBool::new(false),
            halted: AtomicBool::new(false),
            requests: AtomicU64::new(0),
            observer,
        }
    }

    /// Raise the flag. Returns `true` only for the call that raised it.
    ///
    /// Dropped while recovery is halted after a failed refresh.
    pub fn request(&self, reason: RefreshReason) -> bool {
        if self.halted.load(Ordering::Acquire) {
            debug!(?reason, "recovery halted after a failed refresh; request dropped");
            return false;
        }
        if self.needed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.requests.fetch_add(1, Ordering::Relaxed);
        warn!(?reason, "driver refresh requested");
        self.observer.record(MetricEvent::Refresh {
            phase: RefreshPhase::Requested,
            reason: Some(reason),
        });
        true
    }

    pub fn is_needed(&self) -> bool {
        self.needed.load(Ordering::Acquire)
    }

    /// True while a refresh sequence is running; playback renders silence.
    pub fn is_refreshing(&self) -> bool {
        self.refreshing.load(Ordering::Acquire)
    }

    /// True after a failed refresh until the next `resume`.
    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    /// Accept requests again; called when the driver starts a new run.
    pub fn resume(&self) {
        self.halted.store(false, Ordering::Release);
        self.needed.store(false, Ordering::Release);
    }

    /// Number of times the flag went from clear to raised.
    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }
}

/// Guard plus bookkeeping for refresh attempts.
pub struct RecoveryController {
    signal: Arc<RefreshSignal>,
    guard: Mutex<()>,
    completed: AtomicU64,
    failed: AtomicU64,
    observer: Arc<dyn BridgeObserver>,
}

impl RecoveryController {
    pub fn new(signal: Arc<RefreshSignal>, observer: Arc<dyn BridgeObserver>) -> Self {
        Self {
            signal,
            guard: Mutex::new(()),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            observer,
        }
    }

    pub fn signal(&self) -> &Arc<RefreshSignal> {
        &self.signal
    }

    /// Enter the Refreshing state if no other refresh is running.
    pub fn try_begin(&self) -> Option<RefreshTicket<'_>> {
        let guard = match self.guard.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => {
                info!("refresh already in progress; dropping request");
                return None;
            }
        };
        self.signal.refreshing.store(true, Ordering::Release);
        Some(RefreshTicket {
            controller: self,
            _guard: guard,
        })
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

/// Proof of holding the recovery guard. Dropping it returns the controller
/// to Idle and clears the refresh flag.
pub struct RefreshTicket<'a> {
    controller: &'a RecoveryController,
    _guard: MutexGuard<'a, ()>,
}

impl RefreshTicket<'_> {
    pub fn started(&self) {
        info!("driver refresh started");
        self.controller.observer.record(MetricEvent::Refresh {
            phase: RefreshPhase::Started,
            reason: None,
        });
    }

    /// Record the result of the sequence. A failure halts recovery so it is
    /// not retried.
    pub fn finish(self, result: &Result<(), DriverError>) {
        let phase = match result {
            Ok(()) => {
                self.controller.completed.fetch_add(1, Ordering::Relaxed);
                info!("driver refresh completed");
                RefreshPhase::Completed
            }
            Err(err) => {
                self.controller.failed.fetch_add(1, Ordering::Relaxed);
                self.controller
                    .signal
                    .halted
                    .store(true, Ordering::Release);
                warn!(code = err.code(), "driver refresh aborted: {}", err.message());
                RefreshPhase::Failed
            }
        };
        self.controller.observer.record(MetricEvent::Refresh {
            phase,
            reason: None,
        });
    }

    pub fn skip(self) {
        info!("driver not running; refresh skipped");
        self.controller.observer.record(MetricEvent::Refresh {
            phase: RefreshPhase::Skipped,
            reason: None,
        });
    }
}

impl Drop for RefreshTicket<'_> {
    fn drop(&mut self) {
        let signal = &self.controller.signal;
        signal.needed.store(false, Ordering::Release);
        signal.refreshing.store(false, Ordering::Release);
    }
}
