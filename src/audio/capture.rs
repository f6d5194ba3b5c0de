//! Capture bridge: device input callbacks in, engine `read()` out.
//!
//! ```text
//!   device capture thread                       engine thread
//!   ---------------------                       -------------
//!   on_data(InputI16/InputF32)                  read(planes)
//!     convert -> f32 item                         first read: keep newest item only
//!     enqueue ----------> [RingBuffer] ---------> empty: wait (bounded) on data_ready
//!     notify data_ready                           backlog > limit: drain to 1
//!                                                 dequeue -> deinterleave into planes
//! ```
//!
//! In playback-only mode there is no capture stream. The playback bridge
//! pushes a muted item per callback instead, so `read()` still paces the
//! engine off the device clock and never stalls for the full timeout.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, info};

use super::frame::{self, FrameLayout};
use super::ring_buffer::{Enqueued, RingBuffer};
use super::wait::{wait_until, WaitOutcome, WaitPolicy};
use super::report_fault;
use crate::config::BridgeConfig;
use crate::engine::backend::{CallbackResult, DeviceBuffer, DeviceCallbackSink, DeviceFault, Direction};
use crate::engine::recovery::{RefreshReason, RefreshSignal};
use crate::telemetry::{BridgeObserver, MetricEvent};

/// Result of one engine `read()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// A captured item was delivered to the engine planes
    Captured,
    /// Capture is disabled; queued items were discarded and the planes zeroed
    Discarded,
    /// Nothing arrived within the timeout; the planes were zeroed
    TimedOut,
    /// No capture lane delivered data within the timeout (driver closed or
    /// capture not reopened); the planes were zeroed
    Idle,
}

#[derive(Debug, Clone)]
pub struct CaptureSettings {
    pub capacity_items: usize,
    pub backlog_limit: usize,
    pub wait: WaitPolicy,
}

impl From<&BridgeConfig> for CaptureSettings {
    fn from(config: &BridgeConfig) -> Self {
        Self {
            capacity_items: config.queue_capacity_items,
            backlog_limit: config.capture_backlog_limit,
            wait: WaitPolicy::new(config.read_timeout(), config.large_burst_read_multiplier),
        }
    }
}

/// Cumulative capture counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CaptureStats {
    pub items_captured: u64,
    pub muted_injections: u64,
    pub items_read: u64,
    pub read_timeouts: u64,
    pub backlog_drains: u64,
    pub items_discarded: u64,
    pub items_overwritten: u64,
}

#[derive(Default)]
struct CaptureCounters {
    items_captured: AtomicU64,
    muted_injections: AtomicU64,
    items_read: AtomicU64,
    read_timeouts: AtomicU64,
    backlog_drains: AtomicU64,
    items_discarded: AtomicU64,
    items_overwritten: AtomicU64,
}

impl CaptureCounters {
    fn snapshot(&self) -> CaptureStats {
        CaptureStats {
            items_captured: self.items_captured.load(Ordering::Relaxed),
            muted_injections: self.muted_injections.load(Ordering::Relaxed),
            items_read: self.items_read.load(Ordering::Relaxed),
            read_timeouts: self.read_timeouts.load(Ordering::Relaxed),
            backlog_drains: self.backlog_drains.load(Ordering::Relaxed),
            items_discarded: self.items_discarded.load(Ordering::Relaxed),
            items_overwritten: self.items_overwritten.load(Ordering::Relaxed),
        }
    }
}

/// Per-binding state; rebuilt from scratch on every open/reopen.
struct CaptureLane {
    layout: FrameLayout,
    queue: RingBuffer<f32>,
    /// Device-side conversion scratch
    convert: Vec<f32>,
    /// Engine-side dequeue scratch
    read_frame: Vec<f32>,
    muted: Vec<f32>,
    device_enabled: bool,
    first_read: bool,
}

impl CaptureLane {
    fn new(layout: FrameLayout, capacity_items: usize, device_enabled: bool) -> Self {
        Self {
            layout,
            queue: RingBuffer::new(capacity_items, layout.samples()),
            convert: layout.silence(),
            read_frame: layout.silence(),
            muted: layout.silence(),
            device_enabled,
            first_read: true,
        }
    }
}

pub struct CaptureBridge {
    lane: Mutex<Option<CaptureLane>>,
    data_ready: Condvar,
    /// A capture callback has arrived since the last arm
    live: AtomicBool,
    /// A playback callback has arrived since the last arm
    playback_live: AtomicBool,
    /// Playback is running the large-burst strategy
    large_burst: AtomicBool,
    settings: CaptureSettings,
    signal: Arc<RefreshSignal>,
    observer: Arc<dyn BridgeObserver>,
    counters: CaptureCounters,
}

impl CaptureBridge {
    pub fn new(
        settings: CaptureSettings,
        signal: Arc<RefreshSignal>,
        observer: Arc<dyn BridgeObserver>,
    ) -> Self {
        Self {
            lane: Mutex::new(None),
            data_ready: Condvar::new(),
            live: AtomicBool::new(false),
            playback_live: AtomicBool::new(false),
            large_burst: AtomicBool::new(false),
            settings,
            signal,
            observer,
            counters: CaptureCounters::default(),
        }
    }

    /// Install a fresh queue for a newly opened binding.
    ///
    /// `device_enabled` is false in playback-only mode, where the queue only
    /// ever carries muted items.
    pub fn attach(&self, layout: FrameLayout, device_enabled: bool) {
        let lane = CaptureLane::new(layout, self.settings.capacity_items, device_enabled);
        *self.lock_lane() = Some(lane);
        self.live.store(false, Ordering::Release);
        debug!(
            frames = layout.frames,
            channels = layout.channels,
            device_enabled,
            "capture lane attached"
        );
    }

    /// Drop the queue of a closing binding and wake any waiting reader.
    pub fn detach(&self) {
        self.lock_lane().take();
        self.data_ready.notify_all();
    }

    /// Reset per-run state before the streams start.
    pub fn arm(&self) {
        if let Some(lane) = self.lock_lane().as_mut() {
            lane.first_read = true;
        }
        self.live.store(false, Ordering::Release);
        self.playback_live.store(false, Ordering::Release);
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    pub fn mark_playback_live(&self) {
        self.playback_live.store(true, Ordering::Release);
    }

    pub fn set_large_burst(&self, large_burst: bool) {
        self.large_burst.store(large_burst, Ordering::Release);
    }

    pub fn depth(&self) -> usize {
        self.lock_lane()
            .as_ref()
            .map_or(0, |lane| lane.queue.count())
    }

    pub fn stats(&self) -> CaptureStats {
        self.counters.snapshot()
    }

    /// Queue a muted item so a reader blocked in playback-only mode wakes up.
    pub fn push_muted(&self) {
        {
            let mut guard = self.lock_lane();
            let Some(lane) = guard.as_mut() else {
                return;
            };
            lane.queue.enqueue(&lane.muted);
        }
        self.counters.muted_injections.fetch_add(1, Ordering::Relaxed);
        self.data_ready.notify_one();
    }

    /// Engine-side read: fill `planes` with one period of capture data.
    ///
    /// Never blocks longer than the policy timeout and never fails; missing
    /// data is replaced by silence.
    pub fn read(&self, planes: &mut [&mut [f32]]) -> ReadStatus {
        let mut guard = self.lock_lane();
        if guard.is_none() {
            // Still pace the engine: wait for a lane to come back with data.
            let timeout = self.read_timeout();
            let (waited, outcome) = wait_until(&self.data_ready, guard, timeout, |lane| {
                lane.as_ref().is_some_and(|lane| lane.queue.count() > 0)
            });
            guard = waited;
            if outcome == WaitOutcome::TimedOut {
                frame::silence_planes(planes);
                return ReadStatus::Idle;
            }
        }
        let Some(lane) = guard.as_mut() else {
            frame::silence_planes(planes);
            return ReadStatus::Idle;
        };

        if lane.first_read {
            lane.first_read = false;
            let stale = lane.queue.drain_to(1);
            if stale > 0 {
                debug!(stale, "discarded capture items queued before first read");
                self.counters
                    .items_discarded
                    .fetch_add(stale as u64, Ordering::Relaxed);
            }
        }

        let depth = lane.queue.count();
        if depth == 0 {
            let timeout = self.read_timeout();
            let (waited, outcome) = wait_until(&self.data_ready, guard, timeout, |lane| {
                lane.as_ref().map_or(true, |lane| lane.queue.count() > 0)
            });
            guard = waited;

            if outcome == WaitOutcome::TimedOut {
                frame::silence_planes(planes);
                self.on_read_timeout(timeout.as_millis() as u64);
                return ReadStatus::TimedOut;
            }
        } else if depth > self.settings.backlog_limit && lane.device_enabled {
            let discarded = lane.queue.drain_to(1);
            info!(depth, discarded, "engine is behind capture; draining backlog");
            self.counters.backlog_drains.fetch_add(1, Ordering::Relaxed);
            self.counters
                .items_discarded
                .fetch_add(discarded as u64, Ordering::Relaxed);
            self.observer
                .record(MetricEvent::CaptureBacklog { depth, discarded });
        }

        let Some(lane) = guard.as_mut() else {
            frame::silence_planes(planes);
            return ReadStatus::Idle;
        };

        if !lane.queue.dequeue(&mut lane.read_frame) {
            frame::silence_planes(planes);
            return ReadStatus::TimedOut;
        }

        if lane.device_enabled {
            frame::deinterleave(&lane.read_frame, lane.layout, planes);
            self.counters.items_read.fetch_add(1, Ordering::Relaxed);
            ReadStatus::Captured
        } else {
            let discarded = lane.queue.clear();
            self.counters
                .items_discarded
                .fetch_add(discarded as u64 + 1, Ordering::Relaxed);
            frame::silence_planes(planes);
            ReadStatus::Discarded
        }
    }

    fn read_timeout(&self) -> Duration {
        self.settings
            .wait
            .timeout(self.large_burst.load(Ordering::Acquire))
    }

    fn on_read_timeout(&self, timeout_ms: u64) {
        self.counters.read_timeouts.fetch_add(1, Ordering::Relaxed);
        error!(timeout_ms, "capture read timed out; delivering silence");
        self.observer.record(MetricEvent::ReadTimeout { timeout_ms });

        // Only a stall after data has started flowing counts as a liveness
        // failure; a timeout before the first callback is just startup.
        if self.playback_live.load(Ordering::Acquire) || self.live.load(Ordering::Acquire) {
            self.signal.request(RefreshReason::CaptureTimeout);
        }
    }

    fn capture_item(&self, lane: &mut CaptureLane, buffer: &DeviceBuffer<'_>) -> bool {
        let item_len = lane.layout.samples();
        match buffer {
            DeviceBuffer::InputI16(samples) => {
                for chunk in samples.chunks(item_len) {
                    lane.convert.fill(0.0);
                    frame::i16_to_f32(chunk, &mut lane.convert);
                    self.enqueue_converted(lane);
                }
                true
            }
            DeviceBuffer::InputF32(samples) => {
                for chunk in samples.chunks(item_len) {
                    lane.convert.fill(0.0);
                    lane.convert[..chunk.len()].copy_from_slice(chunk);
                    self.enqueue_converted(lane);
                }
                true
            }
            DeviceBuffer::OutputF32(_) | DeviceBuffer::OutputI16(_) => false,
        }
    }

    fn enqueue_converted(&self, lane: &CaptureLane) {
        if lane.queue.enqueue(&lane.convert) == Enqueued::OverwroteOldest {
            self.counters
                .items_overwritten
                .fetch_add(1, Ordering::Relaxed);
        }
        self.counters.items_captured.fetch_add(1, Ordering::Relaxed);
    }

    fn lock_lane(&self) -> MutexGuard<'_, Option<CaptureLane>> {
        self.lane.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl DeviceCallbackSink for CaptureBridge {
    fn on_data(&self, buffer: DeviceBuffer<'_>) -> CallbackResult {
        let depth = {
            let mut guard = self.lock_lane();
            let Some(lane) = guard.as_mut() else {
                return CallbackResult::Stop;
            };
            if !self.capture_item(lane, &buffer) {
                return CallbackResult::Stop;
            }
            lane.queue.count()
        };

        self.live.store(true, Ordering::Release);
        self.data_ready.notify_one();
        self.observer
            .record_queue_depth("capture", depth, self.settings.capacity_items);
        CallbackResult::Continue
    }

    fn on_fault(&self, fault: DeviceFault) {
        report_fault(Direction::Capture, fault, &self.signal, self.observer.as_ref());
    }
}
