//! Playback bridge: engine `write()` in, device output callbacks out.
//!
//! Two strategies share one queue:
//!
//! * **Direct** (small device bursts): one dequeue per callback behind a
//!   jitter warm-up, with starvation, underrun and overrun accounting.
//! * **Jittered** (large or bursty device bursts): the callback drains stale
//!   items, then waits on `data_ready` for the engine's next write.
//!
//! The strategy is picked per lane: large-burst if the binding said so at
//! open or the runtime profiler detects back-to-back callbacks. Either way
//! the verdict holds until the binding is reopened.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, trace, warn};

use super::capture::CaptureBridge;
use super::frame::{self, FrameLayout};
use super::report_fault;
use super::ring_buffer::{Enqueued, RingBuffer};
use super::startup_primer::HalfBufferPrimer;
use super::wait::{wait_until, WaitOutcome};
use crate::config::{BridgeConfig, ProfileConfig};
use crate::engine::backend::{
    CallbackResult, DeviceBuffer, DeviceCallbackSink, DeviceFault, Direction, TimeSource,
};
use crate::engine::profile::{BurstClass, BurstProfiler};
use crate::engine::recovery::{RefreshReason, RefreshSignal};
use crate::telemetry::{BridgeObserver, ClassificationSource, MetricEvent, XrunKind};

/// Result of one engine `write()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    Queued,
    /// The stream is not started or its first callback has not arrived yet
    NotLive,
    /// No playback lane is attached
    Idle,
}

#[derive(Debug, Clone)]
pub struct PlaybackSettings {
    pub capacity_items: usize,
    pub jitter_depth: usize,
    pub xrun_limit: u32,
    pub starvation_factor: u32,
    pub jittered_wait_factor: u32,
    pub primer_callbacks: u32,
    pub profile: ProfileConfig,
}

impl PlaybackSettings {
    pub fn new(bridge: &BridgeConfig, profile: &ProfileConfig) -> Self {
        Self {
            capacity_items: bridge.queue_capacity_items,
            jitter_depth: bridge.jitter_depth.max(1),
            xrun_limit: bridge.xrun_limit.max(1),
            starvation_factor: bridge.starvation_factor,
            jittered_wait_factor: bridge.jittered_wait_factor,
            primer_callbacks: bridge.startup_primer_callbacks,
            profile: profile.clone(),
        }
    }
}

/// Cumulative playback counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PlaybackStats {
    pub callbacks: u64,
    pub items_written: u64,
    pub items_rendered: u64,
    pub underruns: u64,
    pub overruns: u64,
    pub starvations: u64,
    pub silence_injections: u64,
    pub items_dropped: u64,
    pub items_overwritten: u64,
    pub jittered_wait_timeouts: u64,
    pub primed_callbacks: u64,
}

#[derive(Default)]
struct PlaybackCounters {
    callbacks: AtomicU64,
    items_written: AtomicU64,
    items_rendered: AtomicU64,
    underruns: AtomicU64,
    overruns: AtomicU64,
    starvations: AtomicU64,
    silence_injections: AtomicU64,
    items_dropped: AtomicU64,
    items_overwritten: AtomicU64,
    jittered_wait_timeouts: AtomicU64,
    primed_callbacks: AtomicU64,
}

impl PlaybackCounters {
    fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }

    fn snapshot(&self) -> PlaybackStats {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        PlaybackStats {
            callbacks: load(&self.callbacks),
            items_written: load(&self.items_written),
            items_rendered: load(&self.items_rendered),
            underruns: load(&self.underruns),
            overruns: load(&self.overruns),
            starvations: load(&self.starvations),
            silence_injections: load(&self.silence_injections),
            items_dropped: load(&self.items_dropped),
            items_overwritten: load(&self.items_overwritten),
            jittered_wait_timeouts: load(&self.jittered_wait_timeouts),
            primed_callbacks: load(&self.primed_callbacks),
        }
    }
}

/// Per-binding state; rebuilt from scratch on every open/reopen.
struct PlaybackLane {
    layout: FrameLayout,
    queue: RingBuffer<f32>,
    /// Engine-side interleave scratch
    write_frame: Vec<f32>,
    /// Device-side dequeue scratch
    render: Vec<f32>,
    muted: Vec<f32>,
    period: Duration,
    armed: bool,
    callback_started: bool,
    warmed_up: bool,
    prev_callback: Option<Instant>,
    underruns: u32,
    overruns: u32,
    profiler: BurstProfiler,
    large_burst: bool,
    primer: HalfBufferPrimer,
}

/// What a callback produced before it is written to the device buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rendered {
    Item,
    Silence,
    Primed(usize),
    Detached,
}

pub struct PlaybackBridge {
    lane: Mutex<Option<PlaybackLane>>,
    data_ready: Condvar,
    capture: Arc<CaptureBridge>,
    capture_enabled: AtomicBool,
    /// Output gain as `f32` bits; survives reopen
    gain: AtomicU32,
    settings: PlaybackSettings,
    signal: Arc<RefreshSignal>,
    observer: Arc<dyn BridgeObserver>,
    clock: Arc<dyn TimeSource>,
    counters: PlaybackCounters,
}

impl PlaybackBridge {
    pub fn new(
        settings: PlaybackSettings,
        capture: Arc<CaptureBridge>,
        signal: Arc<RefreshSignal>,
        observer: Arc<dyn BridgeObserver>,
        clock: Arc<dyn TimeSource>,
    ) -> Self {
        Self {
            lane: Mutex::new(None),
            data_ready: Condvar::new(),
            capture,
            capture_enabled: AtomicBool::new(false),
            gain: AtomicU32::new(1.0_f32.to_bits()),
            settings,
            signal,
            observer,
            clock,
            counters: PlaybackCounters::default(),
        }
    }

    /// Install a fresh queue for a newly opened binding.
    ///
    /// `large_burst` is the binding's open-time classification; the runtime
    /// profiler only runs when it is false.
    pub fn attach(&self, layout: FrameLayout, period: Duration, large_burst: bool) {
        let lane = PlaybackLane {
            layout,
            queue: RingBuffer::new(self.settings.capacity_items, layout.samples()),
            write_frame: layout.silence(),
            render: layout.silence(),
            muted: layout.silence(),
            period,
            armed: false,
            callback_started: false,
            warmed_up: false,
            prev_callback: None,
            underruns: 0,
            overruns: 0,
            profiler: BurstProfiler::new(&self.settings.profile),
            large_burst,
            primer: HalfBufferPrimer::new(self.settings.primer_callbacks),
        };
        *self.lock_lane() = Some(lane);
        self.capture.set_large_burst(large_burst);
        if large_burst {
            self.observer.record(MetricEvent::BurstClassified {
                direction: Direction::Playback,
                large_burst: true,
                source: ClassificationSource::Binding,
            });
        }
        debug!(
            frames = layout.frames,
            channels = layout.channels,
            large_burst,
            "playback lane attached"
        );
    }

    /// Drop the queue of a closing binding and wake a waiting callback.
    pub fn detach(&self) {
        self.lock_lane().take();
        self.data_ready.notify_all();
    }

    /// Reset per-run state before the stream starts.
    pub fn arm(&self) {
        if let Some(lane) = self.lock_lane().as_mut() {
            lane.armed = true;
            lane.callback_started = false;
            lane.warmed_up = false;
            lane.prev_callback = None;
            lane.underruns = 0;
            lane.overruns = 0;
            lane.primer.rearm();
            lane.queue.clear();
        }
    }

    /// Stop consuming; wakes a callback parked in the jittered wait.
    pub fn disarm(&self) {
        if let Some(lane) = self.lock_lane().as_mut() {
            lane.armed = false;
        }
        self.data_ready.notify_all();
    }

    pub fn set_capture_enabled(&self, enabled: bool) {
        self.capture_enabled.store(enabled, Ordering::Release);
    }

    /// Linear output gain, clamped to `0.0..=1.0`.
    pub fn set_volume(&self, volume: f32) {
        let gain = if volume.is_nan() { 0.0 } else { volume.clamp(0.0, 1.0) };
        self.gain.store(gain.to_bits(), Ordering::Relaxed);
    }

    pub fn volume(&self) -> f32 {
        f32::from_bits(self.gain.load(Ordering::Relaxed))
    }

    pub fn depth(&self) -> usize {
        self.lock_lane()
            .as_ref()
            .map_or(0, |lane| lane.queue.count())
    }

    pub fn is_large_burst(&self) -> bool {
        self.lock_lane()
            .as_ref()
            .is_some_and(|lane| lane.large_burst)
    }

    pub fn stats(&self) -> PlaybackStats {
        self.counters.snapshot()
    }

    /// Engine-side write: interleave `planes` into one item and queue it.
    pub fn write(&self, planes: &[&[f32]]) -> WriteStatus {
        {
            let mut guard = self.lock_lane();
            let Some(lane) = guard.as_mut() else {
                return WriteStatus::Idle;
            };
            if !lane.armed || !lane.callback_started {
                return WriteStatus::NotLive;
            }

            frame::interleave(planes, lane.layout, &mut lane.write_frame);
            if lane.queue.enqueue(&lane.write_frame) == Enqueued::OverwroteOldest {
                PlaybackCounters::bump(&self.counters.items_overwritten, 1);
            }
        }
        PlaybackCounters::bump(&self.counters.items_written, 1);
        self.data_ready.notify_one();
        WriteStatus::Queued
    }

    /// Direct strategy for one callback.
    fn render_direct(&self, lane: &mut PlaybackLane, delta: Option<Duration>) -> Rendered {
        let jitter = self.settings.jitter_depth;

        if !lane.warmed_up {
            if lane.queue.count() < jitter {
                return Rendered::Silence;
            }
            let surplus = lane.queue.drain_to(jitter);
            lane.warmed_up = true;
            PlaybackCounters::bump(&self.counters.items_dropped, surplus as u64);
            debug!(surplus, jitter, "playback warm-up complete");
            return self.dequeue(lane);
        }

        if let Some(delta) = delta {
            let limit = lane.period * self.settings.starvation_factor;
            if delta > limit {
                PlaybackCounters::bump(&self.counters.starvations, 1);
                let gap_ms = delta.as_secs_f32() * 1000.0;
                warn!(gap_ms, limit_ms = limit.as_millis() as u64, "playback callback starved");
                self.observer.record(MetricEvent::Starvation { gap_ms });
                self.signal.request(RefreshReason::CallbackStarvation);
                return Rendered::Silence;
            }
        }

        let depth = lane.queue.count();
        if depth == 0 {
            lane.underruns += 1;
            PlaybackCounters::bump(&self.counters.underruns, 1);
            self.record_xrun(XrunKind::Underrun, lane.underruns);
            if lane.underruns >= self.settings.xrun_limit {
                self.signal.request(RefreshReason::PlaybackUnderrun);
                return Rendered::Silence;
            }
            lane.queue.enqueue(&lane.muted);
            PlaybackCounters::bump(&self.counters.silence_injections, 1);
        } else if depth >= jitter * 2 {
            lane.overruns += 1;
            PlaybackCounters::bump(&self.counters.overruns, 1);
            self.record_xrun(XrunKind::Overrun, lane.overruns);
            if lane.overruns >= self.settings.xrun_limit {
                self.signal.request(RefreshReason::PlaybackOverrun);
                return Rendered::Silence;
            }
            lane.queue.discard();
            PlaybackCounters::bump(&self.counters.items_dropped, 1);
        } else {
            lane.underruns = 0;
            lane.overruns = 0;
        }

        self.dequeue(lane)
    }

    /// Jittered strategy for one callback. Takes the guard because it may
    /// park on `data_ready`.
    fn render_jittered<'a>(
        &'a self,
        mut guard: MutexGuard<'a, Option<PlaybackLane>>,
    ) -> (MutexGuard<'a, Option<PlaybackLane>>, Rendered) {
        let timeout = match guard.as_mut() {
            Some(lane) => {
                let stale = lane.queue.clear();
                PlaybackCounters::bump(&self.counters.items_dropped, stale as u64);
                lane.period * self.settings.jittered_wait_factor
            }
            None => return (guard, Rendered::Detached),
        };

        let (mut guard, outcome) = wait_until(&self.data_ready, guard, timeout, |lane| {
            lane.as_ref()
                .map_or(true, |lane| !lane.armed || lane.queue.count() > 0)
        });

        let rendered = match guard.as_mut() {
            None => Rendered::Detached,
            Some(lane) if !lane.armed => Rendered::Silence,
            Some(_) if outcome == WaitOutcome::TimedOut => {
                PlaybackCounters::bump(&self.counters.jittered_wait_timeouts, 1);
                trace!(timeout_ms = timeout.as_millis() as u64, "jittered wait timed out");
                Rendered::Silence
            }
            Some(lane) => match lane.primer.take(lane.layout.frames) {
                Some(frames) => {
                    PlaybackCounters::bump(&self.counters.primed_callbacks, 1);
                    Rendered::Primed(frames)
                }
                None => self.dequeue(lane),
            },
        };
        (guard, rendered)
    }

    fn dequeue(&self, lane: &mut PlaybackLane) -> Rendered {
        if lane.queue.dequeue(&mut lane.render) {
            PlaybackCounters::bump(&self.counters.items_rendered, 1);
            Rendered::Item
        } else {
            Rendered::Silence
        }
    }

    fn observe_timing(&self, lane: &mut PlaybackLane, delta: Option<Duration>) {
        if lane.large_burst {
            return;
        }
        let Some(delta) = delta else {
            return;
        };
        match lane.profiler.observe(delta) {
            Some(BurstClass::Large) => {
                lane.large_burst = true;
                self.capture.set_large_burst(true);
                info!("back-to-back playback callbacks; switching to jittered strategy");
                self.observer.record(MetricEvent::BurstClassified {
                    direction: Direction::Playback,
                    large_burst: true,
                    source: ClassificationSource::Profiler,
                });
            }
            Some(BurstClass::Small) => {
                debug!("playback callbacks arrive at period cadence; keeping direct strategy");
                self.observer.record(MetricEvent::BurstClassified {
                    direction: Direction::Playback,
                    large_burst: false,
                    source: ClassificationSource::Profiler,
                });
            }
            None => {}
        }
    }

    fn record_xrun(&self, kind: XrunKind, run_length: u32) {
        trace!(?kind, run_length, "playback xrun");
        self.observer.record(MetricEvent::Xrun { kind, run_length });
    }

    fn lock_lane(&self) -> MutexGuard<'_, Option<PlaybackLane>> {
        self.lane.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn write_output(buffer: DeviceBuffer<'_>, item: Option<&[f32]>) {
    match (buffer, item) {
        (DeviceBuffer::OutputF32(out), Some(item)) => {
            let copied = out.len().min(item.len());
            out[..copied].copy_from_slice(&item[..copied]);
            out[copied..].fill(0.0);
        }
        (DeviceBuffer::OutputI16(out), Some(item)) => {
            let copied = out.len().min(item.len());
            frame::f32_to_i16(&item[..copied], &mut out[..copied]);
            out[copied..].fill(0);
        }
        (DeviceBuffer::OutputF32(out), None) => out.fill(0.0),
        (DeviceBuffer::OutputI16(out), None) => out.fill(0),
        (DeviceBuffer::InputF32(_) | DeviceBuffer::InputI16(_), _) => {}
    }
}

impl DeviceCallbackSink for PlaybackBridge {
    fn on_data(&self, buffer: DeviceBuffer<'_>) -> CallbackResult {
        if buffer.direction() != Direction::Playback {
            return CallbackResult::Stop;
        }
        let now = self.clock.now();
        PlaybackCounters::bump(&self.counters.callbacks, 1);

        let mut guard = self.lock_lane();
        let Some(lane) = guard.as_mut() else {
            write_output(buffer, None);
            return CallbackResult::Stop;
        };
        if !lane.armed {
            write_output(buffer, None);
            return CallbackResult::Continue;
        }

        let delta = lane
            .prev_callback
            .replace(now)
            .map(|prev| now.saturating_duration_since(prev));
        if !lane.callback_started {
            lane.callback_started = true;
            self.capture.mark_playback_live();
        }
        self.observe_timing(lane, delta);

        let capture_enabled = self.capture_enabled.load(Ordering::Acquire);
        if !capture_enabled {
            self.capture.push_muted();
        } else if !self.capture.is_live() {
            // Duplex start: hold playback until capture delivers its first item.
            write_output(buffer, None);
            return CallbackResult::Continue;
        }

        let rendered = if lane.large_burst {
            let (held, rendered) = self.render_jittered(guard);
            guard = held;
            rendered
        } else {
            self.render_direct(lane, delta)
        };

        let refreshing = self.signal.is_refreshing();
        match guard.as_mut() {
            Some(lane) => {
                if rendered == Rendered::Item && !refreshing {
                    frame::apply_gain(&mut lane.render, self.volume());
                    write_output(buffer, Some(lane.render.as_slice()));
                } else {
                    write_output(buffer, None);
                }
                self.observer.record_queue_depth(
                    "playback",
                    lane.queue.count(),
                    self.settings.capacity_items,
                );
            }
            None => write_output(buffer, None),
        }

        match rendered {
            Rendered::Primed(frames) => CallbackResult::Partial(frames),
            Rendered::Detached => CallbackResult::Stop,
            Rendered::Item | Rendered::Silence => CallbackResult::Continue,
        }
    }

    fn on_fault(&self, fault: DeviceFault) {
        report_fault(Direction::Playback, fault, &self.signal, self.observer.as_ref());
    }
}

#[cfg(test)]
mod tests;
