//! Deterministic in-process device.
//!
//! Nothing runs on its own: the caller pumps playback callbacks, pushes
//! capture data and injects faults. Every lifecycle call is appended to an
//! event log so tests and the diagnostics CLI can check exact sequences.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use super::{
    AudioDevice, CallbackResult, DeviceBuffer, DeviceCallbackSink, DeviceFault, DeviceStream,
    Direction, SampleEncoding, StreamProperties, StreamRequest, StreamState,
};
use crate::audio::frame;
use crate::error::DriverError;

/// Shape of the simulated hardware.
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Native playback burst; `None` grants the requested callback size
    pub playback_burst_frames: Option<u32>,
    /// Native capture burst; `None` grants the requested callback size
    pub capture_burst_frames: Option<u32>,
    /// Forced playback encoding; `None` grants the requested one
    pub playback_encoding: Option<SampleEncoding>,
    /// Forced capture encoding; `None` grants the requested one
    pub capture_encoding: Option<SampleEncoding>,
    /// Maximum buffer depth, in bursts
    pub capacity_bursts: u32,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            playback_burst_frames: None,
            capture_burst_frames: None,
            playback_encoding: None,
            capture_encoding: None,
            capacity_bursts: 8,
        }
    }
}

/// Lifecycle call observed by the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimEvent {
    Opened(Direction),
    BufferSize(Direction, u32),
    Started(Direction),
    Stopped(Direction),
    Closed(Direction),
}

#[derive(Default)]
struct Failures {
    open: Option<Direction>,
    start: Option<Direction>,
}

struct Slot {
    id: u64,
    sink: Arc<dyn DeviceCallbackSink>,
    properties: StreamProperties,
    state: StreamState,
}

struct Shared {
    config: SimConfig,
    slots: Mutex<HashMap<Direction, Slot>>,
    events: Mutex<Vec<SimEvent>>,
    failures: Mutex<Failures>,
    next_id: AtomicU64,
}

impl Shared {
    fn slots(&self) -> MutexGuard<'_, HashMap<Direction, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn failures(&self) -> MutexGuard<'_, Failures> {
        self.failures.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn log(&self, event: SimEvent) {
        debug!(?event, "simulated device");
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }

    /// Sink and properties of the current stream in `direction`, if it is
    /// started. Cloned out so callbacks run without the slot lock held.
    fn started(
        &self,
        direction: Direction,
    ) -> Option<(Arc<dyn DeviceCallbackSink>, StreamProperties)> {
        self.slots()
            .get(&direction)
            .filter(|slot| slot.state == StreamState::Started)
            .map(|slot| (Arc::clone(&slot.sink), slot.properties.clone()))
    }
}

/// Caller-driven [`AudioDevice`].
pub struct SimulatedDevice {
    shared: Arc<Shared>,
}

impl SimulatedDevice {
    pub fn new(config: SimConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                slots: Mutex::new(HashMap::new()),
                events: Mutex::new(Vec::new()),
                failures: Mutex::new(Failures::default()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Make the next opens in `direction` fail until cleared with `None`.
    pub fn fail_open(&self, direction: Option<Direction>) {
        self.shared.failures().open = direction;
    }

    /// Make the next starts in `direction` fail until cleared with `None`.
    pub fn fail_start(&self, direction: Option<Direction>) {
        self.shared.failures().start = direction;
    }

    pub fn events(&self) -> Vec<SimEvent> {
        self.shared
            .events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn clear_events(&self) {
        self.shared
            .events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn state(&self, direction: Direction) -> StreamState {
        self.shared
            .slots()
            .get(&direction)
            .map_or(StreamState::Closed, |slot| slot.state)
    }

    pub fn properties(&self, direction: Direction) -> Option<StreamProperties> {
        self.shared
            .slots()
            .get(&direction)
            .map(|slot| slot.properties.clone())
    }

    /// Run one playback callback of one engine period.
    ///
    /// Returns `None` when no playback stream is started. Rendered samples
    /// come back as float regardless of the stream encoding.
    pub fn pump_playback(&self) -> Option<(CallbackResult, Vec<f32>)> {
        let (sink, properties) = self.shared.started(Direction::Playback)?;
        let samples = properties.frames_per_callback as usize * usize::from(properties.channels);

        match properties.encoding {
            SampleEncoding::F32 => {
                let mut out = vec![0.0_f32; samples];
                let result = sink.on_data(DeviceBuffer::OutputF32(&mut out));
                Some((result, out))
            }
            SampleEncoding::I16 => {
                let mut out = vec![0_i16; samples];
                let result = sink.on_data(DeviceBuffer::OutputI16(&mut out));
                let mut rendered = vec![0.0_f32; samples];
                frame::i16_to_f32(&out, &mut rendered);
                Some((result, rendered))
            }
        }
    }

    /// Deliver interleaved float samples to the started capture stream,
    /// converted to its encoding first.
    pub fn push_capture(&self, samples: &[f32]) -> Option<CallbackResult> {
        let (sink, properties) = self.shared.started(Direction::Capture)?;
        let result = match properties.encoding {
            SampleEncoding::F32 => sink.on_data(DeviceBuffer::InputF32(samples)),
            SampleEncoding::I16 => {
                let mut native = vec![0_i16; samples.len()];
                frame::f32_to_i16(samples, &mut native);
                sink.on_data(DeviceBuffer::InputI16(&native))
            }
        };
        Some(result)
    }

    /// Deliver one engine period of a constant value to the capture stream.
    pub fn push_capture_period(&self, value: f32) -> Option<CallbackResult> {
        let properties = self.properties(Direction::Capture)?;
        let samples = properties.frames_per_callback as usize * usize::from(properties.channels);
        self.push_capture(&vec![value; samples])
    }

    /// Fire the error callback of the open stream in `direction`.
    pub fn inject_fault(&self, direction: Direction, fault: DeviceFault) -> bool {
        let sink = {
            let mut slots = self.shared.slots();
            let Some(slot) = slots.get_mut(&direction) else {
                return false;
            };
            if fault == DeviceFault::Disconnected {
                slot.state = StreamState::Disconnected;
            }
            Arc::clone(&slot.sink)
        };
        sink.on_fault(fault);
        true
    }
}

impl Default for SimulatedDevice {
    fn default() -> Self {
        Self::new(SimConfig::default())
    }
}

impl AudioDevice for SimulatedDevice {
    fn name(&self) -> &str {
        "simulated"
    }

    fn open_stream(
        &self,
        request: &StreamRequest,
        sink: Arc<dyn DeviceCallbackSink>,
    ) -> Result<Box<dyn DeviceStream>, DriverError> {
        let direction = request.direction;
        if self.shared.failures().open == Some(direction) {
            return Err(DriverError::StreamOpenFailed {
                direction,
                reason: "simulated open failure".to_string(),
            });
        }

        let config = &self.shared.config;
        let (burst, encoding) = match direction {
            Direction::Playback => (config.playback_burst_frames, config.playback_encoding),
            Direction::Capture => (config.capture_burst_frames, config.capture_encoding),
        };
        let frames_per_burst = burst.unwrap_or(request.frames_per_callback).max(1);
        let capacity = frames_per_burst * config.capacity_bursts.max(1);
        let properties = StreamProperties {
            direction,
            sample_rate: request.sample_rate,
            channels: request.channels,
            frames_per_burst,
            frames_per_callback: request.frames_per_callback,
            encoding: encoding.unwrap_or(request.encoding),
            buffer_capacity_frames: capacity,
            buffer_size_frames: (frames_per_burst * 2).min(capacity),
            sharing: request.sharing,
            performance: request.performance,
        };

        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        self.shared.slots().insert(
            direction,
            Slot {
                id,
                sink,
                properties: properties.clone(),
                state: StreamState::Open,
            },
        );
        self.shared.log(SimEvent::Opened(direction));

        Ok(Box::new(SimStream {
            shared: Arc::clone(&self.shared),
            direction,
            id,
            properties,
            closed: false,
        }))
    }
}

struct SimStream {
    shared: Arc<Shared>,
    direction: Direction,
    id: u64,
    properties: StreamProperties,
    closed: bool,
}

impl SimStream {
    fn with_slot<R>(&self, apply: impl FnOnce(&mut Slot) -> R) -> Option<R> {
        let mut slots = self.shared.slots();
        slots
            .get_mut(&self.direction)
            .filter(|slot| slot.id == self.id)
            .map(apply)
    }

    fn set_state(&self, state: StreamState) {
        self.with_slot(|slot| slot.state = state);
    }

    fn release(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let mut slots = self.shared.slots();
        if slots
            .get(&self.direction)
            .is_some_and(|slot| slot.id == self.id)
        {
            slots.remove(&self.direction);
        }
        drop(slots);
        self.shared.log(SimEvent::Closed(self.direction));
    }
}

impl DeviceStream for SimStream {
    fn properties(&self) -> StreamProperties {
        self.properties.clone()
    }

    fn set_buffer_size_frames(&mut self, frames: u32) -> Result<u32, DriverError> {
        if self.closed {
            return Err(DriverError::NotOpen);
        }
        let applied = frames.min(self.properties.buffer_capacity_frames);
        self.properties.buffer_size_frames = applied;
        self.with_slot(|slot| slot.properties.buffer_size_frames = applied);
        self.shared.log(SimEvent::BufferSize(self.direction, applied));
        Ok(applied)
    }

    fn start(&mut self) -> Result<(), DriverError> {
        if self.shared.failures().start == Some(self.direction) {
            return Err(DriverError::StreamStartFailed {
                direction: self.direction,
                reason: "simulated start failure".to_string(),
            });
        }
        self.set_state(StreamState::Started);
        self.shared.log(SimEvent::Started(self.direction));
        Ok(())
    }

    fn stop(&mut self) -> Result<(), DriverError> {
        self.set_state(StreamState::Stopped);
        self.shared.log(SimEvent::Stopped(self.direction));
        Ok(())
    }

    fn close(&mut self) -> Result<(), DriverError> {
        self.release();
        Ok(())
    }

    fn state(&self) -> StreamState {
        if self.closed {
            return StreamState::Closed;
        }
        self.with_slot(|slot| slot.state)
            .unwrap_or(StreamState::Closed)
    }
}

impl Drop for SimStream {
    fn drop(&mut self) {
        self.release();
    }
}
