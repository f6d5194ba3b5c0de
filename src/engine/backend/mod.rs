//! Device abstractions for the bridge driver.
//!
//! The driver never talks to a native audio API directly. It opens streams
//! through [`AudioDevice`], drives them through [`DeviceStream`], and receives
//! data-ready and error callbacks through a [`DeviceCallbackSink`] that the
//! capture and playback bridges implement.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::DriverError;

/// Stream direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Playback,
    Capture,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Playback => f.write_str("playback"),
            Direction::Capture => f.write_str("capture"),
        }
    }
}

/// Native sample encoding of a device stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleEncoding {
    F32,
    I16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SharingMode {
    Shared,
    Exclusive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PerformanceMode {
    None,
    LowLatency,
    PowerSaving,
}

/// Everything the driver asks of the device when opening one direction.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamRequest {
    pub direction: Direction,
    pub sample_rate: u32,
    pub channels: u16,
    /// Requested callback granularity; the engine period.
    pub frames_per_callback: u32,
    pub encoding: SampleEncoding,
    pub sharing: SharingMode,
    pub performance: PerformanceMode,
}

impl StreamRequest {
    pub fn new(
        direction: Direction,
        sample_rate: u32,
        channels: u16,
        frames_per_callback: u32,
        encoding: SampleEncoding,
    ) -> Self {
        Self {
            direction,
            sample_rate,
            channels,
            frames_per_callback,
            encoding,
            sharing: SharingMode::Shared,
            performance: PerformanceMode::LowLatency,
        }
    }
}

/// Parameters the device actually granted.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamProperties {
    pub direction: Direction,
    pub sample_rate: u32,
    pub channels: u16,
    /// Device-native burst; may be larger than the requested callback size.
    pub frames_per_burst: u32,
    pub frames_per_callback: u32,
    pub encoding: SampleEncoding,
    pub buffer_capacity_frames: u32,
    pub buffer_size_frames: u32,
    pub sharing: SharingMode,
    pub performance: PerformanceMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Open,
    Started,
    Stopped,
    Disconnected,
    Closed,
}

/// Problems reported through the device error callback.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceFault {
    Disconnected,
    Other(String),
}

/// Buffer handed to a sink on each data-ready callback. Samples are
/// interleaved.
pub enum DeviceBuffer<'a> {
    OutputF32(&'a mut [f32]),
    OutputI16(&'a mut [i16]),
    InputF32(&'a [f32]),
    InputI16(&'a [i16]),
}

impl DeviceBuffer<'_> {
    pub fn direction(&self) -> Direction {
        match self {
            DeviceBuffer::OutputF32(_) | DeviceBuffer::OutputI16(_) => Direction::Playback,
            DeviceBuffer::InputF32(_) | DeviceBuffer::InputI16(_) => Direction::Capture,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            DeviceBuffer::OutputF32(samples) => samples.len(),
            DeviceBuffer::OutputI16(samples) => samples.len(),
            DeviceBuffer::InputF32(samples) => samples.len(),
            DeviceBuffer::InputI16(samples) => samples.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// What the sink wants the device to do after a callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackResult {
    Continue,
    /// Only the first `n` frames were rendered. Backends that cannot submit
    /// short buffers play the whole (already silenced) buffer instead.
    Partial(usize),
    Stop,
}

/// Capability implemented by the bridges and registered with a device stream.
pub trait DeviceCallbackSink: Send + Sync {
    fn on_data(&self, buffer: DeviceBuffer<'_>) -> CallbackResult;
    fn on_fault(&self, fault: DeviceFault);
}

/// Native audio API entry point.
pub trait AudioDevice: Send + Sync {
    fn name(&self) -> &str;

    fn open_stream(
        &self,
        request: &StreamRequest,
        sink: Arc<dyn DeviceCallbackSink>,
    ) -> Result<Box<dyn DeviceStream>, DriverError>;
}

/// One open device stream. Dropping it without `close` must release the
/// native handle as well.
pub trait DeviceStream: Send {
    fn properties(&self) -> StreamProperties;
    /// Returns the buffer size the device actually applied.
    fn set_buffer_size_frames(&mut self, frames: u32) -> Result<u32, DriverError>;
    fn start(&mut self) -> Result<(), DriverError>;
    fn stop(&mut self) -> Result<(), DriverError>;
    fn close(&mut self) -> Result<(), DriverError>;
    fn state(&self) -> StreamState;
}

/// Trait representing a monotonic time source used for callback deltas.
pub trait TimeSource: Send + Sync {
    fn now(&self) -> Instant;
}

/// Default time source backed by `Instant::now`.
#[derive(Default)]
pub struct SystemTimeSource {
    _unit: (),
}

impl TimeSource for SystemTimeSource {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Deterministic time source for tests and simulations.
///
/// Time only moves when [`ManualTimeSource::advance`] is called.
pub struct ManualTimeSource {
    start: Instant,
    offset_us: AtomicU64,
}

impl ManualTimeSource {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            offset_us: AtomicU64::new(0),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.offset_us
            .fetch_add(by.as_micros() as u64, Ordering::SeqCst);
    }
}

impl Default for ManualTimeSource {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for ManualTimeSource {
    fn now(&self) -> Instant {
        self.start + Duration::from_micros(self.offset_us.load(Ordering::SeqCst))
    }
}

#[cfg(target_os = "android")]
mod oboe;
#[cfg(target_os = "android")]
pub use oboe::OboeDevice;

#[cfg(not(target_os = "android"))]
mod cpal;
#[cfg(not(target_os = "android"))]
pub use cpal::CpalDevice;

mod simulated;
pub use simulated::{SimConfig, SimEvent, SimulatedDevice};

/// Platform device used when the host does not inject one.
pub fn default_device() -> Arc<dyn AudioDevice> {
    cfg_if::cfg_if! {
        if #[cfg(target_os = "android")] {
            Arc::new(OboeDevice::new())
        } else {
            Arc::new(CpalDevice::new())
        }
    }
}
