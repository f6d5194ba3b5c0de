use std::marker::PhantomData;
use std::sync::Arc;

use oboe::{
    AudioInputCallback, AudioInputStreamSafe, AudioOutputCallback, AudioOutputStreamSafe,
    AudioStream, AudioStreamBase, AudioStreamBuilder, DataCallbackResult, Input, Mono, Output,
    Stereo,
};
use tracing::debug;

use super::{
    AudioDevice, CallbackResult, DeviceBuffer, DeviceCallbackSink, DeviceFault, DeviceStream,
    Direction, PerformanceMode, SampleEncoding, SharingMode, StreamProperties, StreamRequest,
    StreamState,
};
use crate::audio::frame;
use crate::error::DriverError;

/// Android device backed by Oboe (AAudio, or OpenSL ES on older releases).
pub struct OboeDevice {
    _unit: (),
}

impl OboeDevice {
    pub fn new() -> Self {
        Self { _unit: () }
    }
}

impl Default for OboeDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioDevice for OboeDevice {
    fn name(&self) -> &str {
        "oboe"
    }

    fn open_stream(
        &self,
        request: &StreamRequest,
        sink: Arc<dyn DeviceCallbackSink>,
    ) -> Result<Box<dyn DeviceStream>, DriverError> {
        let mut native = open_native(request, sink)?;
        let properties = StreamProperties {
            direction: request.direction,
            sample_rate: native.sample_rate(),
            channels: native.channels(),
            frames_per_burst: native.frames_per_burst(),
            frames_per_callback: request.frames_per_callback,
            encoding: request.encoding,
            buffer_capacity_frames: native.buffer_capacity(),
            buffer_size_frames: native.buffer_size(),
            sharing: request.sharing,
            performance: request.performance,
        };
        Ok(Box::new(OboeStream {
            native: Some(native),
            properties,
            state: StreamState::Open,
        }))
    }
}

/// Object-safe view over the typed Oboe stream.
trait NativeStream: Send {
    fn start(&mut self) -> Result<(), oboe::Error>;
    fn stop(&mut self) -> Result<(), oboe::Error>;
    fn set_buffer_size(&mut self, frames: u32) -> Result<u32, oboe::Error>;
    fn frames_per_burst(&mut self) -> u32;
    fn sample_rate(&self) -> u32;
    fn channels(&self) -> u16;
    fn buffer_size(&self) -> u32;
    fn buffer_capacity(&self) -> u32;
}

impl<S: AudioStream + Send> NativeStream for S {
    fn start(&mut self) -> Result<(), oboe::Error> {
        AudioStream::start(self)
    }

    fn stop(&mut self) -> Result<(), oboe::Error> {
        AudioStream::stop(self)
    }

    fn set_buffer_size(&mut self, frames: u32) -> Result<u32, oboe::Error> {
        self.set_buffer_size_in_frames(frames as i32)
            .map(|applied| applied.max(0) as u32)
    }

    fn frames_per_burst(&mut self) -> u32 {
        self.get_frames_per_burst().max(0) as u32
    }

    fn sample_rate(&self) -> u32 {
        self.get_sample_rate().max(0) as u32
    }

    fn channels(&self) -> u16 {
        self.get_channel_count() as u16
    }

    fn buffer_size(&self) -> u32 {
        self.get_buffer_size_in_frames().max(0) as u32
    }

    fn buffer_capacity(&self) -> u32 {
        self.get_buffer_capacity_in_frames().max(0) as u32
    }
}

struct OboeStream {
    native: Option<Box<dyn NativeStream>>,
    properties: StreamProperties,
    state: StreamState,
}

impl OboeStream {
    fn native(&mut self) -> Result<&mut Box<dyn NativeStream>, DriverError> {
        self.native.as_mut().ok_or(DriverError::NotOpen)
    }
}

impl DeviceStream for OboeStream {
    fn properties(&self) -> StreamProperties {
        self.properties.clone()
    }

    fn set_buffer_size_frames(&mut self, frames: u32) -> Result<u32, DriverError> {
        let direction = self.properties.direction;
        let applied = self
            .native()?
            .set_buffer_size(frames)
            .map_err(|e| DriverError::StreamOpenFailed {
                direction,
                reason: format!("set buffer size: {:?}", e),
            })?;
        self.properties.buffer_size_frames = applied;
        Ok(applied)
    }

    fn start(&mut self) -> Result<(), DriverError> {
        let direction = self.properties.direction;
        self.native()?
            .start()
            .map_err(|e| DriverError::StreamStartFailed {
                direction,
                reason: format!("{:?}", e),
            })?;
        self.state = StreamState::Started;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), DriverError> {
        let direction = self.properties.direction;
        self.native()?
            .stop()
            .map_err(|e| DriverError::StreamStopFailed {
                direction,
                reason: format!("{:?}", e),
            })?;
        self.state = StreamState::Stopped;
        Ok(())
    }

    fn close(&mut self) -> Result<(), DriverError> {
        // Dropping the Oboe stream closes it.
        if self.native.take().is_some() {
            debug!(direction = %self.properties.direction, "oboe stream released");
        }
        self.state = StreamState::Closed;
        Ok(())
    }

    fn state(&self) -> StreamState {
        self.state
    }
}

/// Stereo scratch is sized for at least this many frames at open so the
/// callback never allocates.
const SCRATCH_MIN_FRAMES: usize = 4096;

/// Callback object registered with Oboe; forwards into the sink.
struct Forwarder<T, C> {
    sink: Arc<dyn DeviceCallbackSink>,
    /// Interleave scratch for stereo streams; never resized
    scratch: Vec<T>,
    _channels: PhantomData<C>,
}

impl<T: Copy + Default, C> Forwarder<T, C> {
    fn new(sink: Arc<dyn DeviceCallbackSink>, frames_per_callback: u32) -> Self {
        let frames = (frames_per_callback as usize).max(SCRATCH_MIN_FRAMES);
        Self {
            sink,
            scratch: vec![T::default(); frames * 2],
            _channels: PhantomData,
        }
    }

    fn fault(&self, error: oboe::Error) {
        let fault = match error {
            oboe::Error::Disconnected => DeviceFault::Disconnected,
            other => DeviceFault::Other(format!("{:?}", other)),
        };
        self.sink.on_fault(fault);
    }
}

fn to_oboe(result: CallbackResult) -> DataCallbackResult {
    match result {
        CallbackResult::Stop => DataCallbackResult::Stop,
        // Oboe always plays the whole buffer; the bridge already silenced
        // whatever it did not render.
        CallbackResult::Continue | CallbackResult::Partial(_) => DataCallbackResult::Continue,
    }
}

macro_rules! forward_output {
    ($sample:ty, $variant:ident) => {
        impl AudioOutputCallback for Forwarder<$sample, Mono> {
            type FrameType = ($sample, Mono);

            fn on_audio_ready(
                &mut self,
                _stream: &mut dyn AudioOutputStreamSafe,
                frames: &mut [$sample],
            ) -> DataCallbackResult {
                to_oboe(self.sink.on_data(DeviceBuffer::$variant(frames)))
            }

            fn on_error_before_close(
                &mut self,
                _stream: &mut dyn AudioOutputStreamSafe,
                error: oboe::Error,
            ) {
                self.fault(error);
            }
        }

        impl AudioOutputCallback for Forwarder<$sample, Stereo> {
            type FrameType = ($sample, Stereo);

            fn on_audio_ready(
                &mut self,
                _stream: &mut dyn AudioOutputStreamSafe,
                frames: &mut [($sample, $sample)],
            ) -> DataCallbackResult {
                let sink = &self.sink;
                let result = frame::render_stereo(frames, &mut self.scratch, |buffer| {
                    sink.on_data(DeviceBuffer::$variant(buffer))
                });
                to_oboe(result)
            }

            fn on_error_before_close(
                &mut self,
                _stream: &mut dyn AudioOutputStreamSafe,
                error: oboe::Error,
            ) {
                self.fault(error);
            }
        }
    };
}

macro_rules! forward_input {
    ($sample:ty, $variant:ident) => {
        impl AudioInputCallback for Forwarder<$sample, Mono> {
            type FrameType = ($sample, Mono);

            fn on_audio_ready(
                &mut self,
                _stream: &mut dyn AudioInputStreamSafe,
                frames: &[$sample],
            ) -> DataCallbackResult {
                to_oboe(self.sink.on_data(DeviceBuffer::$variant(frames)))
            }

            fn on_error_before_close(
                &mut self,
                _stream: &mut dyn AudioInputStreamSafe,
                error: oboe::Error,
            ) {
                self.fault(error);
            }
        }

        impl AudioInputCallback for Forwarder<$sample, Stereo> {
            type FrameType = ($sample, Stereo);

            fn on_audio_ready(
                &mut self,
                _stream: &mut dyn AudioInputStreamSafe,
                frames: &[($sample, $sample)],
            ) -> DataCallbackResult {
                let sink = &self.sink;
                let delivered = frame::deliver_stereo(frames, &mut self.scratch, |chunk| {
                    sink.on_data(DeviceBuffer::$variant(chunk)) != CallbackResult::Stop
                });
                if delivered {
                    DataCallbackResult::Continue
                } else {
                    DataCallbackResult::Stop
                }
            }

            fn on_error_before_close(
                &mut self,
                _stream: &mut dyn AudioInputStreamSafe,
                error: oboe::Error,
            ) {
                self.fault(error);
            }
        }
    };
}

forward_output!(f32, OutputF32);
forward_output!(i16, OutputI16);
forward_input!(f32, InputF32);
forward_input!(i16, InputI16);

fn sharing(mode: SharingMode) -> oboe::SharingMode {
    match mode {
        SharingMode::Shared => oboe::SharingMode::Shared,
        SharingMode::Exclusive => oboe::SharingMode::Exclusive,
    }
}

fn performance(mode: PerformanceMode) -> oboe::PerformanceMode {
    match mode {
        PerformanceMode::None => oboe::PerformanceMode::None,
        PerformanceMode::LowLatency => oboe::PerformanceMode::LowLatency,
        PerformanceMode::PowerSaving => oboe::PerformanceMode::PowerSaving,
    }
}

macro_rules! open_typed {
    ($request:expr, $sink:expr, $dir:ty, $sample:ty, $channels:ty) => {
        AudioStreamBuilder::default()
            .set_performance_mode(performance($request.performance))
            .set_sharing_mode(sharing($request.sharing))
            .set_direction::<$dir>()
            .set_sample_rate($request.sample_rate as i32)
            .set_frames_per_callback($request.frames_per_callback as i32)
            .set_channel_count::<$channels>()
            .set_format::<$sample>()
            .set_callback(Forwarder::<$sample, $channels>::new(
                $sink,
                $request.frames_per_callback,
            ))
            .open_stream()
            .map(|stream| Box::new(stream) as Box<dyn NativeStream>)
    };
}

fn open_native(
    request: &StreamRequest,
    sink: Arc<dyn DeviceCallbackSink>,
) -> Result<Box<dyn NativeStream>, DriverError> {
    use Direction::{Capture, Playback};
    use SampleEncoding::{F32, I16};

    let direction = request.direction;
    let opened = match (direction, request.encoding, request.channels) {
        (Playback, F32, 1) => open_typed!(request, sink, Output, f32, Mono),
        (Playback, F32, 2) => open_typed!(request, sink, Output, f32, Stereo),
        (Playback, I16, 1) => open_typed!(request, sink, Output, i16, Mono),
        (Playback, I16, 2) => open_typed!(request, sink, Output, i16, Stereo),
        (Capture, F32, 1) => open_typed!(request, sink, Input, f32, Mono),
        (Capture, F32, 2) => open_typed!(request, sink, Input, f32, Stereo),
        (Capture, I16, 1) => open_typed!(request, sink, Input, i16, Mono),
        (Capture, I16, 2) => open_typed!(request, sink, Input, i16, Stereo),
        (_, _, channels) => {
            return Err(DriverError::StreamOpenFailed {
                direction,
                reason: format!("{} channels unsupported; Oboe streams are mono or stereo", channels),
            })
        }
    };
    opened.map_err(|e| DriverError::StreamOpenFailed {
        direction,
        reason: format!("{:?}", e),
    })
}
