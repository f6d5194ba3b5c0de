//! CPAL-based device for desktop platforms (Linux, macOS, Windows)
//!
//! `cpal::Stream` is not `Send` on every host, so each stream lives on its
//! own worker thread and is driven through command messages. CPAL callbacks
//! arrive in whatever size the host picks; they are re-blocked here into
//! fixed engine periods before reaching the sink.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use tracing::{debug, warn};

use super::{
    AudioDevice, CallbackResult, DeviceBuffer, DeviceCallbackSink, DeviceFault, DeviceStream,
    Direction, SampleEncoding, StreamProperties, StreamRequest, StreamState,
};
use crate::error::DriverError;

/// Default host device through CPAL.
pub struct CpalDevice {
    name: String,
}

impl CpalDevice {
    pub fn new() -> Self {
        Self {
            name: format!("cpal:{:?}", cpal::default_host().id()),
        }
    }
}

impl Default for CpalDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioDevice for CpalDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn open_stream(
        &self,
        request: &StreamRequest,
        sink: Arc<dyn DeviceCallbackSink>,
    ) -> Result<Box<dyn DeviceStream>, DriverError> {
        Ok(Box::new(CpalStream::spawn(request.clone(), sink)?))
    }
}

type Reply = Sender<Result<(), DriverError>>;

enum Command {
    Start(Reply),
    Stop(Reply),
    Close,
}

struct CpalStream {
    direction: Direction,
    properties: StreamProperties,
    commands: Sender<Command>,
    worker: Option<JoinHandle<()>>,
    disconnected: Arc<AtomicBool>,
    state: StreamState,
}

impl CpalStream {
    fn spawn(request: StreamRequest, sink: Arc<dyn DeviceCallbackSink>) -> Result<Self, DriverError> {
        let direction = request.direction;
        let (commands, inbox) = mpsc::channel::<Command>();
        let (ready_tx, ready_rx) = mpsc::channel();
        let disconnected = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&disconnected);

        let worker = thread::Builder::new()
            .name(format!("cpal-{}", direction))
            .spawn(move || {
                let stream = match build_stream(&request, sink, flag) {
                    Ok((stream, properties)) => {
                        let _ = ready_tx.send(Ok(properties));
                        stream
                    }
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };

                for command in inbox {
                    match command {
                        Command::Start(reply) => {
                            let _ = reply.send(stream.play().map_err(|e| {
                                DriverError::StreamStartFailed {
                                    direction,
                                    reason: e.to_string(),
                                }
                            }));
                        }
                        Command::Stop(reply) => {
                            let _ = reply.send(stream.pause().map_err(|e| {
                                DriverError::StreamStopFailed {
                                    direction,
                                    reason: e.to_string(),
                                }
                            }));
                        }
                        Command::Close => break,
                    }
                }
                debug!(%direction, "cpal worker exiting");
            })?;

        let properties = ready_rx
            .recv()
            .map_err(|_| DriverError::StreamOpenFailed {
                direction,
                reason: "cpal worker exited before reporting".to_string(),
            })??;

        Ok(Self {
            direction,
            properties,
            commands,
            worker: Some(worker),
            disconnected,
            state: StreamState::Open,
        })
    }

    fn call(&self, command: impl FnOnce(Reply) -> Command) -> Result<(), DriverError> {
        let lost = || DriverError::DeviceUnavailable {
            reason: format!("cpal {} worker is gone", self.direction),
        };
        let (reply, response) = mpsc::channel();
        self.commands.send(command(reply)).map_err(|_| lost())?;
        response.recv().map_err(|_| lost())?
    }

    fn shutdown(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        let _ = self.commands.send(Command::Close);
        if worker.join().is_err() {
            warn!(direction = %self.direction, "cpal worker panicked");
        }
        self.state = StreamState::Closed;
    }
}

impl DeviceStream for CpalStream {
    fn properties(&self) -> StreamProperties {
        self.properties.clone()
    }

    fn set_buffer_size_frames(&mut self, _frames: u32) -> Result<u32, DriverError> {
        // CPAL fixes the buffer when the stream is built.
        Ok(self.properties.buffer_size_frames)
    }

    fn start(&mut self) -> Result<(), DriverError> {
        self.call(Command::Start)?;
        self.state = StreamState::Started;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), DriverError> {
        self.call(Command::Stop)?;
        self.state = StreamState::Stopped;
        Ok(())
    }

    fn close(&mut self) -> Result<(), DriverError> {
        self.shutdown();
        Ok(())
    }

    fn state(&self) -> StreamState {
        if self.state != StreamState::Closed && self.disconnected.load(Ordering::Acquire) {
            return StreamState::Disconnected;
        }
        self.state
    }
}

impl Drop for CpalStream {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn open_failed(direction: Direction, reason: impl ToString) -> DriverError {
    DriverError::StreamOpenFailed {
        direction,
        reason: reason.to_string(),
    }
}

fn build_stream(
    request: &StreamRequest,
    sink: Arc<dyn DeviceCallbackSink>,
    disconnected: Arc<AtomicBool>,
) -> Result<(cpal::Stream, StreamProperties), DriverError> {
    let direction = request.direction;
    let host = cpal::default_host();
    let device = match direction {
        Direction::Playback => host.default_output_device(),
        Direction::Capture => host.default_input_device(),
    }
    .ok_or_else(|| DriverError::DeviceUnavailable {
        reason: format!("no default {} device", direction),
    })?;

    let default_config = match direction {
        Direction::Playback => device.default_output_config(),
        Direction::Capture => device.default_input_config(),
    }
    .map_err(|e| open_failed(direction, format!("default config: {}", e)))?;

    let encoding = match default_config.sample_format() {
        cpal::SampleFormat::I16 => SampleEncoding::I16,
        cpal::SampleFormat::F32 => SampleEncoding::F32,
        other => {
            return Err(open_failed(
                direction,
                format!("unsupported sample format {:?}", other),
            ))
        }
    };

    let config = cpal::StreamConfig {
        channels: request.channels,
        sample_rate: cpal::SampleRate(request.sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };
    let period_samples = request.frames_per_callback as usize * usize::from(request.channels);

    let error_sink = Arc::clone(&sink);
    let on_error = move |err: cpal::StreamError| match err {
        cpal::StreamError::DeviceNotAvailable => {
            disconnected.store(true, Ordering::Release);
            error_sink.on_fault(DeviceFault::Disconnected);
        }
        other => error_sink.on_fault(DeviceFault::Other(other.to_string())),
    };

    let stream = match (direction, encoding) {
        (Direction::Playback, SampleEncoding::F32) => {
            let mut reblock = OutputReblocker::<f32>::new(period_samples);
            device.build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    reblock.fill(data, |period| sink.on_data(DeviceBuffer::OutputF32(period)));
                },
                on_error,
                None,
            )
        }
        (Direction::Playback, SampleEncoding::I16) => {
            let mut reblock = OutputReblocker::<i16>::new(period_samples);
            device.build_output_stream(
                &config,
                move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                    reblock.fill(data, |period| sink.on_data(DeviceBuffer::OutputI16(period)));
                },
                on_error,
                None,
            )
        }
        (Direction::Capture, SampleEncoding::F32) => {
            let mut reblock = InputReblocker::<f32>::new(period_samples);
            device.build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    reblock.push(data, |period| sink.on_data(DeviceBuffer::InputF32(period)));
                },
                on_error,
                None,
            )
        }
        (Direction::Capture, SampleEncoding::I16) => {
            let mut reblock = InputReblocker::<i16>::new(period_samples);
            device.build_input_stream(
                &config,
                move |data: &[i16], _: &cpal::InputCallbackInfo| {
                    reblock.push(data, |period| sink.on_data(DeviceBuffer::InputI16(period)));
                },
                on_error,
                None,
            )
        }
    }
    .map_err(|e| open_failed(direction, e))?;

    // CPAL does not report a native burst. Treat it as one period; bursty
    // hosts are caught by the runtime profiler instead.
    let properties = StreamProperties {
        direction,
        sample_rate: request.sample_rate,
        channels: request.channels,
        frames_per_burst: request.frames_per_callback,
        frames_per_callback: request.frames_per_callback,
        encoding,
        buffer_capacity_frames: request.frames_per_callback * 2,
        buffer_size_frames: request.frames_per_callback * 2,
        sharing: request.sharing,
        performance: request.performance,
    };
    Ok((stream, properties))
}

/// Serves host-sized output buffers from whole rendered periods.
struct OutputReblocker<T> {
    period: Vec<T>,
    position: usize,
    stopped: bool,
}

impl<T: Copy + Default> OutputReblocker<T> {
    fn new(period_samples: usize) -> Self {
        Self {
            period: vec![T::default(); period_samples],
            position: period_samples,
            stopped: false,
        }
    }

    fn fill(&mut self, out: &mut [T], mut render: impl FnMut(&mut [T]) -> CallbackResult) {
        let mut written = 0;
        while written < out.len() {
            if self.stopped || self.period.is_empty() {
                out[written..].fill(T::default());
                return;
            }
            if self.position == self.period.len() {
                self.period.fill(T::default());
                // A partial render leaves the tail silent, which is what the
                // device plays anyway.
                if render(&mut self.period) == CallbackResult::Stop {
                    self.stopped = true;
                    continue;
                }
                self.position = 0;
            }
            let n = (self.period.len() - self.position).min(out.len() - written);
            out[written..written + n]
                .copy_from_slice(&self.period[self.position..self.position + n]);
            self.position += n;
            written += n;
        }
    }
}

/// Collects host-sized input buffers into whole periods.
struct InputReblocker<T> {
    period: Vec<T>,
    filled: usize,
}

impl<T: Copy + Default> InputReblocker<T> {
    fn new(period_samples: usize) -> Self {
        Self {
            period: vec![T::default(); period_samples],
            filled: 0,
        }
    }

    fn push(&mut self, mut data: &[T], mut deliver: impl FnMut(&[T]) -> CallbackResult) {
        if self.period.is_empty() {
            return;
        }
        while !data.is_empty() {
            let n = (self.period.len() - self.filled).min(data.len());
            self.period[self.filled..self.filled + n].copy_from_slice(&data[..n]);
            self.filled += n;
            data = &data[n..];
            if self.filled == self.period.len() {
                deliver(&self.period);
                self.filled = 0;
            }
        }
    }
}
