//! BridgeDriver: engine-facing lifecycle and data path.
//!
//! The driver owns the two stream bindings and the two bridges. Lifecycle
//! calls (`open`, `start`, `stop`, `close`) and the refresh sequence all run
//! under one control lock. `read`/`write` never take it; they only touch the
//! per-direction bridge locks, so a refresh can run while the engine keeps
//! cycling.
//!
//! ```text
//!   Closed --open--> Opened --start--> Running
//!     ^                |  ^              |
//!     +------close-----+  +-----stop-----+
//!
//!   Running: needs-refresh --try_begin--> Refreshing --finish--> Running
//!                                                     --fail--> Running (halted until start)
//! ```

use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use serde::Serialize;
use tracing::{error, info, warn};

use super::backend::{
    AudioDevice, DeviceCallbackSink, Direction, SampleEncoding, StreamRequest, SystemTimeSource,
    TimeSource,
};
use super::binding::StreamBinding;
use super::recovery::{RecoveryController, RefreshOutcome, RefreshReason, RefreshSignal};
use crate::audio::{
    CaptureBridge, CaptureSettings, CaptureStats, FrameLayout, PlaybackBridge, PlaybackSettings,
    PlaybackStats, ReadStatus, WriteStatus,
};
use crate::config::{DriverConfig, StreamDefaults};
use crate::error::{log_driver_error, DriverError};
use crate::telemetry::{
    now_timestamp_ms, BridgeObserver, DiagnosticError, LifecyclePhase, MetricEvent, NullObserver,
};

/// Parameters of one `open` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenParams {
    pub period_frames: u32,
    pub sample_rate: u32,
    pub capturing: bool,
    pub playing: bool,
    pub capture_channels: u16,
    pub playback_channels: u16,
    pub capture_encoding: SampleEncoding,
    pub playback_encoding: SampleEncoding,
}

impl OpenParams {
    /// Playback-only parameters with float output.
    pub fn playback(period_frames: u32, sample_rate: u32, channels: u16) -> Self {
        Self {
            period_frames,
            sample_rate,
            capturing: false,
            playing: true,
            capture_channels: 0,
            playback_channels: channels,
            capture_encoding: SampleEncoding::I16,
            playback_encoding: SampleEncoding::F32,
        }
    }

    /// Full-duplex parameters: 16-bit capture, float playback.
    pub fn duplex(period_frames: u32, sample_rate: u32, inputs: u16, outputs: u16) -> Self {
        Self {
            capturing: true,
            capture_channels: inputs,
            ..Self::playback(period_frames, sample_rate, outputs)
        }
    }

    pub fn from_config(stream: &StreamDefaults) -> Self {
        Self {
            period_frames: stream.period_frames,
            sample_rate: stream.sample_rate,
            capturing: stream.capture_channels > 0,
            playing: stream.playback_channels > 0,
            capture_channels: stream.capture_channels,
            playback_channels: stream.playback_channels,
            capture_encoding: stream.capture_encoding,
            playback_encoding: stream.playback_encoding,
        }
    }

    pub fn validate(&self) -> Result<(), DriverError> {
        let invalid = |reason: &str| {
            Err(DriverError::InvalidParams {
                reason: reason.to_string(),
            })
        };
        if self.period_frames == 0 {
            return invalid("period must be at least one frame");
        }
        if self.sample_rate == 0 {
            return invalid("sample rate must be positive");
        }
        if !self.capturing && !self.playing {
            return invalid("neither capture nor playback requested");
        }
        if self.capturing && self.capture_channels == 0 {
            return invalid("capture requested with zero channels");
        }
        if self.playing && self.playback_channels == 0 {
            return invalid("playback requested with zero channels");
        }
        Ok(())
    }

    fn request(&self, direction: Direction) -> StreamRequest {
        let (channels, encoding) = match direction {
            Direction::Playback => (self.playback_channels, self.playback_encoding),
            Direction::Capture => (self.capture_channels, self.capture_encoding),
        };
        StreamRequest::new(
            direction,
            self.sample_rate,
            channels,
            self.period_frames,
            encoding,
        )
    }

    /// Layout of the muted capture lane used in playback-only mode.
    fn muted_capture_layout(&self) -> FrameLayout {
        FrameLayout::new(
            self.period_frames as usize,
            usize::from(self.capture_channels.max(1)),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverState {
    Closed,
    Opened,
    Running,
}

/// Serializable counters for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct DriverStats {
    pub state: DriverState,
    pub capture_enabled: bool,
    pub playback_large_burst: bool,
    pub playback_depth: usize,
    pub capture_depth: usize,
    pub refresh_requests: u64,
    pub refreshes_completed: u64,
    pub refreshes_failed: u64,
    pub recovery_halted: bool,
    pub volume: f32,
    pub playback: PlaybackStats,
    pub capture: CaptureStats,
}

struct DriverControl {
    params: Option<OpenParams>,
    playback: Option<StreamBinding>,
    capture: Option<StreamBinding>,
    capture_enabled: bool,
    state: DriverState,
}

pub struct BridgeDriver {
    device: Arc<dyn AudioDevice>,
    config: DriverConfig,
    control: Mutex<DriverControl>,
    capture: Arc<CaptureBridge>,
    playback: Arc<PlaybackBridge>,
    recovery: RecoveryController,
    observer: Arc<dyn BridgeObserver>,
}

impl BridgeDriver {
    pub fn new(
        device: Arc<dyn AudioDevice>,
        config: DriverConfig,
        observer: Arc<dyn BridgeObserver>,
        clock: Arc<dyn TimeSource>,
    ) -> Result<Self, DriverError> {
        config.validate()?;

        let signal = Arc::new(RefreshSignal::new(Arc::clone(&observer)));
        let capture = Arc::new(CaptureBridge::new(
            CaptureSettings::from(&config.bridge),
            Arc::clone(&signal),
            Arc::clone(&observer),
        ));
        let playback = Arc::new(PlaybackBridge::new(
            PlaybackSettings::new(&config.bridge, &config.profile),
            Arc::clone(&capture),
            Arc::clone(&signal),
            Arc::clone(&observer),
            clock,
        ));
        let recovery = RecoveryController::new(signal, Arc::clone(&observer));

        Ok(Self {
            device,
            config,
            control: Mutex::new(DriverControl {
                params: None,
                playback: None,
                capture: None,
                capture_enabled: false,
                state: DriverState::Closed,
            }),
            capture,
            playback,
            recovery,
            observer,
        })
    }

    /// Default policy, no observer, wall clock.
    pub fn with_device(device: Arc<dyn AudioDevice>) -> Result<Self, DriverError> {
        Self::new(
            device,
            DriverConfig::default(),
            Arc::new(NullObserver),
            Arc::new(SystemTimeSource::default()),
        )
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    pub fn state(&self) -> DriverState {
        self.control
            .lock()
            .map_or(DriverState::Closed, |control| control.state)
    }

    /// Open and classify the requested streams.
    pub fn open(&self, params: OpenParams) -> Result<(), DriverError> {
        params.validate()?;
        let mut control = self.lock_control()?;
        if control.state != DriverState::Closed {
            return Err(DriverError::AlreadyOpen);
        }

        if let Err(err) = self.open_streams(&mut control, &params) {
            log_driver_error(&err, "open");
            if let Err(close_err) = self.release_streams(&mut control) {
                log_driver_error(&close_err, "open rollback");
            }
            return Err(err);
        }

        info!(
            device = self.device.name(),
            period_frames = params.period_frames,
            sample_rate = params.sample_rate,
            capture_enabled = control.capture_enabled,
            playing = params.playing,
            "driver opened"
        );
        control.params = Some(params);
        control.state = DriverState::Opened;
        self.lifecycle(LifecyclePhase::Opened);
        Ok(())
    }

    pub fn start(&self) -> Result<(), DriverError> {
        let mut control = self.lock_control()?;
        match control.state {
            DriverState::Closed => return Err(DriverError::NotOpen),
            DriverState::Running => return Err(DriverError::AlreadyRunning),
            DriverState::Opened => {}
        }

        self.recovery.signal().resume();
        if let Err(err) = self.start_streams(&mut control) {
            log_driver_error(&err, "start");
            // Leave nothing half-running.
            if let Err(stop_err) = self.stop_streams(&mut control) {
                log_driver_error(&stop_err, "start rollback");
            }
            return Err(err);
        }

        control.state = DriverState::Running;
        info!("driver started");
        self.lifecycle(LifecyclePhase::Started);
        Ok(())
    }

    pub fn stop(&self) -> Result<(), DriverError> {
        let mut control = self.lock_control()?;
        if control.state != DriverState::Running {
            return Err(DriverError::NotRunning);
        }

        let result = self.stop_streams(&mut control);
        control.state = DriverState::Opened;
        info!("driver stopped");
        self.lifecycle(LifecyclePhase::Stopped);
        result
    }

    pub fn close(&self) -> Result<(), DriverError> {
        let mut control = self.lock_control()?;
        if control.state == DriverState::Closed {
            return Err(DriverError::NotOpen);
        }

        let stopped = if control.state == DriverState::Running {
            self.stop_streams(&mut control)
        } else {
            Ok(())
        };
        let released = self.release_streams(&mut control);

        control.params = None;
        control.capture_enabled = false;
        control.state = DriverState::Closed;
        info!("driver closed");
        self.lifecycle(LifecyclePhase::Closed);
        stopped.and(released)
    }

    /// Fill one period of engine capture planes. Never fails; missing data
    /// is delivered as silence.
    pub fn read(&self, planes: &mut [&mut [f32]]) -> ReadStatus {
        self.capture.read(planes)
    }

    /// Queue one period of engine playback planes, then run a pending
    /// refresh on this thread.
    ///
    /// Only a failed refresh surfaces as an error; the period itself is
    /// always accepted or benignly refused.
    pub fn write(&self, planes: &[&[f32]]) -> Result<WriteStatus, DriverError> {
        let status = self.playback.write(planes);
        if self.needs_refresh() {
            self.refresh()?;
        }
        Ok(status)
    }

    /// Set the linear playback gain. Values above 1.0 are clamped; the
    /// setting survives refresh and reopen.
    pub fn set_volume(&self, volume: f32) -> Result<(), DriverError> {
        if !volume.is_finite() || volume < 0.0 {
            return Err(DriverError::InvalidParams {
                reason: format!("volume {} is not a non-negative gain", volume),
            });
        }
        self.playback.set_volume(volume);
        info!(
            volume = self.playback.volume(),
            level_mb = volume_millibels(self.playback.volume()),
            "playback volume set"
        );
        Ok(())
    }

    pub fn volume(&self) -> f32 {
        self.playback.volume()
    }

    pub fn needs_refresh(&self) -> bool {
        self.recovery.signal().is_needed()
    }

    /// Ask for a refresh from outside the data path.
    pub fn request_refresh(&self) -> bool {
        self.recovery.signal().request(RefreshReason::Manual)
    }

    /// Run a refresh only if one was requested.
    pub fn poll_recovery(&self) -> Result<Option<RefreshOutcome>, DriverError> {
        if !self.needs_refresh() {
            return Ok(None);
        }
        self.refresh().map(Some)
    }

    /// Stop, reopen and restart both streams.
    ///
    /// At most one refresh runs at a time; a concurrent call returns
    /// [`RefreshOutcome::AlreadyInProgress`] immediately. A failed step
    /// aborts the sequence and leaves whichever streams did come back;
    /// recovery then stays halted until the next [`BridgeDriver::start`].
    pub fn refresh(&self) -> Result<RefreshOutcome, DriverError> {
        let Some(ticket) = self.recovery.try_begin() else {
            return Ok(RefreshOutcome::AlreadyInProgress);
        };

        let mut control = match self.lock_control() {
            Ok(control) => control,
            Err(err) => {
                ticket.finish(&Err(err.clone()));
                return Err(err);
            }
        };
        if control.state != DriverState::Running {
            ticket.skip();
            return Ok(RefreshOutcome::Skipped);
        }

        ticket.started();
        let result = self.run_refresh(&mut control);
        if let Err(err) = &result {
            log_driver_error(err, "refresh");
        }
        ticket.finish(&result);
        result.map(|()| RefreshOutcome::Completed)
    }

    pub fn stats(&self) -> DriverStats {
        let (state, capture_enabled) = self
            .control
            .lock()
            .map_or((DriverState::Closed, false), |control| {
                (control.state, control.capture_enabled)
            });
        DriverStats {
            state,
            capture_enabled,
            playback_large_burst: self.playback.is_large_burst(),
            playback_depth: self.playback.depth(),
            capture_depth: self.capture.depth(),
            refresh_requests: self.recovery.signal().requests(),
            refreshes_completed: self.recovery.completed(),
            refreshes_failed: self.recovery.failed(),
            recovery_halted: self.recovery.signal().is_halted(),
            volume: self.playback.volume(),
            playback: self.playback.stats(),
            capture: self.capture.stats(),
        }
    }

    fn run_refresh(&self, control: &mut DriverControl) -> Result<(), DriverError> {
        let params = control.params.clone().ok_or(DriverError::NotOpen)?;

        info!("refresh: stopping streams");
        if let Err(err) = self.stop_streams(control) {
            // A disconnected device often refuses stop; reopening still works.
            warn!(error = %err, "refresh: stop failed, continuing");
        }

        let settle = self.config.recovery.settle();
        info!(settle_ms = settle.as_millis() as u64, "refresh: settling");
        thread::sleep(settle);

        info!("refresh: reopening playback");
        self.playback.detach();
        if let Some(mut binding) = control.playback.take() {
            self.close_binding(&mut binding);
        }
        if params.playing {
            self.open_playback(control, &params)
                .map_err(refresh_step("reopen playback"))?;
        }

        if control.capture_enabled {
            info!("refresh: reopening capture");
            self.capture.detach();
            if let Some(mut binding) = control.capture.take() {
                self.close_binding(&mut binding);
            }
            let enabled = self
                .open_capture(control, &params)
                .map_err(refresh_step("reopen capture"))?;
            self.set_capture_enabled(control, enabled, &params);

            self.capture.arm();
            if let Some(binding) = control.capture.as_mut() {
                binding.start().map_err(refresh_step("restart capture"))?;
                thread::sleep(self.config.recovery.capture_settle());
            }
        } else {
            self.capture.attach(params.muted_capture_layout(), false);
            self.capture.arm();
        }

        info!("refresh: restarting playback");
        self.playback.arm();
        if let Some(binding) = control.playback.as_mut() {
            binding.start().map_err(refresh_step("restart playback"))?;
        }
        Ok(())
    }

    fn open_streams(
        &self,
        control: &mut DriverControl,
        params: &OpenParams,
    ) -> Result<(), DriverError> {
        if params.playing {
            self.open_playback(control, params)?;
        }
        let capture_enabled = if params.capturing {
            self.open_capture(control, params)?
        } else {
            false
        };
        self.set_capture_enabled(control, capture_enabled, params);
        Ok(())
    }

    fn open_playback(
        &self,
        control: &mut DriverControl,
        params: &OpenParams,
    ) -> Result<(), DriverError> {
        let sink: Arc<dyn DeviceCallbackSink> = self.playback.clone();
        let binding = StreamBinding::open(
            self.device.as_ref(),
            &params.request(Direction::Playback),
            sink,
        )?;
        self.playback
            .attach(binding.layout(), binding.period(), binding.is_large_burst());
        control.playback = Some(binding);
        Ok(())
    }

    /// Returns whether capture ended up enabled. A large-burst capture
    /// stream is closed again and the driver falls back to playback-only.
    fn open_capture(
        &self,
        control: &mut DriverControl,
        params: &OpenParams,
    ) -> Result<bool, DriverError> {
        let sink: Arc<dyn DeviceCallbackSink> = self.capture.clone();
        let mut binding = StreamBinding::open(
            self.device.as_ref(),
            &params.request(Direction::Capture),
            sink,
        )?;

        if binding.is_large_burst() {
            let burst = binding.properties().frames_per_burst;
            self.close_binding(&mut binding);
            if !params.playing {
                return Err(DriverError::StreamOpenFailed {
                    direction: Direction::Capture,
                    reason: format!(
                        "device burst {} exceeds period {} and there is no playback to fall back to",
                        burst, params.period_frames
                    ),
                });
            }
            error!(
                burst_frames = burst,
                period_frames = params.period_frames,
                "large-burst capture is unsupported; continuing playback-only"
            );
            self.observer.record(MetricEvent::Error {
                code: DiagnosticError::CaptureUnsupported,
                context: format!("capture burst {} > period {}", burst, params.period_frames),
            });
            return Ok(false);
        }

        self.capture.attach(binding.layout(), true);
        control.capture = Some(binding);
        Ok(true)
    }

    fn set_capture_enabled(&self, control: &mut DriverControl, enabled: bool, params: &OpenParams) {
        if !enabled {
            self.capture.attach(params.muted_capture_layout(), false);
        }
        control.capture_enabled = enabled;
        self.playback.set_capture_enabled(enabled);
    }

    /// Capture first so playback has something to pace against.
    fn start_streams(&self, control: &mut DriverControl) -> Result<(), DriverError> {
        self.capture.arm();
        self.playback.arm();
        if let Some(binding) = control.capture.as_mut() {
            binding.start()?;
        }
        if let Some(binding) = control.playback.as_mut() {
            binding.start()?;
        }
        Ok(())
    }

    /// Stop both streams; returns the first failure after trying both.
    fn stop_streams(&self, control: &mut DriverControl) -> Result<(), DriverError> {
        self.playback.disarm();
        let mut first_err = None;
        for binding in [control.playback.as_mut(), control.capture.as_mut()]
            .into_iter()
            .flatten()
        {
            if let Err(err) = binding.stop() {
                self.observer.record(MetricEvent::Error {
                    code: DiagnosticError::StreamStop,
                    context: format!("{} stream: {}", binding.direction(), err),
                });
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Detach both lanes and close both bindings.
    fn release_streams(&self, control: &mut DriverControl) -> Result<(), DriverError> {
        self.playback.detach();
        self.capture.detach();
        let mut first_err = None;
        for mut binding in [control.playback.take(), control.capture.take()]
            .into_iter()
            .flatten()
        {
            if let Err(err) = binding.close() {
                self.observer.record(MetricEvent::Error {
                    code: DiagnosticError::StreamClose,
                    context: format!("{} stream: {}", binding.direction(), err),
                });
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    fn close_binding(&self, binding: &mut StreamBinding) {
        if let Err(err) = binding.close() {
            warn!(direction = %binding.direction(), error = %err, "stream close failed");
            self.observer.record(MetricEvent::Error {
                code: DiagnosticError::StreamClose,
                context: format!("{} stream: {}", binding.direction(), err),
            });
        }
    }

    fn lifecycle(&self, phase: LifecyclePhase) {
        self.observer.record(MetricEvent::Lifecycle {
            phase,
            timestamp_ms: now_timestamp_ms(),
        });
    }

    fn lock_control(&self) -> Result<MutexGuard<'_, DriverControl>, DriverError> {
        self.control.lock().map_err(|_| DriverError::LockPoisoned {
            component: "driver control".to_string(),
        })
    }
}

impl Drop for BridgeDriver {
    fn drop(&mut self) {
        if self.state() != DriverState::Closed {
            if let Err(err) = self.close() {
                log_driver_error(&err, "drop");
            }
        }
    }
}

/// Attenuation in millibels; silence maps to the 16-bit floor.
fn volume_millibels(volume: f32) -> i32 {
    const MILLIBEL_MIN: i32 = i16::MIN as i32;
    if volume <= 0.0 {
        return MILLIBEL_MIN;
    }
    ((2000.0 * volume.log10()).round() as i32).max(MILLIBEL_MIN)
}

fn refresh_step(step: &'static str) -> impl FnOnce(DriverError) -> DriverError {
    move |err| DriverError::RefreshFailed {
        step: step.to_string(),
        reason: err.to_string(),
    }
}
