//! End-to-end driver tests against the simulated device
//!
//! These run the engine side (open/start/write/read) and the device side
//! (callbacks) from one thread, with a manual clock advanced by one period
//! per callback so burst classification is deterministic.

use std::sync::Arc;
use std::time::Duration;

use duplex_bridge::engine::{
    Direction, ManualTimeSource, SampleEncoding, SimConfig, SimEvent, SimulatedDevice,
};
use duplex_bridge::error::ErrorCode;
use duplex_bridge::telemetry::TelemetryHub;
use duplex_bridge::{
    status_code, BridgeDriver, DriverConfig, DriverError, DriverState, OpenParams, ReadStatus,
    WriteStatus,
};

const PERIOD_FRAMES: u32 = 256;
const RATE: u32 = 48_000;

fn period() -> Duration {
    Duration::from_nanos(u64::from(PERIOD_FRAMES) * 1_000_000_000 / u64::from(RATE))
}

struct Session {
    device: Arc<SimulatedDevice>,
    clock: Arc<ManualTimeSource>,
    driver: BridgeDriver,
}

impl Session {
    fn new(sim: SimConfig) -> Self {
        let mut config = DriverConfig::default();
        config.recovery.settle_ms = 0;
        config.recovery.capture_settle_ms = 0;
        config.bridge.read_timeout_ms = 20;

        let device = Arc::new(SimulatedDevice::new(sim));
        let clock = Arc::new(ManualTimeSource::new());
        let driver = BridgeDriver::new(
            device.clone(),
            config,
            Arc::new(TelemetryHub::default()),
            clock.clone(),
        )
        .expect("default config is valid");
        Self {
            device,
            clock,
            driver,
        }
    }

    /// One device callback; returns the first rendered sample.
    fn pump(&self) -> f32 {
        self.clock.advance(period());
        let (_, samples) = self
            .device
            .pump_playback()
            .expect("playback stream is started");
        samples[0]
    }

    fn write(&self, value: f32) -> WriteStatus {
        let plane = vec![value; PERIOD_FRAMES as usize];
        self.driver
            .write(&[&plane[..], &plane[..]])
            .expect("no refresh pending")
    }
}

#[test]
fn playback_only_session_renders_writes_in_order() {
    let session = Session::new(SimConfig::default());
    session
        .driver
        .open(OpenParams::playback(PERIOD_FRAMES, RATE, 2))
        .unwrap();
    session.driver.start().unwrap();

    assert_eq!(session.write(9.0), WriteStatus::NotLive);
    assert_eq!(session.pump(), 0.0);

    let mut rendered = Vec::new();
    for k in 1..=50 {
        assert_eq!(session.write(k as f32 / 100.0), WriteStatus::Queued);
        let sample = session.pump();
        if sample != 0.0 {
            rendered.push(sample);
        }
    }
    // The last write is still queued one callback behind.
    rendered.push(session.pump());

    let expected: Vec<f32> = (1..=50).map(|k| k as f32 / 100.0).collect();
    assert_eq!(rendered, expected);

    let stats = session.driver.stats();
    assert!(stats.playback.silence_injections <= 1);
    assert_eq!(stats.playback.underruns, 0);
    assert_eq!(stats.playback.overruns, 0);
    assert!(!stats.playback_large_burst);
    assert!(!session.driver.needs_refresh());

    session.driver.stop().unwrap();
    session.driver.close().unwrap();
}

#[test]
fn duplex_session_paces_engine_on_capture() {
    let session = Session::new(SimConfig::default());
    session
        .driver
        .open(OpenParams::duplex(PERIOD_FRAMES, RATE, 2, 2))
        .unwrap();
    session.driver.start().unwrap();

    let mut left = vec![0.0_f32; PERIOD_FRAMES as usize];
    let mut right = vec![0.0_f32; PERIOD_FRAMES as usize];
    for k in 1..=10 {
        let value = k as f32 / 20.0;
        session.device.push_capture_period(value);
        let status = session.driver.read(&mut [&mut left[..], &mut right[..]]);
        assert_eq!(status, ReadStatus::Captured);
        // 16-bit capture path: allow for quantisation.
        assert!((left[0] - value).abs() < 1e-3);
        assert!((right[0] - value).abs() < 1e-3);
        session.pump();
        session.write(value);
    }

    let stats = session.driver.stats();
    assert_eq!(stats.capture.items_read, 10);
    assert_eq!(stats.capture.read_timeouts, 0);
    assert!(stats.capture_enabled);
}

#[test]
fn i16_playback_stream_is_converted() {
    let session = Session::new(SimConfig {
        playback_encoding: Some(SampleEncoding::I16),
        ..SimConfig::default()
    });
    let mut params = OpenParams::playback(PERIOD_FRAMES, RATE, 2);
    params.playback_encoding = SampleEncoding::I16;
    session.driver.open(params).unwrap();
    session.driver.start().unwrap();

    session.pump();
    let mut last = 0.0;
    for _ in 0..4 {
        session.write(0.5);
        last = session.pump();
    }
    assert!((last - 0.5).abs() < 1e-3);
}

#[test]
fn lifecycle_error_paths_map_to_status_codes() {
    let session = Session::new(SimConfig::default());

    let started = session.driver.start();
    assert_eq!(started, Err(DriverError::NotOpen));
    assert_eq!(status_code(&started), -DriverError::NotOpen.code());
    assert_eq!(session.driver.stop(), Err(DriverError::NotRunning));

    session.device.fail_open(Some(Direction::Playback));
    let opened = session
        .driver
        .open(OpenParams::playback(PERIOD_FRAMES, RATE, 2));
    assert!(status_code(&opened) < 0);
    assert_eq!(session.driver.state(), DriverState::Closed);

    session.device.fail_open(None);
    session
        .driver
        .open(OpenParams::playback(PERIOD_FRAMES, RATE, 2))
        .unwrap();
    session.device.fail_start(Some(Direction::Playback));
    assert!(matches!(
        session.driver.start(),
        Err(DriverError::StreamStartFailed { .. })
    ));
    assert_eq!(session.driver.state(), DriverState::Opened);

    session.device.fail_start(None);
    session.driver.start().unwrap();
    assert_eq!(session.driver.state(), DriverState::Running);
    session.driver.close().unwrap();

    assert_eq!(
        session.device.events().last(),
        Some(&SimEvent::Closed(Direction::Playback))
    );
}

#[test]
fn reopen_after_close_starts_a_fresh_run() {
    let session = Session::new(SimConfig::default());
    let params = OpenParams::playback(PERIOD_FRAMES, RATE, 2);

    session.driver.open(params.clone()).unwrap();
    session.driver.start().unwrap();
    session.pump();
    session.write(0.1);
    session.driver.close().unwrap();

    session.driver.open(params).unwrap();
    session.driver.start().unwrap();
    // Nothing from the previous run survives, and the new run is not live
    // until its first callback.
    assert_eq!(session.write(0.2), WriteStatus::NotLive);
    assert_eq!(session.driver.stats().playback_depth, 0);
    assert_eq!(session.pump(), 0.0);
}
