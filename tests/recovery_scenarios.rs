//! Recovery scenarios: faults and stalls raised from the device side must end
//! in exactly one refresh, run on the engine thread.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use duplex_bridge::engine::{
    DeviceFault, Direction, ManualTimeSource, SimConfig, SimEvent, SimulatedDevice,
};
use duplex_bridge::telemetry::{MetricEvent, RefreshPhase, TelemetryHub};
use duplex_bridge::{
    BridgeDriver, DriverConfig, DriverError, OpenParams, ReadStatus, RefreshOutcome, WriteStatus,
};

const PERIOD_FRAMES: u32 = 256;
const RATE: u32 = 48_000;
const READ_TIMEOUT_MS: u64 = 20;

fn period() -> Duration {
    Duration::from_nanos(u64::from(PERIOD_FRAMES) * 1_000_000_000 / u64::from(RATE))
}

fn config(settle_ms: u64) -> DriverConfig {
    let mut config = DriverConfig::default();
    config.recovery.settle_ms = settle_ms;
    config.recovery.capture_settle_ms = 0;
    config.bridge.read_timeout_ms = READ_TIMEOUT_MS;
    config
}

struct Harness {
    device: Arc<SimulatedDevice>,
    hub: Arc<TelemetryHub>,
    clock: Arc<ManualTimeSource>,
    driver: BridgeDriver,
}

impl Harness {
    fn new(sim: SimConfig, config: DriverConfig) -> Self {
        let device = Arc::new(SimulatedDevice::new(sim));
        let hub = Arc::new(TelemetryHub::new(256, 256));
        let clock = Arc::new(ManualTimeSource::new());
        let driver = BridgeDriver::new(device.clone(), config, hub.clone(), clock.clone())
            .expect("test config is valid");
        Self {
            device,
            hub,
            clock,
            driver,
        }
    }

    fn running(sim: SimConfig, params: OpenParams) -> Self {
        let harness = Self::new(sim, config(0));
        harness.driver.open(params).unwrap();
        harness.driver.start().unwrap();
        harness
    }

    fn pump(&self) {
        self.clock.advance(period());
        self.device.pump_playback();
    }

    fn write(&self, value: f32) -> WriteStatus {
        let plane = vec![value; PERIOD_FRAMES as usize];
        self.driver.write(&[&plane[..], &plane[..]]).unwrap()
    }
}

fn playback() -> OpenParams {
    OpenParams::playback(PERIOD_FRAMES, RATE, 2)
}

fn duplex() -> OpenParams {
    OpenParams::duplex(PERIOD_FRAMES, RATE, 2, 2)
}

fn refresh_step(result: Result<RefreshOutcome, DriverError>) -> String {
    match result {
        Err(DriverError::RefreshFailed { step, .. }) => step,
        other => panic!("expected a failed refresh, got {:?}", other),
    }
}

#[test]
fn disconnect_triggers_exactly_one_refresh() {
    let harness = Harness::running(SimConfig::default(), playback());
    harness.pump();
    harness.write(0.1);
    let mut events = harness.hub.subscribe();

    assert!(harness
        .device
        .inject_fault(Direction::Playback, DeviceFault::Disconnected));
    assert!(harness
        .device
        .inject_fault(Direction::Playback, DeviceFault::Disconnected));
    assert!(harness.driver.needs_refresh());
    assert_eq!(harness.driver.stats().refresh_requests, 1);

    harness.device.clear_events();
    harness.write(0.2);

    assert_eq!(
        harness.device.events(),
        vec![
            SimEvent::Stopped(Direction::Playback),
            SimEvent::Closed(Direction::Playback),
            SimEvent::Opened(Direction::Playback),
            SimEvent::Started(Direction::Playback),
        ]
    );
    assert!(!harness.driver.needs_refresh());
    let stats = harness.driver.stats();
    assert_eq!(stats.refreshes_completed, 1);
    assert_eq!(stats.refresh_requests, 1);

    let mut phases = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let MetricEvent::Refresh { phase, .. } = event {
            phases.push(phase);
        }
    }
    assert_eq!(
        phases,
        vec![
            RefreshPhase::Requested,
            RefreshPhase::Started,
            RefreshPhase::Completed,
        ]
    );
}

#[test]
fn repeated_underruns_request_one_refresh() {
    let harness = Harness::running(SimConfig::default(), playback());
    harness.pump();
    harness.write(0.1);
    harness.write(0.2);

    // Two pumps drain the jitter buffer, five more underrun.
    for _ in 0..7 {
        harness.pump();
    }

    let stats = harness.driver.stats();
    assert_eq!(stats.playback.underruns, 5);
    assert_eq!(stats.playback.silence_injections, 2);
    assert_eq!(stats.refresh_requests, 1);
    assert!(harness.driver.needs_refresh());

    assert_eq!(
        harness.driver.poll_recovery(),
        Ok(Some(RefreshOutcome::Completed))
    );
    assert_eq!(harness.driver.poll_recovery(), Ok(None));
    assert_eq!(harness.driver.stats().refresh_requests, 1);
}

#[test]
fn engine_write_is_not_blocked_by_refresh_in_flight() {
    let harness = Harness::new(SimConfig::default(), config(300));
    harness.driver.open(playback()).unwrap();
    harness.driver.start().unwrap();
    harness.pump();

    let driver = Arc::new(harness.driver);
    let refresher = {
        let driver = Arc::clone(&driver);
        thread::spawn(move || driver.refresh())
    };
    thread::sleep(Duration::from_millis(50));

    let plane = vec![0.5_f32; PERIOD_FRAMES as usize];
    let started = Instant::now();
    let status = driver.write(&[&plane[..], &plane[..]]);
    assert!(started.elapsed() < Duration::from_millis(200));
    assert_ne!(status, Ok(WriteStatus::Queued));
    assert_eq!(driver.refresh(), Ok(RefreshOutcome::AlreadyInProgress));

    assert_eq!(refresher.join().unwrap(), Ok(RefreshOutcome::Completed));
    assert_eq!(driver.stats().refreshes_completed, 1);
}

#[test]
fn capture_stall_reads_silence_within_bound() {
    let harness = Harness::running(
        SimConfig::default(),
        OpenParams::duplex(PERIOD_FRAMES, RATE, 2, 2),
    );
    let mut left = vec![0.0_f32; PERIOD_FRAMES as usize];
    let mut right = vec![0.0_f32; PERIOD_FRAMES as usize];

    harness.device.push_capture_period(0.25);
    assert_eq!(
        harness.driver.read(&mut [&mut left[..], &mut right[..]]),
        ReadStatus::Captured
    );

    let started = Instant::now();
    let status = harness.driver.read(&mut [&mut left[..], &mut right[..]]);
    let waited = started.elapsed();

    assert_eq!(status, ReadStatus::TimedOut);
    assert!(left.iter().chain(right.iter()).all(|&sample| sample == 0.0));
    assert!(waited >= Duration::from_millis(READ_TIMEOUT_MS));
    assert!(waited < Duration::from_millis(READ_TIMEOUT_MS * 10));

    // Capture had been live, so the stall escalates.
    assert!(harness.driver.needs_refresh());
    assert_eq!(
        harness.driver.poll_recovery(),
        Ok(Some(RefreshOutcome::Completed))
    );
    assert!(harness.driver.stats().capture_enabled);
}

#[test]
fn refresh_keeps_playback_only_fallback() {
    let harness = Harness::running(
        SimConfig {
            capture_burst_frames: Some(1024),
            ..SimConfig::default()
        },
        OpenParams::duplex(PERIOD_FRAMES, RATE, 2, 2),
    );
    assert!(!harness.driver.stats().capture_enabled);
    harness.device.clear_events();

    assert!(harness.driver.request_refresh());
    assert_eq!(
        harness.driver.poll_recovery(),
        Ok(Some(RefreshOutcome::Completed))
    );
    assert_eq!(
        harness.device.events(),
        vec![
            SimEvent::Stopped(Direction::Playback),
            SimEvent::Closed(Direction::Playback),
            SimEvent::Opened(Direction::Playback),
            SimEvent::Started(Direction::Playback),
        ]
    );

    // The muted capture lane still paces the engine.
    harness.pump();
    let mut plane = vec![1.0_f32; PERIOD_FRAMES as usize];
    assert_eq!(
        harness.driver.read(&mut [&mut plane[..]]),
        ReadStatus::Discarded
    );
}

#[test]
fn failed_refresh_is_not_retried_by_the_engine_loop() {
    let harness = Harness::running(SimConfig::default(), duplex());
    let mut left = vec![0.0_f32; PERIOD_FRAMES as usize];
    let mut right = vec![0.0_f32; PERIOD_FRAMES as usize];

    harness.device.push_capture_period(0.25);
    assert_eq!(
        harness.driver.read(&mut [&mut left[..], &mut right[..]]),
        ReadStatus::Captured
    );
    harness.pump();

    harness.device.fail_open(Some(Direction::Playback));
    assert_eq!(refresh_step(harness.driver.refresh()), "reopen playback");

    // Capture is stopped and its reads time out after data had flowed, but
    // recovery stays halted so no write runs another refresh.
    for _ in 0..3 {
        assert_eq!(
            harness.driver.read(&mut [&mut left[..], &mut right[..]]),
            ReadStatus::TimedOut
        );
        harness.write(0.1);
    }
    let stats = harness.driver.stats();
    assert_eq!(stats.refreshes_failed, 1);
    assert_eq!(stats.refresh_requests, 0);
    assert!(stats.recovery_halted);
    assert!(!harness.driver.needs_refresh());

    // A new run accepts requests again.
    harness.device.fail_open(None);
    harness.driver.close().unwrap();
    harness.driver.open(duplex()).unwrap();
    harness.driver.start().unwrap();
    assert!(!harness.driver.stats().recovery_halted);
    assert!(harness.driver.request_refresh());
    assert_eq!(
        harness.driver.poll_recovery(),
        Ok(Some(RefreshOutcome::Completed))
    );
}

#[test]
fn failed_capture_reopen_still_paces_reads() {
    let harness = Harness::running(SimConfig::default(), duplex());
    harness.device.fail_open(Some(Direction::Capture));
    assert_eq!(refresh_step(harness.driver.refresh()), "reopen capture");

    let mut plane = vec![1.0_f32; PERIOD_FRAMES as usize];
    let started = Instant::now();
    for _ in 0..5 {
        assert_eq!(harness.driver.read(&mut [&mut plane[..]]), ReadStatus::Idle);
    }
    assert!(started.elapsed() >= Duration::from_millis(READ_TIMEOUT_MS * 5));
    assert!(plane.iter().all(|&sample| sample == 0.0));
    assert!(!harness.driver.needs_refresh());
    assert_eq!(harness.driver.stats().refreshes_failed, 1);
}
