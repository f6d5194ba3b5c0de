use super::*;
use crate::audio::capture::CaptureSettings;
use crate::engine::backend::ManualTimeSource;
use crate::engine::recovery::RecoveryController;
use crate::telemetry::NullObserver;
use std::thread;

const FRAMES: usize = 4;
const CHANNELS: usize = 2;
const PERIOD: Duration = Duration::from_millis(5);

struct Harness {
    bridge: Arc<PlaybackBridge>,
    capture: Arc<CaptureBridge>,
    signal: Arc<RefreshSignal>,
    clock: Arc<ManualTimeSource>,
}

impl Harness {
    fn new(config: BridgeConfig, large_burst: bool) -> Self {
        let observer: Arc<dyn BridgeObserver> = Arc::new(NullObserver);
        let signal = Arc::new(RefreshSignal::new(Arc::clone(&observer)));
        let capture = Arc::new(CaptureBridge::new(
            CaptureSettings::from(&config),
            Arc::clone(&signal),
            Arc::clone(&observer),
        ));
        capture.attach(FrameLayout::new(FRAMES, 1), false);
        capture.arm();

        let clock = Arc::new(ManualTimeSource::new());
        let bridge = Arc::new(PlaybackBridge::new(
            PlaybackSettings::new(&config, &ProfileConfig::default()),
            Arc::clone(&capture),
            Arc::clone(&signal),
            observer,
            clock.clone(),
        ));
        bridge.attach(FrameLayout::new(FRAMES, CHANNELS), PERIOD, large_burst);
        bridge.arm();

        Self {
            bridge,
            capture,
            signal,
            clock,
        }
    }

    fn direct() -> Self {
        Self::new(BridgeConfig::default(), false)
    }

    fn pump(&self) -> (CallbackResult, Vec<f32>) {
        self.clock.advance(PERIOD);
        render(&self.bridge)
    }

    fn write(&self, value: f32) -> WriteStatus {
        write_value(&self.bridge, value)
    }

    /// Warm up with two items of `value`, leaving one queued.
    fn warm_up_at(&self, value: f32) {
        self.pump();
        self.write(value);
        self.write(value);
        self.pump();
    }

    /// Start the stream and complete the default two-item warm-up,
    /// leaving one item queued.
    fn warm_up(&self) {
        self.pump();
        self.write(0.1);
        self.write(0.2);
        let (_, out) = self.pump();
        assert_eq!(out, vec![0.1; FRAMES * CHANNELS]);
    }
}

fn render(bridge: &PlaybackBridge) -> (CallbackResult, Vec<f32>) {
    let mut out = vec![9.0; FRAMES * CHANNELS];
    let result = bridge.on_data(DeviceBuffer::OutputF32(&mut out));
    (result, out)
}

fn write_value(bridge: &PlaybackBridge, value: f32) -> WriteStatus {
    let plane = [value; FRAMES];
    bridge.write(&[&plane, &plane])
}

fn config_with(adjust: impl FnOnce(&mut BridgeConfig)) -> BridgeConfig {
    let mut config = BridgeConfig::default();
    adjust(&mut config);
    config
}

#[test]
fn write_is_refused_until_first_callback() {
    let harness = Harness::direct();
    assert_eq!(harness.write(0.5), WriteStatus::NotLive);

    let (result, out) = harness.pump();
    assert_eq!(result, CallbackResult::Continue);
    assert_eq!(out, vec![0.0; FRAMES * CHANNELS]);
    assert_eq!(harness.write(0.5), WriteStatus::Queued);
}

#[test]
fn detached_bridge_is_idle() {
    let harness = Harness::direct();
    harness.bridge.detach();
    assert_eq!(harness.write(0.5), WriteStatus::Idle);
    assert_eq!(render(&harness.bridge).0, CallbackResult::Stop);
}

#[test]
fn warm_up_waits_for_jitter_depth_then_trims_surplus() {
    let harness = Harness::direct();
    harness.pump();

    harness.write(1.0);
    let (_, out) = harness.pump();
    assert_eq!(out, vec![0.0; FRAMES * CHANNELS]);

    harness.write(2.0);
    harness.write(3.0);
    harness.write(4.0);
    let (_, out) = harness.pump();
    assert_eq!(out, vec![3.0; FRAMES * CHANNELS]);
    assert_eq!(harness.bridge.depth(), 1);
    assert_eq!(harness.bridge.stats().items_dropped, 2);
}

#[test]
fn steady_state_is_fifo_without_xruns() {
    let harness = Harness::direct();
    harness.warm_up();

    let mut rendered = Vec::new();
    for i in 0..20 {
        harness.write(i as f32);
        let (_, out) = harness.pump();
        rendered.push(out[0]);
    }

    let expected: Vec<f32> = std::iter::once(0.2).chain((0..19).map(|i| i as f32)).collect();
    assert_eq!(rendered, expected);
    let stats = harness.bridge.stats();
    assert_eq!(stats.underruns, 0);
    assert_eq!(stats.overruns, 0);
    assert!(!harness.signal.is_needed());
}

#[test]
fn underruns_inject_silence_then_escalate_once() {
    let harness = Harness::direct();
    harness.warm_up();
    // Drains the item left by warm-up.
    harness.pump();

    for _ in 0..5 {
        let (result, out) = harness.pump();
        assert_eq!(result, CallbackResult::Continue);
        assert_eq!(out, vec![0.0; FRAMES * CHANNELS]);
    }

    let stats = harness.bridge.stats();
    assert_eq!(stats.underruns, 5);
    assert_eq!(stats.silence_injections, 2);
    assert!(harness.signal.is_needed());
    assert_eq!(harness.signal.requests(), 1);
}

#[test]
fn recovered_underrun_resets_run_length() {
    let harness = Harness::direct();
    harness.warm_up();
    harness.pump();

    harness.pump();
    harness.pump();
    harness.write(0.7);
    let (_, out) = harness.pump();
    assert_eq!(out[0], 0.7);
    harness.pump();
    harness.pump();

    assert_eq!(harness.bridge.stats().underruns, 4);
    assert!(!harness.signal.is_needed());
}

#[test]
fn overruns_drop_items_then_escalate() {
    let harness = Harness::direct();
    harness.warm_up();
    for i in 0..9 {
        harness.write(i as f32);
    }
    assert_eq!(harness.bridge.depth(), 10);

    harness.pump();
    harness.pump();
    assert_eq!(harness.bridge.depth(), 6);
    assert!(!harness.signal.is_needed());

    let (_, out) = harness.pump();
    assert_eq!(out, vec![0.0; FRAMES * CHANNELS]);
    assert_eq!(harness.bridge.depth(), 6);
    assert_eq!(harness.bridge.stats().overruns, 3);
    assert_eq!(harness.signal.requests(), 1);
}

#[test]
fn starvation_requests_refresh_without_consuming() {
    let harness = Harness::direct();
    harness.warm_up();
    harness.write(0.3);
    let depth = harness.bridge.depth();

    harness.clock.advance(PERIOD * 4);
    let (_, out) = harness.pump();

    assert_eq!(out, vec![0.0; FRAMES * CHANNELS]);
    assert_eq!(harness.bridge.depth(), depth);
    assert_eq!(harness.bridge.stats().starvations, 1);
    assert!(harness.signal.is_needed());
}

#[test]
fn capture_disabled_feeds_muted_items() {
    let harness = Harness::direct();
    for _ in 0..3 {
        harness.pump();
    }
    assert_eq!(harness.capture.depth(), 3);
    assert_eq!(harness.capture.stats().muted_injections, 3);
}

#[test]
fn duplex_playback_waits_for_capture_to_go_live() {
    let harness = Harness::direct();
    harness.bridge.set_capture_enabled(true);
    harness.capture.attach(FrameLayout::new(FRAMES, 1), true);
    harness.capture.arm();

    harness.pump();
    harness.write(0.4);
    harness.write(0.5);
    let (_, out) = harness.pump();
    assert_eq!(out, vec![0.0; FRAMES * CHANNELS]);
    assert_eq!(harness.bridge.depth(), 2);
    assert_eq!(harness.capture.depth(), 0);

    let input = [0_i16; FRAMES];
    harness.capture.on_data(DeviceBuffer::InputI16(&input));
    let (_, out) = harness.pump();
    assert_eq!(out, vec![0.4; FRAMES * CHANNELS]);
}

#[test]
fn i16_output_uses_saturating_conversion() {
    let harness = Harness::new(config_with(|c| c.jitter_depth = 1), false);
    harness.pump();
    harness.write(0.5);

    harness.clock.advance(PERIOD);
    let mut out = [0_i16; FRAMES * CHANNELS];
    harness.bridge.on_data(DeviceBuffer::OutputI16(&mut out));
    assert_eq!(out, [16384; FRAMES * CHANNELS]);
}

#[test]
fn volume_scales_float_output() {
    let harness = Harness::direct();
    harness.bridge.set_volume(0.5);
    harness.warm_up_at(0.8);

    let (_, out) = harness.pump();
    assert_eq!(out, vec![0.4; FRAMES * CHANNELS]);
    assert_eq!(harness.bridge.volume(), 0.5);
}

#[test]
fn volume_scales_i16_output() {
    let harness = Harness::new(config_with(|c| c.jitter_depth = 1), false);
    harness.bridge.set_volume(0.25);
    harness.pump();
    harness.write(1.0);

    harness.clock.advance(PERIOD);
    let mut out = [0_i16; FRAMES * CHANNELS];
    harness.bridge.on_data(DeviceBuffer::OutputI16(&mut out));
    assert_eq!(out, [8192; FRAMES * CHANNELS]);
}

#[test]
fn volume_is_clamped_to_unit_range() {
    let harness = Harness::direct();
    harness.bridge.set_volume(3.0);
    assert_eq!(harness.bridge.volume(), 1.0);
    harness.bridge.set_volume(-1.0);
    assert_eq!(harness.bridge.volume(), 0.0);
    harness.bridge.set_volume(f32::NAN);
    assert_eq!(harness.bridge.volume(), 0.0);
}

#[test]
fn output_is_muted_while_refreshing() {
    let harness = Harness::direct();
    harness.warm_up();

    let recovery = RecoveryController::new(Arc::clone(&harness.signal), Arc::new(NullObserver));
    let ticket = recovery.try_begin().unwrap();
    harness.write(0.9);
    let (_, out) = harness.pump();
    assert_eq!(out, vec![0.0; FRAMES * CHANNELS]);
    drop(ticket);
}

#[test]
fn back_to_back_callbacks_switch_to_jittered_strategy() {
    let harness = Harness::new(config_with(|c| c.jittered_wait_factor = 2), false);
    assert!(!harness.bridge.is_large_burst());

    // First callback has no delta; the next four arrive with zero spacing.
    for _ in 0..5 {
        render(&harness.bridge);
    }
    assert!(harness.bridge.is_large_burst());
}

#[test]
fn jittered_callback_waits_for_next_write() {
    let harness = Harness::new(config_with(|c| c.startup_primer_callbacks = 0), true);

    let writer = {
        let bridge = Arc::clone(&harness.bridge);
        thread::spawn(move || {
            for _ in 0..2_000 {
                if write_value(&bridge, 0.6) == WriteStatus::Queued {
                    return true;
                }
                thread::sleep(Duration::from_millis(1));
            }
            false
        })
    };

    let (result, out) = harness.pump();
    assert!(writer.join().unwrap());
    assert_eq!(result, CallbackResult::Continue);
    assert_eq!(out, vec![0.6; FRAMES * CHANNELS]);
}

#[test]
fn jittered_wait_times_out_with_silence() {
    let harness = Harness::new(config_with(|c| c.jittered_wait_factor = 2), true);
    let (result, out) = harness.pump();
    assert_eq!(result, CallbackResult::Continue);
    assert_eq!(out, vec![0.0; FRAMES * CHANNELS]);
    assert_eq!(harness.bridge.stats().jittered_wait_timeouts, 1);
}

#[test]
fn startup_primer_feeds_half_buffers_first() {
    let harness = Harness::new(config_with(|c| c.startup_primer_callbacks = 2), true);
    let stop = Arc::new(AtomicBool::new(false));
    let writer = {
        let bridge = Arc::clone(&harness.bridge);
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            while !stop.load(Ordering::Acquire) {
                write_value(&bridge, 0.25);
                thread::sleep(Duration::from_millis(1));
            }
        })
    };

    let results: Vec<CallbackResult> = (0..3).map(|_| harness.pump().0).collect();
    stop.store(true, Ordering::Release);
    writer.join().unwrap();

    assert_eq!(
        results,
        vec![
            CallbackResult::Partial(FRAMES / 2),
            CallbackResult::Partial(FRAMES / 2),
            CallbackResult::Continue
        ]
    );
    assert_eq!(harness.bridge.stats().primed_callbacks, 2);
}

#[test]
fn disarm_releases_parked_jittered_callback() {
    let harness = Harness::new(config_with(|c| c.jittered_wait_factor = 1_000), true);
    let callback = {
        let bridge = Arc::clone(&harness.bridge);
        thread::spawn(move || {
            let started = Instant::now();
            let (result, _) = render(&bridge);
            (result, started.elapsed())
        })
    };

    thread::sleep(Duration::from_millis(20));
    harness.bridge.disarm();
    let (result, elapsed) = callback.join().unwrap();

    assert_eq!(result, CallbackResult::Continue);
    assert!(elapsed < Duration::from_secs(2));
}
