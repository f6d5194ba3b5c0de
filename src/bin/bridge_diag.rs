use std::collections::BTreeMap;
use std::f32::consts::TAU;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use rand::Rng;
use serde::Serialize;
use tracing::{info, warn};

use duplex_bridge::engine::{
    DeviceFault, Direction, SimConfig, SimulatedDevice, SystemTimeSource,
};
use duplex_bridge::telemetry::TelemetryHub;
use duplex_bridge::{BridgeDriver, DriverConfig, DriverStats, OpenParams, WriteStatus};

fn main() -> ExitCode {
    duplex_bridge::init_logging();
    let cli = Cli::parse();
    match cli.execute() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("bridge-diag error: {err:?}");
            ExitCode::from(1)
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "bridge-diag", about = "Exercise the duplex bridge driver and report telemetry")]
struct Cli {
    /// Driver policy file (JSON). Defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

impl Cli {
    fn execute(self) -> Result<()> {
        let config = match &self.config {
            Some(path) => DriverConfig::load_from_file(path),
            None => DriverConfig::default(),
        };
        match self.command {
            Command::Simulate(args) => simulate_command(config, args),
            Command::Probe(args) => probe_command(config, args),
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Drive a simulated device with timing jitter and optional faults.
    Simulate(SimulateArgs),
    /// Play a test tone through the platform device.
    Probe(ProbeArgs),
}

#[derive(Args, Debug, Clone)]
struct SimulateArgs {
    /// Session length (milliseconds).
    #[arg(long, default_value_t = 2_000)]
    duration_ms: u64,
    /// Maximum callback timing jitter (microseconds).
    #[arg(long, default_value_t = 500)]
    jitter_us: u64,
    /// Native playback burst in frames; larger than the period makes the
    /// stream large-burst at open.
    #[arg(long)]
    burst_frames: Option<u32>,
    /// Deliver callbacks in back-to-back pairs to trip the burst profiler.
    #[arg(long, default_value_t = false)]
    bursty: bool,
    /// Also open and feed a capture stream.
    #[arg(long, default_value_t = false)]
    duplex: bool,
    /// Inject a playback disconnect after this many milliseconds.
    #[arg(long)]
    disconnect_at_ms: Option<u64>,
    /// Tone frequency written by the engine loop (Hz).
    #[arg(long, default_value_t = 440.0)]
    frequency: f32,
    /// Write rendered playback to a 32-bit float WAV file.
    #[arg(long)]
    wav_out: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
struct ProbeArgs {
    /// Tone length (milliseconds).
    #[arg(long, default_value_t = 3_000)]
    duration_ms: u64,
    /// Tone frequency (Hz).
    #[arg(long, default_value_t = 440.0)]
    frequency: f32,
}

#[derive(Serialize)]
struct SessionReport {
    engine_cycles: u64,
    write_not_live: u64,
    refreshes_run: u64,
    driver: DriverStats,
    telemetry_events: BTreeMap<String, u64>,
    telemetry_total: u64,
}

/// Sine generator filling non-interleaved planes one period at a time.
struct Tone {
    phase: f32,
    step: f32,
}

impl Tone {
    fn new(frequency: f32, sample_rate: u32) -> Self {
        Self {
            phase: 0.0,
            step: TAU * frequency / sample_rate as f32,
        }
    }

    fn fill(&mut self, planes: &mut [Vec<f32>]) {
        let frames = planes.first().map_or(0, Vec::len);
        for i in 0..frames {
            let sample = 0.25 * self.phase.sin();
            for plane in planes.iter_mut() {
                plane[i] = sample;
            }
            self.phase = (self.phase + self.step) % TAU;
        }
    }
}

fn planes(channels: u16, frames: u32) -> Vec<Vec<f32>> {
    vec![vec![0.0; frames as usize]; usize::from(channels.max(1))]
}

fn simulate_command(config: DriverConfig, args: SimulateArgs) -> Result<()> {
    let mut params = OpenParams::from_config(&config.stream);
    params.capturing = args.duplex;
    if args.duplex && params.capture_channels == 0 {
        params.capture_channels = params.playback_channels;
    }
    let period = Duration::from_secs_f64(f64::from(params.period_frames) / f64::from(params.sample_rate));

    let device = Arc::new(SimulatedDevice::new(SimConfig {
        playback_burst_frames: args.burst_frames,
        ..SimConfig::default()
    }));
    let hub = Arc::new(TelemetryHub::new(256, 4_096));
    let driver = BridgeDriver::new(
        device.clone(),
        config,
        hub.clone(),
        Arc::new(SystemTimeSource::default()),
    )
    .context("driver construction")?;

    driver.open(params.clone()).context("open")?;
    driver.start().context("start")?;
    info!(
        period_us = period.as_micros() as u64,
        duplex = args.duplex,
        "simulated session running"
    );

    let running = Arc::new(AtomicBool::new(true));
    let device_thread = {
        let device = Arc::clone(&device);
        let running = Arc::clone(&running);
        let args = args.clone();
        thread::Builder::new()
            .name("sim-device".into())
            .spawn(move || run_device(&device, &running, period, &args))
            .context("spawn device thread")?
    };

    let mut tone = Tone::new(args.frequency, params.sample_rate);
    let mut output = planes(params.playback_channels, params.period_frames);
    let mut input = planes(params.capture_channels, params.period_frames);
    let mut cycles = 0_u64;
    let mut not_live = 0_u64;
    let deadline = Instant::now() + Duration::from_millis(args.duration_ms);

    while Instant::now() < deadline {
        if args.duplex {
            let mut views: Vec<&mut [f32]> = input.iter_mut().map(Vec::as_mut_slice).collect();
            driver.read(&mut views);
        } else {
            thread::sleep(period);
        }

        tone.fill(&mut output);
        let views: Vec<&[f32]> = output.iter().map(Vec::as_slice).collect();
        match driver.write(&views) {
            Ok(WriteStatus::Queued) => {}
            Ok(_) => not_live += 1,
            Err(err) => warn!(error = %err, "write failed"),
        }
        cycles += 1;
    }

    running.store(false, Ordering::SeqCst);
    let rendered = device_thread
        .join()
        .map_err(|_| anyhow::anyhow!("device thread panicked"))?;

    let stats = driver.stats();
    driver.stop().context("stop")?;
    driver.close().context("close")?;

    if let Some(path) = &args.wav_out {
        write_wav(path, &rendered, params.playback_channels, params.sample_rate)?;
        info!(path = %path.display(), samples = rendered.len(), "rendered playback saved");
    }

    let snapshot = hub.snapshot();
    let report = SessionReport {
        engine_cycles: cycles,
        write_not_live: not_live,
        refreshes_run: stats.refreshes_completed,
        driver: stats,
        telemetry_events: count_event_types(&snapshot.recent),
        telemetry_total: snapshot.total_events,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// Device clock: one playback callback (plus capture in duplex) per period,
/// with jitter. Returns everything the bridge rendered.
fn run_device(
    device: &SimulatedDevice,
    running: &AtomicBool,
    period: Duration,
    args: &SimulateArgs,
) -> Vec<f32> {
    let mut rng = rand::thread_rng();
    let mut rendered = Vec::new();
    let started = Instant::now();
    let mut fault_pending = args.disconnect_at_ms.map(Duration::from_millis);
    let mut tick = 0_u64;

    while running.load(Ordering::SeqCst) {
        let jitter = Duration::from_micros(rng.gen_range(0..=args.jitter_us));
        if args.bursty {
            // Pairs of callbacks every second period.
            if tick % 2 == 0 {
                thread::sleep(period * 2 + jitter);
                pump(device, args.duplex, &mut rendered);
                pump(device, args.duplex, &mut rendered);
            }
        } else {
            thread::sleep(period + jitter);
            pump(device, args.duplex, &mut rendered);
        }
        tick += 1;

        if let Some(at) = fault_pending {
            if started.elapsed() >= at {
                info!("injecting playback disconnect");
                device.inject_fault(Direction::Playback, DeviceFault::Disconnected);
                fault_pending = None;
            }
        }
    }
    rendered
}

fn pump(device: &SimulatedDevice, duplex: bool, rendered: &mut Vec<f32>) {
    if duplex {
        device.push_capture_period(0.0);
    }
    if let Some((_, samples)) = device.pump_playback() {
        rendered.extend_from_slice(&samples);
    }
}

fn count_event_types(events: &[duplex_bridge::telemetry::MetricEvent]) -> BTreeMap<String, u64> {
    let mut counts = BTreeMap::new();
    for event in events {
        let kind = serde_json::to_value(event)
            .ok()
            .and_then(|value| value.get("type").and_then(|t| t.as_str()).map(str::to_owned))
            .unwrap_or_else(|| "unknown".to_string());
        *counts.entry(kind).or_insert(0) += 1;
    }
    counts
}

fn write_wav(path: &Path, samples: &[f32], channels: u16, sample_rate: u32) -> Result<()> {
    let spec = hound::WavSpec {
        channels: channels.max(1),
        sample_rate,
        bits_per_sample: 32,
        sample_format: hound::SampleFormat::Float,
    };
    let mut writer = hound::WavWriter::create(path, spec)
        .with_context(|| format!("create {}", path.display()))?;
    for &sample in samples {
        writer.write_sample(sample)?;
    }
    writer.finalize()?;
    Ok(())
}

fn probe_command(config: DriverConfig, args: ProbeArgs) -> Result<()> {
    if cfg!(target_os = "android") {
        bail!("probe runs on desktop hosts only");
    }

    let mut params = OpenParams::from_config(&config.stream);
    params.capturing = false;
    let period = Duration::from_secs_f64(f64::from(params.period_frames) / f64::from(params.sample_rate));
    let target_depth = config.bridge.jitter_depth;

    let driver = BridgeDriver::new(
        duplex_bridge::engine::default_device(),
        config,
        Arc::new(duplex_bridge::telemetry::NullObserver),
        Arc::new(SystemTimeSource::default()),
    )
    .context("driver construction")?;
    driver.open(params.clone()).context("open")?;
    driver.start().context("start")?;

    let mut tone = Tone::new(args.frequency, params.sample_rate);
    let mut output = planes(params.playback_channels, params.period_frames);
    let deadline = Instant::now() + Duration::from_millis(args.duration_ms);

    while Instant::now() < deadline {
        // Keep the queue near its jitter depth instead of trusting our own clock.
        while driver.stats().playback_depth <= target_depth {
            tone.fill(&mut output);
            let views: Vec<&[f32]> = output.iter().map(Vec::as_slice).collect();
            if driver.write(&views)? != WriteStatus::Queued {
                break;
            }
        }
        thread::sleep(period / 2);
    }

    let stats = driver.stats();
    driver.stop().context("stop")?;
    driver.close().context("close")?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}
