//! Diagnostics telemetry collector and the observer seam used by the bridges.
//!
//! Bridges and the driver report through an injected [`BridgeObserver`].
//! [`TelemetryHub`] is the stock implementation: it multiplexes xrun,
//! classification, queue occupancy, recovery and lifecycle events into a
//! bounded history plus a broadcast stream. Nothing here is process-global.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::broadcast;

pub mod events;

pub use events::{
    ClassificationSource, DiagnosticError, LifecyclePhase, MetricEvent, RefreshPhase, XrunKind,
};

/// Counter/trace sink passed into the bridges at construction.
///
/// Implementations are called from device callback threads and must not
/// block for long.
pub trait BridgeObserver: Send + Sync {
    fn record(&self, event: MetricEvent);

    /// Queue depth after a callback touched `channel`.
    fn record_queue_depth(&self, channel: &'static str, depth: usize, capacity: usize) {
        let _ = (channel, depth, capacity);
    }
}

/// Observer that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullObserver;

impl BridgeObserver for NullObserver {
    fn record(&self, _event: MetricEvent) {}
}

/// Snapshot of collector state for CLI reporting.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TelemetrySnapshot {
    pub recent: Vec<MetricEvent>,
    pub total_events: u64,
    pub dropped_events: u64,
}

/// Broadcast-based collector retaining a bounded history of metrics.
pub struct TelemetryCollector {
    tx: broadcast::Sender<MetricEvent>,
    history: Mutex<VecDeque<MetricEvent>>,
    history_capacity: usize,
    total_events: AtomicU64,
    dropped_history: AtomicU64,
}

impl TelemetryCollector {
    pub fn new(buffer: usize, history_capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(buffer);
        Self {
            tx,
            history: Mutex::new(VecDeque::with_capacity(history_capacity)),
            history_capacity,
            total_events: AtomicU64::new(0),
            dropped_history: AtomicU64::new(0),
        }
    }

    pub fn publish(&self, event: MetricEvent) {
        self.total_events.fetch_add(1, Ordering::Relaxed);
        {
            let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
            if history.len() == self.history_capacity {
                history.pop_front();
                self.dropped_history.fetch_add(1, Ordering::Relaxed);
            }
            history.push_back(event.clone());
        }

        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MetricEvent> {
        self.tx.subscribe()
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        let history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        TelemetrySnapshot {
            recent: history.iter().cloned().collect(),
            total_events: self.total_events.load(Ordering::Relaxed),
            dropped_events: self.dropped_history.load(Ordering::Relaxed),
        }
    }
}

impl Default for TelemetryCollector {
    fn default() -> Self {
        Self::new(256, 64)
    }
}

/// Top-level hub wrapping collector state plus debounced queue gauges.
pub struct TelemetryHub {
    collector: TelemetryCollector,
    buffer_gauges: Mutex<HashMap<&'static str, f32>>,
}

impl TelemetryHub {
    pub fn new(channel_capacity: usize, history_capacity: usize) -> Self {
        Self {
            collector: TelemetryCollector::new(channel_capacity, history_capacity),
            buffer_gauges: Mutex::new(HashMap::new()),
        }
    }

    pub fn collector(&self) -> &TelemetryCollector {
        &self.collector
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MetricEvent> {
        self.collector.subscribe()
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        self.collector.snapshot()
    }

    pub fn record_buffer_occupancy(&self, channel: &'static str, percent: f32) {
        let normalized = percent.clamp(0.0, 100.0);
        let mut gauges = self
            .buffer_gauges
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let should_emit = gauges
            .get(channel)
            .map(|last| (last - normalized).abs() >= 2.5)
            .unwrap_or(true);

        if should_emit {
            gauges.insert(channel, normalized);
            self.collector.publish(MetricEvent::BufferOccupancy {
                channel: channel.to_string(),
                percent: normalized,
            });
        }
    }

    pub fn record_lifecycle(&self, phase: LifecyclePhase) {
        self.collector.publish(MetricEvent::Lifecycle {
            phase,
            timestamp_ms: now_timestamp_ms(),
        });
    }
}

impl Default for TelemetryHub {
    fn default() -> Self {
        Self::new(256, 64)
    }
}

impl BridgeObserver for TelemetryHub {
    fn record(&self, event: MetricEvent) {
        self.collector.publish(event);
    }

    fn record_queue_depth(&self, channel: &'static str, depth: usize, capacity: usize) {
        if capacity == 0 {
            return;
        }
        self.record_buffer_occupancy(channel, depth as f32 * 100.0 / capacity as f32);
    }
}

/// Wall-clock timestamp for lifecycle events.
pub fn now_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
