//! Core telemetry event types describing driver diagnostics exposed to the
//! CLI and any host-side subscriber.

use serde::{Deserialize, Serialize};

use crate::engine::backend::Direction;
use crate::engine::recovery::RefreshReason;

/// Driver lifecycle transitions.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LifecyclePhase {
    Opened,
    Started,
    Stopped,
    Closed,
}

/// Steps of the recovery state machine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RefreshPhase {
    Requested,
    Started,
    Completed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum XrunKind {
    Underrun,
    Overrun,
}

/// Which mechanism decided a stream is large-burst.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ClassificationSource {
    /// Device burst exceeded the engine period at open
    Binding,
    /// Back-to-back callbacks observed at runtime
    Profiler,
}

/// Diagnostic error codes surfaced via telemetry metrics.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticError {
    StreamStop,
    StreamClose,
    CaptureUnsupported,
}

/// Rich metric events covering queue occupancy, xruns, recovery and lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum MetricEvent {
    BufferOccupancy {
        channel: String,
        percent: f32,
    },
    Xrun {
        kind: XrunKind,
        run_length: u32,
    },
    Starvation {
        gap_ms: f32,
    },
    ReadTimeout {
        timeout_ms: u64,
    },
    CaptureBacklog {
        depth: usize,
        discarded: usize,
    },
    BurstClassified {
        direction: Direction,
        large_burst: bool,
        source: ClassificationSource,
    },
    Refresh {
        phase: RefreshPhase,
        reason: Option<RefreshReason>,
    },
    Lifecycle {
        phase: LifecyclePhase,
        timestamp_ms: u64,
    },
    DeviceFault {
        direction: Direction,
        disconnected: bool,
    },
    Error {
        code: DiagnosticError,
        context: String,
    },
}
