// Audio module - ring buffers and the capture/playback bridges

pub mod capture;
pub mod frame;
pub mod playback;
pub mod ring_buffer;
pub mod startup_primer;
pub mod wait;

use tracing::warn;

use crate::engine::backend::{DeviceFault, Direction};
use crate::engine::recovery::{RefreshReason, RefreshSignal};
use crate::telemetry::{BridgeObserver, MetricEvent};

// Re-export commonly used types for convenience
pub use capture::{CaptureBridge, CaptureSettings, CaptureStats, ReadStatus};
pub use frame::FrameLayout;
pub use playback::{PlaybackBridge, PlaybackSettings, PlaybackStats, WriteStatus};
pub use ring_buffer::{RingBuffer, DEFAULT_CAPACITY_ITEMS};

/// Shared error-callback handling: a disconnect escalates straight to a
/// refresh request, anything else is only logged.
pub(crate) fn report_fault(
    direction: Direction,
    fault: DeviceFault,
    signal: &RefreshSignal,
    observer: &dyn BridgeObserver,
) {
    let disconnected = fault == DeviceFault::Disconnected;
    observer.record(MetricEvent::DeviceFault {
        direction,
        disconnected,
    });
    match fault {
        DeviceFault::Disconnected => {
            warn!(%direction, "device stream disconnected");
            signal.request(RefreshReason::DeviceDisconnected);
        }
        DeviceFault::Other(details) => {
            warn!(%direction, %details, "device stream error");
        }
    }
}
