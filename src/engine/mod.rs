//! Device-facing half of the driver.
//!
//! `backend` is the seam to native audio APIs, `binding` negotiates and owns
//! one stream, `profile` and `recovery` hold the burst classifier and the
//! refresh guard, and `driver` ties them to the audio bridges.

pub mod backend;
pub mod binding;
pub mod driver;
pub mod profile;
pub mod recovery;

pub use backend::{
    default_device, AudioDevice, CallbackResult, DeviceBuffer, DeviceCallbackSink, DeviceFault,
    DeviceStream, Direction, ManualTimeSource, SampleEncoding, SimConfig, SimEvent,
    SimulatedDevice, StreamProperties, StreamRequest, StreamState, SystemTimeSource, TimeSource,
};
pub use binding::StreamBinding;
pub use driver::{BridgeDriver, DriverState, DriverStats, OpenParams};
pub use profile::{BurstClass, BurstProfiler};
pub use recovery::{RecoveryController, RefreshOutcome, RefreshReason, RefreshSignal};
