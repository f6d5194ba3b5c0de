// Driver error types and constants

use crate::engine::backend::Direction;
use crate::error::ErrorCode;
use log::error;
use std::fmt;

/// Driver error code constants
///
/// Error code range: 2001-2012
pub struct DriverErrorCodes {}

impl DriverErrorCodes {
    /// Open parameters are unusable (zero period, no channels, ...)
    pub const INVALID_PARAMS: i32 = 2001;

    /// Open called while streams are already bound
    pub const ALREADY_OPEN: i32 = 2002;

    /// Lifecycle call requires an opened driver
    pub const NOT_OPEN: i32 = 2003;

    /// Start called while already running
    pub const ALREADY_RUNNING: i32 = 2004;

    /// Stop called while not running
    pub const NOT_RUNNING: i32 = 2005;

    /// Device refused to open a stream
    pub const STREAM_OPEN_FAILED: i32 = 2006;

    /// Device refused to start a stream
    pub const STREAM_START_FAILED: i32 = 2007;

    /// Device refused to stop a stream
    pub const STREAM_STOP_FAILED: i32 = 2008;

    /// Device refused to close a stream
    pub const STREAM_CLOSE_FAILED: i32 = 2009;

    /// No usable audio device
    pub const DEVICE_UNAVAILABLE: i32 = 2010;

    /// Mutex was poisoned
    pub const LOCK_POISONED: i32 = 2011;

    /// A refresh step failed and the sequence was aborted
    pub const REFRESH_FAILED: i32 = 2012;
}

/// Log a driver error with structured context
///
/// The logging is non-blocking and will not panic on failure.
pub fn log_driver_error(err: &DriverError, context: &str) {
    error!(
        "Driver error in {}: code={}, component=BridgeDriver, message={}",
        context,
        err.code(),
        err.message()
    );
}

/// Map a lifecycle result onto the status convention of the host engine:
/// `0` on success, the negated error code on failure.
pub fn status_code<T>(result: &Result<T, DriverError>) -> i32 {
    match result {
        Ok(_) => 0,
        Err(err) => -err.code(),
    }
}

/// Driver lifecycle and device errors
///
/// Data-flow problems (xruns, read timeouts) never surface here; they are
/// absorbed by the bridges and escalate through the refresh flag instead.
#[derive(Debug, Clone, PartialEq)]
pub enum DriverError {
    /// Open parameters are unusable
    InvalidParams { reason: String },

    /// Driver already has bound streams
    AlreadyOpen,

    /// Driver has not been opened
    NotOpen,

    /// Driver is already running
    AlreadyRunning,

    /// Driver is not running
    NotRunning,

    /// Failed to open a device stream
    StreamOpenFailed { direction: Direction, reason: String },

    /// Failed to start a device stream
    StreamStartFailed { direction: Direction, reason: String },

    /// Failed to stop a device stream
    StreamStopFailed { direction: Direction, reason: String },

    /// Failed to close a device stream
    StreamCloseFailed { direction: Direction, reason: String },

    /// No device could be reached
    DeviceUnavailable { reason: String },

    /// Mutex was poisoned
    LockPoisoned { component: String },

    /// Refresh sequence aborted at `step`
    RefreshFailed { step: String, reason: String },
}

impl ErrorCode for DriverError {
    fn code(&self) -> i32 {
        match self {
            DriverError::InvalidParams { .. } => DriverErrorCodes::INVALID_PARAMS,
            DriverError::AlreadyOpen => DriverErrorCodes::ALREADY_OPEN,
            DriverError::NotOpen => DriverErrorCodes::NOT_OPEN,
            DriverError::AlreadyRunning => DriverErrorCodes::ALREADY_RUNNING,
            DriverError::NotRunning => DriverErrorCodes::NOT_RUNNING,
            DriverError::StreamOpenFailed { .. } => DriverErrorCodes::STREAM_OPEN_FAILED,
            DriverError::StreamStartFailed { .. } => DriverErrorCodes::STREAM_START_FAILED,
            DriverError::StreamStopFailed { .. } => DriverErrorCodes::STREAM_STOP_FAILED,
            DriverError::StreamCloseFailed { .. } => DriverErrorCodes::STREAM_CLOSE_FAILED,
            DriverError::DeviceUnavailable { .. } => DriverErrorCodes::DEVICE_UNAVAILABLE,
            DriverError::LockPoisoned { .. } => DriverErrorCodes::LOCK_POISONED,
            DriverError::RefreshFailed { .. } => DriverErrorCodes::REFRESH_FAILED,
        }
    }

    fn message(&self) -> String {
        match self {
            DriverError::InvalidParams { reason } => {
                format!("Invalid open parameters: {}", reason)
            }
            DriverError::AlreadyOpen => "Driver already open. Call close() first.".to_string(),
            DriverError::NotOpen => "Driver not open. Call open() first.".to_string(),
            DriverError::AlreadyRunning => {
                "Driver already running. Call stop() first.".to_string()
            }
            DriverError::NotRunning => "Driver not running. Call start() first.".to_string(),
            DriverError::StreamOpenFailed { direction, reason } => {
                format!("Failed to open {} stream: {}", direction, reason)
            }
            DriverError::StreamStartFailed { direction, reason } => {
                format!("Failed to start {} stream: {}", direction, reason)
            }
            DriverError::StreamStopFailed { direction, reason } => {
                format!("Failed to stop {} stream: {}", direction, reason)
            }
            DriverError::StreamCloseFailed { direction, reason } => {
                format!("Failed to close {} stream: {}", direction, reason)
            }
            DriverError::DeviceUnavailable { reason } => {
                format!("Audio device unavailable: {}", reason)
            }
            DriverError::LockPoisoned { component } => {
                format!("Lock poisoned on {}", component)
            }
            DriverError::RefreshFailed { step, reason } => {
                format!("Refresh aborted at {}: {}", step, reason)
            }
        }
    }
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DriverError::{:?} (code {}): {}",
            self,
            self.code(),
            self.message()
        )
    }
}

impl std::error::Error for DriverError {}

impl From<std::io::Error> for DriverError {
    fn from(err: std::io::Error) -> Self {
        DriverError::DeviceUnavailable {
            reason: err.to_string(),
        }
    }
}
