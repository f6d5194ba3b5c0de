// Error types for the duplex bridge driver
//
// Lifecycle failures carry numeric codes so a host engine can turn them into
// the negative status values it expects from Open/Start/Stop/Close.

mod driver;

pub use driver::{log_driver_error, status_code, DriverError, DriverErrorCodes};

/// Error codes for structured error reporting
///
/// This trait provides a standard way to get error codes and messages
/// from custom error types, so host engines can report them without
/// matching on every variant.
pub trait ErrorCode {
    /// Get the numeric error code
    fn code(&self) -> i32;

    /// Get the human-readable error message
    fn message(&self) -> String;
}
