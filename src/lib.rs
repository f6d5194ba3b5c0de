// Duplex Bridge - callback-driven audio devices behind a fixed-period engine
// Ring-buffered capture/playback bridges with burst profiling and refresh

// Module declarations
pub mod audio;
pub mod config;
pub mod engine;
pub mod error;
pub mod telemetry;

// Re-exports for convenience
pub use audio::{ReadStatus, WriteStatus};
pub use config::DriverConfig;
pub use engine::{BridgeDriver, DriverState, DriverStats, OpenParams, RefreshOutcome};
pub use error::{status_code, DriverError, ErrorCode};

use std::sync::Once;

static LOGGING: Once = Once::new();

/// Install the process log subscriber. Safe to call more than once. If the
/// host already installed a subscriber, that one stays.
#[cfg(target_os = "android")]
pub fn init_logging() {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    LOGGING.call_once(|| match tracing_android::layer("duplex_bridge") {
        Ok(layer) => {
            let _ = tracing_subscriber::registry()
                .with(tracing_subscriber::filter::LevelFilter::DEBUG)
                .with(layer)
                .try_init();
        }
        Err(err) => log::warn!("android log layer unavailable: {}", err),
    });
}

#[cfg(not(target_os = "android"))]
pub fn init_logging() {
    use tracing_subscriber::EnvFilter;

    LOGGING.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .try_init();
    });
}

/// JNI_OnLoad is called when the native library is loaded by Android
/// This function initializes the Android context required by oboe-rs
#[cfg(target_os = "android")]
#[no_mangle]
pub extern "system" fn JNI_OnLoad(
    vm: jni::JavaVM,
    _reserved: *mut std::ffi::c_void,
) -> jni::sys::jint {
    init_logging();
    tracing::info!("JNI_OnLoad called - initializing Android context");

    // SAFETY: the JavaVM pointer stays valid for the life of the process and
    // this runs once, before any Oboe stream is opened. No activity context
    // is available at load time.
    unsafe {
        ndk_context::initialize_android_context(
            vm.get_java_vm_pointer().cast(),
            std::ptr::null_mut(),
        );
    }

    tracing::info!("Android context initialized successfully");
    jni::sys::JNI_VERSION_1_6
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_logging_is_idempotent() {
        init_logging();
        init_logging();
    }
}
