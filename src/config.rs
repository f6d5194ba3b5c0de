//! Configuration management for driver policy values
//!
//! Queue depths, xrun limits, wait timeouts and refresh pauses are all
//! policy rather than contract, so they live here and can be tuned from a
//! JSON file without recompiling the driver.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::engine::backend::SampleEncoding;
use crate::error::DriverError;

/// Complete driver configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    pub stream: StreamDefaults,
    pub bridge: BridgeConfig,
    pub profile: ProfileConfig,
    pub recovery: RecoveryConfig,
}

/// Default Open parameters, mirroring the driver descriptor a host exposes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamDefaults {
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Frames per engine cycle
    pub period_frames: u32,
    /// Capture channel count (0 disables capture)
    pub capture_channels: u16,
    /// Playback channel count
    pub playback_channels: u16,
    /// Sample encoding requested for capture streams
    pub capture_encoding: SampleEncoding,
    /// Sample encoding requested for playback streams
    pub playback_encoding: SampleEncoding,
}

impl Default for StreamDefaults {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            period_frames: 384,
            capture_channels: 0,
            playback_channels: 2,
            // 16-bit capture is what most Android input paths deliver natively
            capture_encoding: SampleEncoding::I16,
            playback_encoding: SampleEncoding::F32,
        }
    }
}

/// Capture/playback bridge policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Item slots per ring buffer
    pub queue_capacity_items: usize,
    /// Items accumulated before playback starts dequeuing
    pub jitter_depth: usize,
    /// Consecutive underruns/overruns tolerated before requesting a refresh
    pub xrun_limit: u32,
    /// Callback gap, in periods, treated as starvation
    pub starvation_factor: u32,
    /// Queued capture items tolerated before the engine is considered behind
    pub capture_backlog_limit: usize,
    /// Base Read() timeout
    pub read_timeout_ms: u64,
    /// Read() timeout multiplier once playback is large-burst
    pub large_burst_read_multiplier: u32,
    /// Jittered playback wait, in periods
    pub jittered_wait_factor: u32,
    /// Callbacks fed a half-size silence buffer after start (0 disables)
    pub startup_primer_callbacks: u32,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            queue_capacity_items: 100,
            jitter_depth: 2,
            xrun_limit: 3,
            starvation_factor: 3,
            capture_backlog_limit: 3,
            read_timeout_ms: 100,
            large_burst_read_multiplier: 2,
            jittered_wait_factor: 30,
            startup_primer_callbacks: 200,
        }
    }
}

impl BridgeConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

/// Runtime burst classification window
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileConfig {
    /// Callback deltas observed before settling on small-burst
    pub window_callbacks: u32,
    /// Back-to-back deltas needed to classify large-burst
    pub consecutive_fast_callbacks: u32,
    /// A delta at or below this counts as back-to-back
    pub fast_delta_ms: u64,
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            window_callbacks: 10,
            consecutive_fast_callbacks: 4,
            fast_delta_ms: 1,
        }
    }
}

/// Refresh sequence pauses
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Pause after stopping streams, before reopening
    pub settle_ms: u64,
    /// Pause after restarting capture, before restarting playback
    pub capture_settle_ms: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            settle_ms: 2_000,
            capture_settle_ms: 100,
        }
    }
}

impl RecoveryConfig {
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn capture_settle(&self) -> Duration {
        Duration::from_millis(self.capture_settle_ms)
    }
}

impl DriverConfig {
    /// Load configuration from JSON file
    ///
    /// Falls back to default values if file is missing or invalid
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Self {
        match fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(config) => {
                    log::info!("[Config] Loaded configuration from {:?}", path.as_ref());
                    config
                }
                Err(err) => {
                    log::warn!(
                        "[Config] Failed to parse JSON from {:?}: {}. Using defaults.",
                        path.as_ref(),
                        err
                    );
                    Self::default()
                }
            },
            Err(err) => {
                log::warn!(
                    "[Config] Failed to read config file {:?}: {}. Using defaults.",
                    path.as_ref(),
                    err
                );
                Self::default()
            }
        }
    }

    /// Reject policy values the bridges cannot operate with
    pub fn validate(&self) -> Result<(), DriverError> {
        let invalid = |reason: &str| {
            Err(DriverError::InvalidParams {
                reason: reason.to_string(),
            })
        };

        if self.bridge.queue_capacity_items == 0 {
            return invalid("queue_capacity_items must be greater than 0");
        }
        if self.bridge.jitter_depth == 0 {
            return invalid("jitter_depth must be greater than 0");
        }
        if self.bridge.jitter_depth * 2 > self.bridge.queue_capacity_items {
            return invalid("queue_capacity_items must hold at least two jitter depths");
        }
        if self.bridge.xrun_limit == 0 {
            return invalid("xrun_limit must be greater than 0");
        }
        if self.bridge.starvation_factor == 0 || self.bridge.jittered_wait_factor == 0 {
            return invalid("starvation_factor and jittered_wait_factor must be greater than 0");
        }
        if self.bridge.large_burst_read_multiplier == 0 {
            return invalid("large_burst_read_multiplier must be greater than 0");
        }
        if self.profile.consecutive_fast_callbacks == 0 {
            return invalid("consecutive_fast_callbacks must be greater than 0");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DriverConfig::default();
        assert_eq!(config.stream.sample_rate, 48_000);
        assert_eq!(config.stream.period_frames, 384);
        assert_eq!(config.bridge.queue_capacity_items, 100);
        assert_eq!(config.bridge.jitter_depth, 2);
        assert_eq!(config.bridge.read_timeout(), Duration::from_millis(100));
        assert_eq!(config.profile.window_callbacks, 10);
        assert_eq!(config.recovery.settle(), Duration::from_secs(2));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_json_roundtrip() {
        let config = DriverConfig::default();
        let json = serde_json::to_string_pretty(&config).unwrap();
        let parsed: DriverConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.bridge.xrun_limit, config.bridge.xrun_limit);
        assert_eq!(parsed.stream.capture_encoding, SampleEncoding::I16);
        assert_eq!(parsed.recovery.capture_settle_ms, 100);
    }

    #[test]
    fn test_partial_json_uses_section_defaults() {
        let parsed: DriverConfig =
            serde_json::from_str(r#"{"bridge": {"jitter_depth": 4}}"#).unwrap();

        assert_eq!(parsed.bridge.jitter_depth, 4);
        assert_eq!(parsed.bridge.xrun_limit, 3);
        assert_eq!(parsed.stream.playback_channels, 2);
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let config = DriverConfig::load_from_file("/nonexistent/bridge_config.json");
        assert_eq!(config.bridge.queue_capacity_items, 100);
    }

    #[test]
    fn test_validate_rejects_zero_jitter_depth() {
        let mut config = DriverConfig::default();
        config.bridge.jitter_depth = 0;
        assert!(matches!(
            config.validate(),
            Err(DriverError::InvalidParams { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_queue_smaller_than_overrun_threshold() {
        let mut config = DriverConfig::default();
        config.bridge.queue_capacity_items = 3;
        assert!(config.validate().is_err());
    }
}
