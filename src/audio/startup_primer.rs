//! Half-buffer startup compensation for large-burst playback.
//!
//! Some Bluetooth output paths show a large, stable latency offset unless the
//! first few hundred callbacks after start are fed a half-size silent buffer.
//! Nothing explains why; the behaviour was found on hardware and has only
//! been validated there. It is deliberately kept out of the general bridging
//! policy: only the jittered playback strategy consults it, and setting
//! `startup_primer_callbacks` to 0 turns it off.

/// Counts down the callbacks that still get a half-size silence buffer.
#[derive(Debug, Clone)]
pub struct HalfBufferPrimer {
    total: u32,
    remaining: u32,
}

impl HalfBufferPrimer {
    pub fn new(callbacks: u32) -> Self {
        Self {
            total: callbacks,
            remaining: callbacks,
        }
    }

    /// Consume one primed callback. Returns the number of frames the device
    /// should play for this callback, or `None` once priming is over.
    pub fn take(&mut self, frames: usize) -> Option<usize> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        Some(frames / 2)
    }

    pub fn is_active(&self) -> bool {
        self.remaining > 0
    }

    /// Re-arm for a fresh start.
    pub fn rearm(&mut self) {
        self.remaining = self.total;
    }
}
