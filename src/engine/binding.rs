//! Stream binding: one negotiated, exclusively owned device stream.
//!
//! The binding opens a stream with the engine period as its callback size,
//! reads back what the device granted and classifies it. A device whose
//! native burst is larger than the engine period is "large-burst" and gets a
//! buffer three bursts deep; everything else keeps the device default.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use super::backend::{
    AudioDevice, DeviceCallbackSink, DeviceStream, Direction, StreamProperties, StreamRequest,
    StreamState,
};
use crate::audio::FrameLayout;
use crate::error::DriverError;

/// Buffer depth, in bursts, requested for large-burst streams.
pub const LARGE_BURST_BUFFER_BURSTS: u32 = 3;

pub struct StreamBinding {
    stream: Option<Box<dyn DeviceStream>>,
    properties: StreamProperties,
    period_frames: u32,
    large_burst: bool,
}

impl StreamBinding {
    /// Open and classify a stream for `request`.
    pub fn open(
        device: &dyn AudioDevice,
        request: &StreamRequest,
        sink: Arc<dyn DeviceCallbackSink>,
    ) -> Result<Self, DriverError> {
        let mut stream = device.open_stream(request, sink)?;
        let mut properties = stream.properties();

        let period_frames = request.frames_per_callback;
        let large_burst = properties.frames_per_burst > period_frames;
        if large_burst {
            let wanted = properties.frames_per_burst * LARGE_BURST_BUFFER_BURSTS;
            match stream.set_buffer_size_frames(wanted) {
                Ok(applied) => properties.buffer_size_frames = applied,
                Err(err) => {
                    // Non-fatal: the device keeps its default depth.
                    warn!(
                        direction = %request.direction,
                        wanted,
                        error = %err,
                        "could not deepen large-burst buffer"
                    );
                }
            }
        }

        info!(
            device = device.name(),
            direction = %properties.direction,
            sample_rate = properties.sample_rate,
            channels = properties.channels,
            period_frames,
            burst_frames = properties.frames_per_burst,
            buffer_frames = properties.buffer_size_frames,
            capacity_frames = properties.buffer_capacity_frames,
            encoding = ?properties.encoding,
            sharing = ?properties.sharing,
            performance = ?properties.performance,
            large_burst,
            "stream opened"
        );

        Ok(Self {
            stream: Some(stream),
            properties,
            period_frames,
            large_burst,
        })
    }

    pub fn properties(&self) -> &StreamProperties {
        &self.properties
    }

    pub fn direction(&self) -> Direction {
        self.properties.direction
    }

    pub fn is_large_burst(&self) -> bool {
        self.large_burst
    }

    /// One engine period of interleaved device channels.
    pub fn layout(&self) -> FrameLayout {
        FrameLayout::new(
            self.period_frames as usize,
            usize::from(self.properties.channels.max(1)),
        )
    }

    /// Wall-clock length of one engine period.
    pub fn period(&self) -> Duration {
        let rate = u64::from(self.properties.sample_rate.max(1));
        Duration::from_nanos(u64::from(self.period_frames) * 1_000_000_000 / rate)
    }

    pub fn state(&self) -> StreamState {
        self.stream
            .as_ref()
            .map_or(StreamState::Closed, |stream| stream.state())
    }

    pub fn start(&mut self) -> Result<(), DriverError> {
        let direction = self.direction();
        let stream = self.stream.as_mut().ok_or(DriverError::NotOpen)?;
        stream.start()?;
        info!(%direction, "stream started");
        Ok(())
    }

    pub fn stop(&mut self) -> Result<(), DriverError> {
        let direction = self.direction();
        let Some(stream) = self.stream.as_mut() else {
            return Ok(());
        };
        stream.stop()?;
        info!(%direction, "stream stopped");
        Ok(())
    }

    /// Release the device stream. The handle is closed exactly once; later
    /// calls are no-ops.
    pub fn close(&mut self) -> Result<(), DriverError> {
        let Some(mut stream) = self.stream.take() else {
            return Ok(());
        };
        let direction = self.direction();
        stream.close()?;
        info!(%direction, "stream closed");
        Ok(())
    }
}

impl Drop for StreamBinding {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(direction = %self.direction(), error = %err, "stream close on drop failed");
        }
    }
}
