// Frame layout and sample marshaling between engine planes and device buffers
//
// The engine works with one float plane per channel; devices want interleaved
// buffers in their native encoding. Everything here is allocation-free so it
// can run inside device callbacks.

/// Scale applied to 16-bit device samples (1 / 32768)
pub const I16_TO_F32_SCALE: f32 = 0.000030517578125;

/// Peak used when converting float samples back to 16-bit
const F32_TO_I16_PEAK: f32 = 32767.0;

/// Shape of one queue item: `frames` frames of `channels` interleaved samples
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLayout {
    pub frames: usize,
    pub channels: usize,
}

impl FrameLayout {
    pub fn new(frames: usize, channels: usize) -> Self {
        Self { frames, channels }
    }

    /// Samples per item
    pub fn samples(&self) -> usize {
        self.frames * self.channels
    }

    pub fn silence(&self) -> Vec<f32> {
        vec![0.0; self.samples()]
    }
}

/// Convert 16-bit samples to float, clamped to [-1.0, 1.0]
pub fn i16_to_f32(src: &[i16], dst: &mut [f32]) {
    for (out, &sample) in dst.iter_mut().zip(src) {
        *out = (sample as f32 * I16_TO_F32_SCALE).clamp(-1.0, 1.0);
    }
}

/// Convert float samples to 16-bit, saturating at +/-32767
pub fn f32_to_i16(src: &[f32], dst: &mut [i16]) {
    for (out, &sample) in dst.iter_mut().zip(src) {
        *out = if sample <= -1.0 {
            -32767
        } else if sample >= 1.0 {
            32767
        } else {
            (sample * F32_TO_I16_PEAK).round() as i16
        };
    }
}

/// Scale samples in place; unity gain is a no-op.
pub fn apply_gain(samples: &mut [f32], gain: f32) {
    if gain == 1.0 {
        return;
    }
    for sample in samples {
        *sample *= gain;
    }
}

/// Interleave engine planes into `dst`.
///
/// A device channel with no matching plane repeats the last plane; with no
/// planes at all the item is silent.
pub fn interleave(planes: &[&[f32]], layout: FrameLayout, dst: &mut [f32]) {
    let Some(last) = planes.len().checked_sub(1) else {
        dst.fill(0.0);
        return;
    };
    for (frame, chunk) in dst.chunks_mut(layout.channels).take(layout.frames).enumerate() {
        for (channel, sample) in chunk.iter_mut().enumerate() {
            *sample = planes[channel.min(last)].get(frame).copied().unwrap_or(0.0);
        }
    }
}

/// Split an interleaved item into engine planes.
///
/// A mono item is copied to every plane; planes beyond the device channel
/// count take the last device channel.
pub fn deinterleave(src: &[f32], layout: FrameLayout, planes: &mut [&mut [f32]]) {
    let channels = layout.channels.max(1);
    for (plane_index, plane) in planes.iter_mut().enumerate() {
        let channel = plane_index.min(channels - 1);
        for (frame, sample) in plane.iter_mut().enumerate() {
            *sample = if frame < layout.frames {
                src.get(frame * channels + channel).copied().unwrap_or(0.0)
            } else {
                0.0
            };
        }
    }
}

/// Zero every engine plane
pub fn silence_planes(planes: &mut [&mut [f32]]) {
    for plane in planes.iter_mut() {
        plane.fill(0.0);
    }
}

/// Render stereo frame pairs through a fixed interleaved `scratch`.
///
/// Frames beyond the scratch capacity are left silent; `scratch` is never
/// resized.
pub fn render_stereo<T, R>(
    frames: &mut [(T, T)],
    scratch: &mut [T],
    render: impl FnOnce(&mut [T]) -> R,
) -> R
where
    T: Copy + Default,
{
    let rendered = frames.len().min(scratch.len() / 2);
    let scratch = &mut scratch[..rendered * 2];
    let result = render(scratch);
    for (frame, pair) in frames.iter_mut().zip(scratch.chunks_exact(2)) {
        *frame = (pair[0], pair[1]);
    }
    frames[rendered..].fill((T::default(), T::default()));
    result
}

/// Deliver stereo frame pairs as interleaved chunks no larger than
/// `scratch`. Stops early once `deliver` returns false.
pub fn deliver_stereo<T>(
    frames: &[(T, T)],
    scratch: &mut [T],
    mut deliver: impl FnMut(&[T]) -> bool,
) -> bool
where
    T: Copy,
{
    let chunk_frames = (scratch.len() / 2).max(1);
    for chunk in frames.chunks(chunk_frames) {
        let scratch = &mut scratch[..chunk.len() * 2];
        for (pair, &(left, right)) in scratch.chunks_exact_mut(2).zip(chunk) {
            pair[0] = left;
            pair[1] = right;
        }
        if !deliver(scratch) {
            return false;
        }
    }
    true
}
