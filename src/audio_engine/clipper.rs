//! Output clipping and interleaving.

/// Soft-knee input limit; beyond it the round-off curve saturates.
const ROUNDOFF_KNEE: f32 = 1.65;

/// Value of the round-off curve at the knee.
const ROUNDOFF_CEILING: f32 = 0.9862875;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClipMode {
    /// Clamp to `[-1, 1]`.
    Hard,
    /// Cubic soft knee `0.87x - 0.1x³`, saturating at `±0.9862875`.
    #[default]
    RoundOff,
}

impl ClipMode {
    #[inline]
    fn apply(self, x: f32) -> f32 {
        match self {
            ClipMode::Hard => x.clamp(-1.0, 1.0),
            ClipMode::RoundOff => {
                if x <= -ROUNDOFF_KNEE {
                    -ROUNDOFF_CEILING
                } else if x >= ROUNDOFF_KNEE {
                    ROUNDOFF_CEILING
                } else {
                    0.87 * x - 0.1 * x * x * x
                }
            }
        }
    }
}

/// Clips `channels` planar channels of `samples` each from `src` into `dst`.
///
/// The gain ramps linearly from `volume0` to `volume1` within every channel,
/// and the clipped value is multiplied by `post_clip_scaler`.
#[allow(clippy::too_many_arguments)]
pub fn clip(
    mode: ClipMode,
    src: &[f32],
    dst: &mut [f32],
    samples: usize,
    stride: usize,
    channels: usize,
    volume0: f32,
    volume1: f32,
    post_clip_scaler: f32,
) {
    if samples == 0 {
        return;
    }
    let step = (volume1 - volume0) / samples as f32;
    for ch in 0..channels {
        let range = ch * stride..ch * stride + samples;
        let mut volume = volume0;
        for (out, &x) in dst[range.clone()].iter_mut().zip(&src[range]) {
            *out = mode.apply(x * volume) * post_clip_scaler;
            volume += step;
        }
    }
}

/// Interleaves planar `src` into `dst` as `f32` frames.
pub fn interleave_f32(src: &[f32], dst: &mut [f32], samples: usize, stride: usize, channels: usize) {
    for (i, frame) in dst.chunks_exact_mut(channels).take(samples).enumerate() {
        for (ch, out) in frame.iter_mut().enumerate() {
            *out = src[ch * stride + i];
        }
    }
}

/// Interleaves planar `src` into `dst` as signed 16-bit frames.
pub fn interleave_i16(src: &[f32], dst: &mut [i16], samples: usize, stride: usize, channels: usize) {
    for (i, frame) in dst.chunks_exact_mut(channels).take(samples).enumerate() {
        for (ch, out) in frame.iter_mut().enumerate() {
            *out = (src[ch * stride + i] * f32::from(i16::MAX)) as i16;
        }
    }
}
