//! Pan law and channel expansion.
//!
//! Maps a voice's planar channels onto the output layout. Supported layouts
//! are mono, stereo, quad, 5.1 and 7.1 in every combination.

use std::f32::consts::FRAC_PI_4;

use crate::audio_engine::constants::{MAX_CHANNELS, SQRT2_RECIP};

/// Gain rows indexed as `[output channel][source channel]`.
pub type ChannelMatrix = [[f32; MAX_CHANNELS]; MAX_CHANNELS];

/// Per-output-channel gains for a pan position in `[-1, 1]`.
pub fn pan_gains(pan: f32, output_channels: usize) -> [f32; MAX_CHANNELS] {
    let angle = (pan + 1.0) * FRAC_PI_4;
    let (l, r) = (angle.cos(), angle.sin());

    let mut gains = [0.0; MAX_CHANNELS];
    gains[0] = l;
    gains[1] = r;
    match output_channels {
        4 => {
            gains[2] = l;
            gains[3] = r;
        }
        6 => {
            gains[2] = SQRT2_RECIP;
            gains[3] = 1.0;
            gains[4] = l;
            gains[5] = r;
        }
        8 => {
            gains[2] = SQRT2_RECIP;
            gains[3] = 1.0;
            gains[4] = l;
            gains[5] = r;
            gains[6] = l;
            gains[7] = r;
        }
        _ => {}
    }
    gains
}

/// Per-output-channel gains for explicit left/right volumes.
pub fn absolute_pan_gains(left: f32, right: f32, output_channels: usize) -> [f32; MAX_CHANNELS] {
    let center = (left + right) * 0.5;

    let mut gains = [0.0; MAX_CHANNELS];
    gains[0] = left;
    gains[1] = right;
    match output_channels {
        4 => {
            gains[2] = left;
            gains[3] = right;
        }
        6 => {
            gains[2] = center;
            gains[3] = center;
            gains[4] = left;
            gains[5] = right;
        }
        8 => {
            gains[2] = center;
            gains[3] = center;
            gains[4] = left;
            gains[5] = right;
            gains[6] = left;
            gains[7] = right;
        }
        _ => {}
    }
    gains
}

/// Returns the fixed gain table mapping `src_channels` onto `dst_channels`.
pub fn expansion_matrix(src_channels: usize, dst_channels: usize) -> ChannelMatrix {
    let mut m = [[0.0; MAX_CHANNELS]; MAX_CHANNELS];

    if src_channels == dst_channels {
        for (c, row) in m.iter_mut().enumerate().take(dst_channels) {
            row[c] = 1.0;
        }
        return m;
    }

    // Mono output sums everything, mono input feeds every output.
    if dst_channels == 1 {
        m[0][..src_channels].fill(1.0);
        return m;
    }
    if src_channels == 1 {
        for row in m.iter_mut().take(dst_channels) {
            row[0] = 1.0;
        }
        return m;
    }

    let mut set = |out: usize, taps: &[usize], gain: f32| {
        for &tap in taps {
            m[out][tap] = gain;
        }
    };

    match (src_channels, dst_channels) {
        (4, 2) => {
            set(0, &[0, 2], 0.5);
            set(1, &[1, 3], 0.5);
        }
        (6, 2) => {
            set(0, &[0, 2, 3, 4], 0.3);
            set(1, &[1, 2, 3, 5], 0.3);
        }
        (8, 2) => {
            set(0, &[0, 2, 3, 4, 6], 0.2);
            set(1, &[1, 2, 3, 5, 7], 0.2);
        }
        (2, 4) => {
            set(0, &[0], 1.0);
            set(1, &[1], 1.0);
            set(2, &[0], 1.0);
            set(3, &[1], 1.0);
        }
        (6, 4) | (8, 4) => {
            set(0, &[0], 1.0);
            set(0, &[2, 3], 0.7);
            set(1, &[1], 1.0);
            set(1, &[2, 3], 0.7);
            if src_channels == 6 {
                set(2, &[4], 1.0);
                set(3, &[5], 1.0);
            } else {
                set(2, &[4, 6], 0.5);
                set(3, &[5, 7], 0.5);
            }
        }
        (2, 6) => {
            set(0, &[0], 1.0);
            set(1, &[1], 1.0);
            set(2, &[0, 1], 0.5);
            set(3, &[0, 1], 0.5);
            set(4, &[0], 1.0);
            set(5, &[1], 1.0);
        }
        (4, 6) => {
            set(0, &[0], 1.0);
            set(1, &[1], 1.0);
            set(2, &[0, 1], 0.5);
            set(3, &[0, 1, 2, 3], 0.25);
            set(4, &[2], 1.0);
            set(5, &[3], 1.0);
        }
        (8, 6) => {
            for c in 0..4 {
                set(c, &[c], 1.0);
            }
            set(4, &[4, 6], 0.5);
            set(5, &[5, 7], 0.5);
        }
        (2, 8) => {
            set(0, &[0], 1.0);
            set(1, &[1], 1.0);
            set(2, &[0, 1], 0.5);
            set(3, &[0, 1], 0.5);
            set(4, &[0], 1.0);
            set(5, &[1], 1.0);
            set(6, &[0], 1.0);
            set(7, &[1], 1.0);
        }
        (4, 8) => {
            set(0, &[0], 1.0);
            set(1, &[1], 1.0);
            set(2, &[0, 1], 0.5);
            set(3, &[0, 1, 2, 3], 0.25);
            set(4, &[0, 2], 0.5);
            set(5, &[1, 3], 0.5);
            set(6, &[2], 1.0);
            set(7, &[3], 1.0);
        }
        (6, 8) => {
            for c in 0..4 {
                set(c, &[c], 1.0);
            }
            set(4, &[4, 0], 0.5);
            set(5, &[5, 1], 0.5);
            set(6, &[4], 1.0);
            set(7, &[5], 1.0);
        }
        _ => {
            for c in 0..src_channels.min(dst_channels) {
                set(c, &[c], 1.0);
            }
        }
    }
    m
}

/// Pans `src` into `dst`, ramping each output channel's gain from `current`
/// to `target` across `samples`. Both buffers are planar with `stride`
/// samples per channel. On return `current` holds `target`.
#[allow(clippy::too_many_arguments)]
pub fn pan_and_expand(
    dst: &mut [f32],
    dst_channels: usize,
    src: &[f32],
    src_channels: usize,
    samples: usize,
    stride: usize,
    current: &mut [f32; MAX_CHANNELS],
    target: &[f32; MAX_CHANNELS],
) {
    if samples == 0 {
        return;
    }
    let matrix = expansion_matrix(src_channels, dst_channels);

    for (out, row) in matrix.iter().enumerate().take(dst_channels) {
        let step = (target[out] - current[out]) / samples as f32;
        let out_buf = &mut dst[out * stride..out * stride + samples];

        let mut gain = current[out];
        for (i, sample) in out_buf.iter_mut().enumerate() {
            gain += step;
            let mut acc = 0.0;
            for (tap, &weight) in row.iter().enumerate().take(src_channels) {
                if weight != 0.0 {
                    acc += src[tap * stride + i] * weight;
                }
            }
            *sample += acc * gain;
        }
        current[out] = target[out];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_center_pan_is_equal_power() {
        let gains = pan_gains(0.0, 2);
        assert!((gains[0] - SQRT2_RECIP).abs() < 1e-6);
        assert!((gains[1] - SQRT2_RECIP).abs() < 1e-6);

        let hard_left = pan_gains(-1.0, 2);
        assert!((hard_left[0] - 1.0).abs() < 1e-6);
        assert!(hard_left[1].abs() < 1e-6);
    }

    #[test]
    fn test_surround_pan_fills_center_and_lfe() {
        let gains = pan_gains(1.0, 6);
        assert!((gains[2] - SQRT2_RECIP).abs() < 1e-6);
        assert!((gains[3] - 1.0).abs() < 1e-6);
        assert!((gains[5] - 1.0).abs() < 1e-6);
        assert!(gains[4].abs() < 1e-6);
    }

    #[test]
    fn test_absolute_pan_center_is_average() {
        let gains = absolute_pan_gains(1.0, 0.5, 8);
        assert!((gains[2] - 0.75).abs() < 1e-6);
        assert!((gains[3] - 0.75).abs() < 1e-6);
        assert!((gains[7] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_every_supported_pair_has_output() {
        for src in [1, 2, 4, 6, 8] {
            for dst in [1, 2, 4, 6, 8] {
                let m = expansion_matrix(src, dst);
                for row in m.iter().take(dst) {
                    assert!(row.iter().take(src).any(|&g| g > 0.0), "{src}->{dst}");
                }
            }
        }
    }

    #[test]
    fn test_mono_to_stereo_duplicates() {
        let src = [0.5, -0.25, 0.0, 0.0];
        let mut dst = [0.0; 8];
        let mut current = [1.0; MAX_CHANNELS];
        let target = [1.0; MAX_CHANNELS];
        pan_and_expand(&mut dst, 2, &src, 1, 2, 4, &mut current, &target);

        assert_eq!(&dst[0..2], &[0.5, -0.25]);
        assert_eq!(&dst[4..6], &[0.5, -0.25]);
    }

    #[test]
    fn test_stereo_to_mono_sums() {
        let src = [0.5, 0.25, 0.125, -0.5];
        let mut dst = [0.0; 2];
        let mut current = [1.0; MAX_CHANNELS];
        let target = [1.0; MAX_CHANNELS];
        pan_and_expand(&mut dst, 1, &src, 2, 2, 2, &mut current, &target);

        assert!((dst[0] - 0.625).abs() < 1e-6);
        assert!((dst[1] - -0.25).abs() < 1e-6);
    }

    #[test]
    fn test_gain_ramps_from_current_to_target() {
        let src = [1.0; 4];
        let mut dst = [0.0; 4];
        let mut current = [0.0; MAX_CHANNELS];
        let mut target = [0.0; MAX_CHANNELS];
        target[0] = 1.0;
        pan_and_expand(&mut dst, 1, &src, 1, 4, 4, &mut current, &target);

        assert!((dst[0] - 0.25).abs() < 1e-6);
        assert!((dst[1] - 0.5).abs() < 1e-6);
        assert!((dst[2] - 0.75).abs() < 1e-6);
        assert!((dst[3] - 1.0).abs() < 1e-6);
        assert!((current[0] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_pan_accumulates_into_destination() {
        let src = [1.0, 1.0];
        let mut dst = [0.5, 0.5];
        let mut current = [0.5; MAX_CHANNELS];
        let target = [0.5; MAX_CHANNELS];
        pan_and_expand(&mut dst, 1, &src, 1, 2, 2, &mut current, &target);
        assert_eq!(dst, [1.0, 1.0]);
    }
}
