//! Block resampling kernels.
//!
//! Every kernel reads from the current source block `src` and, for lookback
//! across the block boundary, from the tail of the previous block `prev`.
//! `src_offset` is the fixed-point read position within `src` and `step` the
//! fixed-point increment per output sample.

use crate::audio_engine::constants::{FIXPOINT_FRAC_BITS, FIXPOINT_FRAC_MASK, FIXPOINT_FRAC_MUL};

/// Interpolation used when converting a voice to the destination rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Resampler {
    /// Nearest earlier sample.
    Point,
    /// Linear interpolation against the previous sample.
    #[default]
    Linear,
    /// Four-point Catmull-Rom spline.
    CatmullRom,
}

impl Resampler {
    /// Resamples `dst.len()` samples of one channel.
    pub fn process(self, src: &[f32], prev: &[f32], dst: &mut [f32], src_offset: u64, step: u64) {
        match self {
            Resampler::Point => resample_point(src, dst, src_offset, step),
            Resampler::Linear => resample_linear(src, prev, dst, src_offset, step),
            Resampler::CatmullRom => resample_catmullrom(src, prev, dst, src_offset, step),
        }
    }
}

pub fn resample_point(src: &[f32], dst: &mut [f32], src_offset: u64, step: u64) {
    let mut pos = src_offset;
    for out in dst.iter_mut() {
        let p = (pos >> FIXPOINT_FRAC_BITS) as usize;
        *out = src[p];
        pos += step;
    }
}

pub fn resample_linear(src: &[f32], prev: &[f32], dst: &mut [f32], src_offset: u64, step: u64) {
    let scale = 1.0 / FIXPOINT_FRAC_MUL as f32;
    let mut pos = src_offset;
    for out in dst.iter_mut() {
        let p = (pos >> FIXPOINT_FRAC_BITS) as usize;
        let f = (pos & FIXPOINT_FRAC_MASK) as f32 * scale;
        let s1 = if p == 0 { prev[prev.len() - 1] } else { src[p - 1] };
        let s2 = src[p];
        *out = s1 + (s2 - s1) * f;
        pos += step;
    }
}

pub fn resample_catmullrom(src: &[f32], prev: &[f32], dst: &mut [f32], src_offset: u64, step: u64) {
    let scale = 1.0 / FIXPOINT_FRAC_MUL as f32;
    let back = |p: usize, k: usize| {
        if p < k {
            prev[prev.len() + p - k]
        } else {
            src[p - k]
        }
    };

    let mut pos = src_offset;
    for out in dst.iter_mut() {
        let p = (pos >> FIXPOINT_FRAC_BITS) as usize;
        let f = (pos & FIXPOINT_FRAC_MASK) as f32 * scale;
        *out = catmullrom(f, back(p, 3), back(p, 2), back(p, 1), src[p]);
        pos += step;
    }
}

fn catmullrom(t: f32, p0: f32, p1: f32, p2: f32, p3: f32) -> f32 {
    0.5 * ((2.0 * p1)
        + (-p0 + p2) * t
        + (2.0 * p0 - 5.0 * p1 + 4.0 * p2 - p3) * t * t
        + (-p0 + 3.0 * p1 - 3.0 * p2 + p3) * t * t * t)
}
