//! Mixer limits and defaults.

/// Hard cap on the number of voices that can exist at once.
pub const VOICE_COUNT: usize = 1024;

/// Maximum number of channels a source or the output can have.
pub const MAX_CHANNELS: usize = 8;

/// Number of filter slots per voice and on the global chain.
pub const FILTERS_PER_STREAM: usize = 8;

/// Source block size used by the resampler, in samples per channel.
pub const SAMPLE_GRANULARITY: usize = 512;

/// Fractional bits of the fixed-point resample phase.
pub const FIXPOINT_FRAC_BITS: u32 = 20;

/// `1 << FIXPOINT_FRAC_BITS`.
pub const FIXPOINT_FRAC_MUL: u64 = 1 << FIXPOINT_FRAC_BITS;

/// Mask of the fractional part of the resample phase.
pub const FIXPOINT_FRAC_MASK: u64 = FIXPOINT_FRAC_MUL - 1;

/// Resample steps above this overflow the 32-bit fixed-point phase and are
/// silenced.
pub const MAX_RESAMPLE_STEP: f64 = (1u64 << (32 - FIXPOINT_FRAC_BITS)) as f64;

/// Default number of voices processed per mix cycle.
pub const DEFAULT_MAX_ACTIVE_VOICES: usize = 16;

/// Default scaler applied after clipping.
pub const DEFAULT_POST_CLIP_SCALER: f32 = 0.95;

/// Minimum size of the mix scratch buffers, in samples per channel.
pub const MIN_SCRATCH_SIZE: usize = 4096;

/// Overall volume under which a voice is treated as inaudible.
pub const INAUDIBLE_THRESHOLD: f32 = 0.01;

/// Deepest bus nesting that is still mixed.
pub const MAX_BUS_DEPTH: usize = 16;

/// Number of samples in a visualization wave snapshot.
pub const VISUALIZATION_WAVE_SIZE: usize = 256;

/// `1 / sqrt(2)`, the center-channel gain of the pan law.
pub const SQRT2_RECIP: f32 = std::f32::consts::FRAC_1_SQRT_2;

/// Channel counts a source or the output may use.
pub const SUPPORTED_CHANNEL_COUNTS: [usize; 5] = [1, 2, 4, 6, 8];

/// Returns `true` if `channels` is one of [`SUPPORTED_CHANNEL_COUNTS`].
pub fn is_supported_channel_count(channels: usize) -> bool {
    SUPPORTED_CHANNEL_COUNTS.contains(&channels)
}
