//! Per-voice playback state.
//!
//! A [`Voice`] is one playing instance of an audio source. It lives in a
//! [`VoicePool`](crate::audio_engine::voice_pool::VoicePool) slot and is
//! mutated only under the engine lock.

use crate::audio_engine::channels::{absolute_pan_gains, pan_gains};
use crate::audio_engine::constants::{FILTERS_PER_STREAM, MAX_CHANNELS};
use crate::audio_engine::fader::Fader;
use crate::audio_engine::filter::FilterInstance;
use crate::audio_engine::handle::Handle;
use crate::audio_engine::source::{SourceInstance, SourceSettings};

/// Playback flags of a live voice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VoiceFlags {
    pub looping: bool,
    /// Always kept in the active set.
    pub protected: bool,
    pub paused: bool,
    /// Overall volume is below the audibility threshold.
    pub inaudible: bool,
    /// Keep pulling data while inaudible.
    pub inaudible_tick: bool,
    /// Stop as soon as the voice becomes inaudible.
    pub inaudible_kill: bool,
    pub disable_autostop: bool,
    pub process_3d: bool,
}

/// Volume and speed multipliers supplied by an external 3D stage.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpatialFactors {
    pub volume: f32,
    pub doppler: f32,
}

impl Default for SpatialFactors {
    fn default() -> Self {
        Self {
            volume: 1.0,
            doppler: 1.0,
        }
    }
}

/// A single voice in the pool, representing one playing source instance.
pub struct Voice {
    /// The stream or bus this voice plays.
    pub instance: SourceInstance,

    /// ID of the source that spawned this voice.
    pub source_id: u32,

    /// Generation the voice's handle was issued with.
    pub generation: u32,

    pub flags: VoiceFlags,

    /// Channel count of the instance.
    pub channels: usize,

    /// Native rate of the instance, before speed changes.
    pub base_sample_rate: f32,

    /// Effective rate: `base_sample_rate * overall_speed`.
    pub sample_rate: f32,

    pub set_volume: f32,
    pub overall_volume: f32,
    pub pan: f32,

    /// Target gain per output channel, before `overall_volume`.
    pub channel_volume: [f32; MAX_CHANNELS],

    /// Gain per output channel reached at the end of the last mix.
    pub current_channel_volume: [f32; MAX_CHANNELS],

    pub set_speed: f32,
    pub overall_speed: f32,

    pub spatial: SpatialFactors,

    /// Seconds this voice has been playing, unpaused.
    pub stream_time: f64,

    /// Samples consumed from the stream, scaled by speed.
    pub stream_position: u64,

    /// Bus this voice mixes into; `None` is the root.
    pub bus: Option<Handle>,

    pub loop_point: u64,
    pub loop_count: u32,

    /// Fixed-point read position inside the current resample block.
    pub src_offset: u64,

    /// Output samples the current block can still produce.
    pub leftover: usize,

    /// Output samples to wait before starting.
    pub delay: usize,

    pub filters: [Option<Box<dyn FilterInstance>>; FILTERS_PER_STREAM],

    /// Index of the resample buffer pair owned by this voice.
    pub resample_pair: Option<usize>,

    /// Which buffer of the pair holds the current block.
    pub resample_front: usize,

    pub volume_fader: Fader,
    pub pan_fader: Fader,
    pub speed_fader: Fader,
    pub pause_scheduler: Fader,
    pub stop_scheduler: Fader,
}

impl Voice {
    /// Builds a voice for `instance` using the defaults in `settings`.
    pub fn new(
        instance: SourceInstance,
        settings: &SourceSettings,
        filters: [Option<Box<dyn FilterInstance>>; FILTERS_PER_STREAM],
    ) -> Self {
        let channels = instance.channels();
        let base_sample_rate = instance.sample_rate();
        let is_bus = instance.is_bus();
        let flags = VoiceFlags {
            looping: settings.flags.looping,
            protected: is_bus,
            inaudible_tick: settings.flags.inaudible_tick || is_bus,
            inaudible_kill: settings.flags.inaudible_kill,
            disable_autostop: settings.flags.disable_autostop,
            process_3d: settings.flags.process_3d,
            ..VoiceFlags::default()
        };

        Self {
            instance,
            source_id: 0,
            generation: 0,
            flags,
            channels,
            base_sample_rate,
            sample_rate: base_sample_rate,
            set_volume: settings.volume,
            overall_volume: settings.volume,
            pan: 0.0,
            channel_volume: [1.0; MAX_CHANNELS],
            current_channel_volume: [0.0; MAX_CHANNELS],
            set_speed: 1.0,
            overall_speed: 1.0,
            spatial: SpatialFactors::default(),
            stream_time: 0.0,
            stream_position: 0,
            bus: None,
            loop_point: settings.loop_point,
            loop_count: 0,
            src_offset: 0,
            leftover: 0,
            delay: 0,
            filters,
            resample_pair: None,
            resample_front: 0,
            volume_fader: Fader::default(),
            pan_fader: Fader::default(),
            speed_fader: Fader::default(),
            pause_scheduler: Fader::default(),
            stop_scheduler: Fader::default(),
        }
    }

    /// Recomputes `overall_volume` from the set volume and the 3D factor.
    pub fn update_volume(&mut self) {
        self.overall_volume = self.set_volume * self.spatial.volume;
        if self.flags.paused {
            self.prime_channel_volume();
        }
    }

    /// Recomputes `overall_speed` and the effective sample rate.
    pub fn update_speed(&mut self) {
        self.overall_speed = self.spatial.doppler * self.set_speed;
        self.sample_rate = self.base_sample_rate * self.overall_speed;
    }

    pub fn set_pan(&mut self, pan: f32, output_channels: usize) {
        self.pan = pan;
        let gains = pan_gains(pan, output_channels);
        let n = output_channels.clamp(2, MAX_CHANNELS);
        self.channel_volume[..n].copy_from_slice(&gains[..n]);
    }

    pub fn set_pan_absolute(&mut self, left: f32, right: f32, output_channels: usize) {
        let gains = absolute_pan_gains(left, right, output_channels);
        let n = output_channels.clamp(2, MAX_CHANNELS);
        self.channel_volume[..n].copy_from_slice(&gains[..n]);
    }

    /// Jumps the ramped gains to their targets so the next mix does not fade.
    pub fn prime_channel_volume(&mut self) {
        for (current, &target) in self
            .current_channel_volume
            .iter_mut()
            .zip(&self.channel_volume)
        {
            *current = target * self.overall_volume;
        }
    }

    /// Swaps the ping-pong resample buffers.
    pub fn swap_resample_buffers(&mut self) {
        self.resample_front ^= 1;
    }

    /// Buffer indices `(current, previous)` in the engine's resample pool.
    pub fn resample_buffers(&self) -> Option<(usize, usize)> {
        self.resample_pair
            .map(|pair| (pair * 2 + self.resample_front, pair * 2 + (self.resample_front ^ 1)))
    }

    /// Protected and ticking voices are always kept in the active set.
    pub fn must_live(&self) -> bool {
        self.flags.protected || self.flags.inaudible_tick
    }

    /// Whether this voice competes for the active set at all.
    pub fn is_candidate(&self) -> bool {
        (!self.flags.inaudible && !self.flags.paused) || self.flags.inaudible_tick
    }

    pub fn has_ended(&self) -> bool {
        self.instance.has_ended()
    }

    /// A finished, non-looping, auto-stopping voice should be removed.
    pub fn should_autostop(&self) -> bool {
        !self.flags.looping && !self.flags.disable_autostop && self.has_ended()
    }
}
