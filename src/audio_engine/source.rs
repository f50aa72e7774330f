//! Audio source templates and the stream contract voices pull from.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::audio_engine::bus::BusInstance;
use crate::audio_engine::constants::FILTERS_PER_STREAM;
use crate::audio_engine::errors::{MixerError, Result};
use crate::audio_engine::filter::{Filter, FilterInstance};

/// Options passed to [`AudioStream::seek`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SeekFlags {
    /// The stream may refuse to move backwards.
    pub forward_only: bool,
}

/// Where a seek landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Seeked {
    /// Resulting position in samples.
    pub position: u64,
    /// The target was at or past the end; `position` is the end.
    pub end_of_stream: bool,
}

/// A decoder or generator that produces planar float samples.
///
/// `pull` writes up to `samples_to_read` samples for each channel, channel
/// `c` starting at `c * channel_stride`, and returns how many it wrote.
/// Zero means exhaustion. Implementations must not block.
pub trait AudioStream: Send {
    fn channels(&self) -> usize;

    fn sample_rate(&self) -> f32;

    fn relative_playback_speed(&self) -> f32 {
        1.0
    }

    fn pull(&mut self, buffer: &mut [f32], samples_to_read: usize, channel_stride: usize) -> usize;

    fn has_ended(&self) -> bool;

    fn can_seek(&self) -> bool;

    fn seek(&mut self, position: u64, scratch: &mut [f32], flags: SeekFlags) -> Result<Seeked>;
}

/// Playback flags a source hands to every voice it spawns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SourceFlags {
    pub looping: bool,
    /// Playing the source again stops its previous voices first.
    pub single_instance: bool,
    /// Keep pulling data while inaudible.
    pub inaudible_tick: bool,
    /// Stop the voice as soon as it becomes inaudible.
    pub inaudible_kill: bool,
    /// Keep the voice alive after its stream ends.
    pub disable_autostop: bool,
    /// Volume and speed are driven by spatial factors.
    pub process_3d: bool,
}

/// Shared configuration of a playable source.
pub struct SourceSettings {
    pub(crate) id: AtomicU32,
    pub volume: f32,
    pub flags: SourceFlags,
    pub loop_point: u64,
    pub filters: [Option<Arc<dyn Filter>>; FILTERS_PER_STREAM],
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            id: AtomicU32::new(0),
            volume: 1.0,
            flags: SourceFlags::default(),
            loop_point: 0,
            filters: Default::default(),
        }
    }
}

impl SourceSettings {
    /// Engine-assigned identifier; zero until first played.
    pub fn id(&self) -> u32 {
        self.id.load(Ordering::Relaxed)
    }

    /// Returns the source ID, taking the next one from `counter` if unset.
    pub(crate) fn ensure_id(&self, counter: &mut u32) -> u32 {
        let id = self.id();
        if id != 0 {
            return id;
        }
        let id = *counter;
        *counter = match counter.wrapping_add(1) {
            0 => 1,
            next => next,
        };
        self.id.store(id, Ordering::Relaxed);
        id
    }

    /// Sets the filter in `slot`. Applies to voices started afterwards.
    pub fn set_filter(&mut self, slot: usize, filter: Option<Arc<dyn Filter>>) -> Result<()> {
        let entry = self
            .filters
            .get_mut(slot)
            .ok_or(MixerError::InvalidParameter)?;
        *entry = filter;
        Ok(())
    }

    pub(crate) fn instantiate_filters(
        &self,
    ) -> [Option<Box<dyn FilterInstance>>; FILTERS_PER_STREAM] {
        std::array::from_fn(|i| self.filters[i].as_ref().map(|f| f.create_instance()))
    }
}

/// A template the engine can play.
pub trait AudioSource {
    fn settings(&self) -> &SourceSettings;

    /// Builds the per-voice state. Called outside the engine lock.
    fn create_instance(&self) -> Result<SourceInstance>;
}

/// What a voice plays: an external stream or a sub-mix.
pub enum SourceInstance {
    Stream(Box<dyn AudioStream>),
    Bus(BusInstance),
}

impl SourceInstance {
    pub fn channels(&self) -> usize {
        match self {
            SourceInstance::Stream(stream) => stream.channels(),
            SourceInstance::Bus(bus) => bus.channels(),
        }
    }

    /// Native rate, or zero for a bus that follows the output rate.
    pub fn sample_rate(&self) -> f32 {
        match self {
            SourceInstance::Stream(stream) => stream.sample_rate(),
            SourceInstance::Bus(bus) => bus.sample_rate(),
        }
    }

    pub fn relative_playback_speed(&self) -> f32 {
        match self {
            SourceInstance::Stream(stream) => stream.relative_playback_speed(),
            SourceInstance::Bus(_) => 1.0,
        }
    }

    pub fn has_ended(&self) -> bool {
        match self {
            SourceInstance::Stream(stream) => stream.has_ended(),
            SourceInstance::Bus(_) => false,
        }
    }

    pub fn can_seek(&self) -> bool {
        match self {
            SourceInstance::Stream(stream) => stream.can_seek(),
            SourceInstance::Bus(_) => false,
        }
    }

    pub fn seek(&mut self, position: u64, scratch: &mut [f32], flags: SeekFlags) -> Result<Seeked> {
        match self {
            SourceInstance::Stream(stream) => stream.seek(position, scratch, flags),
            SourceInstance::Bus(_) => Err(MixerError::NotImplemented),
        }
    }

    pub fn is_bus(&self) -> bool {
        matches!(self, SourceInstance::Bus(_))
    }
}
