//! Sub-mix buses.
//!
//! A [`Bus`] is a playable source whose voice mixes every voice routed to it.
//! Buses find their own live voice by scanning the engine's pool, so they
//! hold no reference into the engine.

use std::sync::{Arc, Mutex, PoisonError};

use crate::audio_engine::Engine;
use crate::audio_engine::constants::{
    MAX_CHANNELS, SAMPLE_GRANULARITY, VISUALIZATION_WAVE_SIZE, is_supported_channel_count,
};
use crate::audio_engine::errors::{MixerError, Result};
use crate::audio_engine::filter::Filter;
use crate::audio_engine::handle::Handle;
use crate::audio_engine::mixer::EngineState;
use crate::audio_engine::resampler::Resampler;
use crate::audio_engine::source::{AudioSource, SourceInstance, SourceSettings};
use crate::audio_engine::visualization::Visualization;
use crate::audio_engine::voice::SpatialFactors;

/// Identity shared by a bus and the instances it spawns.
#[derive(Debug)]
struct BusIdentity;

/// Live state of a playing bus, owned by its voice.
pub struct BusInstance {
    identity: Arc<BusIdentity>,
    pub(crate) channels: usize,
    pub(crate) resampler: Resampler,
    pub(crate) visualization_enabled: bool,
    pub(crate) visualization: Visualization,
    /// Resample scratch for the voices routed into this bus.
    pub(crate) scratch: Vec<f32>,
}

impl BusInstance {
    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Zero: buses run at the engine's output rate.
    pub fn sample_rate(&self) -> f32 {
        0.0
    }

    fn belongs_to(&self, bus: &Bus) -> bool {
        Arc::ptr_eq(&self.identity, &bus.identity)
    }
}

/// A sub-mix that is both playable and a routing target.
pub struct Bus {
    settings: SourceSettings,
    identity: Arc<BusIdentity>,
    channels: usize,
    resampler: Resampler,
    visualization: bool,
    cached_handle: Mutex<Handle>,
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

impl Bus {
    /// Creates a stereo bus.
    pub fn new() -> Self {
        let mut settings = SourceSettings::default();
        settings.flags.single_instance = true;
        settings.flags.inaudible_tick = true;
        Self {
            settings,
            identity: Arc::new(BusIdentity),
            channels: 2,
            resampler: Resampler::default(),
            visualization: false,
            cached_handle: Mutex::new(Handle::INVALID),
        }
    }

    pub fn settings_mut(&mut self) -> &mut SourceSettings {
        &mut self.settings
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Sets the channel count used by future instances. Only 1, 2, 4, 6 and
    /// 8 are accepted.
    pub fn set_channels(&mut self, channels: usize) -> Result<()> {
        if !is_supported_channel_count(channels) {
            return Err(MixerError::InvalidParameter);
        }
        self.channels = channels;
        Ok(())
    }

    /// Sets the resampler for voices routed to this bus, including the live
    /// instance.
    pub fn set_resampler(&mut self, engine: &Engine, resampler: Resampler) {
        self.resampler = resampler;
        self.with_instance(engine, |bus| bus.resampler = resampler);
    }

    pub fn resampler(&self) -> Resampler {
        self.resampler
    }

    pub fn set_visualization_enable(&mut self, engine: &Engine, enable: bool) {
        self.visualization = enable;
        self.with_instance(engine, |bus| bus.visualization_enabled = enable);
    }

    /// Sets a filter on the bus output. The live instance gets a fresh
    /// filter instance as well.
    pub fn set_filter(
        &mut self,
        engine: &Engine,
        slot: usize,
        filter: Option<Arc<dyn Filter>>,
    ) -> Result<()> {
        let instance = filter.as_ref().map(|f| f.create_instance());
        self.settings.set_filter(slot, filter)?;

        let mut state = engine.lock();
        if let Some(handle) = self.find_handle(&state)
            && let Some(voice) = state.voices.get_mut(handle)
        {
            voice.filters[slot] = instance;
        }
        Ok(())
    }

    /// Handle of this bus's live voice, or [`Handle::INVALID`].
    pub fn handle(&self, engine: &Engine) -> Handle {
        self.find_handle(&engine.lock()).unwrap_or(Handle::INVALID)
    }

    /// Plays `source` into this bus. Returns an invalid handle if the bus
    /// itself is not playing.
    pub fn play(
        &self,
        engine: &Engine,
        source: &dyn AudioSource,
        volume: Option<f32>,
        pan: f32,
        paused: bool,
    ) -> Handle {
        match self.bus_handle(engine) {
            Some(bus) => engine.play(source, volume, pan, paused, Some(bus)),
            None => Handle::INVALID,
        }
    }

    pub fn play_clocked(
        &self,
        engine: &Engine,
        time: f64,
        source: &dyn AudioSource,
        volume: Option<f32>,
        pan: f32,
    ) -> Handle {
        match self.bus_handle(engine) {
            Some(bus) => engine.play_clocked(time, source, volume, pan, Some(bus)),
            None => Handle::INVALID,
        }
    }

    pub fn play_3d(
        &self,
        engine: &Engine,
        source: &dyn AudioSource,
        spatial: SpatialFactors,
        volume: Option<f32>,
        paused: bool,
    ) -> Handle {
        match self.bus_handle(engine) {
            Some(bus) => engine.play_3d(source, spatial, volume, paused, Some(bus)),
            None => Handle::INVALID,
        }
    }

    /// Moves a live voice (or every voice of a group) into this bus.
    ///
    /// Fails if the bus is not playing, or if the move would route a bus
    /// into itself or one of its descendants.
    pub fn annex_sound(&self, engine: &Engine, handle: Handle) -> Result<()> {
        let mut state = engine.lock();
        let bus = self.find_handle(&state).ok_or(MixerError::InvalidParameter)?;

        let mut result = Ok(());
        state.for_each_slot(handle, |state, slot| {
            let voice_handle = state.voices.handle_of(slot);
            if state.routes_through(bus, voice_handle) {
                log::warn!("refusing to route bus voice {voice_handle:?} into its own sub-mix");
                result = Err(MixerError::InvalidParameter);
                return;
            }
            if let Some(voice) = state.voices.slot_mut(slot) {
                voice.bus = Some(bus);
            }
        });
        result
    }

    /// Number of active voices routed directly into this bus.
    pub fn get_active_voice_count(&self, engine: &Engine) -> usize {
        let state = engine.lock();
        let Some(bus) = self.find_handle(&state) else {
            return 0;
        };
        state
            .active
            .iter()
            .filter(|&&slot| state.voices.slot(slot).is_some_and(|v| v.bus == Some(bus)))
            .count()
    }

    pub fn get_wave(&self, engine: &Engine) -> [f32; VISUALIZATION_WAVE_SIZE] {
        self.snapshot(engine).wave
    }

    pub fn calc_fft(&self, engine: &Engine) -> [f32; VISUALIZATION_WAVE_SIZE] {
        self.snapshot(engine).spectrum()
    }

    pub fn get_approximate_volume(&self, engine: &Engine, channel: usize) -> f32 {
        self.snapshot(engine)
            .channel_volume
            .get(channel)
            .copied()
            .unwrap_or(0.0)
    }

    pub fn get_approximate_volumes(&self, engine: &Engine) -> [f32; MAX_CHANNELS] {
        self.snapshot(engine).channel_volume
    }

    fn snapshot(&self, engine: &Engine) -> Visualization {
        let mut snapshot = Visualization::default();
        self.with_instance(engine, |bus| snapshot = bus.visualization);
        snapshot
    }

    fn bus_handle(&self, engine: &Engine) -> Option<Handle> {
        self.find_handle(&engine.lock())
    }

    fn with_instance(&self, engine: &Engine, f: impl FnOnce(&mut BusInstance)) {
        let mut state = engine.lock();
        if let Some(handle) = self.find_handle(&state)
            && let Some(voice) = state.voices.get_mut(handle)
            && let SourceInstance::Bus(bus) = &mut voice.instance
        {
            f(bus);
        }
    }

    /// Returns the cached handle if it still names this bus's voice,
    /// otherwise scans the pool and refreshes the cache.
    fn find_handle(&self, state: &EngineState) -> Option<Handle> {
        let mut cached = self
            .cached_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let owns = |handle: Handle| {
            state
                .voices
                .get(handle)
                .is_some_and(|voice| matches!(&voice.instance, SourceInstance::Bus(b) if b.belongs_to(self)))
        };
        if owns(*cached) {
            return Some(*cached);
        }

        let found = state.voices.iter().find_map(|(slot, voice)| match &voice.instance {
            SourceInstance::Bus(b) if b.belongs_to(self) => Some(Handle::voice(slot, voice.generation)),
            _ => None,
        });
        *cached = found.unwrap_or(Handle::INVALID);
        found
    }
}

impl AudioSource for Bus {
    fn settings(&self) -> &SourceSettings {
        &self.settings
    }

    fn create_instance(&self) -> Result<SourceInstance> {
        Ok(SourceInstance::Bus(BusInstance {
            identity: Arc::clone(&self.identity),
            channels: self.channels,
            resampler: self.resampler,
            visualization_enabled: self.visualization,
            visualization: Visualization::default(),
            scratch: vec![0.0; SAMPLE_GRANULARITY * MAX_CHANNELS],
        }))
    }
}
