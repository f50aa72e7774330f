//! Audio Engine Module
//!
//! Real-time voice mixing. The module is organized into sub-modules, each
//! with a specific responsibility:
//!
//! - [`backend`]: audio device backends and logger setup
//! - [`constants`]: limits and defaults
//! - [`errors`]: status and decode error types
//! - [`source`]: the audio source and stream contracts
//! - [`sample_loader`]: in-memory samples decoded from audio files
//! - [`bus`]: sub-mix buses
//! - [`filter`] / [`eq3`]: the filter contract and a reference EQ
//! - `mixer`: engine state and the mix cycle
//!
//! [`Engine`] is the entry point. Control threads call it to start, stop and
//! shape voices; a backend calls [`Engine::mix`] once per hardware period.

use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::audio_engine::constants::{
    DEFAULT_MAX_ACTIVE_VOICES, MAX_CHANNELS, VISUALIZATION_WAVE_SIZE, VOICE_COUNT,
    is_supported_channel_count,
};
use crate::audio_engine::errors::{MixerError, Result};
use crate::audio_engine::handle::Handle;
use crate::audio_engine::mixer::EngineState;
use crate::audio_engine::resampler::Resampler;
use crate::audio_engine::source::AudioSource;
use crate::audio_engine::voice::Voice;

pub mod backend;
pub mod bus;
pub mod channels;
pub mod clipper;
pub mod constants;
pub mod eq3;
pub mod errors;
pub mod fader;
pub mod filter;
pub mod handle;
mod mixer;
pub mod resampler;
pub mod sample_loader;
pub mod source;
pub mod visualization;
mod voice;
mod voice_ops;
mod voice_pool;

pub use voice::{SpatialFactors, VoiceFlags};

/// Engine-wide behavior switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineFlags {
    /// Soft-clip the output instead of clamping it.
    pub clip_roundoff: bool,
    /// Capture a wave snapshot of every mixed buffer.
    pub visualization: bool,
}

impl Default for EngineFlags {
    fn default() -> Self {
        Self {
            clip_roundoff: true,
            visualization: false,
        }
    }
}

/// Construction-time settings of an [`Engine`].
#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    pub flags: EngineFlags,
    pub resampler: Resampler,
    /// Voices processed per mix cycle.
    pub max_active_voices: usize,
    /// Size of the voice pool, at most [`VOICE_COUNT`].
    pub voice_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            flags: EngineFlags::default(),
            resampler: Resampler::default(),
            max_active_voices: DEFAULT_MAX_ACTIVE_VOICES,
            voice_capacity: VOICE_COUNT,
        }
    }
}

/// The mixer. Share it as `Arc<Engine>` between control threads and the
/// backend callback.
pub struct Engine {
    state: Mutex<EngineState>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        let voice_capacity = config.voice_capacity.clamp(1, VOICE_COUNT);
        let config = EngineConfig {
            voice_capacity,
            max_active_voices: config.max_active_voices.clamp(1, VOICE_COUNT),
            ..config
        };
        Engine {
            state: Mutex::new(EngineState::new(&config)),
        }
    }

    /// Locks the engine state. A poisoned lock is recovered so the audio
    /// callback never panics on it.
    pub(crate) fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Called by a backend once the output format is known.
    pub fn postinit(&self, sample_rate: u32, buffer_size: usize, channels: usize) -> Result<()> {
        if sample_rate == 0 || buffer_size == 0 || !is_supported_channel_count(channels) {
            return Err(MixerError::InvalidParameter);
        }
        self.lock()
            .configure_output(sample_rate, buffer_size, channels);
        log::info!(
            "Mixer ready ({} ch@{} Hz, {} frame buffer)",
            channels,
            sample_rate,
            buffer_size
        );
        Ok(())
    }

    /// Registers the callback [`Engine::deinit`] runs to tear the backend down.
    pub fn set_backend_cleanup(&self, cleanup: impl FnOnce() + Send + 'static) {
        self.lock().backend_cleanup = Some(Box::new(cleanup));
    }

    /// Stops every voice and runs the backend teardown once.
    pub fn deinit(&self) {
        let cleanup = {
            let mut state = self.lock();
            for slot in 0..state.voices.highest() {
                state.stop_voice(slot);
            }
            state.initialized = false;
            state.backend_cleanup.take()
        };
        if let Some(cleanup) = cleanup {
            cleanup();
        }
        log::info!("Mixer shut down");
    }

    /// Starts a voice of `source` and returns its handle.
    ///
    /// `volume` of `None` (or negative) uses the source's default. `bus` of
    /// `None` mixes into the output directly. Returns [`Handle::INVALID`] when
    /// the pool is full or the source fails to instantiate.
    pub fn play(
        &self,
        source: &dyn AudioSource,
        volume: Option<f32>,
        pan: f32,
        paused: bool,
        bus: Option<Handle>,
    ) -> Handle {
        let settings = source.settings();
        if settings.flags.single_instance {
            self.stop_audio_source(source);
        }
        if self.lock().voices.find_free().is_none() {
            log::debug!("play rejected: voice pool is full");
            return Handle::INVALID;
        }

        let instance = match source.create_instance() {
            Ok(instance) => instance,
            Err(err) => {
                log::warn!("play rejected: {err}");
                return Handle::INVALID;
            }
        };
        let channels = instance.channels();
        if channels == 0 || channels > MAX_CHANNELS {
            log::warn!("play rejected: {} ({channels} channels)", MixerError::InvalidParameter);
            return Handle::INVALID;
        }
        let mut pending = Some(Voice::new(instance, settings, settings.instantiate_filters()));

        let handle = self
            .lock()
            .publish_voice(&mut pending, settings, volume, pan, paused, bus);
        if pending.is_some() {
            log::debug!("play rejected: voice pool is full");
        }
        handle
    }

    /// Plays `source` sample-accurately at `time` seconds of stream time,
    /// relative to the first clocked play of the current buffer.
    pub fn play_clocked(
        &self,
        time: f64,
        source: &dyn AudioSource,
        volume: Option<f32>,
        pan: f32,
        bus: Option<Handle>,
    ) -> Handle {
        let handle = self.play(source, volume, pan, true, bus);
        let mut state = self.lock();
        let Some(slot) = state.voices.resolve(handle) else {
            return handle;
        };

        if state.last_clocked_time == 0.0 {
            state.last_clocked_time = time;
        }
        let delay = ((time - state.last_clocked_time) * f64::from(state.sample_rate)).floor();
        let delay = (delay.max(0.0) as usize).min(state.buffer_size);
        if let Some(voice) = state.voices.slot_mut(slot) {
            voice.delay = delay;
        }
        state.set_voice_pause(slot, false);
        handle
    }

    /// Plays `source` at full volume on every output channel.
    pub fn play_background(
        &self,
        source: &dyn AudioSource,
        volume: Option<f32>,
        paused: bool,
        bus: Option<Handle>,
    ) -> Handle {
        let handle = self.play(source, volume, 0.0, true, bus);
        let mut state = self.lock();
        let channels = state.channels;
        let Some(slot) = state.voices.resolve(handle) else {
            return handle;
        };
        if let Some(voice) = state.voices.slot_mut(slot) {
            voice.set_pan_absolute(1.0, 1.0, channels);
            voice.prime_channel_volume();
        }
        state.set_voice_pause(slot, paused);
        handle
    }

    /// Plays `source` with its volume and speed driven by `spatial`.
    pub fn play_3d(
        &self,
        source: &dyn AudioSource,
        spatial: SpatialFactors,
        volume: Option<f32>,
        paused: bool,
        bus: Option<Handle>,
    ) -> Handle {
        let handle = self.play(source, volume, 0.0, true, bus);
        let mut state = self.lock();
        let Some(slot) = state.voices.resolve(handle) else {
            return handle;
        };
        if let Some(voice) = state.voices.slot_mut(slot) {
            voice.flags.process_3d = true;
        }
        state.set_spatial(slot, spatial);
        if state.voices.resolve(handle).is_some() {
            state.set_voice_pause(slot, paused);
        }
        handle
    }

    /// Stops a voice or every voice of a group.
    pub fn stop(&self, handle: Handle) {
        self.lock()
            .for_each_slot(handle, |state, slot| state.stop_voice(slot));
    }

    /// Stops every voice spawned from `source`.
    pub fn stop_audio_source(&self, source: &dyn AudioSource) {
        let id = source.settings().id();
        self.lock().stop_source(id);
    }

    pub fn stop_all(&self) {
        let mut state = self.lock();
        for slot in 0..state.voices.highest() {
            state.stop_voice(slot);
        }
    }

    /// Number of live voices spawned from `source`.
    pub fn count_audio_source(&self, source: &dyn AudioSource) -> usize {
        let id = source.settings().id();
        if id == 0 {
            return 0;
        }
        self.lock()
            .voices
            .iter()
            .filter(|(_, voice)| voice.source_id == id)
            .count()
    }

    /// Seeks a voice (or each member of a group) to `position` frames.
    ///
    /// A stream that cannot reach the position returns the error but keeps
    /// playing. For groups the last failure is reported.
    pub fn seek(&self, handle: Handle, position: u64) -> Result<()> {
        let mut result = Ok(());
        self.lock().for_each_slot(handle, |state, slot| {
            if let Err(err) = state.seek_voice(slot, position) {
                result = Err(err);
            }
        });
        result
    }

    pub fn is_valid_voice_handle(&self, handle: Handle) -> bool {
        let state = self.lock();
        if handle.is_group() {
            state.groups.is_group(handle)
        } else {
            state.voices.resolve(handle).is_some()
        }
    }

    /// Voices selected for processing, recomputing the selection if needed.
    pub fn get_active_voice_count(&self) -> usize {
        let mut state = self.lock();
        if state.active_dirty {
            state.calc_active_voices();
        }
        state.active.len()
    }

    pub fn get_voice_count(&self) -> usize {
        self.lock().voices.count()
    }

    pub fn get_max_active_voice_count(&self) -> usize {
        self.lock().max_active
    }

    pub fn get_backend_samplerate(&self) -> u32 {
        self.lock().sample_rate
    }

    pub fn get_backend_buffer_size(&self) -> usize {
        self.lock().buffer_size
    }

    pub fn get_backend_channels(&self) -> usize {
        self.lock().channels
    }

    /// Seconds of audio mixed since `postinit`.
    pub fn get_stream_time(&self) -> f64 {
        self.lock().stream_time
    }

    /// Mixes `samples` interleaved frames into `buffer`.
    pub fn mix(&self, buffer: &mut [f32], samples: usize) {
        self.lock().mix_f32(buffer, samples);
    }

    /// Mixes `samples` interleaved frames into `buffer` as 16-bit PCM.
    pub fn mix_signed16(&self, buffer: &mut [i16], samples: usize) {
        self.lock().mix_i16(buffer, samples);
    }

    /// Downmixed wave of the last output buffer. Needs visualization enabled.
    pub fn get_wave(&self) -> [f32; VISUALIZATION_WAVE_SIZE] {
        self.lock().visualization.wave
    }

    /// Magnitude spectrum of [`Engine::get_wave`].
    pub fn calc_fft(&self) -> [f32; VISUALIZATION_WAVE_SIZE] {
        let visualization = self.lock().visualization;
        visualization.spectrum()
    }

    /// Peak level of `channel` in the last output buffer.
    pub fn get_approximate_volume(&self, channel: usize) -> f32 {
        if channel >= MAX_CHANNELS {
            return 0.0;
        }
        self.lock().visualization.channel_volume[channel]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio_engine::sample_loader::Sample;
    use crate::audio_engine::source::SourceFlags;

    fn engine_with_capacity(voice_capacity: usize) -> Engine {
        let engine = Engine::new(EngineConfig {
            voice_capacity,
            ..EngineConfig::default()
        });
        engine.postinit(44_100, 512, 2).unwrap();
        engine
    }

    fn tone(frames: usize) -> Sample {
        Sample::from_planar(vec![0.5; frames], 1, 44_100.0).unwrap()
    }

    #[test]
    fn test_postinit_rejects_bad_format() {
        let engine = Engine::new(EngineConfig::default());
        assert_eq!(engine.postinit(0, 512, 2), Err(MixerError::InvalidParameter));
        assert_eq!(engine.postinit(44_100, 512, 3), Err(MixerError::InvalidParameter));
        assert!(engine.postinit(44_100, 512, 6).is_ok());
        assert_eq!(engine.get_backend_channels(), 6);
    }

    #[test]
    fn test_stale_handle_is_rejected_after_slot_reuse() {
        let engine = engine_with_capacity(1);
        let sample = tone(44_100);
        let first = engine.play(&sample, None, 0.0, false, None);
        engine.stop(first);

        let second = engine.play(&sample, None, 0.0, false, None);
        assert!(engine.is_valid_voice_handle(second));
        assert!(!engine.is_valid_voice_handle(first));
        assert_ne!(first, second);

        engine.set_volume(first, 0.1);
        assert!((engine.get_volume(second) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_play_returns_invalid_when_pool_is_full() {
        let engine = engine_with_capacity(2);
        let sample = tone(44_100);
        assert!(engine.play(&sample, None, 0.0, false, None).is_valid());
        assert!(engine.play(&sample, None, 0.0, false, None).is_valid());
        assert_eq!(engine.play(&sample, None, 0.0, false, None), Handle::INVALID);
        assert_eq!(engine.get_voice_count(), 2);
    }

    #[test]
    fn test_single_instance_source_replaces_its_voice() {
        let engine = engine_with_capacity(8);
        let mut sample = tone(44_100);
        sample.settings_mut().flags = SourceFlags {
            single_instance: true,
            ..SourceFlags::default()
        };
        let first = engine.play(&sample, None, 0.0, false, None);
        let second = engine.play(&sample, None, 0.0, false, None);

        assert!(!engine.is_valid_voice_handle(first));
        assert!(engine.is_valid_voice_handle(second));
        assert_eq!(engine.count_audio_source(&sample), 1);
    }

    #[test]
    fn test_stop_audio_source_and_stop_all() {
        let engine = engine_with_capacity(8);
        let a = tone(44_100);
        let b = tone(44_100);
        engine.play(&a, None, 0.0, false, None);
        engine.play(&a, None, 0.0, false, None);
        engine.play(&b, None, 0.0, false, None);

        engine.stop_audio_source(&a);
        assert_eq!(engine.count_audio_source(&a), 0);
        assert_eq!(engine.count_audio_source(&b), 1);

        engine.stop_all();
        assert_eq!(engine.get_voice_count(), 0);
    }

    #[test]
    fn test_clocked_plays_are_delayed_relative_to_first() {
        let engine = engine_with_capacity(8);
        let sample = tone(44_100);
        let first = engine.play_clocked(1.0, &sample, None, 0.0, None);
        let second = engine.play_clocked(1.001, &sample, None, 0.0, None);
        let late = engine.play_clocked(5.0, &sample, None, 0.0, None);

        let state = engine.lock();
        assert_eq!(state.voices.get(first).unwrap().delay, 0);
        assert_eq!(state.voices.get(second).unwrap().delay, 44);
        assert_eq!(state.voices.get(late).unwrap().delay, 512);
        assert!(!state.voices.get(second).unwrap().flags.paused);
    }

    #[test]
    fn test_clocked_reference_resets_each_cycle() {
        let engine = engine_with_capacity(8);
        let sample = tone(44_100);
        engine.play_clocked(1.0, &sample, None, 0.0, None);
        engine.mix(&mut vec![0.0; 1024], 512);

        let handle = engine.play_clocked(2.0, &sample, None, 0.0, None);
        assert_eq!(engine.lock().voices.get(handle).unwrap().delay, 0);
    }

    #[test]
    fn test_seek_past_end_reports_end_of_stream_and_keeps_voice() {
        let engine = engine_with_capacity(8);
        let sample = tone(1000);
        let handle = engine.play(&sample, None, 0.0, false, None);

        assert!(engine.seek(handle, 500).is_ok());
        assert_eq!(engine.get_stream_position(handle), 500);
        assert_eq!(engine.seek(handle, 5000), Err(MixerError::EndOfStream));
        assert!(engine.is_valid_voice_handle(handle));
    }

    #[test]
    fn test_seek_failure_keeps_voice() {
        let engine = engine_with_capacity(8);
        let bus = crate::audio_engine::bus::Bus::new();
        let handle = engine.play(&bus, None, 0.0, false, None);
        assert_eq!(engine.seek(handle, 10), Err(MixerError::NotImplemented));
        assert!(engine.is_valid_voice_handle(handle));
    }

    #[test]
    fn test_mix_signed16_scales_to_full_range() {
        let engine = engine_with_capacity(8);
        let sample = tone(44_100);
        engine.set_post_clip_scaler(1.0);
        engine.play_background(&sample, Some(1.0), false, None);

        let mut out = vec![0i16; 512 * 2];
        engine.mix_signed16(&mut out, 512);
        // 0.5 soft-clipped is 0.4225.
        let expected = (0.4225 * f32::from(i16::MAX)) as i16;
        assert!((out[200] - expected).abs() <= 2);
        assert_eq!(out[200], out[201]);
    }

    #[test]
    fn test_play_3d_silences_and_kills_inaudible_voice() {
        let engine = engine_with_capacity(8);
        let sample = tone(44_100);
        let quiet = SpatialFactors {
            volume: 0.001,
            doppler: 1.0,
        };
        let handle = engine.play_3d(&sample, quiet, None, false, None);
        assert!(engine.lock().voices.get(handle).unwrap().flags.inaudible);

        engine.set_inaudible_behavior(handle, false, true);
        engine.set_spatial_factors(handle, quiet);
        assert!(!engine.is_valid_voice_handle(handle));
    }

    #[test]
    fn test_play_rejects_unsupported_stream_channels() {
        use crate::audio_engine::source::{
            AudioStream, SeekFlags, Seeked, SourceInstance, SourceSettings,
        };

        struct Wide(usize);

        impl AudioStream for Wide {
            fn channels(&self) -> usize {
                self.0
            }
            fn sample_rate(&self) -> f32 {
                44_100.0
            }
            fn pull(&mut self, buffer: &mut [f32], samples: usize, stride: usize) -> usize {
                for ch in 0..self.0 {
                    buffer[ch * stride..ch * stride + samples].fill(0.5);
                }
                samples
            }
            fn has_ended(&self) -> bool {
                false
            }
            fn can_seek(&self) -> bool {
                false
            }
            fn seek(&mut self, _: u64, _: &mut [f32], _: SeekFlags) -> Result<Seeked> {
                Err(MixerError::NotImplemented)
            }
        }

        struct WideSource(usize, SourceSettings);

        impl AudioSource for WideSource {
            fn settings(&self) -> &SourceSettings {
                &self.1
            }
            fn create_instance(&self) -> Result<SourceInstance> {
                Ok(SourceInstance::Stream(Box::new(Wide(self.0))))
            }
        }

        let engine = engine_with_capacity(8);
        for channels in [0, MAX_CHANNELS + 2] {
            let source = WideSource(channels, SourceSettings::default());
            assert_eq!(engine.play(&source, None, 0.0, false, None), Handle::INVALID);
        }
        assert_eq!(engine.get_voice_count(), 0);

        let source = WideSource(MAX_CHANNELS, SourceSettings::default());
        assert!(engine.play(&source, None, 0.0, false, None).is_valid());
        let mut out = vec![0.0; 512 * 2];
        engine.mix(&mut out, 512);
        assert!(out.iter().any(|&s| s != 0.0));
    }

    #[test]
    fn test_deinit_runs_cleanup_once() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicUsize, Ordering};

        let engine = engine_with_capacity(8);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        engine.set_backend_cleanup(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        engine.play(&tone(100), None, 0.0, false, None);

        engine.deinit();
        engine.deinit();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(engine.get_voice_count(), 0);
    }
}
