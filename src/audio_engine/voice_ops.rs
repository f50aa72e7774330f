//! Per-voice and global parameter control.
//!
//! Every operation taking a [`Handle`] accepts a voice group as well and
//! applies to each live member. Stale handles are ignored; getters on them
//! return a neutral default.

use std::sync::Arc;

use crate::audio_engine::Engine;
use crate::audio_engine::constants::{FILTERS_PER_STREAM, MAX_CHANNELS, VOICE_COUNT};
use crate::audio_engine::errors::{MixerError, Result};
use crate::audio_engine::filter::{Filter, FilterInstance};
use crate::audio_engine::handle::Handle;
use crate::audio_engine::mixer::{EngineState, resample_pool};
use crate::audio_engine::resampler::Resampler;
use crate::audio_engine::voice::{SpatialFactors, Voice};

/// A filter slot on a voice, or on the global chain with `None`.
fn filter_slot(
    state: &mut EngineState,
    slot: Option<usize>,
    filter: usize,
) -> Option<(&mut Box<dyn FilterInstance>, f64)> {
    match slot {
        Some(slot) => {
            let voice = state.voices.slot_mut(slot)?;
            let time = voice.stream_time;
            voice.filters.get_mut(filter)?.as_mut().map(|f| (f, time))
        }
        None => {
            let time = state.stream_time;
            state.filters.get_mut(filter)?.as_mut().map(|f| (f, time))
        }
    }
}

impl Engine {
    /// Reads a field of the voice `handle` names, or `default` for groups and
    /// stale handles.
    fn read_voice<T>(&self, handle: Handle, default: T, read: impl FnOnce(&Voice) -> T) -> T {
        self.lock().voices.get(handle).map_or(default, read)
    }

    fn update_voices(&self, handle: Handle, update: impl FnMut(&mut Voice)) {
        self.lock().with_voices(handle, update);
    }

    /// Like [`Engine::update_voices`], and reselects the active voices.
    fn update_audibility(&self, handle: Handle, update: impl FnMut(&mut Voice)) {
        let mut state = self.lock();
        state.with_voices(handle, update);
        state.active_dirty = true;
    }

    pub fn set_volume(&self, handle: Handle, volume: f32) {
        self.update_audibility(handle, |voice| {
            voice.volume_fader.disable();
            voice.set_volume = volume;
            voice.update_volume();
        });
    }

    pub fn get_volume(&self, handle: Handle) -> f32 {
        self.read_voice(handle, 0.0, |voice| voice.set_volume)
    }

    /// Volume after 3D attenuation.
    pub fn get_overall_volume(&self, handle: Handle) -> f32 {
        self.read_voice(handle, 0.0, |voice| voice.overall_volume)
    }

    /// Sets the pan position, -1 (left) to 1 (right).
    pub fn set_pan(&self, handle: Handle, pan: f32) {
        let mut state = self.lock();
        let channels = state.channels;
        state.with_voices(handle, |voice| {
            voice.pan_fader.disable();
            voice.set_pan(pan, channels);
        });
    }

    pub fn get_pan(&self, handle: Handle) -> f32 {
        self.read_voice(handle, 0.0, |voice| voice.pan)
    }

    /// Sets explicit left and right gains.
    pub fn set_pan_absolute(&self, handle: Handle, left: f32, right: f32) {
        let mut state = self.lock();
        let channels = state.channels;
        state.with_voices(handle, |voice| {
            voice.pan_fader.disable();
            voice.set_pan_absolute(left, right, channels);
        });
    }

    /// Sets the gain of one output channel. Out-of-range channels are ignored.
    pub fn set_channel_volume(&self, handle: Handle, channel: usize, volume: f32) {
        if channel >= MAX_CHANNELS {
            return;
        }
        self.update_voices(handle, |voice| voice.channel_volume[channel] = volume);
    }

    pub fn set_pause(&self, handle: Handle, paused: bool) {
        self.lock()
            .for_each_slot(handle, |state, slot| state.set_voice_pause(slot, paused));
    }

    pub fn get_pause(&self, handle: Handle) -> bool {
        self.read_voice(handle, false, |voice| voice.flags.paused)
    }

    pub fn set_pause_all(&self, paused: bool) {
        let mut state = self.lock();
        for slot in 0..state.voices.highest() {
            state.set_voice_pause(slot, paused);
        }
    }

    pub fn set_looping(&self, handle: Handle, looping: bool) {
        self.update_voices(handle, |voice| voice.flags.looping = looping);
    }

    pub fn get_looping(&self, handle: Handle) -> bool {
        self.read_voice(handle, false, |voice| voice.flags.looping)
    }

    /// Sets the frame a looping voice wraps back to.
    pub fn set_loop_point(&self, handle: Handle, frame: u64) {
        self.update_voices(handle, |voice| voice.loop_point = frame);
    }

    pub fn get_loop_point(&self, handle: Handle) -> u64 {
        self.read_voice(handle, 0, |voice| voice.loop_point)
    }

    /// Number of times the voice has wrapped to its loop point.
    pub fn get_loop_count(&self, handle: Handle) -> u32 {
        self.read_voice(handle, 0, |voice| voice.loop_count)
    }

    /// With auto-stop off, a voice whose stream ended stays alive.
    pub fn set_auto_stop(&self, handle: Handle, auto_stop: bool) {
        self.update_voices(handle, |voice| voice.flags.disable_autostop = !auto_stop);
    }

    pub fn get_auto_stop(&self, handle: Handle) -> bool {
        self.read_voice(handle, false, |voice| !voice.flags.disable_autostop)
    }

    /// Protected voices are always processed.
    pub fn set_protect_voice(&self, handle: Handle, protect: bool) {
        self.update_audibility(handle, |voice| voice.flags.protected = protect);
    }

    pub fn get_protect_voice(&self, handle: Handle) -> bool {
        self.read_voice(handle, false, |voice| voice.flags.protected)
    }

    /// Chooses what happens while a voice is inaudible: keep ticking its
    /// stream, or stop it outright.
    pub fn set_inaudible_behavior(&self, handle: Handle, must_tick: bool, kill: bool) {
        self.update_audibility(handle, |voice| {
            voice.flags.inaudible_tick = must_tick;
            voice.flags.inaudible_kill = kill;
        });
    }

    /// Sets the playback speed multiplier. Must be positive.
    pub fn set_relative_play_speed(&self, handle: Handle, speed: f32) -> Result<()> {
        if !(speed.is_finite() && speed > 0.0) {
            return Err(MixerError::InvalidParameter);
        }
        self.update_voices(handle, |voice| {
            voice.speed_fader.disable();
            voice.set_speed = speed;
            voice.update_speed();
        });
        Ok(())
    }

    pub fn get_relative_play_speed(&self, handle: Handle) -> f32 {
        self.read_voice(handle, 1.0, |voice| voice.set_speed)
    }

    /// Overrides the rate the voice's stream is read at, before speed.
    pub fn set_sample_rate(&self, handle: Handle, sample_rate: f32) {
        self.update_voices(handle, |voice| {
            voice.base_sample_rate = sample_rate;
            voice.update_speed();
        });
    }

    pub fn get_sample_rate(&self, handle: Handle) -> f32 {
        self.read_voice(handle, 0.0, |voice| voice.base_sample_rate)
    }

    /// Delays the start of a voice by `samples` output samples.
    pub fn set_delay_samples(&self, handle: Handle, samples: usize) {
        self.update_voices(handle, |voice| voice.delay = samples);
    }

    /// Seconds the voice has played.
    pub fn get_stream_time_of(&self, handle: Handle) -> f64 {
        self.read_voice(handle, 0.0, |voice| voice.stream_time)
    }

    /// Frames consumed from the voice's stream, scaled by speed.
    pub fn get_stream_position(&self, handle: Handle) -> u64 {
        self.read_voice(handle, 0, |voice| voice.stream_position)
    }

    /// Applies the external 3D stage's outputs to a 3D voice.
    pub fn set_spatial_factors(&self, handle: Handle, spatial: SpatialFactors) {
        self.lock().for_each_slot(handle, |state, slot| {
            if state.voices.slot(slot).is_some_and(|v| v.flags.process_3d) {
                state.set_spatial(slot, spatial);
            }
        });
    }

    /// Sets how many voices are processed per mix cycle.
    pub fn set_max_active_voice_count(&self, count: usize) -> Result<()> {
        if count == 0 || count > VOICE_COUNT {
            return Err(MixerError::InvalidParameter);
        }
        let buffers = resample_pool(count);
        let old = self.lock().replace_resample_pool(count, buffers);
        drop(old);
        Ok(())
    }

    pub fn set_main_resampler(&self, resampler: Resampler) {
        self.lock().resampler = resampler;
    }

    pub fn get_main_resampler(&self) -> Resampler {
        self.lock().resampler
    }

    pub fn set_global_volume(&self, volume: f32) {
        let mut state = self.lock();
        state.global_volume_fader.disable();
        state.global_volume = volume;
    }

    pub fn get_global_volume(&self) -> f32 {
        self.lock().global_volume
    }

    /// Sets the gain applied after clipping.
    pub fn set_post_clip_scaler(&self, scaler: f32) {
        self.lock().post_clip_scaler = scaler;
    }

    pub fn get_post_clip_scaler(&self) -> f32 {
        self.lock().post_clip_scaler
    }

    pub fn set_visualization_enable(&self, enable: bool) {
        self.lock().visualization_enabled = enable;
    }

    /// Installs `filter` in a slot of the global chain, or clears the slot.
    pub fn set_global_filter(&self, slot: usize, filter: Option<Arc<dyn Filter>>) -> Result<()> {
        if slot >= FILTERS_PER_STREAM {
            return Err(MixerError::InvalidParameter);
        }
        let instance = filter.map(|filter| filter.create_instance());
        let old = std::mem::replace(&mut self.lock().filters[slot], instance);
        drop(old);
        Ok(())
    }

    pub fn fade_volume(&self, handle: Handle, to: f32, time: f64) {
        if time <= 0.0 {
            self.set_volume(handle, to);
            return;
        }
        self.update_voices(handle, |voice| {
            if voice.set_volume == to {
                voice.volume_fader.disable();
            } else {
                voice.volume_fader.set(voice.set_volume, to, time, voice.stream_time);
            }
        });
    }

    pub fn fade_pan(&self, handle: Handle, to: f32, time: f64) {
        if time <= 0.0 {
            self.set_pan(handle, to);
            return;
        }
        self.update_voices(handle, |voice| {
            if voice.pan == to {
                voice.pan_fader.disable();
            } else {
                voice.pan_fader.set(voice.pan, to, time, voice.stream_time);
            }
        });
    }

    pub fn fade_relative_play_speed(&self, handle: Handle, to: f32, time: f64) -> Result<()> {
        if !(to.is_finite() && to > 0.0) {
            return Err(MixerError::InvalidParameter);
        }
        if time <= 0.0 {
            return self.set_relative_play_speed(handle, to);
        }
        self.update_voices(handle, |voice| {
            if voice.set_speed == to {
                voice.speed_fader.disable();
            } else {
                voice.speed_fader.set(voice.set_speed, to, time, voice.stream_time);
            }
        });
        Ok(())
    }

    pub fn fade_global_volume(&self, to: f32, time: f64) {
        let mut state = self.lock();
        if time <= 0.0 || state.global_volume == to {
            state.global_volume_fader.disable();
            state.global_volume = to;
            return;
        }
        let (from, now) = (state.global_volume, state.stream_time);
        state.global_volume_fader.set(from, to, time, now);
    }

    /// Oscillates the volume between `from` and `to` with period `time`.
    pub fn oscillate_volume(&self, handle: Handle, from: f32, to: f32, time: f64) {
        if time <= 0.0 || from == to {
            self.set_volume(handle, to);
            return;
        }
        self.update_voices(handle, |voice| {
            voice.volume_fader.set_lfo(from, to, time, voice.stream_time);
        });
    }

    pub fn oscillate_pan(&self, handle: Handle, from: f32, to: f32, time: f64) {
        if time <= 0.0 || from == to {
            self.set_pan(handle, to);
            return;
        }
        self.update_voices(handle, |voice| {
            voice.pan_fader.set_lfo(from, to, time, voice.stream_time);
        });
    }

    pub fn oscillate_relative_play_speed(
        &self,
        handle: Handle,
        from: f32,
        to: f32,
        time: f64,
    ) -> Result<()> {
        if !(from > 0.0 && to > 0.0) {
            return Err(MixerError::InvalidParameter);
        }
        if time <= 0.0 || from == to {
            return self.set_relative_play_speed(handle, to);
        }
        self.update_voices(handle, |voice| {
            voice.speed_fader.set_lfo(from, to, time, voice.stream_time);
        });
        Ok(())
    }

    pub fn oscillate_global_volume(&self, from: f32, to: f32, time: f64) {
        let mut state = self.lock();
        if time <= 0.0 || from == to {
            state.global_volume_fader.disable();
            state.global_volume = to;
            return;
        }
        let now = state.stream_time;
        state.global_volume_fader.set_lfo(from, to, time, now);
    }

    /// Pauses the voice after `time` seconds of its own playback.
    pub fn schedule_pause(&self, handle: Handle, time: f64) {
        if time <= 0.0 {
            self.set_pause(handle, true);
            return;
        }
        self.update_voices(handle, |voice| {
            voice.pause_scheduler.set(1.0, 0.0, time, voice.stream_time);
        });
    }

    /// Stops the voice after `time` seconds of its own playback.
    pub fn schedule_stop(&self, handle: Handle, time: f64) {
        if time <= 0.0 {
            self.stop(handle);
            return;
        }
        self.update_voices(handle, |voice| {
            voice.stop_scheduler.set(1.0, 0.0, time, voice.stream_time);
        });
    }

    pub fn create_voice_group(&self) -> Result<Handle> {
        self.lock().groups.create()
    }

    pub fn destroy_voice_group(&self, group: Handle) -> Result<()> {
        self.lock().groups.destroy(group)
    }

    /// Adds a live voice to `group`, trimming members that have stopped.
    pub fn add_voice_to_group(&self, group: Handle, voice: Handle) -> Result<()> {
        let mut guard = self.lock();
        let state = &mut *guard;
        state
            .groups
            .add(group, voice, |member| state.voices.resolve(member).is_some())
    }

    pub fn is_voice_group(&self, handle: Handle) -> bool {
        self.lock().groups.is_group(handle)
    }

    /// `true` if the group has no live members (or does not exist).
    pub fn is_voice_group_empty(&self, group: Handle) -> bool {
        let mut guard = self.lock();
        let state = &mut *guard;
        state
            .groups
            .trim(group, |member| state.voices.resolve(member).is_some())
    }

    /// Reads a parameter of a voice filter, or of the global chain when
    /// `handle` is `None`.
    pub fn get_filter_parameter(
        &self,
        handle: Option<Handle>,
        filter: usize,
        attribute: usize,
    ) -> Result<f32> {
        debug_assert!(filter < FILTERS_PER_STREAM, "filter slot {filter} out of range");
        let mut state = self.lock();
        let slot = match handle {
            Some(handle) => Some(
                state
                    .voices
                    .resolve(handle)
                    .ok_or(MixerError::InvalidParameter)?,
            ),
            None => None,
        };
        filter_slot(&mut state, slot, filter)
            .map(|(instance, _)| instance.parameter(attribute))
            .ok_or(MixerError::InvalidParameter)
    }

    pub fn set_filter_parameter(
        &self,
        handle: Option<Handle>,
        filter: usize,
        attribute: usize,
        value: f32,
    ) -> Result<()> {
        self.with_filter(handle, filter, |instance, _| {
            instance.set_parameter(attribute, value);
        })
    }

    pub fn fade_filter_parameter(
        &self,
        handle: Option<Handle>,
        filter: usize,
        attribute: usize,
        to: f32,
        time: f64,
    ) -> Result<()> {
        self.with_filter(handle, filter, |instance, now| {
            instance.fade_parameter(attribute, to, time, now);
        })
    }

    pub fn oscillate_filter_parameter(
        &self,
        handle: Option<Handle>,
        filter: usize,
        attribute: usize,
        from: f32,
        to: f32,
        time: f64,
    ) -> Result<()> {
        self.with_filter(handle, filter, |instance, now| {
            instance.oscillate_parameter(attribute, from, to, time, now);
        })
    }

    /// Runs `f` on filter `filter` of every voice `handle` names, or of the
    /// global chain. Slots without a filter are skipped.
    fn with_filter(
        &self,
        handle: Option<Handle>,
        filter: usize,
        mut f: impl FnMut(&mut Box<dyn FilterInstance>, f64),
    ) -> Result<()> {
        debug_assert!(filter < FILTERS_PER_STREAM, "filter slot {filter} out of range");
        if filter >= FILTERS_PER_STREAM {
            return Err(MixerError::InvalidParameter);
        }
        let mut state = self.lock();
        match handle {
            Some(handle) => state.for_each_slot(handle, |state, slot| {
                if let Some((instance, now)) = filter_slot(state, Some(slot), filter) {
                    f(instance, now);
                }
            }),
            None => {
                if let Some((instance, now)) = filter_slot(&mut state, None, filter) {
                    f(instance, now);
                }
            }
        }
        Ok(())
    }
}
