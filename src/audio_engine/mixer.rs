//! Engine state and the real-time mix cycle.
//!
//! [`EngineState`] is everything guarded by the engine lock: the voice pool,
//! the active-voice selection, the resample buffer pool and all scratch
//! memory. Buffers are sized at `postinit` and when the active-voice cap
//! changes, so a mix cycle does not allocate.

use std::mem;

use crate::audio_engine::EngineConfig;
use crate::audio_engine::channels::pan_and_expand;
use crate::audio_engine::clipper::{ClipMode, clip, interleave_f32, interleave_i16};
use crate::audio_engine::constants::{
    DEFAULT_POST_CLIP_SCALER, FILTERS_PER_STREAM, FIXPOINT_FRAC_BITS, FIXPOINT_FRAC_MUL,
    INAUDIBLE_THRESHOLD, MAX_BUS_DEPTH, MAX_CHANNELS, MAX_RESAMPLE_STEP, MIN_SCRATCH_SIZE,
    SAMPLE_GRANULARITY,
};
use crate::audio_engine::errors::{MixerError, Result};
use crate::audio_engine::fader::{Fader, FaderState};
use crate::audio_engine::filter::FilterInstance;
use crate::audio_engine::handle::{Handle, VoiceGroups, next_generation};
use crate::audio_engine::resampler::Resampler;
use crate::audio_engine::source::{SeekFlags, SourceInstance, SourceSettings};
use crate::audio_engine::visualization::Visualization;
use crate::audio_engine::voice::{SpatialFactors, Voice};
use crate::audio_engine::voice_pool::VoicePool;

/// Fixed-point size of one resample block.
const BLOCK_FIXED: u64 = SAMPLE_GRANULARITY as u64 * FIXPOINT_FRAC_MUL;

/// Length of one resample buffer: a block for every possible channel.
const RESAMPLE_BUFFER_LEN: usize = SAMPLE_GRANULARITY * MAX_CHANNELS;

/// Allocates the resample buffer pool for `max_active` voices.
pub(crate) fn resample_pool(max_active: usize) -> Vec<Vec<f32>> {
    (0..max_active * 2)
        .map(|_| vec![0.0; RESAMPLE_BUFFER_LEN])
        .collect()
}

pub(crate) struct EngineState {
    pub voices: VoicePool,
    pub groups: VoiceGroups,

    pub initialized: bool,
    pub sample_rate: u32,
    pub buffer_size: usize,
    pub channels: usize,

    pub clip_mode: ClipMode,
    pub visualization_enabled: bool,
    pub visualization: Visualization,
    pub resampler: Resampler,

    pub max_active: usize,
    /// Pool slots selected for processing this cycle.
    pub active: Vec<usize>,
    pub active_dirty: bool,
    candidates: Vec<usize>,

    /// `2 * max_active` buffers; pair `p` is buffers `2p` and `2p + 1`.
    resample_buffers: Vec<Vec<f32>>,
    /// Slot owning each buffer pair.
    resample_owner: Vec<Option<usize>>,
    live_pairs: Vec<bool>,

    scratch_size: usize,
    scratch: Vec<f32>,
    output_scratch: Vec<f32>,
    pub seek_scratch: Vec<f32>,

    pub global_volume: f32,
    pub global_volume_fader: Fader,
    pub post_clip_scaler: f32,
    pub filters: [Option<Box<dyn FilterInstance>>; FILTERS_PER_STREAM],

    /// Seconds of audio mixed since `postinit`.
    pub stream_time: f64,
    /// Time of the first clocked play in the current buffer, or zero.
    pub last_clocked_time: f64,

    pub play_index: u32,
    pub next_source_id: u32,
    pub backend_cleanup: Option<Box<dyn FnOnce() + Send>>,
    depth_warned: bool,
}

impl EngineState {
    pub fn new(config: &EngineConfig) -> Self {
        let max_active = config.max_active_voices;
        Self {
            voices: VoicePool::new(config.voice_capacity),
            groups: VoiceGroups::default(),
            initialized: false,
            sample_rate: 0,
            buffer_size: 0,
            channels: 2,
            clip_mode: if config.flags.clip_roundoff {
                ClipMode::RoundOff
            } else {
                ClipMode::Hard
            },
            visualization_enabled: config.flags.visualization,
            visualization: Visualization::default(),
            resampler: config.resampler,
            max_active,
            active: Vec::with_capacity(max_active),
            active_dirty: false,
            candidates: Vec::with_capacity(config.voice_capacity),
            resample_buffers: resample_pool(max_active),
            resample_owner: vec![None; max_active],
            live_pairs: vec![false; max_active],
            scratch_size: 0,
            scratch: Vec::new(),
            output_scratch: Vec::new(),
            seek_scratch: vec![0.0; RESAMPLE_BUFFER_LEN],
            global_volume: 1.0,
            global_volume_fader: Fader::default(),
            post_clip_scaler: DEFAULT_POST_CLIP_SCALER,
            filters: Default::default(),
            stream_time: 0.0,
            last_clocked_time: 0.0,
            play_index: 0,
            next_source_id: 1,
            backend_cleanup: None,
            depth_warned: false,
        }
    }

    /// Sizes the scratch buffers for the negotiated backend format.
    pub fn configure_output(&mut self, sample_rate: u32, buffer_size: usize, channels: usize) {
        self.sample_rate = sample_rate;
        self.buffer_size = buffer_size;
        self.channels = channels;

        let mut size = (buffer_size + 15) & !15;
        if size < SAMPLE_GRANULARITY * 2 {
            size = SAMPLE_GRANULARITY * 2;
        }
        self.scratch_size = size.max(MIN_SCRATCH_SIZE);
        self.scratch = vec![0.0; self.scratch_size * MAX_CHANNELS];
        self.output_scratch = vec![0.0; self.scratch_size * MAX_CHANNELS];
        self.global_volume = 1.0;
        self.post_clip_scaler = DEFAULT_POST_CLIP_SCALER;
        self.initialized = true;
    }

    /// Installs a new resample pool sized for `max_active` voices.
    pub fn replace_resample_pool(&mut self, max_active: usize, buffers: Vec<Vec<f32>>) -> Vec<Vec<f32>> {
        self.max_active = max_active;
        self.resample_owner = vec![None; max_active];
        self.live_pairs = vec![false; max_active];
        self.active.reserve(max_active.saturating_sub(self.active.len()));
        for (_, voice) in self.voices.iter_mut() {
            voice.resample_pair = None;
        }
        self.active_dirty = true;
        mem::replace(&mut self.resample_buffers, buffers)
    }

    /// Calls `f` for the slot of every live voice `handle` names.
    pub fn for_each_slot(&mut self, handle: Handle, mut f: impl FnMut(&mut EngineState, usize)) {
        if handle.is_group() {
            let len = self.groups.members(handle).map_or(0, <[Handle]>::len);
            for i in 0..len {
                let Some(&member) = self.groups.members(handle).and_then(|m| m.get(i)) else {
                    break;
                };
                if let Some(slot) = self.voices.resolve(member) {
                    f(self, slot);
                }
            }
        } else if let Some(slot) = self.voices.resolve(handle) {
            f(self, slot);
        }
    }

    /// Calls `f` on every live voice `handle` names.
    pub fn with_voices(&mut self, handle: Handle, mut f: impl FnMut(&mut Voice)) {
        self.for_each_slot(handle, |state, slot| {
            if let Some(voice) = state.voices.slot_mut(slot) {
                f(voice);
            }
        });
    }

    /// `true` if `candidate` is `bus` or one of the buses `bus` feeds into.
    pub fn routes_through(&self, bus: Handle, candidate: Handle) -> bool {
        let mut current = Some(bus);
        for _ in 0..=self.voices.capacity() {
            match current {
                Some(handle) if handle == candidate => return true,
                Some(handle) => current = self.voices.get(handle).and_then(|v| v.bus),
                None => return false,
            }
        }
        false
    }

    /// Removes the voice in `slot`, releasing its resample buffers. A bus
    /// voice takes every voice routed into it along.
    pub fn stop_voice(&mut self, slot: usize) {
        self.active_dirty = true;
        let Some(voice) = self.voices.take(slot) else {
            return;
        };
        if let Some(pair) = voice.resample_pair
            && let Some(owner) = self.resample_owner.get_mut(pair)
        {
            *owner = None;
        }
        if voice.instance.is_bus() {
            let bus = Handle::voice(slot, voice.generation);
            for child in 0..self.voices.highest() {
                if self.voices.slot(child).is_some_and(|v| v.bus == Some(bus)) {
                    self.stop_voice(child);
                }
            }
        }
    }

    /// Moves `pending` into a free slot and returns its handle. Leaves
    /// `pending` untouched when the pool is full so the caller can drop the
    /// voice after unlocking.
    pub fn publish_voice(
        &mut self,
        pending: &mut Option<Voice>,
        settings: &SourceSettings,
        volume: Option<f32>,
        pan: f32,
        paused: bool,
        bus: Option<Handle>,
    ) -> Handle {
        let Some(slot) = self.voices.find_free() else {
            return Handle::INVALID;
        };
        let Some(mut voice) = pending.take() else {
            return Handle::INVALID;
        };

        self.play_index = next_generation(self.play_index);
        voice.generation = self.play_index;
        voice.source_id = settings.ensure_id(&mut self.next_source_id);
        voice.bus = bus;
        voice.flags.paused = paused;
        if voice.base_sample_rate <= 0.0 {
            voice.base_sample_rate = self.sample_rate as f32;
        }
        let speed = voice.instance.relative_playback_speed();
        voice.set_speed = if speed > 0.0 { speed } else { 1.0 };
        voice.set_pan(pan, self.channels);
        voice.set_volume = match volume {
            Some(volume) if volume >= 0.0 => volume,
            _ => settings.volume,
        };
        voice.update_speed();
        voice.update_volume();
        voice.prime_channel_volume();

        let handle = Handle::voice(slot, voice.generation);
        self.voices.insert(slot, voice);
        self.active_dirty = true;
        handle
    }

    /// Applies the 3D stage's volume and doppler factors to a voice.
    pub fn set_spatial(&mut self, slot: usize, spatial: SpatialFactors) {
        let Some(voice) = self.voices.slot_mut(slot) else {
            return;
        };
        voice.spatial = spatial;
        voice.update_speed();
        voice.update_volume();

        let inaudible = voice.overall_volume < INAUDIBLE_THRESHOLD;
        let kill = inaudible && voice.flags.inaudible_kill;
        if voice.flags.inaudible != inaudible {
            voice.flags.inaudible = inaudible;
            self.active_dirty = true;
        }
        if kill {
            self.stop_voice(slot);
        }
    }

    /// Seeks the voice in `slot`. The voice keeps playing on failure.
    pub fn seek_voice(&mut self, slot: usize, position: u64) -> Result<()> {
        let Some(voice) = self.voices.slot_mut(slot) else {
            return Ok(());
        };
        match voice
            .instance
            .seek(position, &mut self.seek_scratch, SeekFlags::default())
        {
            Ok(seeked) => {
                voice.stream_position = seeked.position;
                if seeked.end_of_stream {
                    Err(MixerError::EndOfStream)
                } else {
                    Ok(())
                }
            }
            Err(err) => {
                log::debug!("seek to {position} failed: {err}");
                Err(err)
            }
        }
    }

    /// Stops every voice of `source_id`.
    pub fn stop_source(&mut self, source_id: u32) {
        if source_id == 0 {
            return;
        }
        for slot in 0..self.voices.highest() {
            if self.voices.slot(slot).is_some_and(|v| v.source_id == source_id) {
                self.stop_voice(slot);
            }
        }
    }

    pub fn set_voice_pause(&mut self, slot: usize, paused: bool) {
        self.active_dirty = true;
        if let Some(voice) = self.voices.slot_mut(slot) {
            voice.pause_scheduler.disable();
            voice.flags.paused = paused;
        }
    }

    /// Recomputes the active-voice list and remaps resample buffers.
    ///
    /// Protected and ticking voices are always kept; the remaining room goes
    /// to the loudest voices. If the always-kept voices alone exceed the cap,
    /// only the first `max_active` of them are processed.
    pub fn calc_active_voices(&mut self) {
        self.active_dirty = false;
        self.candidates.clear();

        let mut must_live = 0;
        for (slot, voice) in self.voices.iter() {
            if !voice.is_candidate() {
                continue;
            }
            self.candidates.push(slot);
            if voice.must_live() {
                let last = self.candidates.len() - 1;
                self.candidates.swap(must_live, last);
                must_live += 1;
            }
        }

        if self.candidates.len() > self.max_active && must_live < self.max_active {
            let keep = self.max_active - must_live;
            let voices = &self.voices;
            let volume = |slot: usize| voices.slot(slot).map_or(0.0, |v| v.overall_volume);
            self.candidates[must_live..]
                .select_nth_unstable_by(keep - 1, |&a, &b| volume(b).total_cmp(&volume(a)));
        }
        self.candidates.truncate(self.max_active);

        self.active.clear();
        self.active.extend_from_slice(&self.candidates);
        self.map_resample_buffers();
    }

    fn map_resample_buffers(&mut self) {
        self.live_pairs.fill(false);
        for &slot in &self.active {
            if let Some(pair) = self.voices.slot(slot).and_then(|v| v.resample_pair) {
                self.live_pairs[pair] = true;
            }
        }

        for (pair, owner) in self.resample_owner.iter_mut().enumerate() {
            if !self.live_pairs[pair]
                && let Some(slot) = owner.take()
                && let Some(voice) = self.voices.slot_mut(slot)
            {
                voice.resample_pair = None;
            }
        }

        let mut free = 0;
        for &slot in &self.active {
            let Some(voice) = self.voices.slot_mut(slot) else {
                continue;
            };
            if voice.resample_pair.is_some() {
                continue;
            }
            while free < self.resample_owner.len() && self.resample_owner[free].is_some() {
                free += 1;
            }
            if free == self.resample_owner.len() {
                break;
            }
            self.resample_owner[free] = Some(slot);
            voice.resample_pair = Some(free);
            voice.resample_front = 0;
            self.resample_buffers[free * 2].fill(0.0);
            self.resample_buffers[free * 2 + 1].fill(0.0);
        }
    }

    /// Mixes every active voice routed to `bus` into `buffer`.
    ///
    /// `buffer` and `scratch` are planar with `stride` samples per channel;
    /// `scratch` receives each voice's resampled audio before panning.
    #[allow(clippy::too_many_arguments)]
    pub fn mix_bus(
        &mut self,
        buffer: &mut [f32],
        samples: usize,
        stride: usize,
        scratch: &mut [f32],
        bus: Option<Handle>,
        sample_rate: f32,
        channels: usize,
        resampler: Resampler,
        depth: usize,
    ) {
        for ch in 0..channels {
            buffer[ch * stride..ch * stride + samples].fill(0.0);
        }
        if depth > MAX_BUS_DEPTH {
            if !self.depth_warned {
                log::warn!("bus nesting deeper than {MAX_BUS_DEPTH}; mixing silence");
                self.depth_warned = true;
            }
            return;
        }

        let target = MixTarget {
            samples,
            stride,
            sample_rate,
            channels,
            resampler,
            depth,
        };
        for i in 0..self.active.len() {
            let slot = self.active[i];
            let Some(voice) = self.voices.slot(slot) else {
                continue;
            };
            if voice.bus != bus || voice.flags.paused {
                continue;
            }
            if !voice.flags.inaudible {
                self.mix_voice(slot, &target, Some((&mut *buffer, &mut *scratch)));
            } else if voice.flags.inaudible_tick {
                self.mix_voice(slot, &target, None);
            } else {
                continue;
            }

            if self.voices.slot(slot).is_some_and(Voice::should_autostop) {
                self.stop_voice(slot);
            }
        }
    }

    /// Advances one voice by `target.samples` output samples. With `output`
    /// the voice is filtered, resampled and panned into the bus buffer;
    /// without it only its stream and phase move.
    fn mix_voice(&mut self, slot: usize, target: &MixTarget, mut output: Option<(&mut [f32], &mut [f32])>) {
        let Some(voice) = self.voices.slot_mut(slot) else {
            return;
        };
        let step = f64::from(voice.sample_rate) / f64::from(target.sample_rate);
        let step_fixed = if step.is_finite() && step > 0.0 && step <= MAX_RESAMPLE_STEP {
            (step * FIXPOINT_FRAC_MUL as f64).floor() as u64
        } else {
            0
        };

        let mut outofs = 0;
        if voice.delay > 0 {
            outofs = voice.delay.min(target.samples);
            voice.delay -= outofs;
            if let Some((_, scratch)) = output.as_mut() {
                for ch in 0..voice.channels {
                    let start = ch * target.stride;
                    scratch[start..start + outofs].fill(0.0);
                }
            }
        }

        while step_fixed != 0 && outofs < target.samples {
            let needs_block = match self.voices.slot_mut(slot) {
                Some(voice) if voice.leftover == 0 => {
                    voice.swap_resample_buffers();
                    true
                }
                Some(voice) => {
                    voice.leftover = 0;
                    false
                }
                None => return,
            };
            if needs_block {
                self.refill_block(slot, output.is_some(), target.depth);
            }

            let Some(voice) = self.voices.slot_mut(slot) else {
                return;
            };
            let mut write = 0;
            if voice.src_offset < BLOCK_FIXED {
                write = ((BLOCK_FIXED - voice.src_offset) / step_fixed + 1) as usize;
                if ((write as u64 * step_fixed + voice.src_offset) >> FIXPOINT_FRAC_BITS)
                    >= SAMPLE_GRANULARITY as u64
                {
                    write -= 1;
                }
                // A step of a block or more still takes the sample at the
                // current offset; the refills that follow skip the rest.
                if write == 0 && step_fixed >= BLOCK_FIXED {
                    write = 1;
                }
            }
            if write + outofs > target.samples {
                voice.leftover = write + outofs - target.samples;
                write = target.samples - outofs;
            }

            if write > 0
                && let Some((_, scratch)) = output.as_mut()
                && let Some((current, previous)) = voice.resample_buffers()
            {
                let src = &self.resample_buffers[current];
                let prev = &self.resample_buffers[previous];
                for ch in 0..voice.channels {
                    let block = ch * SAMPLE_GRANULARITY..(ch + 1) * SAMPLE_GRANULARITY;
                    let start = ch * target.stride + outofs;
                    target.resampler.process(
                        &src[block.clone()],
                        &prev[block],
                        &mut scratch[start..start + write],
                        voice.src_offset,
                        step_fixed,
                    );
                }
            }

            outofs += write;
            voice.src_offset += write as u64 * step_fixed;
        }

        if let Some((buffer, scratch)) = output
            && let Some(voice) = self.voices.slot_mut(slot)
        {
            if step_fixed == 0 {
                for ch in 0..voice.channels {
                    let start = ch * target.stride + outofs;
                    scratch[start..ch * target.stride + target.samples].fill(0.0);
                }
            }
            let mut gains = [0.0; MAX_CHANNELS];
            for (gain, &channel) in gains.iter_mut().zip(&voice.channel_volume) {
                *gain = channel * voice.overall_volume;
            }
            pan_and_expand(
                buffer,
                target.channels,
                scratch,
                voice.channels,
                target.samples,
                target.stride,
                &mut voice.current_channel_volume,
                &gains,
            );
        }
    }

    /// Pulls the next source block into the voice's current resample buffer.
    fn refill_block(&mut self, slot: usize, audible: bool, depth: usize) {
        let Some((current, _)) = self.voices.slot(slot).and_then(Voice::resample_buffers) else {
            return;
        };
        let mut block = mem::take(&mut self.resample_buffers[current]);
        let read = self.pull_voice(slot, &mut block, depth);

        if let Some(voice) = self.voices.slot_mut(slot) {
            if read < SAMPLE_GRANULARITY {
                for ch in 0..voice.channels {
                    block[ch * SAMPLE_GRANULARITY + read..(ch + 1) * SAMPLE_GRANULARITY].fill(0.0);
                }
            }

            if voice.src_offset < BLOCK_FIXED {
                voice.src_offset = 0;
            } else {
                voice.src_offset -= BLOCK_FIXED;
            }

            if audible {
                for filter in voice.filters.iter_mut().flatten() {
                    filter.apply(
                        &mut block,
                        SAMPLE_GRANULARITY,
                        SAMPLE_GRANULARITY,
                        voice.channels,
                        voice.sample_rate,
                        voice.stream_time,
                    );
                }
            }
        }
        self.resample_buffers[current] = block;
    }

    /// Reads one block from the voice's source, wrapping to the loop point
    /// as needed. A bus voice mixes its children into the block.
    fn pull_voice(&mut self, slot: usize, block: &mut [f32], depth: usize) -> usize {
        let Some(voice) = self.voices.slot_mut(slot) else {
            return 0;
        };
        if voice.has_ended() && !voice.flags.looping {
            return 0;
        }
        let handle = Handle::voice(slot, voice.generation);
        let rate = voice.sample_rate;

        match &mut voice.instance {
            SourceInstance::Stream(stream) => {
                let mut read = stream.pull(block, SAMPLE_GRANULARITY, SAMPLE_GRANULARITY);
                while read < SAMPLE_GRANULARITY && voice.flags.looping {
                    match stream.seek(voice.loop_point, &mut self.seek_scratch, SeekFlags::default()) {
                        Ok(seeked) if !seeked.end_of_stream => {
                            voice.stream_position = seeked.position;
                            voice.loop_count += 1;
                        }
                        _ => break,
                    }
                    let inc = stream.pull(
                        &mut block[read..],
                        SAMPLE_GRANULARITY - read,
                        SAMPLE_GRANULARITY,
                    );
                    read += inc;
                    if inc == 0 {
                        break;
                    }
                }
                read
            }
            SourceInstance::Bus(bus) => {
                let mut bus_scratch = mem::take(&mut bus.scratch);
                let (channels, resampler) = (bus.channels, bus.resampler);
                self.mix_bus(
                    block,
                    SAMPLE_GRANULARITY,
                    SAMPLE_GRANULARITY,
                    &mut bus_scratch,
                    Some(handle),
                    rate,
                    channels,
                    resampler,
                    depth + 1,
                );
                if let Some(voice) = self.voices.slot_mut(slot)
                    && let SourceInstance::Bus(bus) = &mut voice.instance
                {
                    bus.scratch = bus_scratch;
                    if bus.visualization_enabled {
                        bus.visualization
                            .capture(block, SAMPLE_GRANULARITY, SAMPLE_GRANULARITY, channels);
                    }
                }
                SAMPLE_GRANULARITY
            }
        }
    }

    /// Advances voice clocks and faders, firing scheduled pauses and stops.
    fn advance_voices(&mut self, samples: usize, buffer_time: f64) {
        for slot in 0..self.voices.highest() {
            let channels = self.channels;
            let Some(voice) = self.voices.slot_mut(slot) else {
                continue;
            };
            if voice.flags.paused {
                continue;
            }

            voice.stream_time += buffer_time;
            voice.stream_position += (samples as f64 * f64::from(voice.overall_speed)) as u64;
            let now = voice.stream_time;

            if voice.speed_fader.is_active() {
                let speed = voice.speed_fader.get(now);
                if speed > 0.0 {
                    voice.set_speed = speed;
                    voice.update_speed();
                }
            }
            if voice.volume_fader.is_active() {
                voice.set_volume = voice.volume_fader.get(now);
                voice.update_volume();
                self.active_dirty = true;
            }
            if voice.pan_fader.is_active() {
                let pan = voice.pan_fader.get(now);
                voice.set_pan(pan, channels);
            }

            if voice.pause_scheduler.state() != FaderState::Disabled {
                voice.pause_scheduler.get(now);
                if voice.pause_scheduler.take_finished() {
                    voice.flags.paused = true;
                    self.active_dirty = true;
                }
            }

            let mut stop = false;
            if voice.stop_scheduler.state() != FaderState::Disabled {
                voice.stop_scheduler.get(now);
                stop = voice.stop_scheduler.take_finished();
            }
            if stop {
                self.stop_voice(slot);
            }
        }
    }

    /// One mix cycle of `samples` frames into the planar scratch buffer.
    fn mix_internal(&mut self, samples: usize, stride: usize) {
        let buffer_time = samples as f64 / f64::from(self.sample_rate);
        self.stream_time += buffer_time;
        self.last_clocked_time = 0.0;

        let volume0 = self.global_volume;
        if self.global_volume_fader.is_active() {
            self.global_volume = self.global_volume_fader.get(self.stream_time);
        }
        let volume1 = self.global_volume;

        self.advance_voices(samples, buffer_time);
        if self.active_dirty {
            self.calc_active_voices();
        }

        let mut output = mem::take(&mut self.output_scratch);
        let mut scratch = mem::take(&mut self.scratch);
        let (rate, channels) = (self.sample_rate as f32, self.channels);
        self.mix_bus(
            &mut output,
            samples,
            stride,
            &mut scratch,
            None,
            rate,
            channels,
            self.resampler,
            0,
        );

        for filter in self.filters.iter_mut().flatten() {
            filter.apply(&mut output, samples, stride, channels, rate, self.stream_time);
        }

        if self.visualization_enabled {
            self.visualization.capture(&output, samples, stride, channels);
        }

        clip(
            self.clip_mode,
            &output,
            &mut scratch,
            samples,
            stride,
            channels,
            volume0,
            volume1,
            self.post_clip_scaler,
        );
        self.output_scratch = output;
        self.scratch = scratch;
    }

    /// Runs mix cycles for `samples` frames in chunks that fit the scratch.
    fn mix_chunks(&mut self, samples: usize, mut emit: impl FnMut(&[f32], usize, usize, usize)) {
        let mut done = 0;
        while done < samples {
            let count = (samples - done).min(self.scratch_size);
            let stride = (count + 15) & !15;
            self.mix_internal(count, stride);
            emit(&self.scratch, done, count, stride);
            done += count;
        }
    }

    /// Mixes `samples` interleaved frames into `buffer`.
    pub fn mix_f32(&mut self, buffer: &mut [f32], samples: usize) {
        let channels = self.channels;
        if !self.initialized || channels == 0 {
            buffer.fill(0.0);
            return;
        }
        let samples = samples.min(buffer.len() / channels);
        self.mix_chunks(samples, |scratch, done, count, stride| {
            interleave_f32(scratch, &mut buffer[done * channels..], count, stride, channels);
        });
    }

    /// Mixes `samples` interleaved frames into `buffer` as 16-bit PCM.
    pub fn mix_i16(&mut self, buffer: &mut [i16], samples: usize) {
        let channels = self.channels;
        if !self.initialized || channels == 0 {
            buffer.fill(0);
            return;
        }
        let samples = samples.min(buffer.len() / channels);
        self.mix_chunks(samples, |scratch, done, count, stride| {
            interleave_i16(scratch, &mut buffer[done * channels..], count, stride, channels);
        });
    }
}

/// Destination parameters of one `mix_bus` pass.
struct MixTarget {
    samples: usize,
    stride: usize,
    sample_rate: f32,
    channels: usize,
    resampler: Resampler,
    depth: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio_engine::Engine;
    use crate::audio_engine::bus::Bus;
    use crate::audio_engine::sample_loader::Sample;
    use crate::audio_engine::source::{AudioSource, SourceFlags};

    fn engine_with(max_active: usize) -> Engine {
        let config = EngineConfig {
            max_active_voices: max_active,
            ..EngineConfig::default()
        };
        let engine = Engine::new(config);
        engine.postinit(44_100, 512, 2).unwrap();
        engine
    }

    fn constant(value: f32, frames: usize) -> Sample {
        Sample::from_planar(vec![value; frames], 1, 44_100.0).unwrap()
    }

    fn active_volumes(engine: &Engine) -> Vec<f32> {
        let state = engine.lock();
        let mut volumes: Vec<f32> = state
            .active
            .iter()
            .filter_map(|&slot| state.voices.slot(slot).map(|v| v.overall_volume))
            .collect();
        volumes.sort_by(|a, b| b.total_cmp(a));
        volumes
    }

    #[test]
    fn test_active_set_keeps_loudest() {
        let engine = engine_with(2);
        let sample = constant(0.1, 44_100);
        for volume in [0.1, 0.9, 0.5, 0.7, 0.3] {
            assert!(engine.play(&sample, Some(volume), 0.0, false, None).is_valid());
        }

        engine.lock().calc_active_voices();
        let volumes = active_volumes(&engine);
        assert_eq!(volumes.len(), 2);
        assert!((volumes[0] - 0.9).abs() < 1e-6);
        assert!((volumes[1] - 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_active_set_always_includes_bus() {
        let engine = engine_with(2);
        let bus = crate::audio_engine::bus::Bus::new();
        let sample = constant(0.1, 44_100);
        for volume in [0.1, 0.9, 0.5, 0.7] {
            engine.play(&sample, Some(volume), 0.0, false, None);
        }
        let bus_handle = engine.play(&bus, Some(0.05), 0.0, false, None);

        engine.lock().calc_active_voices();
        let state = engine.lock();
        let bus_slot = state.voices.resolve(bus_handle).unwrap();
        assert_eq!(state.active.len(), 2);
        assert!(state.active.contains(&bus_slot));
        let other = state.active.iter().find(|&&s| s != bus_slot).unwrap();
        assert!((state.voices.slot(*other).unwrap().overall_volume - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_must_live_overflow_keeps_first_max() {
        let engine = engine_with(2);
        let sample = constant(0.1, 44_100);
        let handles: Vec<_> = (0..3)
            .map(|_| engine.play(&sample, Some(1.0), 0.0, false, None))
            .collect();
        for &handle in &handles {
            engine.set_protect_voice(handle, true);
        }
        engine.play(&sample, Some(1.0), 0.0, false, None);

        engine.lock().calc_active_voices();
        let state = engine.lock();
        assert_eq!(state.active.len(), 2);
        assert!(state.active.iter().all(|&slot| state.voices.slot(slot).unwrap().flags.protected));
    }

    #[test]
    fn test_resample_pairs_are_unique() {
        let engine = engine_with(3);
        let sample = constant(0.1, 44_100);
        for _ in 0..5 {
            engine.play(&sample, None, 0.0, false, None);
        }
        engine.lock().calc_active_voices();

        let state = engine.lock();
        let mut pairs: Vec<usize> = state
            .active
            .iter()
            .filter_map(|&slot| state.voices.slot(slot).and_then(|v| v.resample_pair))
            .collect();
        assert_eq!(pairs.len(), 3);
        pairs.sort_unstable();
        pairs.dedup();
        assert_eq!(pairs.len(), 3);
    }

    #[test]
    fn test_stop_releases_resample_pair() {
        let engine = engine_with(1);
        let sample = constant(0.1, 44_100);
        let first = engine.play(&sample, None, 0.0, false, None);
        engine.lock().calc_active_voices();
        engine.stop(first);

        let second = engine.play(&sample, None, 0.0, false, None);
        engine.lock().calc_active_voices();
        let state = engine.lock();
        assert_eq!(state.voices.get(second).unwrap().resample_pair, Some(0));
    }

    #[test]
    fn test_looping_voice_counts_loops_without_stopping() {
        let engine = engine_with(4);
        let mut sample = constant(0.25, 300);
        sample.settings_mut().flags.looping = true;
        let handle = engine.play(&sample, None, 0.0, false, None);

        let mut out = vec![0.0; 512 * 2];
        engine.mix(&mut out, 512);
        // 512 samples were pulled into the first block: one wrap from 300.
        assert_eq!(engine.get_loop_count(handle), 1);
        engine.mix(&mut out, 512);
        assert_eq!(engine.get_loop_count(handle), 3);
        assert!(engine.is_valid_voice_handle(handle));
    }

    #[test]
    fn test_step_beyond_one_block_still_produces_output() {
        let engine = engine_with(4);
        let mut sample = constant(0.5, 44_100);
        sample.settings_mut().flags.looping = true;
        let handle = engine.play(&sample, None, 0.0, false, None);
        engine.set_relative_play_speed(handle, 600.0).unwrap();

        let mut out = vec![0.0; 512 * 2];
        engine.mix(&mut out, 512);
        engine.mix(&mut out, 512);
        let peak = out.iter().fold(0.0f32, |peak, s| peak.max(s.abs()));
        assert!(peak > 0.1);
        assert!(engine.is_valid_voice_handle(handle));
    }

    #[test]
    fn test_step_beyond_fixed_point_range_is_silent() {
        let engine = engine_with(4);
        let mut sample = constant(0.5, 44_100);
        sample.settings_mut().flags.looping = true;
        let handle = engine.play(&sample, None, 0.0, false, None);
        engine.set_relative_play_speed(handle, 5_000.0).unwrap();

        let mut out = vec![1.0; 512 * 2];
        engine.mix(&mut out, 512);
        assert!(out.iter().all(|&s| s == 0.0));
        assert!(engine.is_valid_voice_handle(handle));
    }

    #[test]
    fn test_inaudible_tick_voice_advances_silently() {
        let engine = engine_with(4);
        let mut sample = constant(0.5, 300);
        sample.settings_mut().flags = SourceFlags {
            looping: true,
            inaudible_tick: true,
            ..SourceFlags::default()
        };
        let silent = SpatialFactors {
            volume: 0.0,
            doppler: 1.0,
        };
        let handle = engine.play_3d(&sample, silent, None, false, None);
        assert!(engine.lock().voices.get(handle).unwrap().flags.inaudible);

        let mut out = vec![1.0; 512 * 2];
        engine.mix(&mut out, 512);
        assert!(out.iter().all(|&s| s == 0.0));
        assert_eq!(engine.get_loop_count(handle), 1);

        // Without ticking the stream is never pulled.
        engine.set_inaudible_behavior(handle, false, false);
        engine.mix(&mut out, 512);
        assert_eq!(engine.get_loop_count(handle), 1);
    }

    fn nested_buses(engine: &Engine, depth: usize) -> Vec<Bus> {
        let buses: Vec<Bus> = (0..depth).map(|_| Bus::new()).collect();
        assert!(engine.play(&buses[0], None, 0.0, false, None).is_valid());
        for pair in buses.windows(2) {
            assert!(pair[0].play(engine, &pair[1], None, 0.0, false).is_valid());
        }
        buses
    }

    fn peak_after_two_mixes(engine: &Engine) -> f32 {
        let mut out = vec![0.0; 512 * 2];
        engine.mix(&mut out, 512);
        engine.mix(&mut out, 512);
        out.iter().fold(0.0f32, |peak, s| peak.max(s.abs()))
    }

    #[test]
    fn test_bus_nesting_at_depth_limit_is_mixed() {
        let engine = engine_with(32);
        let buses = nested_buses(&engine, MAX_BUS_DEPTH);
        let sample = constant(0.5, 44_100);
        let leaf = buses.last().unwrap();
        assert!(leaf.play(&engine, &sample, None, 0.0, false).is_valid());

        assert!(peak_after_two_mixes(&engine) > 0.0);
        assert!(!engine.lock().depth_warned);
    }

    #[test]
    fn test_bus_nesting_past_depth_limit_is_silent() {
        let engine = engine_with(32);
        let buses = nested_buses(&engine, MAX_BUS_DEPTH + 1);
        let sample = constant(0.5, 44_100);
        let leaf = buses.last().unwrap();
        assert!(leaf.play(&engine, &sample, None, 0.0, false).is_valid());

        assert_eq!(peak_after_two_mixes(&engine), 0.0);
        assert!(engine.lock().depth_warned);
    }

    #[test]
    fn test_finished_voice_is_stopped() {
        let engine = engine_with(4);
        let sample = constant(0.25, 100);
        let handle = engine.play(&sample, None, 0.0, false, None);

        let mut out = vec![0.0; 512 * 2];
        engine.mix(&mut out, 512);
        assert!(!engine.is_valid_voice_handle(handle));
    }

    #[test]
    fn test_disable_autostop_keeps_voice() {
        let engine = engine_with(4);
        let mut sample = constant(0.25, 100);
        sample.settings_mut().flags = SourceFlags {
            disable_autostop: true,
            ..SourceFlags::default()
        };
        let handle = engine.play(&sample, None, 0.0, false, None);

        let mut out = vec![0.0; 512 * 2];
        engine.mix(&mut out, 512);
        assert!(engine.is_valid_voice_handle(handle));
    }

    #[test]
    fn test_mix_without_voices_is_silent() {
        let engine = engine_with(4);
        let mut out = vec![1.0; 256 * 2];
        engine.mix(&mut out, 256);
        assert!(out.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_start_delay_zeroes_leading_samples() {
        let engine = engine_with(4);
        let sample = constant(0.5, 44_100);
        let handle = engine.play(&sample, None, -1.0, true, None);
        engine.set_delay_samples(handle, 100);
        engine.set_pause(handle, false);

        let mut out = vec![0.0; 512 * 2];
        engine.mix(&mut out, 512);
        assert!(out[..100 * 2].iter().all(|&s| s == 0.0));
        assert!(out[110 * 2].abs() > 0.1);
    }

    #[test]
    fn test_large_requests_are_chunked() {
        let engine = engine_with(4);
        let sample = constant(0.5, 44_100);
        engine.play(&sample, None, 0.0, false, None);

        let frames = MIN_SCRATCH_SIZE + 1000;
        let mut out = vec![0.0; frames * 2];
        engine.mix(&mut out, frames);
        assert!(out[(frames - 1) * 2].abs() > 0.1);
    }

    #[test]
    fn test_global_filters_run_in_slot_order() {
        use crate::audio_engine::filter::{Filter, FilterInstance};
        use std::sync::{Arc, Mutex};

        struct Tag(usize, Arc<Mutex<Vec<usize>>>);
        struct TagInstance(usize, Arc<Mutex<Vec<usize>>>);

        impl Filter for Tag {
            fn create_instance(&self) -> Box<dyn FilterInstance> {
                Box::new(TagInstance(self.0, Arc::clone(&self.1)))
            }
        }

        impl FilterInstance for TagInstance {
            fn apply(&mut self, _: &mut [f32], _: usize, _: usize, _: usize, _: f32, _: f64) {
                self.1.lock().unwrap().push(self.0);
            }
            fn parameter(&self, _: usize) -> f32 {
                0.0
            }
            fn set_parameter(&mut self, _: usize, _: f32) {}
            fn fade_parameter(&mut self, _: usize, _: f32, _: f64, _: f64) {}
            fn oscillate_parameter(&mut self, _: usize, _: f32, _: f32, _: f64, _: f64) {}
        }

        let engine = engine_with(4);
        let log = Arc::new(Mutex::new(Vec::new()));
        engine
            .set_global_filter(5, Some(Arc::new(Tag(5, Arc::clone(&log)))))
            .unwrap();
        engine
            .set_global_filter(1, Some(Arc::new(Tag(1, Arc::clone(&log)))))
            .unwrap();

        engine.mix(&mut vec![0.0; 128], 64);
        assert_eq!(*log.lock().unwrap(), vec![1, 5]);
    }

    #[test]
    fn test_source_settings_reach_voice() {
        let engine = engine_with(4);
        let mut sample = constant(0.5, 1000);
        sample.settings_mut().volume = 0.25;
        let handle = engine.play(&sample, None, 0.0, false, None);
        assert!((engine.get_volume(handle) - 0.25).abs() < 1e-6);
        assert_eq!(sample.settings().id(), engine.lock().voices.get(handle).unwrap().source_id);
    }
}
