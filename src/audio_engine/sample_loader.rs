//! Audio file loading and in-memory samples.
//!
//! A [`Sample`] owns decoded audio as one planar buffer shared by every voice
//! that plays it. Files are decoded with Symphonia.

use std::fs::File;
use std::path::Path;
use std::sync::Arc;
use symphonia::core::{
    audio::SampleBuffer as SymphoniaSampleBuffer, codecs::DecoderOptions,
    errors::Error as SymphoniaError, formats::FormatOptions, io::MediaSourceStream,
    meta::MetadataOptions, probe::Hint,
};
use symphonia::default::{get_codecs, get_probe};

use crate::audio_engine::constants::is_supported_channel_count;
use crate::audio_engine::errors::{MixerError, Result, SampleLoadError};
use crate::audio_engine::source::{
    AudioSource, AudioStream, SeekFlags, Seeked, SourceInstance, SourceSettings,
};

/// Interleaved audio as it comes out of the decoder.
#[derive(Debug)]
pub struct DecodedAudio {
    pub channels: usize,
    pub sample_rate: u32,
    pub samples: Vec<f32>,
}

/// Decodes the default track of an audio file to interleaved `f32`.
///
/// # Errors
///
/// - the file cannot be opened
/// - the format is not recognized, or the data is corrupt
/// - the track has no sample rate or channel layout
/// - the channel count is not 1, 2, 4, 6 or 8
pub fn decode_audio_file(path: &Path) -> std::result::Result<DecodedAudio, SampleLoadError> {
    let file = File::open(path)?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let probed = get_probe().format(
        &hint,
        mss,
        &FormatOptions::default(),
        &MetadataOptions::default(),
    )?;
    let mut format = probed.format;

    let track = format
        .default_track()
        .ok_or(SampleLoadError::NoDefaultTrack)?;
    let track_id = track.id;
    let sample_rate = track
        .codec_params
        .sample_rate
        .ok_or(SampleLoadError::MissingSampleRate)?;
    let channels = track
        .codec_params
        .channels
        .ok_or(SampleLoadError::MissingChannels)?
        .count();
    if !is_supported_channel_count(channels) {
        return Err(SampleLoadError::UnsupportedChannels { channels });
    }

    let mut decoder = get_codecs().make(&track.codec_params, &DecoderOptions::default())?;

    let mut samples: Vec<f32> = Vec::new();
    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(err))
                if err.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                break;
            }
            Err(err) => return Err(SampleLoadError::Decode(err)),
        };
        if packet.track_id() != track_id {
            continue;
        }

        let audio_buf = decoder.decode(&packet)?;
        let spec = *audio_buf.spec();
        let duration = audio_buf.capacity() as u64;

        let mut sample_buf = SymphoniaSampleBuffer::<f32>::new(duration, spec);
        sample_buf.copy_interleaved_ref(audio_buf);
        samples.extend_from_slice(sample_buf.samples());
    }

    Ok(DecodedAudio {
        channels,
        sample_rate,
        samples,
    })
}

/// Splits interleaved frames into one contiguous run per channel.
fn deinterleave(interleaved: &[f32], channels: usize) -> Vec<f32> {
    let frames = interleaved.len() / channels;
    let mut planar = vec![0.0; frames * channels];
    for (i, frame) in interleaved.chunks_exact(channels).enumerate() {
        for (ch, &sample) in frame.iter().enumerate() {
            planar[ch * frames + i] = sample;
        }
    }
    planar
}

/// Decoded audio kept in memory.
pub struct Sample {
    settings: SourceSettings,
    data: Arc<[f32]>,
    channels: usize,
    frames: usize,
    sample_rate: f32,
}

impl Sample {
    /// Wraps planar audio: channel `c` occupies `data[c * frames..(c + 1) * frames]`.
    pub fn from_planar(data: Vec<f32>, channels: usize, sample_rate: f32) -> Result<Self> {
        if !is_supported_channel_count(channels)
            || data.len() % channels != 0
            || !(sample_rate.is_finite() && sample_rate > 0.0)
        {
            return Err(MixerError::InvalidParameter);
        }
        Ok(Self {
            settings: SourceSettings::default(),
            frames: data.len() / channels,
            data: Arc::from(data.into_boxed_slice()),
            channels,
            sample_rate,
        })
    }

    pub fn from_interleaved(data: &[f32], channels: usize, sample_rate: f32) -> Result<Self> {
        if !is_supported_channel_count(channels) {
            return Err(MixerError::InvalidParameter);
        }
        Self::from_planar(deinterleave(data, channels), channels, sample_rate)
    }

    /// Loads and decodes an audio file.
    pub fn load(path: &Path) -> Result<Self> {
        let decoded = decode_audio_file(path).map_err(|err| {
            log::warn!("Failed to load {}: {err}", path.display());
            MixerError::from(err)
        })?;
        log::debug!(
            "Loaded {} ({} ch@{} Hz)",
            path.display(),
            decoded.channels,
            decoded.sample_rate
        );
        Self::from_interleaved(
            &decoded.samples,
            decoded.channels,
            decoded.sample_rate as f32,
        )
    }

    pub fn settings_mut(&mut self) -> &mut SourceSettings {
        &mut self.settings
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn frames(&self) -> usize {
        self.frames
    }

    pub fn sample_rate(&self) -> f32 {
        self.sample_rate
    }

    /// Duration in seconds.
    pub fn length(&self) -> f64 {
        self.frames as f64 / f64::from(self.sample_rate)
    }
}

impl AudioSource for Sample {
    fn settings(&self) -> &SourceSettings {
        &self.settings
    }

    fn create_instance(&self) -> Result<SourceInstance> {
        Ok(SourceInstance::Stream(Box::new(SampleInstance {
            data: Arc::clone(&self.data),
            channels: self.channels,
            frames: self.frames,
            sample_rate: self.sample_rate,
            position: 0,
        })))
    }
}

/// Read cursor over a [`Sample`]'s data.
struct SampleInstance {
    data: Arc<[f32]>,
    channels: usize,
    frames: usize,
    sample_rate: f32,
    position: usize,
}

impl AudioStream for SampleInstance {
    fn channels(&self) -> usize {
        self.channels
    }

    fn sample_rate(&self) -> f32 {
        self.sample_rate
    }

    fn pull(&mut self, buffer: &mut [f32], samples_to_read: usize, channel_stride: usize) -> usize {
        let count = samples_to_read.min(self.frames.saturating_sub(self.position));
        for ch in 0..self.channels {
            let src = ch * self.frames + self.position;
            let dst = ch * channel_stride;
            buffer[dst..dst + count].copy_from_slice(&self.data[src..src + count]);
        }
        self.position += count;
        count
    }

    fn has_ended(&self) -> bool {
        self.position >= self.frames
    }

    fn can_seek(&self) -> bool {
        true
    }

    fn seek(&mut self, position: u64, _scratch: &mut [f32], _flags: SeekFlags) -> Result<Seeked> {
        let target = usize::try_from(position).unwrap_or(usize::MAX);
        let end_of_stream = target >= self.frames;
        self.position = target.min(self.frames);
        Ok(Seeked {
            position: self.position as u64,
            end_of_stream,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    /// Helper function to create a PCM16 WAV file for testing.
    fn write_pcm16_wav(
        path: &Path,
        channels: u16,
        sample_rate_hz: u32,
        samples: &[i16],
    ) -> std::io::Result<()> {
        let bits_per_sample = 16u16;
        let block_align = channels * (bits_per_sample / 8);
        let byte_rate = sample_rate_hz * u32::from(block_align);
        let data_len_bytes = u32::try_from(samples.len() * 2).expect("sample data too large");
        let chunk_size = 36 + data_len_bytes;

        let mut file = File::create(path)?;
        file.write_all(b"RIFF")?;
        file.write_all(&chunk_size.to_le_bytes())?;
        file.write_all(b"WAVE")?;

        file.write_all(b"fmt ")?;
        file.write_all(&16u32.to_le_bytes())?;
        file.write_all(&1u16.to_le_bytes())?; // PCM
        file.write_all(&channels.to_le_bytes())?;
        file.write_all(&sample_rate_hz.to_le_bytes())?;
        file.write_all(&byte_rate.to_le_bytes())?;
        file.write_all(&block_align.to_le_bytes())?;
        file.write_all(&bits_per_sample.to_le_bytes())?;

        file.write_all(b"data")?;
        file.write_all(&data_len_bytes.to_le_bytes())?;
        for sample in samples {
            file.write_all(&sample.to_le_bytes())?;
        }

        Ok(())
    }

    fn pull_all(stream: &mut SourceInstance, frames: usize) -> (Vec<f32>, usize) {
        let SourceInstance::Stream(stream) = stream else {
            panic!("sample instance should be a stream");
        };
        let mut buffer = vec![0.0; frames * 2];
        let read = stream.pull(&mut buffer, frames, frames);
        (buffer, read)
    }

    #[test]
    fn test_decode_wav_to_f32_buffer() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("test.wav");

        let samples = [0i16, 16_384i16, -16_384i16, 32_767i16];
        write_pcm16_wav(&path, 1, 44_100, &samples).unwrap();

        let decoded = decode_audio_file(&path).unwrap();
        assert_eq!(decoded.channels, 1);
        assert_eq!(decoded.sample_rate, 44_100);
        assert_eq!(decoded.samples.len(), samples.len());
        assert!(decoded.samples.iter().all(|s| (-1.0..=1.0).contains(s)));
        assert!((decoded.samples[1] - 0.5).abs() < 1e-3);
    }

    #[test]
    fn test_load_stereo_wav_is_planar() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("stereo.wav");

        // Left is positive, right is negative.
        let samples = [16_384i16, -16_384, 16_384, -16_384, 16_384, -16_384];
        write_pcm16_wav(&path, 2, 22_050, &samples).unwrap();

        let sample = Sample::load(&path).unwrap();
        assert_eq!(sample.channels(), 2);
        assert_eq!(sample.frames(), 3);
        assert!((sample.sample_rate() - 22_050.0).abs() < f32::EPSILON);

        let mut instance = sample.create_instance().unwrap();
        let (buffer, read) = pull_all(&mut instance, 3);
        assert_eq!(read, 3);
        assert!(buffer[..3].iter().all(|&s| s > 0.4));
        assert!(buffer[3..6].iter().all(|&s| s < -0.4));
    }

    #[test]
    fn test_load_missing_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nonexistent.wav");

        assert_eq!(Sample::load(&path).err(), Some(MixerError::FileNotFound));
    }

    #[test]
    fn test_load_garbage_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("garbage.wav");
        std::fs::write(&path, b"definitely not audio").unwrap();

        assert_eq!(Sample::load(&path).err(), Some(MixerError::FileLoadFailed));
    }

    #[test]
    fn test_from_interleaved_splits_channels() {
        let sample = Sample::from_interleaved(&[1.0, -1.0, 2.0, -2.0], 2, 8_000.0).unwrap();
        assert_eq!(&sample.data[..], &[1.0, 2.0, -1.0, -2.0]);
        assert_eq!(
            Sample::from_interleaved(&[0.0; 6], 3, 8_000.0).err(),
            Some(MixerError::InvalidParameter)
        );
    }

    #[test]
    fn test_pull_stops_at_end() {
        let sample = Sample::from_planar(vec![0.25; 10], 1, 8_000.0).unwrap();
        let mut instance = sample.create_instance().unwrap();

        let (_, read) = pull_all(&mut instance, 8);
        assert_eq!(read, 8);
        assert!(!instance.has_ended());
        let (buffer, read) = pull_all(&mut instance, 8);
        assert_eq!(read, 2);
        assert_eq!(&buffer[..2], &[0.25, 0.25]);
        assert!(instance.has_ended());
    }

    #[test]
    fn test_seek_rewinds_and_clamps() {
        let sample = Sample::from_planar(vec![0.0; 10], 1, 8_000.0).unwrap();
        let mut instance = sample.create_instance().unwrap();
        let mut scratch = vec![0.0; 16];

        let seeked = instance.seek(4, &mut scratch, SeekFlags::default()).unwrap();
        assert_eq!(seeked.position, 4);
        assert!(!seeked.end_of_stream);
        assert_eq!(pull_all(&mut instance, 10).1, 6);

        let seeked = instance.seek(25, &mut scratch, SeekFlags::default()).unwrap();
        assert_eq!(seeked.position, 10);
        assert!(seeked.end_of_stream);
        assert!(instance.has_ended());
    }
}
