//! Waveform and level snapshots for meters and scopes.

use rustfft::FftPlanner;
use rustfft::num_complex::Complex;

use crate::audio_engine::constants::{MAX_CHANNELS, VISUALIZATION_WAVE_SIZE};

/// Size of the FFT run over a zero-padded wave snapshot.
const FFT_SIZE: usize = VISUALIZATION_WAVE_SIZE * 2;

/// Last captured downmixed waveform and per-channel peak levels.
#[derive(Debug, Clone, Copy)]
pub struct Visualization {
    pub wave: [f32; VISUALIZATION_WAVE_SIZE],
    pub channel_volume: [f32; MAX_CHANNELS],
}

impl Default for Visualization {
    fn default() -> Self {
        Self {
            wave: [0.0; VISUALIZATION_WAVE_SIZE],
            channel_volume: [0.0; MAX_CHANNELS],
        }
    }
}

impl Visualization {
    /// Captures the first 256 frames of a planar buffer.
    ///
    /// Buffers shorter than the snapshot wrap around.
    pub fn capture(&mut self, buffer: &[f32], samples: usize, stride: usize, channels: usize) {
        self.channel_volume = [0.0; MAX_CHANNELS];
        if samples == 0 {
            self.wave = [0.0; VISUALIZATION_WAVE_SIZE];
            return;
        }
        for (i, out) in self.wave.iter_mut().enumerate() {
            let frame = i % samples;
            *out = 0.0;
            for ch in 0..channels {
                let sample = buffer[ch * stride + frame];
                self.channel_volume[ch] = self.channel_volume[ch].max(sample.abs());
                *out += sample;
            }
        }
    }

    /// Magnitude spectrum of the wave snapshot, 256 bins.
    pub fn spectrum(&self) -> [f32; VISUALIZATION_WAVE_SIZE] {
        let mut planner = FftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(FFT_SIZE);

        let mut bins = vec![Complex::new(0.0, 0.0); FFT_SIZE];
        for (bin, &sample) in bins.iter_mut().zip(&self.wave) {
            bin.re = sample;
        }
        fft.process(&mut bins);

        let mut out = [0.0; VISUALIZATION_WAVE_SIZE];
        for (magnitude, bin) in out.iter_mut().zip(&bins) {
            *magnitude = bin.norm();
        }
        out
    }
}
