//! Three-band equalizer filter.
//!
//! Splits the signal with Butterworth crossovers at 380 Hz and 2.3 kHz and
//! applies a gain in dB to each band. Parameters: `Wet`, `Low`, `Mid`, `High`.

use std::f32::consts::PI;

use crate::audio_engine::constants::MAX_CHANNELS;
use crate::audio_engine::filter::{Filter, FilterInstance, FilterParamType, FilterParams};

const LOW_MID_CROSSOVER_HZ: f32 = 380.0;
const MID_HIGH_CROSSOVER_HZ: f32 = 2_300.0;

const BUTTERWORTH_Q: f32 = 0.70710677;

/// Lowest band gain in dB; at or below it the band is muted.
pub const EQ_DB_MIN: f32 = -12.0;

/// Highest band gain in dB.
pub const EQ_DB_MAX: f32 = 12.0;

pub const PARAM_WET: usize = 0;
pub const PARAM_LOW: usize = 1;
pub const PARAM_MID: usize = 2;
pub const PARAM_HIGH: usize = 3;

const PARAM_NAMES: [&str; 4] = ["Wet", "Low", "Mid", "High"];

#[derive(Debug, Clone, Copy)]
struct BiquadCoeffs {
    b0: f32,
    b1: f32,
    b2: f32,
    a1: f32,
    a2: f32,
}

impl BiquadCoeffs {
    const IDENTITY: Self = Self {
        b0: 1.0,
        b1: 0.0,
        b2: 0.0,
        a1: 0.0,
        a2: 0.0,
    };

    fn normalized(b: [f32; 3], a: [f32; 3]) -> Self {
        if !a[0].is_finite() || a[0].abs() < 1e-12 {
            return Self::IDENTITY;
        }
        let inv = 1.0 / a[0];
        let coeffs = Self {
            b0: b[0] * inv,
            b1: b[1] * inv,
            b2: b[2] * inv,
            a1: a[1] * inv,
            a2: a[2] * inv,
        };
        let finite = [coeffs.b0, coeffs.b1, coeffs.b2, coeffs.a1, coeffs.a2]
            .iter()
            .all(|v| v.is_finite());
        if finite { coeffs } else { Self::IDENTITY }
    }

    /// Butterworth low-pass (`high_pass == false`) or high-pass section.
    fn butterworth(sample_rate: f32, freq_hz: f32, high_pass: bool) -> Self {
        let nyquist_guard = (sample_rate * 0.45).max(1.0);
        let freq_hz = freq_hz.clamp(1.0, nyquist_guard);
        let w0 = 2.0 * PI * freq_hz / sample_rate;
        let (sin_w0, cos_w0) = w0.sin_cos();
        let alpha = sin_w0 / (2.0 * BUTTERWORTH_Q);

        let b = if high_pass {
            [(1.0 + cos_w0) * 0.5, -(1.0 + cos_w0), (1.0 + cos_w0) * 0.5]
        } else {
            [(1.0 - cos_w0) * 0.5, 1.0 - cos_w0, (1.0 - cos_w0) * 0.5]
        };
        Self::normalized(b, [1.0 + alpha, -2.0 * cos_w0, 1.0 - alpha])
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct BiquadState {
    z1: f32,
    z2: f32,
}

impl BiquadState {
    #[inline]
    fn process(&mut self, c: &BiquadCoeffs, x: f32) -> f32 {
        let y = c.b0 * x + self.z1;
        self.z1 = c.b1 * x - c.a1 * y + self.z2;
        self.z2 = c.b2 * x - c.a2 * y;
        y
    }
}

fn db_to_gain(db: f32) -> f32 {
    if !db.is_finite() {
        1.0
    } else if db <= EQ_DB_MIN {
        0.0
    } else {
        10.0_f32.powf(db / 20.0)
    }
}

/// Band splitter state for one channel: two cascaded sections per crossover.
#[derive(Debug, Clone, Copy, Default)]
struct BandState {
    low: [BiquadState; 2],
    high: [BiquadState; 2],
}

/// Three-band equalizer template.
#[derive(Debug, Clone, Copy, Default)]
pub struct Eq3Filter {
    pub low_db: f32,
    pub mid_db: f32,
    pub high_db: f32,
}

impl Eq3Filter {
    pub fn new(low_db: f32, mid_db: f32, high_db: f32) -> Self {
        Self {
            low_db,
            mid_db,
            high_db,
        }
    }
}

impl Filter for Eq3Filter {
    fn param_count(&self) -> usize {
        PARAM_NAMES.len()
    }

    fn param_name(&self, index: usize) -> &str {
        PARAM_NAMES.get(index).copied().unwrap_or("")
    }

    fn param_type(&self, _index: usize) -> FilterParamType {
        FilterParamType::Float
    }

    fn param_min(&self, index: usize) -> f32 {
        if index == PARAM_WET { 0.0 } else { EQ_DB_MIN }
    }

    fn param_max(&self, index: usize) -> f32 {
        if index == PARAM_WET { 1.0 } else { EQ_DB_MAX }
    }

    fn create_instance(&self) -> Box<dyn FilterInstance> {
        Box::new(Eq3Instance {
            params: FilterParams::new(&[1.0, self.low_db, self.mid_db, self.high_db]),
            low: BiquadCoeffs::IDENTITY,
            high: BiquadCoeffs::IDENTITY,
            gains: [1.0; 3],
            sample_rate: 0.0,
            states: [BandState::default(); MAX_CHANNELS],
        })
    }
}

struct Eq3Instance {
    params: FilterParams,
    low: BiquadCoeffs,
    high: BiquadCoeffs,
    gains: [f32; 3],
    sample_rate: f32,
    states: [BandState; MAX_CHANNELS],
}

impl Eq3Instance {
    fn recompute(&mut self, sample_rate: f32) {
        if sample_rate.is_finite() && sample_rate > 0.0 {
            self.low = BiquadCoeffs::butterworth(sample_rate, LOW_MID_CROSSOVER_HZ, false);
            self.high = BiquadCoeffs::butterworth(sample_rate, MID_HIGH_CROSSOVER_HZ, true);
        } else {
            self.low = BiquadCoeffs::IDENTITY;
            self.high = BiquadCoeffs::IDENTITY;
        }
        self.gains = [
            db_to_gain(self.params.get(PARAM_LOW)),
            db_to_gain(self.params.get(PARAM_MID)),
            db_to_gain(self.params.get(PARAM_HIGH)),
        ];
        self.sample_rate = sample_rate;
    }
}

impl FilterInstance for Eq3Instance {
    fn apply(
        &mut self,
        buffer: &mut [f32],
        samples: usize,
        stride: usize,
        channels: usize,
        sample_rate: f32,
        time: f64,
    ) {
        if self.params.update(time) || sample_rate != self.sample_rate {
            self.recompute(sample_rate);
        }
        let wet = self.params.get(PARAM_WET);
        let [low_gain, mid_gain, high_gain] = self.gains;

        for (ch, state) in self.states.iter_mut().enumerate().take(channels) {
            for x in &mut buffer[ch * stride..ch * stride + samples] {
                let mut low = *x;
                for section in &mut state.low {
                    low = section.process(&self.low, low);
                }
                let mut high = *x;
                for section in &mut state.high {
                    high = section.process(&self.high, high);
                }
                let mid = *x - low - high;
                let y = low * low_gain + mid * mid_gain + high * high_gain;
                *x += (y - *x) * wet;
            }
        }
    }

    fn parameter(&self, index: usize) -> f32 {
        self.params.get(index)
    }

    fn set_parameter(&mut self, index: usize, value: f32) {
        self.params.set(index, value);
    }

    fn fade_parameter(&mut self, index: usize, to: f32, time: f64, now: f64) {
        self.params.fade(index, to, time, now);
    }

    fn oscillate_parameter(&mut self, index: usize, from: f32, to: f32, time: f64, now: f64) {
        self.params.oscillate(index, from, to, time, now);
    }
}
