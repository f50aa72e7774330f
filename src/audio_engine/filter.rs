//! Filter contract and parameter bookkeeping shared by filter implementations.

use crate::audio_engine::fader::Fader;

/// How a filter parameter should be presented and quantized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FilterParamType {
    #[default]
    Float,
    Int,
    Bool,
}

/// A filter template. Each voice or global slot gets its own instance.
///
/// The default metadata describes a single `Wet` parameter in `[0, 1]`.
pub trait Filter: Send + Sync {
    fn param_count(&self) -> usize {
        1
    }

    fn param_name(&self, _index: usize) -> &str {
        "Wet"
    }

    fn param_type(&self, _index: usize) -> FilterParamType {
        FilterParamType::Float
    }

    fn param_min(&self, _index: usize) -> f32 {
        0.0
    }

    fn param_max(&self, _index: usize) -> f32 {
        1.0
    }

    fn create_instance(&self) -> Box<dyn FilterInstance>;
}

/// Stateful per-stream filter.
pub trait FilterInstance: Send {
    /// Processes `samples` frames of planar audio in place.
    ///
    /// Channel `c` starts at `c * stride`. `time` is the owning stream's time
    /// in seconds, used to advance parameter faders.
    fn apply(
        &mut self,
        buffer: &mut [f32],
        samples: usize,
        stride: usize,
        channels: usize,
        sample_rate: f32,
        time: f64,
    );

    fn parameter(&self, index: usize) -> f32;

    fn set_parameter(&mut self, index: usize, value: f32);

    fn fade_parameter(&mut self, index: usize, to: f32, time: f64, now: f64);

    fn oscillate_parameter(&mut self, index: usize, from: f32, to: f32, time: f64, now: f64);
}

/// Parameter values with one fader each.
///
/// Out-of-range indices are ignored.
#[derive(Debug, Clone)]
pub struct FilterParams {
    values: Vec<f32>,
    faders: Vec<Fader>,
    changed: bool,
}

impl FilterParams {
    pub fn new(defaults: &[f32]) -> Self {
        Self {
            values: defaults.to_vec(),
            faders: vec![Fader::default(); defaults.len()],
            changed: true,
        }
    }

    pub fn get(&self, index: usize) -> f32 {
        self.values.get(index).copied().unwrap_or(0.0)
    }

    pub fn set(&mut self, index: usize, value: f32) {
        if let (Some(slot), Some(fader)) = (self.values.get_mut(index), self.faders.get_mut(index)) {
            fader.disable();
            *slot = value;
            self.changed = true;
        }
    }

    pub fn fade(&mut self, index: usize, to: f32, time: f64, now: f64) {
        if let (Some(&from), Some(fader)) = (self.values.get(index), self.faders.get_mut(index)) {
            fader.set(from, to, time, now);
        }
    }

    pub fn oscillate(&mut self, index: usize, from: f32, to: f32, time: f64, now: f64) {
        if let Some(fader) = self.faders.get_mut(index) {
            fader.set_lfo(from, to, time, now);
        }
    }

    /// Advances running faders to `now`. Returns `true` if any value changed
    /// since the previous call.
    pub fn update(&mut self, now: f64) -> bool {
        for (value, fader) in self.values.iter_mut().zip(self.faders.iter_mut()) {
            if fader.is_active() {
                *value = fader.get(now);
                self.changed = true;
            }
        }
        std::mem::take(&mut self.changed)
    }
}
