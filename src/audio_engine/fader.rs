//! Time-driven scalar scheduler used for fades, oscillation and one-shot
//! pause/stop timers.

use std::f64::consts::TAU;

/// Current mode of a [`Fader`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FaderState {
    /// Not running; the owner keeps its own value.
    #[default]
    Disabled,
    /// Linear ramp from `from` to `to`.
    Ramp,
    /// Sine oscillation between `from` and `to`.
    Lfo,
    /// A ramp that has passed its end. Consumed by [`Fader::take_finished`].
    Inactive,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Fader {
    state: FaderState,
    from: f32,
    to: f32,
    delta: f32,
    current: f32,
    start_time: f64,
    end_time: f64,
    time: f64,
    lfo_rate: f64,
}

impl Fader {
    /// Starts a ramp from `from` to `to` lasting `time` seconds.
    pub fn set(&mut self, from: f32, to: f32, time: f64, start_time: f64) {
        self.state = FaderState::Ramp;
        self.current = from;
        self.from = from;
        self.to = to;
        self.delta = to - from;
        self.time = time;
        self.start_time = start_time;
        self.end_time = start_time + time;
    }

    /// Starts an oscillation between `from` and `to` with period `time`.
    pub fn set_lfo(&mut self, from: f32, to: f32, time: f64, start_time: f64) {
        self.state = FaderState::Lfo;
        self.current = 0.0;
        self.from = from;
        self.to = to;
        self.delta = ((to - from) * 0.5).abs();
        self.time = time;
        self.start_time = start_time;
        self.lfo_rate = if time > 0.0 { TAU / time } else { 0.0 };
    }

    pub fn disable(&mut self) {
        self.state = FaderState::Disabled;
    }

    pub fn state(&self) -> FaderState {
        self.state
    }

    /// `true` while ramping or oscillating.
    pub fn is_active(&self) -> bool {
        matches!(self.state, FaderState::Ramp | FaderState::Lfo)
    }

    /// Evaluates the fader at `now`.
    ///
    /// A ramp evaluated past its end returns `to` and switches to
    /// [`FaderState::Inactive`]. If `now` is earlier than the start time the
    /// ramp restarts from its current value over the time it had left.
    pub fn get(&mut self, now: f64) -> f32 {
        if self.state == FaderState::Lfo {
            if self.start_time > now {
                self.start_time = now;
            }
            let t = now - self.start_time;
            return (t * self.lfo_rate).sin() as f32 * self.delta + (self.from + self.delta);
        }

        if self.start_time > now {
            let progress = if self.delta != 0.0 {
                ((self.current - self.from) / self.delta).clamp(0.0, 1.0)
            } else {
                1.0
            };
            self.from = self.current;
            self.start_time = now;
            self.time *= 1.0 - f64::from(progress);
            self.delta = self.to - self.from;
            self.end_time = self.start_time + self.time;
        }

        if now > self.end_time {
            if self.state == FaderState::Ramp {
                self.state = FaderState::Inactive;
            }
            return self.to;
        }

        let t = if self.time > 0.0 {
            ((now - self.start_time) / self.time) as f32
        } else {
            1.0
        };
        self.current = self.from + self.delta * t;
        self.current
    }

    /// Returns `true` exactly once after a ramp has run out, disabling it.
    pub fn take_finished(&mut self) -> bool {
        if self.state == FaderState::Inactive {
            self.state = FaderState::Disabled;
            true
        } else {
            false
        }
    }
}
