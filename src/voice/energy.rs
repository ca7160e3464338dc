/// Weight of the previous smoothed value (30% new sample per frame).
pub const RMS_SMOOTHING: f32 = 0.7;
/// Weight of the new peak when the envelope rises.
const MAX_ATTACK: f32 = 0.9;
const INITIAL_MAX_ENERGY: f32 = 0.1;
const INITIAL_MIN_ENERGY: f32 = 0.01;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct EnergyReading {
    /// Instantaneous RMS of the frame.
    pub raw: f32,
    /// Exponentially smoothed RMS; what the VAD sees.
    pub smoothed: f32,
    /// `smoothed` mapped into the current min/max envelope, floored at 0.
    pub normalized: f32,
}

#[derive(Debug, Clone)]
pub struct EnergyCalculator {
    smoothed_rms: f32,
    max_energy: f32,
    min_energy: f32,
}

impl EnergyCalculator {
    pub fn new() -> Self {
        Self {
            smoothed_rms: 0.0,
            max_energy: INITIAL_MAX_ENERGY,
            min_energy: INITIAL_MIN_ENERGY,
        }
    }

    /// Measure one frame and fold it into the smoothed state.
    pub fn calculate(&mut self, samples: &[f32]) -> EnergyReading {
        let raw = rms(samples);

        // The envelope only ever rises.
        if raw > self.max_energy {
            self.max_energy = raw * MAX_ATTACK + self.max_energy * (1.0 - MAX_ATTACK);
        }

        self.smoothed_rms = raw * (1.0 - RMS_SMOOTHING) + self.smoothed_rms * RMS_SMOOTHING;

        let span = self.max_energy - self.min_energy;
        let normalized = if span > f32::EPSILON {
            ((self.smoothed_rms - self.min_energy) / span).max(0.0)
        } else {
            0.0
        };

        EnergyReading {
            raw,
            smoothed: self.smoothed_rms,
            normalized,
        }
    }

    pub fn smoothed(&self) -> f32 {
        self.smoothed_rms
    }

    pub fn max_energy(&self) -> f32 {
        self.max_energy
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

impl Default for EnergyCalculator {
    fn default() -> Self {
        Self::new()
    }
}

/// Root-mean-square of `samples`; 0 for an empty slice.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f32 = samples.iter().map(|s| s * s).sum();
    (sum_sq / samples.len() as f32).sqrt()
}
