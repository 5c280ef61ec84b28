use super::{FrameClassifier, VadDecision};

/// Onset multiplier: RMS energy must exceed `noise_floor * K_ON` to transition silence→speech.
const K_ON: f32 = 3.5;
/// Offset multiplier: once speaking, RMS energy must fall below `noise_floor * K_OFF` to
/// transition speech→silence. `K_OFF < K_ON` gives the classifier hysteresis so energy
/// hovering near the floor doesn't chatter between states.
const K_OFF: f32 = 2.0;
/// Exponential-average weight applied to the noise floor on silence frames only.
const NOISE_FLOOR_ALPHA: f32 = 0.05;
const MIN_NOISE_FLOOR: f32 = 1e-4;
/// A frame whose high-pass energy is below this fraction of its total energy is treated as
/// low-frequency-dominant (hum, HVAC rumble) rather than speech.
const LOW_FREQ_DOMINANT_RATIO: f32 = 0.15;

/// Model-free VAD: RMS energy against an adaptive noise floor, with a one-pole high-pass
/// filter standing in for the spectral-flux check (speech carries energy above ~300 Hz;
/// sustained low-frequency rumble does not). Allocation-free per frame after construction.
pub struct EnergyVad {
    noise_floor: f32,
    speaking: bool,
    prev_sample: f32,
}

impl EnergyVad {
    pub fn new() -> Self {
        Self {
            noise_floor: MIN_NOISE_FLOOR,
            speaking: false,
            prev_sample: 0.0,
        }
    }
}

impl Default for EnergyVad {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameClassifier for EnergyVad {
    fn classify_frame(&mut self, mono_frame: &[f32]) -> VadDecision {
        if mono_frame.is_empty() {
            return VadDecision {
                is_speech: false,
                confidence: 0.0,
            };
        }

        let n = mono_frame.len() as f32;
        let mut sum_sq = 0f32;
        let mut hp_sum_sq = 0f32;
        let mut prev = self.prev_sample;
        for &s in mono_frame {
            sum_sq += s * s;
            let hp = s - prev;
            hp_sum_sq += hp * hp;
            prev = s;
        }
        self.prev_sample = prev;

        let rms = (sum_sq / n).sqrt();
        let hp_rms = (hp_sum_sq / n).sqrt();
        let low_freq_dominant = rms > 0.0 && hp_rms < rms * LOW_FREQ_DOMINANT_RATIO;

        let threshold = self.noise_floor * if self.speaking { K_OFF } else { K_ON };
        let is_speech = rms > threshold && !low_freq_dominant;

        if !is_speech {
            self.noise_floor = (self.noise_floor * (1.0 - NOISE_FLOOR_ALPHA) + rms * NOISE_FLOOR_ALPHA)
                .max(MIN_NOISE_FLOOR);
        }
        self.speaking = is_speech;

        let confidence = (rms / (self.noise_floor * K_ON).max(MIN_NOISE_FLOOR)).clamp(0.0, 1.0);
        VadDecision {
            is_speech,
            confidence,
        }
    }

    fn reset(&mut self) {
        self.noise_floor = MIN_NOISE_FLOOR;
        self.speaking = false;
        self.prev_sample = 0.0;
    }
}
