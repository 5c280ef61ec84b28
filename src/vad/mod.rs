//! Voice-activity detection: per-frame classification plus end-of-utterance hysteresis.

pub mod adapter;
pub mod energy;

pub use adapter::{EarshotVad, SileroVad, WebRtcVad};
pub use energy::EnergyVad;

use crate::config::VadConfig;

/// Result of classifying one frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VadDecision {
    pub is_speech: bool,
    pub confidence: f32,
}

/// Signal raised by [`UtteranceVad::process`] once enough consecutive silence has elapsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseKind {
    /// Not enough silence has elapsed yet to mean anything.
    None,
    /// Silence below `vad.shortPauseMs`: a breath, not a cut.
    Breath,
    /// Silence at or above `vad.naturalPauseMs`: a true end-of-utterance boundary.
    NaturalPause,
}

/// Per-frame classification capability. `classify_frame` must run in bounded time and be
/// allocation-free per frame once the implementation has warmed up.
pub trait FrameClassifier: Send {
    /// Classifies one 20ms frame, already downmixed to mono and normalized to `[-1.0, 1.0]`.
    fn classify_frame(&mut self, mono_frame: &[f32]) -> VadDecision;
    fn reset(&mut self);
}

/// A variant tag over the available VAD implementations, selected once at processor
/// construction and not swappable mid-run.
pub enum VadVariant {
    Energy(EnergyVad),
    Silero(SileroVad),
    WebRtc(WebRtcVad),
    Earshot(EarshotVad),
}

impl FrameClassifier for VadVariant {
    fn classify_frame(&mut self, mono_frame: &[f32]) -> VadDecision {
        match self {
            VadVariant::Energy(v) => v.classify_frame(mono_frame),
            VadVariant::Silero(v) => v.classify_frame(mono_frame),
            VadVariant::WebRtc(v) => v.classify_frame(mono_frame),
            VadVariant::Earshot(v) => v.classify_frame(mono_frame),
        }
    }

    fn reset(&mut self) {
        match self {
            VadVariant::Energy(v) => v.reset(),
            VadVariant::Silero(v) => v.reset(),
            VadVariant::WebRtc(v) => v.reset(),
            VadVariant::Earshot(v) => v.reset(),
        }
    }
}

/// Drives a [`VadVariant`] and layers end-of-utterance hysteresis on top of its raw
/// per-frame speech/silence decisions: this is the type [`crate::pipeline::buffer::SmartBuffer`]
/// actually holds.
pub struct UtteranceVad {
    classifier: VadVariant,
    natural_pause_ms: u64,
    short_pause_ms: u64,
    frame_ms: u64,
    speaking: bool,
    silence_run_ms: u64,
}

impl UtteranceVad {
    pub fn new(classifier: VadVariant, cfg: VadConfig, frame_ms: u64) -> Self {
        Self {
            classifier,
            natural_pause_ms: cfg.natural_pause_ms,
            short_pause_ms: cfg.short_pause_ms,
            frame_ms,
            speaking: false,
            silence_run_ms: 0,
        }
    }

    /// Classifies one frame and advances the silence-run hysteresis. Returns both the raw
    /// per-frame decision and the derived pause signal.
    pub fn process(&mut self, mono_frame: &[f32]) -> (VadDecision, PauseKind) {
        let decision = self.classifier.classify_frame(mono_frame);
        if decision.is_speech {
            self.speaking = true;
            self.silence_run_ms = 0;
            return (decision, PauseKind::None);
        }

        self.silence_run_ms = self.silence_run_ms.saturating_add(self.frame_ms);
        let pause = if !self.speaking {
            PauseKind::None
        } else if self.silence_run_ms >= self.natural_pause_ms {
            self.speaking = false;
            PauseKind::NaturalPause
        } else if self.silence_run_ms >= self.short_pause_ms {
            PauseKind::Breath
        } else {
            PauseKind::None
        };
        (decision, pause)
    }

    pub fn is_speaking(&self) -> bool {
        self.speaking
    }

    pub fn reset(&mut self) {
        self.classifier.reset();
        self.speaking = false;
        self.silence_run_ms = 0;
    }
}
