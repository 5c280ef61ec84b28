//! Thin [`FrameClassifier`] adapters over the crate's existing neural/energy VAD backends.
//!
//! Each upstream crate exposes a per-frame speech *probability*, not the speech/silence +
//! end-of-utterance decision this pipeline needs; these wrappers do the probability→decision
//! thresholding and the 48kHz→16kHz downmix the upstream models expect, so
//! [`super::UtteranceVad`] can drive any of them identically.

use super::{FrameClassifier, VadDecision};

/// Naive 48kHz → 16kHz decimation (every third sample). Good enough to feed a VAD's speech
/// probability estimate; this crate does not resample for transcription quality, only for
/// voice-activity classification.
fn decimate_3x(mono_48k: &[f32], out: &mut Vec<i16>) {
    out.clear();
    out.extend(
        mono_48k
            .iter()
            .step_by(3)
            .map(|&s| (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16),
    );
}

const SPEECH_PROBABILITY_THRESHOLD: f32 = 0.5;

/// Adapter over `voice_activity_detector`'s Silero-based classifier.
pub struct SileroVad {
    detector: voice_activity_detector::VoiceActivityDetector,
    scratch: Vec<i16>,
}

impl SileroVad {
    pub fn try_new() -> Result<Self, crate::error::RibbleWhisperError> {
        let detector = voice_activity_detector::VoiceActivityDetector::builder()
            .sample_rate(16_000)
            .chunk_size(320usize)
            .build()
            .map_err(|e| {
                crate::error::RibbleWhisperError::ParameterError(format!(
                    "failed to build Silero VAD: {e}"
                ))
            })?;
        Ok(Self {
            detector,
            scratch: Vec::with_capacity(320),
        })
    }
}

impl FrameClassifier for SileroVad {
    fn classify_frame(&mut self, mono_frame: &[f32]) -> VadDecision {
        decimate_3x(mono_frame, &mut self.scratch);
        let probability = self.detector.predict(self.scratch.iter().copied());
        VadDecision {
            is_speech: probability >= SPEECH_PROBABILITY_THRESHOLD,
            confidence: probability,
        }
    }

    fn reset(&mut self) {
        self.detector.reset();
    }
}

/// Adapter over `webrtc-vad`'s energy-based classifier.
pub struct WebRtcVad {
    vad: webrtc_vad::Vad,
    scratch: Vec<i16>,
}

impl WebRtcVad {
    pub fn try_new() -> Result<Self, crate::error::RibbleWhisperError> {
        let mut vad = webrtc_vad::Vad::new_with_rate(webrtc_vad::SampleRate::Rate16kHz);
        vad.set_mode(webrtc_vad::VadMode::Aggressive);
        Ok(Self {
            vad,
            scratch: Vec::with_capacity(320),
        })
    }
}

impl FrameClassifier for WebRtcVad {
    fn classify_frame(&mut self, mono_frame: &[f32]) -> VadDecision {
        decimate_3x(mono_frame, &mut self.scratch);
        let is_speech = self
            .vad
            .is_voice_segment(&self.scratch)
            .unwrap_or(false);
        VadDecision {
            is_speech,
            confidence: if is_speech { 1.0 } else { 0.0 },
        }
    }

    fn reset(&mut self) {
        // webrtc-vad is stateless per call; nothing to reset.
    }
}

/// Adapter over `earshot`'s WebRTC-derived classifier.
pub struct EarshotVad {
    vad: earshot::VoiceActivityDetector,
    scratch: Vec<i16>,
}

impl EarshotVad {
    pub fn try_new() -> Result<Self, crate::error::RibbleWhisperError> {
        let vad = earshot::VoiceActivityDetector::new(earshot::VadMode::Aggressive);
        Ok(Self {
            vad,
            scratch: Vec::with_capacity(320),
        })
    }
}

impl FrameClassifier for EarshotVad {
    fn classify_frame(&mut self, mono_frame: &[f32]) -> VadDecision {
        decimate_3x(mono_frame, &mut self.scratch);
        let is_speech = self
            .vad
            .predict_16khz(&self.scratch)
            .unwrap_or(false);
        VadDecision {
            is_speech,
            confidence: if is_speech { 1.0 } else { 0.0 },
        }
    }

    fn reset(&mut self) {
        self.vad.reset();
    }
}
