//! The pluggable transcription-backend capability contract (§6) plus this crate's own
//! whisper.cpp-backed default implementation of it.

pub mod backend;

pub use backend::WhisperTranscriptionBackend;

use std::sync::Arc;
use std::time::Duration;

use crate::error::RibbleWhisperError;

pub const WHISPER_SAMPLE_RATE: f64 = 16_000.0;

/// Sentinel text a backend returns for audio it judged to contain no speech. The core never
/// appends this to the session transcript.
pub const NO_SPEECH_SENTINEL: &str = "[no speech]";

/// Optional hints the core passes along with the raw PCM on every `transcribe` call.
#[derive(Debug, Clone, Default)]
pub struct TranscribeRequest {
    /// Last ≤ 30 normalized tokens of the previous finalized transcript for this SSRC.
    pub previous_context: Option<Arc<str>>,
    /// BCP-47-ish language code, or `None`/`"auto"` for automatic detection.
    pub language: Option<String>,
    /// Trailing overlap audio, offered for backends that prefer audio context over text
    /// context. This crate's own backend does not consume it (§9 — context-text-only).
    pub overlap_audio: Option<Arc<[i16]>>,
}

/// Result of a single `transcribe` call.
#[derive(Debug, Clone)]
pub struct TranscribeOutput {
    pub text: String,
    pub confidence: f32,
    pub detected_language: Option<String>,
    pub duration: Duration,
}

/// The capability contract every transcription backend must implement. The core is
/// agnostic about backend implementation beyond this surface.
pub trait TranscriptionBackend: Send + Sync {
    /// Transcribes one segment's PCM. May block the calling worker; workers run it under a
    /// per-segment timeout (see `crate::pipeline::dispatcher`).
    fn transcribe(
        &self,
        pcm: &[i16],
        request: TranscribeRequest,
    ) -> Result<TranscribeOutput, RibbleWhisperError>;

    /// Whether the backend is ready to accept work (e.g. model loaded).
    fn is_ready(&self) -> bool;

    /// Releases any backend resources. Idempotent.
    fn close(&self);
}
