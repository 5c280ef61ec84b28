use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use whisper_rs::{FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters};

use crate::error::RibbleWhisperError;

use super::{TranscribeRequest, TranscriptionBackend, NO_SPEECH_SENTINEL, WHISPER_SAMPLE_RATE};

use super::TranscribeOutput;

/// Default [`TranscriptionBackend`] implementation, adapting this crate's existing
/// whisper.cpp integration. One whisper state is shared across workers behind a mutex, since
/// whisper-rs states are not safe to drive concurrently; this is the price of a single-model
/// backend and is invisible to the dispatcher, which only sees the `{transcribe, isReady,
/// close}` contract.
pub struct WhisperTranscriptionBackend {
    context: WhisperContext,
    state: Mutex<()>,
    n_threads: i32,
    ready: AtomicBool,
    closed: AtomicBool,
}

impl WhisperTranscriptionBackend {
    /// Loads a ggml/gguf whisper model from disk.
    pub fn from_file(model_path: impl AsRef<Path>, n_threads: i32) -> Result<Self, RibbleWhisperError> {
        let params = WhisperContextParameters::default();
        let context = WhisperContext::new_with_params(
            &model_path.as_ref().to_string_lossy(),
            params,
        )?;
        Ok(Self {
            context,
            state: Mutex::new(()),
            n_threads,
            ready: AtomicBool::new(true),
            closed: AtomicBool::new(false),
        })
    }

    /// Loads a model already resident in memory.
    pub fn from_buffer(buffer: &[u8], n_threads: i32) -> Result<Self, RibbleWhisperError> {
        let params = WhisperContextParameters::default();
        let context = WhisperContext::new_from_buffer_with_params(buffer, params)?;
        Ok(Self {
            context,
            state: Mutex::new(()),
            n_threads,
            ready: AtomicBool::new(true),
            closed: AtomicBool::new(false),
        })
    }

    /// Naive 48kHz → 16kHz decimation plus int→float normalization. The core hands segments
    /// to the backend at the source PCM rate (default 48kHz mono); whisper.cpp expects
    /// 16kHz, and this crate does not carry a resampler dependency for it (§5).
    fn pcm_i16_to_f32(pcm: &[i16]) -> Vec<f32> {
        pcm.iter()
            .step_by(3)
            .map(|&s| s as f32 / i16::MAX as f32)
            .collect()
    }
}

impl TranscriptionBackend for WhisperTranscriptionBackend {
    fn transcribe(
        &self,
        pcm: &[i16],
        request: TranscribeRequest,
    ) -> Result<TranscribeOutput, RibbleWhisperError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RibbleWhisperError::BackendPermanent(
                "backend has been closed".to_string(),
            ));
        }
        if !self.ready.load(Ordering::Acquire) {
            return Err(RibbleWhisperError::BackendNotReady);
        }

        let started = Instant::now();
        // Whisper state is not `Sync`-safe to drive from multiple threads at once; only one
        // worker may run inference against this backend at a time.
        let _guard = self.state.lock();

        let mut state = self
            .context
            .create_state()
            .map_err(RibbleWhisperError::from)?;

        let mut params = FullParams::new(SamplingStrategy::Greedy { best_of: 1 });
        params.set_n_threads(self.n_threads);
        params.set_translate(false);
        params.set_print_progress(false);
        params.set_print_special(false);
        params.set_print_realtime(false);
        params.set_print_timestamps(false);
        params.set_no_context(false);
        params.set_single_segment(false);

        match request.language.as_deref() {
            Some("auto") | None => params.set_language(Some("auto")),
            Some(lang) => params.set_language(Some(lang)),
        }

        if let Some(context) = request.previous_context.as_deref() {
            if !context.is_empty() {
                params.set_initial_prompt(context);
            }
        }

        let samples = Self::pcm_i16_to_f32(pcm);
        state
            .full(params, &samples)
            .map_err(RibbleWhisperError::from)?;

        let num_segments = state.full_n_segments().map_err(RibbleWhisperError::from)?;
        let mut text = String::new();
        for i in 0..num_segments {
            let segment_text = state
                .full_get_segment_text(i)
                .map_err(RibbleWhisperError::from)?;
            text.push_str(&segment_text);
        }
        let text = text.trim().to_string();

        let (text, confidence) = if text.is_empty() {
            (NO_SPEECH_SENTINEL.to_string(), 0.0)
        } else {
            (text, 1.0)
        };

        Ok(TranscribeOutput {
            text,
            confidence,
            detected_language: request.language.clone(),
            duration: started.elapsed(),
        })
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire) && !self.closed.load(Ordering::Acquire)
    }

    fn close(&self) {
        self.ready.store(false, Ordering::Release);
        self.closed.store(true, Ordering::Release);
    }
}

/// Sample rate whisper.cpp expects PCM to be resampled to before `transcribe` is called.
/// Exposed for hosts that need to resample outside the core (§1 — resampling is not this
/// crate's concern; the voice-channel collaborator or the backend performs it).
pub const fn model_sample_rate() -> f64 {
    WHISPER_SAMPLE_RATE
}

#[cfg(all(test, feature = "_gpu"))]
mod tests {
    // Backend tests that require an actual model file are gated behind `_gpu` the same way
    // the teacher's own `transcriber_tests` are, since CI does not ship model weights.
}
