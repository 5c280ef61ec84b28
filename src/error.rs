use thiserror::Error;

/// The single error type returned by every fallible operation in this crate.
///
/// Errors are always attributed to the segment, speaker queue, or subsystem that raised
/// them; nothing here is allowed to propagate to unrelated segments or speakers.
#[derive(Debug, Error, Clone)]
pub enum RibbleWhisperError {
    /// Raised by builders when construction-time configuration is invalid.
    #[error("Parameter error: {0}")]
    ParameterError(String),

    /// Wraps a whisper-rs failure (model load, state creation, decoding).
    #[error("Whisper error: {0}")]
    WhisperError(String),

    /// A dispatcher queue rejected a segment because it was at capacity.
    #[error("Queue full for user {user_id}")]
    QueueFull { user_id: String },

    /// A worker's per-segment deadline elapsed before the backend returned.
    #[error("Segment {segment_id} timed out before completion")]
    SegmentTimeout { segment_id: u64 },

    /// The transcription backend reported it is not yet ready to accept work.
    #[error("Transcription backend is not ready")]
    BackendNotReady,

    /// A backend error considered retryable under `worker.retries`.
    #[error("Transient backend error: {0}")]
    BackendTransient(String),

    /// A backend error considered terminal; the segment fails without retry.
    #[error("Permanent backend error: {0}")]
    BackendPermanent(String),

    /// `ingest` was called after `stop()` began draining the processor.
    #[error("Processor is shutting down; no new segments are accepted")]
    ShutdownInProgress,
}

impl From<whisper_rs::WhisperError> for RibbleWhisperError {
    fn from(value: whisper_rs::WhisperError) -> Self {
        Self::WhisperError(value.to_string())
    }
}
