use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use strum::{Display, IntoStaticStr};

use crate::error::RibbleWhisperError;

pub type SegmentId = u64;

static NEXT_SEGMENT_ID: AtomicU64 = AtomicU64::new(1);

/// Allocates a process-wide unique segment id.
pub fn next_segment_id() -> SegmentId {
    NEXT_SEGMENT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Why a [`Segment`] was cut off from its [`crate::pipeline::buffer::SmartBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoStaticStr)]
pub enum CutReason {
    /// VAD hysteresis detected `vad.naturalPauseMs` of trailing silence.
    #[strum(serialize = "natural-pause")]
    NaturalPause,
    /// The buffer reached `buffer.maxSegmentMs` without a natural pause.
    #[strum(serialize = "buffer-full")]
    BufferFull,
    /// `buffer.forcedCutMs` elapsed since speech last occurred with no new cut.
    #[strum(serialize = "timeout")]
    Timeout,
    /// The processor is shutting down and flushed whatever audio remained.
    #[strum(serialize = "shutdown")]
    Shutdown,
}

impl CutReason {
    /// The event-bus wire form (`audio.segmented`'s `reason` field), e.g. `"natural-pause"`.
    pub fn as_str(self) -> &'static str {
        self.into()
    }
}

/// Dispatch priority. `NaturalPause` cuts jump the queue ahead of forced cuts, since they
/// represent audio a speaker is actively waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Normal = 0,
    High = 1,
}

impl CutReason {
    pub fn base_priority(self) -> Priority {
        match self {
            CutReason::NaturalPause => Priority::High,
            CutReason::BufferFull | CutReason::Timeout | CutReason::Shutdown => Priority::Normal,
        }
    }
}

pub type OnStart = Arc<dyn Fn(SegmentId) + Send + Sync>;
pub type OnComplete = Arc<dyn Fn(SegmentId, &str) + Send + Sync>;
pub type OnError = Arc<dyn Fn(SegmentId, &RibbleWhisperError) + Send + Sync>;

/// One unit of work handed to the [`crate::pipeline::dispatcher::SpeakerDispatcher`]: a cut
/// utterance's audio plus everything a worker needs to transcribe and re-attribute it.
pub struct Segment {
    pub id: SegmentId,
    pub ssrc: u32,
    /// Resolved at enqueue time, but re-resolved against the latest binding at completion
    /// time before the transcript is delivered (§9 — identity-on-append is current-at-completion).
    pub user_id_hint: Arc<str>,
    /// Display name resolved at enqueue time, alongside `user_id_hint`.
    pub display_name_hint: Arc<str>,
    pub pcm: Arc<[i16]>,
    pub duration: Duration,
    pub cut_reason: CutReason,
    pub submitted_at: Instant,
    pub priority: Priority,
    /// Last ≤ 30 normalized tokens of this speaker's previous finalized transcript.
    pub previous_context: Arc<str>,
    pub on_start: Option<OnStart>,
    pub on_complete: Option<OnComplete>,
    pub on_error: Option<OnError>,
}

impl Segment {
    pub fn is_empty_timeout(&self) -> bool {
        matches!(self.cut_reason, CutReason::Timeout) && self.pcm.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_ids_are_monotonic_and_unique() {
        let a = next_segment_id();
        let b = next_segment_id();
        assert!(b > a);
    }

    #[test]
    fn natural_pause_outranks_forced_cuts() {
        assert!(CutReason::NaturalPause.base_priority() > CutReason::BufferFull.base_priority());
        assert!(CutReason::NaturalPause.base_priority() > CutReason::Timeout.base_priority());
        assert!(CutReason::NaturalPause.base_priority() > CutReason::Shutdown.base_priority());
    }
}
