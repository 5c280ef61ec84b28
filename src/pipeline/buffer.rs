use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::audio::AudioRingBuffer;
use crate::config::BufferConfig;
use crate::error::RibbleWhisperError;
use crate::vad::{PauseKind, UtteranceVad};

use super::segment::CutReason;
use super::text::normalize_context;

/// One utterance cut out of a [`SmartBuffer`], waiting to become a [`super::segment::Segment`].
pub struct PendingCut {
    pub pcm: Arc<[i16]>,
    pub duration: Duration,
    pub reason: CutReason,
    pub previous_context: Arc<str>,
}

/// Per-SSRC rolling audio accumulator: a PCM ring, a VAD instance, and the segmentation
/// policy that decides when to cut a ready-to-transcribe utterance off of it (§4.2).
///
/// Cut priority, evaluated on every pushed frame, is: buffer-full, then natural-pause, then
/// silence-timeout. Shutdown flushes are driven separately through [`SmartBuffer::flush`].
pub struct SmartBuffer {
    ssrc: u32,
    ring: AudioRingBuffer<i16>,
    vad: UtteranceVad,
    cfg: BufferConfig,
    /// Timestamp of the last frame the VAD classified as speech, or the last cut if none
    /// has occurred yet. Drives the forced-timeout check (§4.2 step 4), which is phrased in
    /// terms of "speech last occurred", not "no speech since the last cut".
    last_speech_at: Instant,
    previous_context: Arc<str>,
}

impl SmartBuffer {
    pub fn new(
        ssrc: u32,
        vad: UtteranceVad,
        cfg: BufferConfig,
        sample_rate: u32,
        now: Instant,
    ) -> Result<Self, RibbleWhisperError> {
        let ring = AudioRingBuffer::new(
            (cfg.max_segment_ms + cfg.overlap_ms) as usize,
            sample_rate as usize,
        )?;
        Ok(Self {
            ssrc,
            ring,
            vad,
            cfg,
            last_speech_at: now,
            previous_context: Arc::from(""),
        })
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    /// Audio currently accumulated since the last cut, in milliseconds. Drives
    /// `audio.buffering` progress events.
    pub fn accumulated_ms(&self) -> u64 {
        self.ring.get_audio_length_ms() as u64
    }

    /// Whether the VAD currently considers this SSRC mid-utterance.
    pub fn is_speaking(&self) -> bool {
        self.vad.is_speaking()
    }

    /// Accumulates one frame's already-downmixed PCM and advances the cut policy. `mono_i16`
    /// is stored in the ring; `mono_f32` drives the VAD. Returns a cut if this frame
    /// triggered one.
    pub fn push_frame(
        &mut self,
        mono_i16: &[i16],
        mono_f32: &[f32],
        now: Instant,
    ) -> Option<PendingCut> {
        self.ring.push_audio(mono_i16);
        let (decision, pause) = self.vad.process(mono_f32);
        if decision.is_speech {
            self.last_speech_at = now;
        }

        let accumulated_ms = self.ring.get_audio_length_ms() as u64;

        if accumulated_ms >= self.cfg.max_segment_ms {
            return Some(self.cut(CutReason::BufferFull, now));
        }
        if pause == PauseKind::NaturalPause && accumulated_ms >= self.cfg.min_segment_ms {
            return Some(self.cut(CutReason::NaturalPause, now));
        }
        self.check_forced_timeout(now)
    }

    /// Evaluates the forced-timeout rule (§4.2 step 4) on its own, independent of frame
    /// arrival: speech last occurred `buffer.forcedCutMs` ago or more, and the buffer holds
    /// some audio. The host calls this periodically so a speaker who simply stops sending
    /// frames (rather than sending silence) still gets cut loose (scenario B). Audio below
    /// `buffer.minSegmentMs` is discarded rather than emitted, the same as `flush` does for
    /// shutdown (§8 testable property 2 admits no exception for "timeout").
    pub fn check_forced_timeout(&mut self, now: Instant) -> Option<PendingCut> {
        let accumulated_ms = self.ring.get_audio_length_ms() as u64;
        if accumulated_ms == 0 {
            return None;
        }
        let idle_ms = now.duration_since(self.last_speech_at).as_millis() as u64;
        if idle_ms < self.cfg.forced_cut_ms {
            return None;
        }
        if accumulated_ms < self.cfg.min_segment_ms {
            // Too little audio to be worth transcribing; discard it and reset the idle
            // clock so this doesn't refire on every subsequent sweep.
            self.ring.clear();
            self.vad.reset();
            self.last_speech_at = now;
            return None;
        }
        Some(self.cut(CutReason::Timeout, now))
    }

    /// Unconditionally cuts whatever audio remains, for processor shutdown. Discards
    /// (rather than emits) audio below `buffer.minSegmentMs`. Returns `None` if there is
    /// nothing to flush.
    pub fn flush(&mut self, now: Instant) -> Option<PendingCut> {
        let accumulated_ms = self.ring.get_audio_length_ms() as u64;
        if accumulated_ms == 0 {
            return None;
        }
        if accumulated_ms < self.cfg.min_segment_ms {
            self.ring.clear();
            return None;
        }
        Some(self.cut(CutReason::Shutdown, now))
    }

    /// Records a finalized transcript as this speaker's forward context, normalized and
    /// capped to the last 30 tokens (§4.2).
    pub fn update_context(&mut self, finalized_text: &str) {
        self.previous_context = Arc::from(normalize_context(finalized_text));
    }

    fn cut(&mut self, reason: CutReason, now: Instant) -> PendingCut {
        let pcm = self.ring.read(0);
        let duration_ms = self.ring.get_audio_length_ms() as u64;
        self.ring.clear_from_back_retain_ms(self.cfg.overlap_ms as usize);
        self.vad.reset();
        self.last_speech_at = now;
        PendingCut {
            pcm: Arc::from(pcm),
            duration: Duration::from_millis(duration_ms),
            reason,
            previous_context: self.previous_context.clone(),
        }
    }
}
