//! [`AsyncProcessor`]: the façade that owns every other piece of the core (§4.6).
//!
//! It is the single long-lived object a host constructs: it owns the per-SSRC
//! [`SmartBuffer`]s, the [`EventBus`], the [`SpeakerDispatcher`] and its worker pool, and the
//! [`SsrcResolver`]. The host feeds it decoded PCM and channel-lifecycle events through
//! [`AsyncProcessorHandle`] (cheap to clone, safe to hand to the thread that receives audio)
//! and observes finalized transcripts through a [`SessionSink`] attached on the owning
//! [`AsyncProcessor`].

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::config::ProcessorConfig;
use crate::error::RibbleWhisperError;
use crate::pipeline::{
    downmix_to_mono_f32, downmix_to_mono_i16, next_segment_id, CutReason, Event, EventBus, Frame,
    OnComplete, OnError, OnStart, Priority, Segment, SmartBuffer, SpeakerDispatcher, SsrcResolver,
};
use crate::vad::{EnergyVad, UtteranceVad, VadVariant};
use crate::whisper::{TranscriptionBackend, NO_SPEECH_SENTINEL};

/// The frame duration every component in this crate assumes (§3 — 20ms frames).
const FRAME_MS: u64 = 20;

/// How the staged shutdown in [`AsyncProcessor::stop`] actually concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Every buffer flushed and every in-flight/queued segment resolved within
    /// `shutdown.deadlineMs`.
    Graceful,
    /// The deadline elapsed with work still outstanding; workers and the event bus were
    /// torn down regardless.
    Forced,
}

/// Combined, host-facing snapshot of dispatcher and event-bus health (§4.4, §4.3).
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessorMetrics {
    pub active_speakers: usize,
    pub concurrent_peak: usize,
    pub dispatched_total: u64,
    pub completed_total: u64,
    pub dropped_total: u64,
    pub avg_latency_ms: f64,
    pub events_dropped_total: u64,
    pub active_buffers: usize,
}

/// A point-in-time view of one SSRC's [`SmartBuffer`], for `bufferStatuses()` (§4.6).
#[derive(Debug, Clone)]
pub struct BufferStatus {
    pub ssrc: u32,
    pub user_id: Arc<str>,
    pub accumulated_ms: u64,
    pub is_speaking: bool,
}

/// The outbound capability contract to the session collaborator (§6): appended transcripts
/// and the "pending" bookkeeping a UI uses to show an in-progress bubble while a segment is
/// being transcribed. This crate calls it; it never calls back into this crate.
pub trait SessionSink: Send + Sync {
    /// Called on `transcription.started`, before the backend has produced anything.
    fn add_pending(&self, session_id: &str, user_id: &str, display_name: &str, estimated_duration_sec: f32);
    /// Called on completion or failure, always before (or alongside) `append_transcript`.
    fn remove_pending(&self, session_id: &str, user_id: &str);
    /// Called once per successfully transcribed, non-empty segment. `segment_start_time` is
    /// approximate (cut time minus segment duration); this core does not persist it, it only
    /// forwards it for the collaborator's own storage.
    fn append_transcript(
        &self,
        session_id: &str,
        user_id: &str,
        display_name: &str,
        text: &str,
        ssrc: u32,
        segment_start_time: Instant,
        segment_duration: Duration,
    );
}

/// Builder for [`AsyncProcessor`], the sole constructor (§4.6, §1.3), in the same
/// type-changing-builder idiom as this crate's transcriber builders: the backend type is a
/// compile-time parameter (`B`), consistent with §9's "selected at startup; not swappable
/// mid-run". `build()` must be called from inside a Tokio runtime, since it spawns the
/// dispatcher's worker pool and idle-speaker sweeper.
pub struct AsyncProcessorBuilder<B: TranscriptionBackend + 'static> {
    config: ProcessorConfig,
    backend: Option<Arc<B>>,
    vad_factory: Option<Arc<dyn Fn() -> VadVariant + Send + Sync>>,
}

impl<B: TranscriptionBackend + 'static> AsyncProcessorBuilder<B> {
    pub fn new() -> Self {
        Self {
            config: ProcessorConfig::default(),
            backend: None,
            vad_factory: None,
        }
    }

    pub fn with_config(mut self, config: ProcessorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_backend(mut self, backend: Arc<B>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Selects which [`VadVariant`] arm `AsyncProcessor` constructs for every new SSRC
    /// (§9 — a variant tag, chosen once, not per-SSRC-swappable). Defaults to
    /// [`EnergyVad`], the crate's model-free implementation.
    pub fn with_vad_factory<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> VadVariant + Send + Sync + 'static,
    {
        self.vad_factory = Some(Arc::new(factory));
        self
    }

    pub fn build(self) -> Result<(AsyncProcessor, AsyncProcessorHandle), RibbleWhisperError> {
        let backend = self.backend.ok_or_else(|| {
            RibbleWhisperError::ParameterError(
                "Transcription backend missing in AsyncProcessorBuilder.".to_string(),
            )
        })?;
        let vad_factory = self
            .vad_factory
            .unwrap_or_else(|| Arc::new(|| VadVariant::Energy(EnergyVad::new())));
        let backend: Arc<dyn TranscriptionBackend> = backend;

        let event_bus = EventBus::new(self.config.event_bus);
        let dispatcher = SpeakerDispatcher::new(
            self.config.worker,
            self.config.queue,
            backend,
            event_bus.clone(),
        );
        let worker_handles = dispatcher.spawn();
        let resolver = Arc::new(SsrcResolver::new(event_bus.clone()));

        let inner = Arc::new(ProcessorInner {
            config: self.config,
            buffers: RwLock::new(HashMap::new()),
            vad_factory,
            event_bus,
            dispatcher,
            resolver,
            session_sink: RwLock::new(None),
            session_id: RwLock::new(Arc::from("default")),
            shutting_down: AtomicBool::new(false),
            worker_handles: Mutex::new(worker_handles),
        });

        Ok((
            AsyncProcessor {
                inner: inner.clone(),
            },
            AsyncProcessorHandle { inner },
        ))
    }
}

impl<B: TranscriptionBackend + 'static> Default for AsyncProcessorBuilder<B> {
    fn default() -> Self {
        Self::new()
    }
}

struct ProcessorInner {
    config: ProcessorConfig,
    buffers: RwLock<HashMap<u32, Arc<Mutex<SmartBuffer>>>>,
    vad_factory: Arc<dyn Fn() -> VadVariant + Send + Sync>,
    event_bus: Arc<EventBus>,
    dispatcher: Arc<SpeakerDispatcher>,
    resolver: Arc<SsrcResolver>,
    session_sink: RwLock<Option<Arc<dyn SessionSink>>>,
    session_id: RwLock<Arc<str>>,
    shutting_down: AtomicBool,
    worker_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl ProcessorInner {
    fn session_id(&self) -> Arc<str> {
        self.session_id.read().clone()
    }

    fn get_or_create_buffer(
        self: &Arc<Self>,
        ssrc: u32,
        now: Instant,
    ) -> Result<Arc<Mutex<SmartBuffer>>, RibbleWhisperError> {
        if let Some(buf) = self.buffers.read().get(&ssrc) {
            return Ok(buf.clone());
        }
        let mut buffers = self.buffers.write();
        if let Some(buf) = buffers.get(&ssrc) {
            return Ok(buf.clone());
        }
        let vad = UtteranceVad::new((self.vad_factory)(), self.config.vad, FRAME_MS);
        let buffer = Arc::new(Mutex::new(SmartBuffer::new(
            ssrc,
            vad,
            self.config.buffer,
            self.config.sample_rate,
            now,
        )?));
        buffers.insert(ssrc, buffer.clone());
        Ok(buffer)
    }

    /// `onPCMFrame`: the single entry point for decoded audio (§4.6). Never blocks beyond
    /// the bounded per-SSRC buffer lock; drops telemetry rather than audio, per §5.
    fn ingest(self: &Arc<Self>, ssrc: u32, frame: &Frame) -> Result<(), RibbleWhisperError> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(RibbleWhisperError::ShutdownInProgress);
        }
        let now = Instant::now();
        self.resolver
            .register_audio_packet(ssrc, frame.byte_len(), now);

        let mono_i16 = downmix_to_mono_i16(&frame.pcm, self.config.channels);
        let mono_f32 = downmix_to_mono_f32(&frame.pcm, self.config.channels);

        let buffer = self.get_or_create_buffer(ssrc, now)?;
        let (cut, accumulated_ms, is_speaking) = {
            let mut guard = buffer.lock();
            let cut = guard.push_frame(&mono_i16, &mono_f32, now);
            (cut, guard.accumulated_ms(), guard.is_speaking())
        };

        self.event_bus.publish(Event::AudioBuffering {
            ssrc,
            user_id: self.resolver.resolve(ssrc),
            accumulated_ms,
            is_speaking,
        });

        if let Some(cut) = cut {
            self.handle_cut(ssrc, cut);
        }
        Ok(())
    }

    /// Periodic, frame-arrival-independent check for the forced-timeout cut rule (§4.2 step
    /// 4): a speaker who stops sending frames entirely (no silence, nothing) still needs to
    /// be cut loose. Hosts drive this on a timer (see `tests/processor_scenarios.rs` scenario
    /// B); it is not implied by `ingest` alone, since `ingest` only runs when a frame arrives.
    fn sweep_forced_timeouts(self: &Arc<Self>) {
        let now = Instant::now();
        let snapshot: Vec<(u32, Arc<Mutex<SmartBuffer>>)> = self
            .buffers
            .read()
            .iter()
            .map(|(&ssrc, buf)| (ssrc, buf.clone()))
            .collect();
        for (ssrc, buf) in snapshot {
            let cut = buf.lock().check_forced_timeout(now);
            if let Some(cut) = cut {
                self.handle_cut(ssrc, cut);
            }
        }
    }

    fn handle_cut(self: &Arc<Self>, ssrc: u32, cut: crate::pipeline::PendingCut) {
        let user_id = self.resolver.resolve(ssrc);
        let display_name = self.resolver.resolve_display_name(ssrc);
        let segment_id = next_segment_id();
        let submitted_at = Instant::now();
        let segment_start = submitted_at.checked_sub(cut.duration).unwrap_or(submitted_at);
        let priority = cut.reason.base_priority();

        self.event_bus.publish(Event::AudioSegmented {
            segment_id,
            ssrc,
            reason: cut.reason.as_str(),
        });

        let start_inner = self.clone();
        let start_session = self.session_id();
        let start_user = user_id.clone();
        let start_display = display_name.clone();
        let start_duration = cut.duration;
        let on_start: OnStart = Arc::new(move |_segment_id| {
            if let Some(sink) = start_inner.session_sink.read().clone() {
                sink.add_pending(
                    &start_session,
                    &start_user,
                    &start_display,
                    start_duration.as_secs_f32(),
                );
            }
        });

        let complete_inner = self.clone();
        let complete_user_hint = user_id.clone();
        let on_complete: OnComplete = Arc::new(move |_segment_id, text| {
            complete_inner.on_segment_complete(ssrc, &complete_user_hint, text, segment_start, start_duration);
        });

        let error_inner = self.clone();
        let error_user_hint = user_id.clone();
        let on_error: OnError = Arc::new(move |_segment_id, _error| {
            error_inner.on_segment_error(&error_user_hint);
        });

        let segment = Segment {
            id: segment_id,
            ssrc,
            user_id_hint: user_id.clone(),
            display_name_hint: display_name,
            pcm: cut.pcm,
            duration: cut.duration,
            cut_reason: cut.reason,
            submitted_at,
            priority,
            previous_context: cut.previous_context,
            on_start: Some(on_start),
            on_complete: Some(on_complete),
            on_error: Some(on_error),
        };

        // `SpeakerDispatcher::enqueue` already invokes `on_error` and publishes
        // `transcription.failed` on rejection; nothing further to do here on `Err`.
        let _ = self.dispatcher.enqueue(user_id, segment);
    }

    /// Re-resolves the *current* identity for `ssrc` before delivering the transcript, so a
    /// rebind that lands between cut and completion is reflected (§9, §4.6). `user_id_hint`
    /// is the identity `add_pending` used, kept so `remove_pending` pairs with it regardless
    /// of any rebind in between.
    fn on_segment_complete(
        self: &Arc<Self>,
        ssrc: u32,
        user_id_hint: &Arc<str>,
        text: &str,
        segment_start: Instant,
        duration: Duration,
    ) {
        let is_speech = text != NO_SPEECH_SENTINEL && !text.trim().is_empty();
        if is_speech {
            if let Some(buf) = self.buffers.read().get(&ssrc) {
                buf.lock().update_context(text);
            }
        }

        let Some(sink) = self.session_sink.read().clone() else {
            return;
        };
        let session_id = self.session_id();
        sink.remove_pending(&session_id, user_id_hint);
        if is_speech {
            let current_user_id = self.resolver.resolve(ssrc);
            let current_display_name = self.resolver.resolve_display_name(ssrc);
            sink.append_transcript(
                &session_id,
                &current_user_id,
                &current_display_name,
                text,
                ssrc,
                segment_start,
                duration,
            );
        }
    }

    fn on_segment_error(self: &Arc<Self>, user_id_hint: &Arc<str>) {
        let Some(sink) = self.session_sink.read().clone() else {
            return;
        };
        sink.remove_pending(&self.session_id(), user_id_hint);
    }

    fn metrics(&self) -> ProcessorMetrics {
        let dm = self.dispatcher.metrics();
        ProcessorMetrics {
            active_speakers: dm.active_speakers,
            concurrent_peak: dm.concurrent_peak,
            dispatched_total: dm.dispatched_total,
            completed_total: dm.completed_total,
            dropped_total: dm.dropped_total,
            avg_latency_ms: dm.avg_latency_ms,
            events_dropped_total: self.event_bus.dropped_count(),
            active_buffers: self.buffers.read().len(),
        }
    }

    fn buffer_statuses(&self) -> Vec<BufferStatus> {
        self.buffers
            .read()
            .iter()
            .map(|(&ssrc, buf)| {
                let guard = buf.lock();
                BufferStatus {
                    ssrc,
                    user_id: self.resolver.resolve(ssrc),
                    accumulated_ms: guard.accumulated_ms(),
                    is_speaking: guard.is_speaking(),
                }
            })
            .collect()
    }

    /// Staged shutdown body (§4.6 steps 2-5); `stop()` races this against the overall
    /// deadline. Returns whether the dispatcher drain hit its own (shorter) deadline with
    /// work still outstanding.
    async fn run_shutdown_sequence(self: Arc<Self>) -> bool {
        let buffers: Vec<(u32, Arc<Mutex<SmartBuffer>>)> =
            self.buffers.write().drain().collect();
        for (ssrc, buf) in &buffers {
            let cut = buf.lock().flush(Instant::now());
            if let Some(cut) = cut {
                self.handle_cut(*ssrc, cut);
            }
        }

        let drain_deadline =
            Instant::now() + Duration::from_millis(self.config.shutdown.drain_deadline_ms);
        while self.dispatcher.pending_count() > 0 && Instant::now() < drain_deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let forced = self.dispatcher.pending_count() > 0;

        self.dispatcher.shutdown();
        let handles: Vec<JoinHandle<()>> = self.worker_handles.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        self.event_bus.stop();
        forced
    }
}

/// Cheap-to-clone handle for the side of the API the voice-channel collaborator drives:
/// ingesting frames and channel-lifecycle events. Does not expose `stop()` or
/// `attach_session_sink`, which are owned by the single [`AsyncProcessor`] that constructed
/// this handle's sibling.
#[derive(Clone)]
pub struct AsyncProcessorHandle {
    inner: Arc<ProcessorInner>,
}

impl AsyncProcessorHandle {
    /// `onPCMFrame`.
    pub fn ingest(&self, ssrc: u32, frame: &Frame) -> Result<(), RibbleWhisperError> {
        self.inner.ingest(ssrc, frame)
    }

    /// `onSpeakingUpdate`.
    pub fn on_speaking_update(
        &self,
        ssrc: u32,
        user_id: impl Into<Arc<str>>,
        display_name: impl Into<Arc<str>>,
    ) {
        self.inner.resolver.speaking_update(ssrc, user_id, display_name);
    }

    /// `onChannelJoined`. Also becomes the session id used for the session-sink contract,
    /// since one resolver/processor instance is scoped to one channel session.
    pub fn on_channel_joined<I, S1, S2>(&self, channel_id: impl Into<Arc<str>>, expected_users: I)
    where
        I: IntoIterator<Item = (S1, S2)>,
        S1: Into<Arc<str>>,
        S2: Into<Arc<str>>,
    {
        *self.inner.session_id.write() = channel_id.into();
        self.inner.resolver.channel_context(expected_users);
    }

    /// `onChannelLeft`.
    pub fn on_channel_left(&self) {
        self.inner.resolver.reset();
    }

    /// Drives the forced-timeout cut rule for SSRCs that have gone idle without even
    /// sending silence (scenario B in §8). Hosts call this periodically (e.g. every
    /// `buffer.forcedCutMs`); `ingest` alone cannot observe "no frames at all".
    pub fn sweep_forced_timeouts(&self) {
        self.inner.sweep_forced_timeouts();
    }

    pub fn event_bus(&self) -> Arc<EventBus> {
        self.inner.event_bus.clone()
    }

    pub fn metrics(&self) -> ProcessorMetrics {
        self.inner.metrics()
    }

    pub fn buffer_statuses(&self) -> Vec<BufferStatus> {
        self.inner.buffer_statuses()
    }
}

/// Owns the pipeline end to end (§4.6): the long-lived object a host constructs once per
/// voice-channel session and tears down with [`AsyncProcessor::stop`].
pub struct AsyncProcessor {
    inner: Arc<ProcessorInner>,
}

impl AsyncProcessor {
    /// Registers the session collaborator that receives finalized transcripts and
    /// pending-state notifications (§6). Replaces any previously attached sink.
    pub fn attach_session_sink(&self, sink: Arc<dyn SessionSink>) {
        *self.inner.session_sink.write() = Some(sink);
    }

    pub fn event_bus(&self) -> Arc<EventBus> {
        self.inner.event_bus.clone()
    }

    pub fn metrics(&self) -> ProcessorMetrics {
        self.inner.metrics()
    }

    pub fn buffer_statuses(&self) -> Vec<BufferStatus> {
        self.inner.buffer_statuses()
    }

    /// Staged shutdown (§4.6): refuse new ingest, flush every buffer, drain dispatcher
    /// queues up to `shutdown.drainDeadlineMs`, stop workers, stop the event bus — all
    /// bounded by `shutdown.deadlineMs` overall. Returns [`ShutdownOutcome::Forced`] if the
    /// overall deadline elapsed first; outstanding segments still resolve (complete or
    /// error) on their own workers even in that case, since cancellation is cooperative.
    pub async fn stop(&self) -> ShutdownOutcome {
        self.inner.shutting_down.store(true, Ordering::Release);
        let deadline = Duration::from_millis(self.inner.config.shutdown.deadline_ms);
        match tokio::time::timeout(deadline, self.inner.clone().run_shutdown_sequence()).await {
            Ok(true) => ShutdownOutcome::Forced,
            Ok(false) => ShutdownOutcome::Graceful,
            Err(_elapsed) => {
                self.inner.dispatcher.shutdown();
                self.inner.event_bus.stop();
                ShutdownOutcome::Forced
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::whisper::{TranscribeOutput, TranscribeRequest};
    use std::sync::atomic::AtomicU32;
    use std::sync::Mutex as StdMutex;

    struct EchoBackend;
    impl TranscriptionBackend for EchoBackend {
        fn transcribe(
            &self,
            pcm: &[i16],
            _request: TranscribeRequest,
        ) -> Result<TranscribeOutput, RibbleWhisperError> {
            let text = if pcm.is_empty() {
                NO_SPEECH_SENTINEL.to_string()
            } else {
                "hello world".to_string()
            };
            Ok(TranscribeOutput {
                text,
                confidence: 1.0,
                detected_language: None,
                duration: Duration::from_millis(1),
            })
        }
        fn is_ready(&self) -> bool {
            true
        }
        fn close(&self) {}
    }

    struct RecordingSink {
        appended: StdMutex<Vec<(String, String, String)>>,
        pending: AtomicU32,
    }

    impl SessionSink for RecordingSink {
        fn add_pending(&self, _session_id: &str, _user_id: &str, _display_name: &str, _est: f32) {
            self.pending.fetch_add(1, Ordering::SeqCst);
        }
        fn remove_pending(&self, _session_id: &str, _user_id: &str) {
            self.pending.fetch_sub(1, Ordering::SeqCst);
        }
        fn append_transcript(
            &self,
            session_id: &str,
            user_id: &str,
            _display_name: &str,
            text: &str,
            _ssrc: u32,
            _start: Instant,
            _duration: Duration,
        ) {
            self.appended.lock().unwrap().push((
                session_id.to_string(),
                user_id.to_string(),
                text.to_string(),
            ));
        }
    }

    fn tone_frame(ssrc: u32) -> Frame {
        let pcm: Vec<i16> = (0..1920)
            .map(|i| (5000.0 * (i as f32 * 0.3).sin()) as i16)
            .collect();
        Frame::new(ssrc, Arc::from(pcm), Instant::now())
    }

    fn silence_frame(ssrc: u32) -> Frame {
        Frame::new(ssrc, Arc::from(vec![0i16; 1920]), Instant::now())
    }

    #[tokio::test]
    async fn single_speaker_natural_pause_appends_one_transcript() {
        let (processor, handle) = AsyncProcessorBuilder::new()
            .with_backend(Arc::new(EchoBackend))
            .build()
            .unwrap();
        let sink = Arc::new(RecordingSink {
            appended: StdMutex::new(Vec::new()),
            pending: AtomicU32::new(0),
        });
        processor.attach_session_sink(sink.clone());
        handle.on_channel_joined("chan-1", [("alice", "Alice")]);
        handle.on_speaking_update(42, "alice", "Alice");

        for _ in 0..5 {
            handle.ingest(42, &silence_frame(42)).unwrap();
        }
        for _ in 0..25 {
            handle.ingest(42, &tone_frame(42)).unwrap();
        }
        for _ in 0..40 {
            handle.ingest(42, &silence_frame(42)).unwrap();
        }

        let deadline = Instant::now() + Duration::from_secs(2);
        while sink.appended.lock().unwrap().is_empty() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let appended = sink.appended.lock().unwrap();
        assert_eq!(appended.len(), 1);
        assert_eq!(appended[0].0, "chan-1");
        assert_eq!(appended[0].1, "alice");
        assert_eq!(appended[0].2, "hello world");

        processor.stop().await;
    }

    #[tokio::test]
    async fn ingest_after_stop_is_refused() {
        let (processor, handle) = AsyncProcessorBuilder::new()
            .with_backend(Arc::new(EchoBackend))
            .build()
            .unwrap();
        processor.stop().await;
        let err = handle.ingest(1, &silence_frame(1)).unwrap_err();
        assert!(matches!(err, RibbleWhisperError::ShutdownInProgress));
    }
}
