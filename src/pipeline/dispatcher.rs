use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{QueueConfig, WorkerConfig};
use crate::error::RibbleWhisperError;
use crate::whisper::{TranscribeRequest, TranscriptionBackend};

use super::bus::{Event, EventBus};
use super::segment::{Priority, Segment};

/// A bounded per-speaker FIFO of pending segments, plus the bookkeeping the dispatcher's
/// scheduler needs: whether a worker currently holds it, and when it was last touched (for
/// the idle sweep).
struct SpeakerQueue {
    segments: Mutex<VecDeque<Segment>>,
    capacity: usize,
    in_flight: AtomicBool,
    last_activity: Mutex<Instant>,
}

impl SpeakerQueue {
    fn new(capacity: usize, now: Instant) -> Self {
        Self {
            segments: Mutex::new(VecDeque::new()),
            capacity,
            in_flight: AtomicBool::new(false),
            last_activity: Mutex::new(now),
        }
    }

    /// Pushes `segment` onto the tail of the queue, or hands it back unchanged if the
    /// queue is already at capacity, so the caller can route the rejection through its own
    /// drop-accounting rather than losing the segment silently.
    fn try_push(&self, segment: Segment) -> Result<(), Segment> {
        let mut q = self.segments.lock();
        if q.len() >= self.capacity {
            return Err(segment);
        }
        q.push_back(segment);
        Ok(())
    }

    fn pop(&self) -> Option<Segment> {
        self.segments.lock().pop_front()
    }

    fn head_submitted_at_and_priority(&self) -> Option<(Instant, Priority)> {
        self.segments.lock().front().map(|s| (s.submitted_at, s.priority))
    }

    fn len(&self) -> usize {
        self.segments.lock().len()
    }

    fn touch(&self, now: Instant) {
        *self.last_activity.lock() = now;
    }

    fn is_idle(&self, now: Instant, idle_timeout_ms: u64) -> bool {
        !self.in_flight.load(Ordering::Acquire)
            && self.segments.lock().is_empty()
            && now.duration_since(*self.last_activity.lock()).as_millis() as u64 >= idle_timeout_ms
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DispatcherMetricsSnapshot {
    pub active_speakers: usize,
    pub concurrent_peak: usize,
    pub dispatched_total: u64,
    pub completed_total: u64,
    pub dropped_total: u64,
    pub avg_latency_ms: f64,
}

struct DispatcherMetrics {
    concurrent_peak: AtomicUsize,
    dispatched_total: AtomicU64,
    completed_total: AtomicU64,
    dropped_total: AtomicU64,
    ema_latency_ms: Mutex<f64>,
}

impl DispatcherMetrics {
    fn new() -> Self {
        Self {
            concurrent_peak: AtomicUsize::new(0),
            dispatched_total: AtomicU64::new(0),
            completed_total: AtomicU64::new(0),
            dropped_total: AtomicU64::new(0),
            ema_latency_ms: Mutex::new(0.0),
        }
    }

    fn bump_peak(&self, active: usize) {
        self.concurrent_peak.fetch_max(active, Ordering::Relaxed);
    }

    fn record_latency(&self, latency: Duration) {
        const ALPHA: f64 = 0.2;
        let sample = latency.as_secs_f64() * 1000.0;
        let mut ema = self.ema_latency_ms.lock();
        *ema = if *ema == 0.0 {
            sample
        } else {
            ALPHA * sample + (1.0 - ALPHA) * *ema
        };
    }
}

/// Fair, speaker-aware scheduler over per-user segment queues (§4.4): round-robin across
/// non-empty, non-in-flight queues, with a priority boost for segments that have waited
/// longer than `worker.boost_ms`. A fixed pool of worker tasks pulls from it and drives the
/// pluggable [`TranscriptionBackend`].
pub struct SpeakerDispatcher {
    queues: RwLock<HashMap<Arc<str>, Arc<SpeakerQueue>>>,
    cursor: AtomicUsize,
    worker_cfg: WorkerConfig,
    queue_cfg: QueueConfig,
    backend: Arc<dyn TranscriptionBackend>,
    event_bus: Arc<EventBus>,
    notify: Notify,
    cancel: CancellationToken,
    metrics: DispatcherMetrics,
}

impl SpeakerDispatcher {
    pub fn new(
        worker_cfg: WorkerConfig,
        queue_cfg: QueueConfig,
        backend: Arc<dyn TranscriptionBackend>,
        event_bus: Arc<EventBus>,
    ) -> Arc<Self> {
        Arc::new(Self {
            queues: RwLock::new(HashMap::new()),
            cursor: AtomicUsize::new(0),
            worker_cfg,
            queue_cfg,
            backend,
            event_bus,
            notify: Notify::new(),
            cancel: CancellationToken::new(),
            metrics: DispatcherMetrics::new(),
        })
    }

    /// Spawns the fixed worker pool and the idle-speaker sweeper. Returns their join
    /// handles so the owner can await them during shutdown.
    pub fn spawn(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(self.worker_cfg.count + 1);
        for worker_id in 0..self.worker_cfg.count {
            let dispatcher = self.clone();
            handles.push(tokio::spawn(async move {
                dispatcher.worker_loop(worker_id).await;
            }));
        }
        let sweeper = self.clone();
        handles.push(tokio::spawn(async move {
            sweeper.sweeper_loop().await;
        }));
        handles
    }

    /// Signals all workers and the sweeper to stop after their current unit of work.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        self.notify.notify_waiters();
    }

    /// Enqueues a segment for `user_id`, creating that speaker's queue if this is its first
    /// segment. Fails with [`RibbleWhisperError::QueueFull`] if the speaker's queue is at
    /// capacity, or if this would exceed `queue.max_active_speakers` distinct speakers; both
    /// rejection paths still account for the drop and notify collaborators (§4.4 "full →
    /// drop with metric and transcription.failed").
    pub fn enqueue(&self, user_id: Arc<str>, segment: Segment) -> Result<(), RibbleWhisperError> {
        let now = Instant::now();
        let queue = {
            let mut queues = self.queues.write();
            if !queues.contains_key(&user_id) && queues.len() >= self.queue_cfg.max_active_speakers
            {
                drop(queues);
                self.reject(&user_id, segment);
                return Err(RibbleWhisperError::QueueFull {
                    user_id: user_id.to_string(),
                });
            }
            queues
                .entry(user_id.clone())
                .or_insert_with(|| Arc::new(SpeakerQueue::new(self.queue_cfg.max_per_speaker, now)))
                .clone()
        };

        queue.touch(now);
        if let Err(segment) = queue.try_push(segment) {
            self.reject(&user_id, segment);
            return Err(RibbleWhisperError::QueueFull {
                user_id: user_id.to_string(),
            });
        }
        self.metrics.dispatched_total.fetch_add(1, Ordering::Relaxed);
        let active = self.queues.read().len();
        self.metrics.bump_peak(active);
        self.event_bus.publish(Event::QueueDepthChanged {
            user_id: user_id.clone(),
            depth: queue.len(),
        });
        self.notify.notify_waiters();
        Ok(())
    }

    /// Accounts for a segment dropped before it ever reached a queue: bumps
    /// `dropped_total`, invokes its error callback, and publishes `transcription.failed`.
    fn reject(&self, user_id: &Arc<str>, segment: Segment) {
        self.metrics.dropped_total.fetch_add(1, Ordering::Relaxed);
        let error = RibbleWhisperError::QueueFull {
            user_id: user_id.to_string(),
        };
        if let Some(cb) = &segment.on_error {
            cb(segment.id, &error);
        }
        self.event_bus.publish(Event::TranscriptionFailed {
            segment_id: segment.id,
            user_id: user_id.clone(),
            reason: Arc::from(error.to_string().as_str()),
        });
    }

    /// Total segments currently queued or in flight, across all speakers. Used by the
    /// processor to know when a shutdown drain has finished.
    pub fn pending_count(&self) -> usize {
        self.queues.read().values().map(|q| q.len()).sum()
    }

    pub fn metrics(&self) -> DispatcherMetricsSnapshot {
        DispatcherMetricsSnapshot {
            active_speakers: self.queues.read().len(),
            concurrent_peak: self.metrics.concurrent_peak.load(Ordering::Relaxed),
            dispatched_total: self.metrics.dispatched_total.load(Ordering::Relaxed),
            completed_total: self.metrics.completed_total.load(Ordering::Relaxed),
            dropped_total: self.metrics.dropped_total.load(Ordering::Relaxed),
            avg_latency_ms: *self.metrics.ema_latency_ms.lock(),
        }
    }

    /// Picks the next (user, queue) pair to service, marking it in-flight. Scans once around
    /// the queue table starting at the shared cursor (fair round robin); within that single
    /// sweep, a candidate whose head segment is effectively high-priority — its own priority,
    /// or boosted because it was submitted less than `worker.boost_ms` ago (§4.4) — preempts
    /// a plain round-robin match encountered earlier in the sweep. The cursor always advances
    /// by one regardless of which candidate is chosen, so no speaker is skipped for more than
    /// one full sweep.
    fn get_next_work(&self) -> Option<(Arc<str>, Arc<SpeakerQueue>)> {
        let queues = self.queues.read();
        if queues.is_empty() {
            return None;
        }
        let keys: Vec<Arc<str>> = queues.keys().cloned().collect();
        let n = keys.len();
        let now = Instant::now();
        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % n;

        let mut fallback: Option<usize> = None;
        let mut chosen: Option<usize> = None;
        for offset in 0..n {
            let idx = (start + offset) % n;
            let q = &queues[&keys[idx]];
            if q.in_flight.load(Ordering::Acquire) {
                continue;
            }
            let Some((submitted_at, priority)) = q.head_submitted_at_and_priority() else {
                continue;
            };
            let boosted_ms = now.duration_since(submitted_at).as_millis() as u64;
            let effective_high = priority == Priority::High || boosted_ms < self.worker_cfg.boost_ms;
            if effective_high {
                chosen = Some(idx);
                break;
            }
            if fallback.is_none() {
                fallback = Some(idx);
            }
        }

        chosen.or(fallback).map(|idx| {
            let key = keys[idx].clone();
            let queue = queues[&key].clone();
            queue.in_flight.store(true, Ordering::Release);
            (key, queue)
        })
    }

    async fn worker_loop(self: Arc<Self>, _worker_id: usize) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(Duration::from_millis(50)) => {}
            }
            while let Some((user_id, queue)) = self.get_next_work() {
                self.run_segment(&user_id, &queue).await;
                if self.cancel.is_cancelled() {
                    break;
                }
            }
        }
    }

    async fn run_segment(&self, user_id: &Arc<str>, queue: &Arc<SpeakerQueue>) {
        let Some(segment) = queue.pop() else {
            queue.in_flight.store(false, Ordering::Release);
            return;
        };

        if let Some(cb) = &segment.on_start {
            cb(segment.id);
        }
        self.event_bus.publish(Event::TranscriptionStarted {
            segment_id: segment.id,
            user_id: user_id.clone(),
        });

        let request = TranscribeRequest {
            previous_context: Some(segment.previous_context.clone()),
            language: None,
            overlap_audio: None,
        };

        // One deadline shared across every attempt (§4.4 "honoring the remaining
        // per-segment timeout"), not a fresh timeout window per retry.
        let deadline = Instant::now() + Duration::from_millis(self.worker_cfg.timeout_ms);
        let max_attempts = self.worker_cfg.retries + 1;
        let mut result = Err(RibbleWhisperError::BackendNotReady);
        for attempt in 1..=max_attempts {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                result = Err(RibbleWhisperError::SegmentTimeout {
                    segment_id: segment.id,
                });
                break;
            }

            let backend = self.backend.clone();
            let pcm = segment.pcm.clone();
            let req = request.clone();

            let outcome = tokio::time::timeout(
                remaining,
                tokio::task::spawn_blocking(move || backend.transcribe(&pcm, req)),
            )
            .await;

            result = match outcome {
                Ok(Ok(inner)) => inner,
                Ok(Err(_join_error)) => Err(RibbleWhisperError::BackendTransient(
                    "transcription worker task failed to join".to_string(),
                )),
                Err(_elapsed) => Err(RibbleWhisperError::SegmentTimeout {
                    segment_id: segment.id,
                }),
            };

            if result.is_ok() || attempt == max_attempts {
                break;
            }
            // A permanent backend error (bad input, unsupported format) will not succeed on
            // retry; stop burning attempts and the shared deadline on it.
            if matches!(result, Err(RibbleWhisperError::BackendPermanent(_))) {
                break;
            }

            let remaining_after = deadline.saturating_duration_since(Instant::now());
            if remaining_after.is_zero() {
                result = Err(RibbleWhisperError::SegmentTimeout {
                    segment_id: segment.id,
                });
                break;
            }
            let delay = Duration::from_millis(self.worker_cfg.retry_delay_ms).min(remaining_after);
            tokio::time::sleep(delay).await;
        }

        match result {
            Ok(output) => {
                self.metrics.completed_total.fetch_add(1, Ordering::Relaxed);
                self.metrics.record_latency(output.duration);
                if let Some(cb) = &segment.on_complete {
                    cb(segment.id, &output.text);
                }
                self.event_bus.publish(Event::TranscriptionCompleted {
                    segment_id: segment.id,
                    user_id: user_id.clone(),
                    text: Arc::from(output.text.as_str()),
                });
            }
            Err(error) => {
                self.metrics.dropped_total.fetch_add(1, Ordering::Relaxed);
                if let Some(cb) = &segment.on_error {
                    cb(segment.id, &error);
                }
                self.event_bus.publish(Event::TranscriptionFailed {
                    segment_id: segment.id,
                    user_id: user_id.clone(),
                    reason: Arc::from(error.to_string().as_str()),
                });
            }
        }

        let now = Instant::now();
        queue.touch(now);
        queue.in_flight.store(false, Ordering::Release);
        self.notify.notify_waiters();
    }

    async fn sweeper_loop(self: Arc<Self>) {
        let mut interval =
            tokio::time::interval(Duration::from_millis(self.worker_cfg.speaker_sweep_interval_ms));
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = interval.tick() => {
                    self.sweep_idle_speakers();
                }
            }
        }
    }

    fn sweep_idle_speakers(&self) {
        let now = Instant::now();
        let idle_timeout_ms = self.worker_cfg.speaker_idle_timeout_ms;
        self.queues
            .write()
            .retain(|_, q| !q.is_idle(now, idle_timeout_ms));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EventBusConfig;
    use crate::error::RibbleWhisperError as Error;
    use crate::whisper::TranscribeOutput;
    use std::sync::atomic::AtomicU32;

    struct InstantBackend {
        calls: AtomicU32,
    }

    impl TranscriptionBackend for InstantBackend {
        fn transcribe(
            &self,
            _pcm: &[i16],
            _request: TranscribeRequest,
        ) -> Result<TranscribeOutput, Error> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(TranscribeOutput {
                text: "hello".to_string(),
                confidence: 1.0,
                detected_language: None,
                duration: Duration::from_millis(5),
            })
        }

        fn is_ready(&self) -> bool {
            true
        }

        fn close(&self) {}
    }

    fn test_segment(id: u64) -> Segment {
        Segment {
            id,
            ssrc: 1,
            user_id_hint: Arc::from("alice"),
            display_name_hint: Arc::from("Alice"),
            pcm: Arc::from(vec![0i16; 160]),
            duration: Duration::from_millis(20),
            cut_reason: super::super::segment::CutReason::NaturalPause,
            submitted_at: Instant::now(),
            priority: super::super::segment::Priority::High,
            previous_context: Arc::from(""),
            on_start: None,
            on_complete: None,
            on_error: None,
        }
    }

    #[tokio::test]
    async fn enqueue_rejects_beyond_max_active_speakers() {
        let backend = Arc::new(InstantBackend {
            calls: AtomicU32::new(0),
        });
        let bus = EventBus::new(EventBusConfig::default());
        let queue_cfg = QueueConfig {
            max_per_speaker: 10,
            max_active_speakers: 1,
        };
        let dispatcher = SpeakerDispatcher::new(WorkerConfig::default(), queue_cfg, backend, bus);

        dispatcher
            .enqueue(Arc::from("alice"), test_segment(1))
            .unwrap();
        let err = dispatcher
            .enqueue(Arc::from("bob"), test_segment(2))
            .unwrap_err();
        assert!(matches!(err, RibbleWhisperError::QueueFull { .. }));
    }

    #[tokio::test]
    async fn enqueue_rejects_beyond_per_speaker_capacity() {
        let backend = Arc::new(InstantBackend {
            calls: AtomicU32::new(0),
        });
        let bus = EventBus::new(EventBusConfig::default());
        let queue_cfg = QueueConfig {
            max_per_speaker: 1,
            max_active_speakers: 8,
        };
        let dispatcher = SpeakerDispatcher::new(WorkerConfig::default(), queue_cfg, backend, bus);

        dispatcher
            .enqueue(Arc::from("alice"), test_segment(1))
            .unwrap();
        let err = dispatcher
            .enqueue(Arc::from("alice"), test_segment(2))
            .unwrap_err();
        assert!(matches!(err, RibbleWhisperError::QueueFull { .. }));
    }

    #[tokio::test]
    async fn workers_drain_enqueued_segments() {
        let backend = Arc::new(InstantBackend {
            calls: AtomicU32::new(0),
        });
        let bus = EventBus::new(EventBusConfig::default());
        let mut worker_cfg = WorkerConfig::default();
        worker_cfg.count = 2;
        let dispatcher =
            SpeakerDispatcher::new(worker_cfg, QueueConfig::default(), backend.clone(), bus);
        let handles = dispatcher.spawn();

        dispatcher
            .enqueue(Arc::from("alice"), test_segment(1))
            .unwrap();
        dispatcher
            .enqueue(Arc::from("bob"), test_segment(2))
            .unwrap();

        for _ in 0..50 {
            if dispatcher.pending_count() == 0 && backend.calls.load(Ordering::SeqCst) >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(dispatcher.pending_count(), 0);
        assert!(backend.calls.load(Ordering::SeqCst) >= 2);

        dispatcher.shutdown();
        for h in handles {
            let _ = h.await;
        }
    }
}
