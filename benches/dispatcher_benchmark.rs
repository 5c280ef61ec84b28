//! Throughput of the fair-scheduling path: enqueueing segments across many speakers and
//! picking the next unit of work, without the cost of an actual transcription call.

use std::sync::Arc;
use std::time::{Duration, Instant};

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use chorus_pipeline::config::{EventBusConfig, QueueConfig, WorkerConfig};
use chorus_pipeline::error::RibbleWhisperError;
use chorus_pipeline::pipeline::{CutReason, Event, EventBus, Priority, Segment, SpeakerDispatcher};
use chorus_pipeline::whisper::{TranscribeOutput, TranscribeRequest, TranscriptionBackend};

struct NoopBackend;

impl TranscriptionBackend for NoopBackend {
    fn transcribe(
        &self,
        _pcm: &[i16],
        _request: TranscribeRequest,
    ) -> Result<TranscribeOutput, RibbleWhisperError> {
        Ok(TranscribeOutput {
            text: String::new(),
            confidence: 0.0,
            detected_language: None,
            duration: Duration::from_millis(0),
        })
    }

    fn is_ready(&self) -> bool {
        true
    }

    fn close(&self) {}
}

fn segment(id: u64, user: &str) -> Segment {
    Segment {
        id,
        ssrc: 1,
        user_id_hint: Arc::from(user),
        display_name_hint: Arc::from(user),
        pcm: Arc::from(Vec::new()),
        duration: Duration::from_millis(20),
        cut_reason: CutReason::BufferFull,
        submitted_at: Instant::now(),
        priority: Priority::Normal,
        previous_context: Arc::from(""),
        on_start: None,
        on_complete: None,
        on_error: None,
    }
}

fn quiet_bus() -> Arc<EventBus> {
    let bus = EventBus::new(EventBusConfig::default());
    bus.subscribe_all(|_event: &Event| {});
    bus
}

fn bench_enqueue_across_speakers(c: &mut Criterion) {
    let dispatcher = SpeakerDispatcher::new(
        WorkerConfig::default(),
        QueueConfig {
            max_per_speaker: 1_000_000,
            max_active_speakers: 64,
        },
        Arc::new(NoopBackend),
        quiet_bus(),
    );
    let mut next_id = 0u64;
    c.bench_function("dispatcher_enqueue_32_speakers_round_robin", |b| {
        b.iter(|| {
            for speaker in 0..32 {
                next_id += 1;
                let user: Arc<str> = Arc::from(format!("speaker-{speaker}"));
                let _ = black_box(dispatcher.enqueue(user, segment(next_id, &format!("speaker-{speaker}"))));
            }
        })
    });
}

criterion_group!(benches, bench_enqueue_across_speakers);
criterion_main!(benches);
