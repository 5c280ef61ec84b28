use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chorus_pipeline::config::{EventBusConfig, QueueConfig, WorkerConfig};
use chorus_pipeline::error::RibbleWhisperError;
use chorus_pipeline::pipeline::{CutReason, EventBus, Priority, Segment, SpeakerDispatcher};
use chorus_pipeline::whisper::{TranscribeOutput, TranscribeRequest, TranscriptionBackend};

struct RecordingBackend {
    order: Mutex<Vec<String>>,
}

impl TranscriptionBackend for RecordingBackend {
    fn transcribe(
        &self,
        _pcm: &[i16],
        request: TranscribeRequest,
    ) -> Result<TranscribeOutput, RibbleWhisperError> {
        std::thread::sleep(Duration::from_millis(5));
        self.order
            .lock()
            .unwrap()
            .push(request.previous_context.map(|c| c.to_string()).unwrap_or_default());
        Ok(TranscribeOutput {
            text: "ok".to_string(),
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

fn segment(id: u64, user: &str) -> Segment {
    Segment {
        id,
        ssrc: 1,
        user_id_hint: Arc::from(user),
        display_name_hint: Arc::from(user),
        pcm: Arc::from(vec![0i16; 160]),
        duration: Duration::from_millis(20),
        cut_reason: CutReason::BufferFull,
        submitted_at: Instant::now(),
        priority: Priority::Normal,
        // tag each segment with its own label so `RecordingBackend` can record arrival order
        previous_context: Arc::from(user),
        on_start: None,
        on_complete: None,
        on_error: None,
    }
}

#[tokio::test]
async fn one_speaker_cannot_starve_another() {
    let backend = Arc::new(RecordingBackend {
        order: Mutex::new(Vec::new()),
    });
    let bus = EventBus::new(EventBusConfig::default());
    let mut worker_cfg = WorkerConfig::default();
    worker_cfg.count = 1;
    let dispatcher = SpeakerDispatcher::new(worker_cfg, QueueConfig::default(), backend.clone(), bus);
    let handles = dispatcher.spawn();

    // Alice floods 5 segments before Bob enqueues even one.
    for i in 0..5 {
        dispatcher.enqueue(Arc::from("alice"), segment(i, "alice")).unwrap();
    }
    dispatcher.enqueue(Arc::from("bob"), segment(100, "bob")).unwrap();

    for _ in 0..200 {
        if dispatcher.pending_count() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let order = backend.order.lock().unwrap().clone();
    assert_eq!(order.len(), 6);
    // Bob's single segment must not be stuck behind all five of Alice's: round-robin
    // fairness means it lands somewhere in the first couple of slots, not last.
    let bob_pos = order.iter().position(|u| u == "bob").unwrap();
    assert!(bob_pos <= 1, "bob was starved, ran at position {bob_pos}");

    dispatcher.shutdown();
    for h in handles {
        let _ = h.await;
    }
}

#[tokio::test]
async fn queue_full_drops_with_error_callback() {
    let backend = Arc::new(RecordingBackend {
        order: Mutex::new(Vec::new()),
    });
    let bus = EventBus::new(EventBusConfig::default());
    let queue_cfg = QueueConfig {
        max_per_speaker: 1,
        max_active_speakers: 8,
    };
    let dispatcher = SpeakerDispatcher::new(WorkerConfig::default(), queue_cfg, backend, bus);

    dispatcher.enqueue(Arc::from("alice"), segment(1, "alice")).unwrap();
    let err = dispatcher
        .enqueue(Arc::from("alice"), segment(2, "alice"))
        .unwrap_err();
    assert!(matches!(err, RibbleWhisperError::QueueFull { .. }));
}
