use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;

use crossbeam::channel::{Sender, TrySendError, bounded};
use parking_lot::Mutex;

use crate::config::EventBusConfig;

use super::segment::SegmentId;

/// Everything the core publishes about its own activity (§4.3). Hosts subscribe to learn
/// about transcription results, buffering state, queue pressure and session lifecycle
/// without polling.
#[derive(Debug, Clone)]
pub enum Event {
    TranscriptionStarted { segment_id: SegmentId, user_id: Arc<str> },
    TranscriptionCompleted { segment_id: SegmentId, user_id: Arc<str>, text: Arc<str> },
    TranscriptionFailed { segment_id: SegmentId, user_id: Arc<str>, reason: Arc<str> },
    AudioBuffering { ssrc: u32, user_id: Arc<str>, accumulated_ms: u64, is_speaking: bool },
    AudioSegmented { segment_id: SegmentId, ssrc: u32, reason: &'static str },
    QueueDepthChanged { user_id: Arc<str>, depth: usize },
    SessionCreated { user_id: Arc<str> },
    SessionEnded { user_id: Arc<str> },
    /// A speaker identity deduced or confirmed for an SSRC changed from what had previously
    /// been resolved for it, after segments may already have been appended under the old
    /// identity (§4.5, §7 "late identification").
    BindingCorrected { ssrc: u32, from: Arc<str>, to: Arc<str> },
}

impl Event {
    /// The discriminant used to scope a subscription to one event kind (§4.3's
    /// `subscribe(type, handler)`, as distinct from `subscribeAll`).
    pub fn kind(&self) -> EventKind {
        match self {
            Event::TranscriptionStarted { .. } => EventKind::TranscriptionStarted,
            Event::TranscriptionCompleted { .. } => EventKind::TranscriptionCompleted,
            Event::TranscriptionFailed { .. } => EventKind::TranscriptionFailed,
            Event::AudioBuffering { .. } => EventKind::AudioBuffering,
            Event::AudioSegmented { .. } => EventKind::AudioSegmented,
            Event::QueueDepthChanged { .. } => EventKind::QueueDepthChanged,
            Event::SessionCreated { .. } => EventKind::SessionCreated,
            Event::SessionEnded { .. } => EventKind::SessionEnded,
            Event::BindingCorrected { .. } => EventKind::BindingCorrected,
        }
    }
}

/// One variant per [`Event`] case, with no payload: what [`EventBus::subscribe`] filters on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    TranscriptionStarted,
    TranscriptionCompleted,
    TranscriptionFailed,
    AudioBuffering,
    AudioSegmented,
    QueueDepthChanged,
    SessionCreated,
    SessionEnded,
    BindingCorrected,
}

type Handler = Box<dyn Fn(&Event) + Send + Sync>;

struct Subscriber {
    id: u64,
    /// `None` for a [`EventBus::subscribe_all`] registration; `Some(kind)` scopes delivery
    /// to only that [`EventKind`] for a [`EventBus::subscribe`] registration.
    kind: Option<EventKind>,
    handler: Handler,
}

/// Bounded, drop-newest, panic-isolated publish/subscribe bus (§4.3).
///
/// A dedicated background thread owns the receiving end and delivers events to subscribers;
/// `publish` only ever attempts a non-blocking `try_send` into the bounded channel, so a
/// slow or stuck subscriber throttles delivery, never the publisher. When the channel is at
/// capacity, `publish` drops the event and bumps `dropped_count` instead of waiting.
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
    next_subscriber_id: AtomicU64,
    tx: Mutex<Option<Sender<Event>>>,
    dropped: Arc<AtomicU64>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// Opaque handle returned by [`EventBus::subscribe`], usable to unsubscribe later.
pub struct SubscriptionId(u64);

impl EventBus {
    pub fn new(cfg: EventBusConfig) -> Arc<Self> {
        let (tx, rx) = bounded(cfg.buffer_size.max(1));
        let subscribers: Arc<Mutex<Vec<Subscriber>>> = Arc::new(Mutex::new(Vec::new()));
        let worker_subscribers = subscribers.clone();
        let worker = std::thread::Builder::new()
            .name("chorus-event-bus".to_string())
            .spawn(move || {
                // `recv()` blocks until an event arrives and returns `Err` only once every
                // `Sender` clone has been dropped, which is exactly `stop()`'s signal to
                // finish draining and exit: everything still queued at that point is
                // delivered before the loop ends.
                while let Ok(event) = rx.recv() {
                    let kind = event.kind();
                    let subs = worker_subscribers.lock();
                    for sub in subs.iter() {
                        if sub.kind.is_some_and(|k| k != kind) {
                            continue;
                        }
                        let handler = &sub.handler;
                        let result = std::panic::catch_unwind(AssertUnwindSafe(|| handler(&event)));
                        if let Err(panic) = result {
                            #[cfg(feature = "ribble-logging")]
                            log::error!("event bus subscriber {} panicked: {:?}", sub.id, panic);
                            #[cfg(not(feature = "ribble-logging"))]
                            {
                                let _ = panic;
                                eprintln!("event bus subscriber {} panicked", sub.id);
                            }
                        }
                    }
                }
            })
            .expect("failed to spawn event bus dispatch thread");

        Arc::new(Self {
            subscribers,
            next_subscriber_id: AtomicU64::new(1),
            tx: Mutex::new(Some(tx)),
            dropped: Arc::new(AtomicU64::new(0)),
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Registers a handler invoked only for events whose [`EventKind`] matches `kind`, on the
    /// bus's dispatch thread. Returns a subscription id that can be passed to
    /// [`EventBus::unsubscribe`].
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.push_subscriber(Some(kind), Box::new(handler))
    }

    /// Registers a handler invoked for every published event, regardless of kind, on the
    /// bus's dispatch thread. Returns a subscription id that can be passed to
    /// [`EventBus::unsubscribe`].
    pub fn subscribe_all<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.push_subscriber(None, Box::new(handler))
    }

    fn push_subscriber(&self, kind: Option<EventKind>, handler: Handler) -> SubscriptionId {
        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.lock().push(Subscriber { id, kind, handler });
        SubscriptionId(id)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.subscribers.lock().retain(|s| s.id != id.0);
    }

    /// Publishes an event. Never blocks: if the internal queue is full the event is
    /// dropped and the drop counter is incremented; if the bus has already been `stop()`'d,
    /// the publish is silently refused.
    pub fn publish(&self, event: Event) {
        let tx = self.tx.lock();
        let Some(tx) = tx.as_ref() else {
            return;
        };
        match tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    /// Number of events dropped so far because the internal queue was full.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Refuses further publishes, then drains whatever was already queued (bounded by
    /// remaining capacity) before returning, and finally drops all subscribers.
    pub fn stop(&self) {
        let tx = self.tx.lock().take();
        drop(tx);
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
        self.subscribers.lock().clear();
    }
}

impl Drop for EventBus {
    fn drop(&mut self) {
        self.stop();
    }
}
