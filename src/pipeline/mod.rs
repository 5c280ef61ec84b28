//! The multi-speaker segmentation-and-dispatch core: per-SSRC buffering and VAD-driven
//! cutting, SSRC→identity resolution, a fair speaker-aware dispatcher, and the event bus
//! that reports on all of it.

pub mod buffer;
pub mod bus;
pub mod dispatcher;
pub mod frame;
pub mod segment;
pub mod ssrc;
pub mod text;

pub use buffer::{PendingCut, SmartBuffer};
pub use bus::{Event, EventBus, EventKind, SubscriptionId};
pub use dispatcher::{DispatcherMetricsSnapshot, SpeakerDispatcher};
pub use frame::{downmix_to_mono_f32, downmix_to_mono_i16, Frame};
pub use segment::{next_segment_id, CutReason, OnComplete, OnError, OnStart, Priority, Segment, SegmentId};
pub use ssrc::SsrcResolver;
