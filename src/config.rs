//! Configuration surface realizing the external-interfaces table: one struct per
//! component, each field backed by a named default constant and a builder setter on
//! [`crate::processor::AsyncProcessorBuilder`].

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

pub const DEFAULT_SAMPLE_RATE: u32 = 48_000;
pub const DEFAULT_CHANNELS: u8 = 2;

pub const DEFAULT_VAD_NATURAL_PAUSE_MS: u64 = 800;
pub const DEFAULT_VAD_SHORT_PAUSE_MS: u64 = 400;

pub const DEFAULT_BUFFER_MIN_SEGMENT_MS: u64 = 300;
pub const DEFAULT_BUFFER_MAX_SEGMENT_MS: u64 = 30_000;
pub const DEFAULT_BUFFER_FORCED_CUT_MS: u64 = 10_000;
pub const DEFAULT_BUFFER_OVERLAP_MS: u64 = 1_000;

pub const DEFAULT_QUEUE_MAX_PER_SPEAKER: usize = 50;
pub const DEFAULT_QUEUE_MAX_ACTIVE_SPEAKERS: usize = 8;

pub const DEFAULT_WORKERS_COUNT: usize = 4;
pub const DEFAULT_WORKER_TIMEOUT_MS: u64 = 20_000;
pub const DEFAULT_WORKER_RETRIES: u32 = 3;
pub const DEFAULT_WORKER_RETRY_DELAY_MS: u64 = 1_000;

pub const DEFAULT_DISPATCH_BOOST_MS: u64 = 5_000;
pub const DEFAULT_SPEAKER_IDLE_TIMEOUT_MS: u64 = 120_000;
pub const DEFAULT_SPEAKER_SWEEP_INTERVAL_MS: u64 = 30_000;

pub const DEFAULT_EVENTBUS_BUFFER_SIZE: usize = 1024;

pub const DEFAULT_SHUTDOWN_DEADLINE_MS: u64 = 10_000;
pub const DEFAULT_SHUTDOWN_DRAIN_DEADLINE_MS: u64 = 5_000;

/// `vad.*` configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct VadConfig {
    pub natural_pause_ms: u64,
    pub short_pause_ms: u64,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            natural_pause_ms: DEFAULT_VAD_NATURAL_PAUSE_MS,
            short_pause_ms: DEFAULT_VAD_SHORT_PAUSE_MS,
        }
    }
}

/// `buffer.*` configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct BufferConfig {
    pub min_segment_ms: u64,
    pub max_segment_ms: u64,
    pub forced_cut_ms: u64,
    pub overlap_ms: u64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            min_segment_ms: DEFAULT_BUFFER_MIN_SEGMENT_MS,
            max_segment_ms: DEFAULT_BUFFER_MAX_SEGMENT_MS,
            forced_cut_ms: DEFAULT_BUFFER_FORCED_CUT_MS,
            overlap_ms: DEFAULT_BUFFER_OVERLAP_MS,
        }
    }
}

/// `queue.*` configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct QueueConfig {
    pub max_per_speaker: usize,
    pub max_active_speakers: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_per_speaker: DEFAULT_QUEUE_MAX_PER_SPEAKER,
            max_active_speakers: DEFAULT_QUEUE_MAX_ACTIVE_SPEAKERS,
        }
    }
}

/// `worker.*` / `dispatch.*` / `speaker.*` configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct WorkerConfig {
    pub count: usize,
    pub timeout_ms: u64,
    pub retries: u32,
    pub retry_delay_ms: u64,
    pub boost_ms: u64,
    pub speaker_idle_timeout_ms: u64,
    pub speaker_sweep_interval_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            count: DEFAULT_WORKERS_COUNT,
            timeout_ms: DEFAULT_WORKER_TIMEOUT_MS,
            retries: DEFAULT_WORKER_RETRIES,
            retry_delay_ms: DEFAULT_WORKER_RETRY_DELAY_MS,
            boost_ms: DEFAULT_DISPATCH_BOOST_MS,
            speaker_idle_timeout_ms: DEFAULT_SPEAKER_IDLE_TIMEOUT_MS,
            speaker_sweep_interval_ms: DEFAULT_SPEAKER_SWEEP_INTERVAL_MS,
        }
    }
}

/// `eventbus.*` configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct EventBusConfig {
    pub buffer_size: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_EVENTBUS_BUFFER_SIZE,
        }
    }
}

/// `shutdown.*` configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ShutdownConfig {
    pub deadline_ms: u64,
    pub drain_deadline_ms: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            deadline_ms: DEFAULT_SHUTDOWN_DEADLINE_MS,
            drain_deadline_ms: DEFAULT_SHUTDOWN_DRAIN_DEADLINE_MS,
        }
    }
}

/// Top-level configuration for an [`crate::processor::AsyncProcessor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ProcessorConfig {
    pub sample_rate: u32,
    pub channels: u8,
    pub vad: VadConfig,
    pub buffer: BufferConfig,
    pub queue: QueueConfig,
    pub worker: WorkerConfig,
    pub event_bus: EventBusConfig,
    pub shutdown: ShutdownConfig,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            channels: DEFAULT_CHANNELS,
            vad: VadConfig::default(),
            buffer: BufferConfig::default(),
            queue: QueueConfig::default(),
            worker: WorkerConfig::default(),
            event_bus: EventBusConfig::default(),
            shutdown: ShutdownConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_spec_table() {
        let cfg = ProcessorConfig::default();
        assert_eq!(cfg.sample_rate, 48_000);
        assert_eq!(cfg.channels, 2);
        assert_eq!(cfg.vad.natural_pause_ms, 800);
        assert_eq!(cfg.vad.short_pause_ms, 400);
        assert_eq!(cfg.buffer.min_segment_ms, 300);
        assert_eq!(cfg.buffer.max_segment_ms, 30_000);
        assert_eq!(cfg.buffer.forced_cut_ms, 10_000);
        assert_eq!(cfg.buffer.overlap_ms, 1_000);
        assert_eq!(cfg.queue.max_per_speaker, 50);
        assert_eq!(cfg.queue.max_active_speakers, 8);
        assert_eq!(cfg.worker.count, 4);
        assert_eq!(cfg.worker.timeout_ms, 20_000);
        assert_eq!(cfg.worker.retries, 3);
        assert_eq!(cfg.worker.retry_delay_ms, 1_000);
        assert_eq!(cfg.worker.boost_ms, 5_000);
        assert_eq!(cfg.worker.speaker_idle_timeout_ms, 120_000);
        assert_eq!(cfg.event_bus.buffer_size, 1024);
        assert_eq!(cfg.shutdown.deadline_ms, 10_000);
    }
}
