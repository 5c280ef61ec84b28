#![doc = include_str!("../README.md")]
pub mod audio;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod processor;
pub mod vad;
pub mod whisper;

pub use config::ProcessorConfig;
pub use error::RibbleWhisperError;
pub use processor::{AsyncProcessor, AsyncProcessorBuilder, AsyncProcessorHandle, SessionSink};
