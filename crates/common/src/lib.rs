//! `lm-common` — Shared types, traits, and events for the LiveMux engine.
//!
//! This crate is the foundation the muxing crates depend on. It defines the
//! core abstractions:
//!
//! - **Codecs**: `MediaCodec` and the recognised MIME types
//! - **Samples**: `SampleBuffer`, `SampleMeta` (data flow types)
//! - **Sources**: `MediaSource`, `TrackFormat` (producer interface)
//! - **Events**: `MuxerEvent` (host notifications)

pub mod codec;
pub mod event;
pub mod sample;
pub mod source;

// Re-export commonly used items at crate root
pub use codec::MediaCodec;
pub use event::MuxerEvent;
pub use sample::{SampleBuffer, SampleMeta};
pub use source::{MediaSource, SourceError, TrackFormat};
