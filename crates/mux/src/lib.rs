//! `lm-mux` — live MP4 muxer for the LiveMux engine.
//!
//! This crate combines live encoded elementary streams (video and/or audio)
//! into a playable MP4 file (ISO Base Media File Format / ISO 14496-12).
//!
//! # Architecture
//!
//! - **No FFmpeg dependency** — pure Rust MP4 box writing
//! - **Streamable layout first** — the moov (metadata) box is staged in
//!   memory and substituted into a region reserved before mdat; only when it
//!   outgrows the reservation does the file degrade to moov-at-end
//! - **One producer thread per track** — each track pulls from its
//!   [`MediaSource`](lm_common::MediaSource), conditions payloads (4-byte
//!   length-prefixed NAL units for H.264), and flushes interleaved chunks
//!   under a single writer lock
//! - **Bounded recordings** — optional file-size and duration limits,
//!   reported as [`MuxerEvent`](lm_common::MuxerEvent)s over a channel
//!
//! # Usage
//!
//! ```ignore
//! use lm_mux::Mp4Writer;
//!
//! let mut writer = Mp4Writer::create("capture.mp4")?;
//! writer.add_source(Box::new(camera));
//! writer.add_source(Box::new(microphone));
//! writer.start()?;
//! // ... record until the sources run dry or the host decides to stop ...
//! writer.stop()?;
//! ```

pub mod avc;
pub mod error;
pub mod tables;
mod track;
mod writer;

// Re-export primary API types
pub use error::{MuxError, MuxResult};
pub use writer::{Mp4Writer, DEFAULT_INTERLEAVE_DURATION_US, DEFAULT_MOOV_RESERVATION};
