//! The blocking pull interface live sample producers implement.

use thiserror::Error;

use crate::sample::SampleBuffer;

/// Stream-level format metadata a source exposes before producing samples.
#[derive(Clone, Debug)]
pub struct TrackFormat {
    /// Elementary-stream MIME type (see [`crate::codec`]).
    pub mime_type: String,
    /// Frame width in pixels (video only).
    pub width: Option<u32>,
    /// Frame height in pixels (video only).
    pub height: Option<u32>,
    /// Channel count (audio only).
    pub channel_count: Option<u16>,
    /// Sample rate in Hz (audio only).
    pub sample_rate: Option<u32>,
}

impl TrackFormat {
    pub fn video(mime_type: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            mime_type: mime_type.into(),
            width: Some(width),
            height: Some(height),
            channel_count: None,
            sample_rate: None,
        }
    }

    pub fn audio(mime_type: impl Into<String>, channel_count: u16, sample_rate: u32) -> Self {
        Self {
            mime_type: mime_type.into(),
            width: None,
            height: None,
            channel_count: Some(channel_count),
            sample_rate: Some(sample_rate),
        }
    }
}

/// Error starting a sample source.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("source failed to start: {0}")]
    StartFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A live elementary-stream producer.
///
/// `read` blocks until a sample is available and returns `None` once the
/// stream ends or the source fails terminally; either way the consumer's
/// pull loop stops. The muxer observes its stop flag only between samples,
/// so sources must arrange their own unblocking when asked to shut down.
pub trait MediaSource: Send {
    fn start(&mut self) -> Result<(), SourceError>;
    fn stop(&mut self);
    fn format(&self) -> TrackFormat;
    fn read(&mut self) -> Option<SampleBuffer>;
}
