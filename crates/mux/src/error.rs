//! Muxer error types.

use thiserror::Error;

use lm_common::SourceError;

/// Errors that can occur during MP4 muxing.
#[derive(Error, Debug)]
pub enum MuxError {
    /// I/O error during file write.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid muxer configuration.
    #[error("invalid muxer config: {0}")]
    InvalidConfig(String),

    /// A sample source failed to start.
    #[error("source error: {0}")]
    Source(#[from] SourceError),

    /// The elementary stream violated the format the codec requires
    /// (e.g. H.264 configuration without start codes).
    #[error("malformed stream: {0}")]
    MalformedStream(String),

    /// Track-level bookkeeping error.
    #[error("track error: {0}")]
    Track(String),
}

/// Convenience Result type for mux operations.
pub type MuxResult<T> = Result<T, MuxError>;
