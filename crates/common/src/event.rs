//! Host-visible notifications raised while muxing.

/// Event codes delivered over the writer's event channel.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MuxerEvent {
    /// The configured maximum file size was reached; the offending track
    /// stopped accepting samples and finalised.
    MaxFileSizeReached,
    /// The configured maximum recording duration was reached.
    MaxDurationReached,
    /// A track reached end of stream without accepting a single sample.
    StopPrematurely,
}
