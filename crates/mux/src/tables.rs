//! Per-track index tables.
//!
//! Pure data: accumulated by a track's producer thread while samples flow,
//! serialised into the `stbl` subtree at finalisation. The vectors grow only
//! on the producer thread and are read only after it has been joined, so no
//! synchronisation is needed around them.

/// Size and decode time of one accepted sample.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SampleInfo {
    /// Stored byte count, including the 4-byte NAL length prefix for H.264.
    pub size: u32,
    /// Decode timestamp in milliseconds, half-up rounded from microseconds.
    pub timestamp_ms: i64,
}

/// One `stts` run: `sample_count` consecutive samples sharing the same
/// inter-sample delta.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SttsEntry {
    pub sample_count: u32,
    pub sample_duration_ms: u32,
}

/// One `stsc` run. A new entry is recorded only when the samples-per-chunk
/// count changes from the previous run.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct StscEntry {
    /// 1-based index of the first chunk the run applies to.
    pub first_chunk: u32,
    pub samples_per_chunk: u32,
    pub sample_description_id: u32,
}

/// Everything a producer thread accumulates for its trak.
#[derive(Clone, Debug)]
pub struct TrackTables {
    pub sample_infos: Vec<SampleInfo>,
    /// True until two accepted samples differ in size; enables the
    /// compressed `stsz` form.
    pub samples_have_same_size: bool,
    pub stts: Vec<SttsEntry>,
    /// 1-based indices of sync samples.
    pub stss: Vec<u32>,
    pub stsc: Vec<StscEntry>,
    /// File offset of the first sample of each chunk (`co64`).
    pub chunk_offsets: Vec<u64>,
    /// Parsed decoder configuration: an AVC decoder configuration record for
    /// H.264, the raw VOL header for MPEG-4 Visual, the AudioSpecificConfig
    /// for AAC, absent for the other codecs.
    pub codec_specific_data: Option<Vec<u8>>,
    /// Offset of this track's first sample relative to the movie start, in
    /// microseconds. Positive values delay playback through an empty edit.
    pub start_timestamp_us: i64,
}

impl Default for TrackTables {
    fn default() -> Self {
        Self {
            sample_infos: Vec::new(),
            samples_have_same_size: true,
            stts: Vec::new(),
            stss: Vec::new(),
            stsc: Vec::new(),
            chunk_offsets: Vec::new(),
            codec_specific_data: None,
            start_timestamp_us: 0,
        }
    }
}
