//! Encoded sample buffers — output of a live source, input to the muxer.

/// Per-sample metadata attached by the producer.
#[derive(Clone, Debug, Default)]
pub struct SampleMeta {
    /// The sample carries decoder configuration (SPS/PPS for H.264, a VOL
    /// header for MPEG-4 Visual, an AudioSpecificConfig for AAC) rather
    /// than media data.
    pub is_codec_config: bool,
    /// The sample is a random-access point (an IDR frame for H.264).
    pub is_sync_frame: bool,
    /// Presentation timestamp in microseconds, monotone non-decreasing
    /// within a track. Required on every media sample.
    pub timestamp_us: Option<i64>,
}

/// One encoded sample handed over by a [`MediaSource`](crate::MediaSource).
///
/// The buffer owns its backing storage; the valid payload is the
/// `[range_offset, range_offset + range_length)` window, which can be
/// narrowed to hand out a sub-slice without copying. Dropping the buffer
/// returns it to the producer.
#[derive(Clone, Debug)]
pub struct SampleBuffer {
    data: Vec<u8>,
    range_offset: usize,
    range_length: usize,
    pub meta: SampleMeta,
}

impl SampleBuffer {
    /// Wrap a full payload with the given metadata.
    pub fn new(data: Vec<u8>, meta: SampleMeta) -> Self {
        let range_length = data.len();
        Self {
            data,
            range_offset: 0,
            range_length,
            meta,
        }
    }

    pub fn range_offset(&self) -> usize {
        self.range_offset
    }

    pub fn range_length(&self) -> usize {
        self.range_length
    }

    /// Narrow (or move) the valid payload window.
    ///
    /// # Panics
    ///
    /// Panics if the window does not fit the backing storage.
    pub fn set_range(&mut self, offset: usize, length: usize) {
        assert!(
            offset + length <= self.data.len(),
            "sample range out of bounds"
        );
        self.range_offset = offset;
        self.range_length = length;
    }

    /// The valid payload bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.data[self.range_offset..self.range_offset + self.range_length]
    }
}
