//! The MP4 writer state machine.
//!
//! `Mp4Writer` owns the output file and coordinates one producer thread per
//! attached source. The file is laid out for streaming: `ftyp`, a `free`
//! placeholder sized to hold the finished `moov`, then the `mdat` payload.
//! At `stop()` the `moov` subtree is staged in memory and substituted into
//! the reserved region; if it outgrows the reservation mid-emission the
//! writer falls back to appending it after `mdat` — a valid but
//! non-streamable layout.

use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use byteorder::{BigEndian, WriteBytesExt};
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use lm_common::{MediaSource, MuxerEvent};

use crate::error::{MuxError, MuxResult};
use crate::track::{Track, TrackShared};

/// Default chunk accumulation threshold: 500 ms.
pub const DEFAULT_INTERLEAVE_DURATION_US: i64 = 500_000;

/// Default byte reservation for the in-place `moov`.
pub const DEFAULT_MOOV_RESERVATION: u32 = 0x0F00;

/// Seconds since the Unix epoch, truncated to the 32-bit header fields.
pub(crate) fn unix_time_now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Output state (everything behind the writer lock)
// ---------------------------------------------------------------------------

/// Scratch region the `moov` subtree is staged in so it can later be written
/// into the reserved `free` region in one pass.
struct MoovBuffer {
    buf: Vec<u8>,
}

/// The mutable emission state: file, logical offset, box nesting, and the
/// moov staging buffer. Producer threads reach it only through the
/// surrounding mutex.
pub(crate) struct OutputState {
    file: File,
    /// Logical write position; every emission primitive advances it. The
    /// file cursor always sits at `offset` between primitives.
    offset: u64,
    mdat_offset: u64,
    free_offset: u64,
    estimated_moov_size: u32,
    /// Positions of the length fields of currently open boxes, relative to
    /// the active emission target (staging buffer when present, file
    /// otherwise).
    box_stack: Vec<u64>,
    moov: Option<MoovBuffer>,
    streamable: bool,
    start_timestamp_us: Option<i64>,
}

impl OutputState {
    fn new(file: File, estimated_moov_size: u32) -> Self {
        Self {
            file,
            offset: 0,
            mdat_offset: 0,
            free_offset: 0,
            estimated_moov_size,
            box_stack: Vec::new(),
            moov: None,
            streamable: true,
            start_timestamp_us: None,
        }
    }

    /// Append to the active emission target.
    ///
    /// While the moov is being staged, an emission that would leave less
    /// than a trailing `free` header of slack in the reservation switches
    /// the target back to the file: open box positions are rebased to their
    /// final file positions, the staged prefix is flushed after `mdat`, and
    /// the file stops being streamable.
    pub(crate) fn write_bytes(&mut self, data: &[u8]) -> MuxResult<()> {
        if let Some(moov) = self.moov.as_mut() {
            if 8 + moov.buf.len() + data.len() > self.estimated_moov_size as usize {
                let staged = self.moov.take().expect("staging active").buf;
                for pos in &mut self.box_stack {
                    *pos += self.offset;
                }
                self.file.seek(SeekFrom::Start(self.offset))?;
                self.file.write_all(&staged)?;
                self.file.write_all(data)?;
                self.offset += (staged.len() + data.len()) as u64;
                self.streamable = false;
                warn!(
                    reserved = self.estimated_moov_size,
                    "moov exceeded its reservation, appending it after mdat; \
                     the file will not be streamable"
                );
            } else {
                moov.buf.extend_from_slice(data);
            }
        } else {
            self.file.write_all(data)?;
            self.offset += data.len() as u64;
        }
        Ok(())
    }

    pub(crate) fn write_u8(&mut self, v: u8) -> MuxResult<()> {
        self.write_bytes(&[v])
    }

    pub(crate) fn write_u16(&mut self, v: u16) -> MuxResult<()> {
        self.write_bytes(&v.to_be_bytes())
    }

    pub(crate) fn write_i16(&mut self, v: i16) -> MuxResult<()> {
        self.write_bytes(&v.to_be_bytes())
    }

    pub(crate) fn write_u32(&mut self, v: u32) -> MuxResult<()> {
        self.write_bytes(&v.to_be_bytes())
    }

    pub(crate) fn write_i32(&mut self, v: i32) -> MuxResult<()> {
        self.write_bytes(&v.to_be_bytes())
    }

    pub(crate) fn write_u64(&mut self, v: u64) -> MuxResult<()> {
        self.write_bytes(&v.to_be_bytes())
    }

    pub(crate) fn write_fourcc(&mut self, fourcc: &[u8; 4]) -> MuxResult<()> {
        self.write_bytes(fourcc)
    }

    /// Null-terminated string, as `hdlr` names require.
    pub(crate) fn write_cstring(&mut self, s: &str) -> MuxResult<()> {
        self.write_bytes(s.as_bytes())?;
        self.write_u8(0)
    }

    /// Open a box: remember where its length field lives and emit the
    /// placeholder header.
    pub(crate) fn begin_box(&mut self, fourcc: &[u8; 4]) -> MuxResult<()> {
        let pos = match &self.moov {
            Some(moov) => moov.buf.len() as u64,
            None => self.offset,
        };
        self.box_stack.push(pos);
        self.write_u32(0)?;
        self.write_fourcc(fourcc)
    }

    /// Close the innermost open box, patching its 32-bit length.
    pub(crate) fn end_box(&mut self) -> MuxResult<()> {
        let pos = self
            .box_stack
            .pop()
            .ok_or_else(|| MuxError::Track("end_box without an open box".into()))?;
        match self.moov.as_mut() {
            Some(moov) => {
                let len = moov.buf.len() as u64 - pos;
                moov.buf[pos as usize..pos as usize + 4]
                    .copy_from_slice(&(len as u32).to_be_bytes());
            }
            None => {
                let len = self.offset - pos;
                self.file.seek(SeekFrom::Start(pos))?;
                self.file.write_u32::<BigEndian>(len as u32)?;
                self.file.seek(SeekFrom::Start(self.offset))?;
            }
        }
        Ok(())
    }

    /// Append a raw sample payload to `mdat`; returns the offset it landed
    /// at. Callers hold the writer lock by construction.
    pub(crate) fn add_sample(&mut self, data: &[u8]) -> MuxResult<u64> {
        let at = self.offset;
        self.file.write_all(data)?;
        self.offset += data.len() as u64;
        Ok(at)
    }

    /// Append a 4-byte big-endian length then the payload (H.264 NAL
    /// units); returns the offset of the length prefix.
    pub(crate) fn add_length_prefixed_sample(&mut self, data: &[u8]) -> MuxResult<u64> {
        let at = self.offset;
        self.file.write_u32::<BigEndian>(data.len() as u32)?;
        self.file.write_all(data)?;
        self.offset += data.len() as u64 + 4;
        Ok(at)
    }
}

// ---------------------------------------------------------------------------
// State shared with producer threads
// ---------------------------------------------------------------------------

/// The writer side producer threads see: the locked output state, the fixed
/// muxing configuration, every track's counters, and the event channel.
pub(crate) struct WriterShared {
    pub(crate) state: Mutex<OutputState>,
    pub(crate) interleave_duration_us: i64,
    max_file_size_bytes: i64,
    max_file_duration_us: i64,
    estimated_moov_size: u32,
    tracks: Vec<Arc<TrackShared>>,
    pub(crate) events: Sender<MuxerEvent>,
}

impl WriterShared {
    /// Elect the movie start timestamp: the first track to report wins.
    /// Returns the elected value either way.
    pub(crate) fn set_start_timestamp(&self, timestamp_us: i64) -> i64 {
        let mut state = self.state.lock();
        let start = *state.start_timestamp_us.get_or_insert(timestamp_us);
        debug!(timestamp_us, start, "start timestamp election");
        start
    }

    /// True when the size estimate (reserved moov plus every track's byte
    /// count) has reached the configured limit.
    pub(crate) fn exceeds_file_size_limit(&self) -> bool {
        if self.max_file_size_bytes == 0 {
            return false;
        }
        let mut estimate = self.estimated_moov_size as i64;
        for track in &self.tracks {
            estimate += track.estimated_size_bytes();
        }
        estimate >= self.max_file_size_bytes
    }

    /// True when any track's duration has reached the configured limit.
    pub(crate) fn exceeds_file_duration_limit(&self) -> bool {
        if self.max_file_duration_us == 0 {
            return false;
        }
        self.tracks
            .iter()
            .any(|track| track.duration_us() >= self.max_file_duration_us)
    }
}

// ---------------------------------------------------------------------------
// Public writer
// ---------------------------------------------------------------------------

/// Live MP4 writer: one instance per output file.
///
/// Attach sources with [`add_source`](Self::add_source), then bracket the
/// recording with [`start`](Self::start) and [`stop`](Self::stop). Each
/// source gets its own producer thread; `stop` joins them all and finalises
/// the movie metadata.
pub struct Mp4Writer {
    output: Option<File>,
    shared: Option<Arc<WriterShared>>,
    tracks: Vec<Track>,
    estimated_moov_size: u32,
    interleave_duration_us: i64,
    max_file_size_bytes: i64,
    max_file_duration_us: i64,
    event_tx: Sender<MuxerEvent>,
    event_rx: Receiver<MuxerEvent>,
}

impl Mp4Writer {
    /// Create a writer for the given output path.
    pub fn create<P: AsRef<Path>>(path: P) -> MuxResult<Self> {
        let path = path.as_ref();
        let file = File::create(path).map_err(|e| {
            MuxError::Io(std::io::Error::new(
                e.kind(),
                format!("failed to create output file {path:?}: {e}"),
            ))
        })?;
        Ok(Self::from_file(file))
    }

    /// Wrap an already-open output file.
    pub fn from_file(file: File) -> Self {
        let (event_tx, event_rx) = channel::unbounded();
        Self {
            output: Some(file),
            shared: None,
            tracks: Vec::new(),
            estimated_moov_size: 0,
            interleave_duration_us: DEFAULT_INTERLEAVE_DURATION_US,
            max_file_size_bytes: 0,
            max_file_duration_us: 0,
            event_tx,
            event_rx,
        }
    }

    /// Channel the muxer reports limit and premature-stop events on.
    pub fn events(&self) -> Receiver<MuxerEvent> {
        self.event_rx.clone()
    }

    /// Attach a new media source as the next track (IDs are 1-based in
    /// insertion order). Must be called before [`start`](Self::start).
    pub fn add_source(&mut self, source: Box<dyn MediaSource>) {
        self.tracks.push(Track::new(source));
    }

    /// Override the default 500 ms chunk accumulation threshold. Zero makes
    /// every sample its own chunk.
    pub fn set_interleave_duration(&mut self, duration_us: i64) {
        self.interleave_duration_us = duration_us;
    }

    /// Bound the output file size in bytes (0 = unlimited).
    pub fn set_max_file_size(&mut self, bytes: i64) {
        self.max_file_size_bytes = bytes;
    }

    /// Bound the recording duration in microseconds (0 = unlimited).
    pub fn set_max_file_duration(&mut self, duration_us: i64) {
        self.max_file_duration_us = duration_us;
    }

    /// Override the byte reservation for the in-place moov.
    pub fn set_estimated_moov_size(&mut self, bytes: u32) {
        self.estimated_moov_size = bytes;
    }

    /// True once every track's producer has reached end of stream.
    pub fn reached_eos(&self) -> bool {
        self.tracks.iter().all(Track::reached_eos)
    }

    /// Write the file prelude and start every track's producer thread.
    ///
    /// If any track fails to start, the already-started tracks are stopped
    /// and the error is returned.
    pub fn start(&mut self) -> MuxResult<()> {
        let estimated_moov_size = if self.estimated_moov_size == 0 {
            DEFAULT_MOOV_RESERVATION
        } else {
            self.estimated_moov_size
        };
        if estimated_moov_size < 8 {
            return Err(MuxError::InvalidConfig(format!(
                "moov reservation of {estimated_moov_size} bytes is smaller than a box header"
            )));
        }
        let file = self
            .output
            .take()
            .ok_or_else(|| MuxError::InvalidConfig("writer already started".into()))?;

        let mut state = OutputState::new(file, estimated_moov_size);

        state.begin_box(b"ftyp")?;
        state.write_fourcc(b"isom")?; // major brand
        state.write_u32(0)?; // minor version
        state.write_fourcc(b"isom")?; // compatible brand
        state.end_box()?;

        // Reserve the region the finished moov will be substituted into.
        state.free_offset = state.offset;
        state.write_u32(estimated_moov_size)?;
        state.write_fourcc(b"free")?;

        // Open mdat with a 64-bit length placeholder, patched at stop().
        state.mdat_offset = state.free_offset + estimated_moov_size as u64;
        state.offset = state.mdat_offset;
        state.file.seek(SeekFrom::Start(state.mdat_offset))?;
        state.write_bytes(b"\x00\x00\x00\x01mdat????????")?;

        let shared = Arc::new(WriterShared {
            state: Mutex::new(state),
            interleave_duration_us: self.interleave_duration_us,
            max_file_size_bytes: self.max_file_size_bytes,
            max_file_duration_us: self.max_file_duration_us,
            estimated_moov_size,
            tracks: self.tracks.iter().map(|t| t.shared_handle()).collect(),
            events: self.event_tx.clone(),
        });

        info!(tracks = self.tracks.len(), "starting mux");

        for index in 0..self.tracks.len() {
            if let Err(err) = self.tracks[index].start(index + 1, Arc::clone(&shared)) {
                for started in &mut self.tracks[..index] {
                    started.stop();
                }
                return Err(err);
            }
        }

        self.shared = Some(shared);
        Ok(())
    }

    /// Finalise the file: join every producer, patch the `mdat` length, and
    /// emit the `moov` subtree. Idempotent; a writer that never started is
    /// left alone.
    pub fn stop(&mut self) -> MuxResult<()> {
        let Some(shared) = self.shared.take() else {
            return Ok(());
        };

        let mut max_duration_us: i64 = 0;
        for track in &mut self.tracks {
            track.stop();
            max_duration_us = max_duration_us.max(track.duration_us());
        }

        let mut guard = shared.state.lock();
        let state = &mut *guard;

        // Patch the 64-bit mdat length in place.
        let mdat_size = state.offset - state.mdat_offset;
        state.file.seek(SeekFrom::Start(state.mdat_offset + 8))?;
        state.file.write_u64::<BigEndian>(mdat_size)?;
        state.file.seek(SeekFrom::Start(state.offset))?;

        // Stage the whole moov in memory so it can land in the reserved
        // region in one pass.
        state.moov = Some(MoovBuffer {
            buf: Vec::with_capacity(shared.estimated_moov_size as usize),
        });
        let creation_time = unix_time_now();

        state.begin_box(b"moov")?;

        state.begin_box(b"mvhd")?;
        state.write_u32(0)?; // version + flags
        state.write_u32(creation_time)?;
        state.write_u32(creation_time)?;
        state.write_u32(1000)?; // timescale: milliseconds
        state.write_u32((max_duration_us / 1000) as u32)?;
        state.write_u32(0x0001_0000)?; // rate 1.0
        state.write_u16(0x0100)?; // volume 1.0
        state.write_u16(0)?; // reserved
        state.write_u32(0)?;
        state.write_u32(0)?;
        state.write_u32(0x0001_0000)?; // unity matrix
        state.write_u32(0)?;
        state.write_u32(0)?;
        state.write_u32(0)?;
        state.write_u32(0x0001_0000)?;
        state.write_u32(0)?;
        state.write_u32(0)?;
        state.write_u32(0)?;
        state.write_u32(0x4000_0000)?;
        for _ in 0..6 {
            state.write_u32(0)?; // pre-defined
        }
        state.write_u32(self.tracks.len() as u32 + 1)?; // next track ID
        state.end_box()?; // mvhd

        for (index, track) in self.tracks.iter().enumerate() {
            track.write_track_header(index as u32 + 1, state)?;
        }
        state.end_box()?; // moov

        if let Some(moov) = state.moov.take() {
            // The staged moov fits: substitute it into the reserved region
            // and let a trailing free box soak up the slack.
            state.file.seek(SeekFrom::Start(state.free_offset))?;
            state.offset = state.free_offset;
            let staged = moov.buf;
            state.write_bytes(&staged)?;
            state.write_u32(shared.estimated_moov_size - staged.len() as u32)?;
            state.write_fourcc(b"free")?;
        }

        if !state.box_stack.is_empty() {
            return Err(MuxError::Track(
                "unbalanced box nesting at finalisation".into(),
            ));
        }
        state.file.flush()?;

        info!(
            duration_ms = max_duration_us / 1000,
            streamable = state.streamable,
            tracks = self.tracks.len(),
            "mux finalised"
        );
        Ok(())
    }
}

impl Drop for Mp4Writer {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}
