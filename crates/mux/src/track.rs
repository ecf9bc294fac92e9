//! Per-track sample pipeline.
//!
//! Each attached source gets a dedicated producer thread that pulls encoded
//! samples, captures codec configuration (flagged or not), conditions the
//! payload for storage, accumulates the index tables, and flushes
//! interleaved chunks to the file under the writer lock. After the thread is
//! joined its tables are serialised into the track's `trak` subtree.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{error, info, warn};

use lm_common::{MediaCodec, MediaSource, MuxerEvent, TrackFormat};

use crate::avc;
use crate::error::{MuxError, MuxResult};
use crate::tables::{SampleInfo, StscEntry, SttsEntry, TrackTables};
use crate::writer::{unix_time_now, OutputState, WriterShared};

/// MPEG-4 Visual VOP start code; everything before it in an unflagged first
/// sample is the VOL header.
const VOP_START_CODE: [u8; 4] = [0x00, 0x00, 0x01, 0xB6];

// DecoderConfigDescriptor tails: 24-bit bufferSizeDB, then max and average
// bitrate as 32-bit values.
const AAC_DECODER_RATES: [u8; 11] = [
    0x00, 0x03, 0x00, // bufferSizeDB
    0x00, 0x01, 0x77, 0x00, // max bitrate: 96000
    0x00, 0x01, 0x77, 0x00, // avg bitrate: 96000
];
const MPEG4_DECODER_RATES: [u8; 11] = [
    0x01, 0x77, 0x00, // bufferSizeDB
    0x00, 0x03, 0xE8, 0x00, // max bitrate: 256000
    0x00, 0x03, 0xE8, 0x00, // avg bitrate: 256000
];

// ---------------------------------------------------------------------------
// Cross-thread track state
// ---------------------------------------------------------------------------

/// Counters and flags shared between a track's producer thread, the writer's
/// limit predicates, and the control thread.
pub(crate) struct TrackShared {
    done: AtomicBool,
    reached_eos: AtomicBool,
    first_timestamp_us: AtomicI64,
    max_timestamp_us: AtomicI64,
    estimated_size_bytes: AtomicI64,
}

impl TrackShared {
    fn new() -> Self {
        Self {
            done: AtomicBool::new(false),
            reached_eos: AtomicBool::new(false),
            first_timestamp_us: AtomicI64::new(0),
            max_timestamp_us: AtomicI64::new(0),
            estimated_size_bytes: AtomicI64::new(0),
        }
    }

    fn reset(&self) {
        self.done.store(false, Ordering::SeqCst);
        self.reached_eos.store(false, Ordering::SeqCst);
        self.first_timestamp_us.store(0, Ordering::SeqCst);
        self.max_timestamp_us.store(0, Ordering::SeqCst);
        self.estimated_size_bytes.store(0, Ordering::SeqCst);
    }

    fn mark_done_and_eos(&self) {
        self.done.store(true, Ordering::SeqCst);
        self.reached_eos.store(true, Ordering::SeqCst);
    }

    pub(crate) fn estimated_size_bytes(&self) -> i64 {
        self.estimated_size_bytes.load(Ordering::SeqCst)
    }

    /// Duration of the content accepted so far: the span between the first
    /// and the highest sample timestamp.
    pub(crate) fn duration_us(&self) -> i64 {
        let first = self.first_timestamp_us.load(Ordering::SeqCst);
        let max = self.max_timestamp_us.load(Ordering::SeqCst);
        (max - first).max(0)
    }
}

// ---------------------------------------------------------------------------
// Track (control-thread side)
// ---------------------------------------------------------------------------

/// Codec identity and validated format fields, fixed when the track starts.
#[derive(Clone, Debug)]
struct TrackDesc {
    codec: MediaCodec,
    width: u32,
    height: u32,
    channel_count: u16,
    sample_rate: u32,
}

impl TrackDesc {
    fn from_format(format: &TrackFormat) -> MuxResult<Self> {
        let codec = MediaCodec::from_mime(&format.mime_type).ok_or_else(|| {
            MuxError::InvalidConfig(format!("unsupported mime type '{}'", format.mime_type))
        })?;
        if codec.is_audio() {
            let channel_count = format.channel_count.ok_or_else(|| {
                MuxError::InvalidConfig("audio track without a channel count".into())
            })?;
            let sample_rate = format.sample_rate.ok_or_else(|| {
                MuxError::InvalidConfig("audio track without a sample rate".into())
            })?;
            Ok(Self {
                codec,
                width: 0,
                height: 0,
                channel_count,
                sample_rate,
            })
        } else {
            let width = format
                .width
                .ok_or_else(|| MuxError::InvalidConfig("video track without a width".into()))?;
            let height = format
                .height
                .ok_or_else(|| MuxError::InvalidConfig("video track without a height".into()))?;
            Ok(Self {
                codec,
                width,
                height,
                channel_count: 0,
                sample_rate: 0,
            })
        }
    }
}

/// One media stream inside the output file.
pub(crate) struct Track {
    source: Option<Box<dyn MediaSource>>,
    desc: Option<TrackDesc>,
    shared: Arc<TrackShared>,
    handle: Option<JoinHandle<TrackTables>>,
    tables: TrackTables,
}

impl Track {
    pub(crate) fn new(source: Box<dyn MediaSource>) -> Self {
        Self {
            source: Some(source),
            desc: None,
            shared: Arc::new(TrackShared::new()),
            handle: None,
            tables: TrackTables::default(),
        }
    }

    pub(crate) fn shared_handle(&self) -> Arc<TrackShared> {
        Arc::clone(&self.shared)
    }

    pub(crate) fn reached_eos(&self) -> bool {
        self.shared.reached_eos.load(Ordering::SeqCst)
    }

    pub(crate) fn duration_us(&self) -> i64 {
        self.shared.duration_us()
    }

    /// Resolve the codec, start the source, and spawn the producer thread.
    pub(crate) fn start(&mut self, track_id: usize, writer: Arc<WriterShared>) -> MuxResult<()> {
        let mut source = self
            .source
            .take()
            .ok_or_else(|| MuxError::Track(format!("track {track_id} already started")))?;

        let desc = match TrackDesc::from_format(&source.format()) {
            Ok(desc) => desc,
            Err(err) => {
                self.shared.mark_done_and_eos();
                return Err(err);
            }
        };
        if let Err(err) = source.start() {
            self.shared.mark_done_and_eos();
            return Err(err.into());
        }

        self.shared.reset();
        info!(
            track_id,
            codec = desc.codec.display_name(),
            "starting track producer"
        );

        let worker = SampleWorker {
            writer,
            track: Arc::clone(&self.shared),
            codec: desc.codec,
            source,
            tables: TrackTables::default(),
            chunk_samples: Vec::new(),
            got_all_codec_specific_data: false,
        };
        self.desc = Some(desc);

        let handle = thread::Builder::new()
            .name(format!("mux-track-{track_id}"))
            .spawn(move || worker.run())
            .map_err(|e| {
                self.shared.mark_done_and_eos();
                MuxError::Track(format!("failed to spawn producer for track {track_id}: {e}"))
            })?;
        self.handle = Some(handle);
        Ok(())
    }

    /// Signal the producer to finish, join it, and collect its tables.
    /// Idempotent.
    pub(crate) fn stop(&mut self) {
        self.shared.done.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            match handle.join() {
                Ok(tables) => self.tables = tables,
                Err(_) => warn!("track producer panicked; its samples are lost"),
            }
        }
    }

    // -----------------------------------------------------------------------
    // trak emission (runs on the control thread after the producer joined)
    // -----------------------------------------------------------------------

    pub(crate) fn write_track_header(
        &self,
        track_id: u32,
        state: &mut OutputState,
    ) -> MuxResult<()> {
        let desc = self
            .desc
            .as_ref()
            .ok_or_else(|| MuxError::Track(format!("track {track_id} was never started")))?;
        let is_audio = desc.codec.is_audio();
        let duration_ms = self.duration_us() / 1000;
        let creation_time = unix_time_now();

        state.begin_box(b"trak")?;

        state.begin_box(b"tkhd")?;
        state.write_u32(0)?; // version + flags
        state.write_u32(creation_time)?;
        state.write_u32(creation_time)?;
        state.write_u32(track_id)?;
        state.write_u32(0)?; // reserved
        state.write_u32(duration_ms as u32)?;
        state.write_u32(0)?; // reserved
        state.write_u32(0)?;
        state.write_i16(0)?; // layer
        state.write_i16(0)?; // alternate group
        state.write_u16(if is_audio { 0x0100 } else { 0 })?; // volume
        state.write_u16(0)?; // reserved
        state.write_u32(0x0001_0000)?; // unity matrix
        state.write_u32(0)?;
        state.write_u32(0)?;
        state.write_u32(0)?;
        state.write_u32(0x0001_0000)?;
        state.write_u32(0)?;
        state.write_u32(0)?;
        state.write_u32(0)?;
        state.write_u32(0x4000_0000)?;
        if is_audio {
            state.write_u32(0)?;
            state.write_u32(0)?;
        } else {
            state.write_u32(desc.width << 16)?; // 16.16 fixed point
            state.write_u32(desc.height << 16)?;
        }
        state.end_box()?; // tkhd

        if self.tables.start_timestamp_us > 0 {
            // Delay playback of a late-starting track with one empty edit.
            state.begin_box(b"edts")?;
            state.begin_box(b"elst")?;
            state.write_u32(0)?; // version + flags
            state.write_u32(1)?; // entry count
            state.write_u32((self.tables.start_timestamp_us / 1000) as u32)?; // edit duration
            state.write_i32(-1)?; // empty edit
            state.write_u32(1)?; // media rate
            state.end_box()?;
            state.end_box()?;
        }

        state.begin_box(b"mdia")?;

        state.begin_box(b"mdhd")?;
        state.write_u32(0)?; // version + flags
        state.write_u32(creation_time)?;
        state.write_u32(creation_time)?;
        state.write_u32(1000)?; // timescale: milliseconds
        state.write_u32(duration_ms as u32)?;
        state.write_u16(0)?; // language
        state.write_u16(0)?; // pre-defined
        state.end_box()?; // mdhd

        state.begin_box(b"hdlr")?;
        state.write_u32(0)?; // version + flags
        state.write_u32(0)?; // component type
        state.write_fourcc(if is_audio { b"soun" } else { b"vide" })?;
        state.write_u32(0)?; // reserved
        state.write_u32(0)?;
        state.write_u32(0)?;
        state.write_cstring(if is_audio { "SoundHandler" } else { "" })?;
        state.end_box()?; // hdlr

        state.begin_box(b"minf")?;
        if is_audio {
            state.begin_box(b"smhd")?;
            state.write_u32(0)?; // version + flags
            state.write_i16(0)?; // balance
            state.write_u16(0)?; // reserved
            state.end_box()?;
        } else {
            state.begin_box(b"vmhd")?;
            state.write_u32(0x0000_0001)?; // version=0, flags=1
            state.write_u16(0)?; // graphics mode
            state.write_u16(0)?; // opcolor
            state.write_u16(0)?;
            state.write_u16(0)?;
            state.end_box()?;
        }

        state.begin_box(b"dinf")?;
        state.begin_box(b"dref")?;
        state.write_u32(0)?; // version + flags
        state.write_u32(1)?; // entry count
        state.begin_box(b"url ")?;
        state.write_u32(1)?; // flags: data in this file
        state.end_box()?;
        state.end_box()?; // dref
        state.end_box()?; // dinf

        self.write_sample_table(desc, state)?;

        state.end_box()?; // minf
        state.end_box()?; // mdia
        state.end_box()?; // trak
        Ok(())
    }

    fn write_sample_table(&self, desc: &TrackDesc, state: &mut OutputState) -> MuxResult<()> {
        let tables = &self.tables;
        state.begin_box(b"stbl")?;

        state.begin_box(b"stsd")?;
        state.write_u32(0)?; // version + flags
        state.write_u32(1)?; // entry count
        if desc.codec.is_audio() {
            self.write_audio_sample_entry(desc, state)?;
        } else {
            self.write_video_sample_entry(desc, state)?;
        }
        state.end_box()?; // stsd

        state.begin_box(b"stts")?;
        state.write_u32(0)?; // version + flags
        state.write_u32(tables.stts.len() as u32)?;
        for entry in &tables.stts {
            state.write_u32(entry.sample_count)?;
            state.write_u32(entry.sample_duration_ms)?;
        }
        state.end_box()?; // stts

        if !desc.codec.is_audio() {
            state.begin_box(b"stss")?;
            state.write_u32(0)?; // version + flags
            state.write_u32(tables.stss.len() as u32)?;
            for &sample_number in &tables.stss {
                state.write_u32(sample_number)?;
            }
            state.end_box()?; // stss
        }

        state.begin_box(b"stsz")?;
        state.write_u32(0)?; // version + flags
        if tables.samples_have_same_size && !tables.sample_infos.is_empty() {
            state.write_u32(tables.sample_infos[0].size)?; // default sample size
        } else {
            state.write_u32(0)?;
        }
        state.write_u32(tables.sample_infos.len() as u32)?;
        if !tables.samples_have_same_size {
            for info in &tables.sample_infos {
                state.write_u32(info.size)?;
            }
        }
        state.end_box()?; // stsz

        state.begin_box(b"stsc")?;
        state.write_u32(0)?; // version + flags
        state.write_u32(tables.stsc.len() as u32)?;
        for entry in &tables.stsc {
            state.write_u32(entry.first_chunk)?;
            state.write_u32(entry.samples_per_chunk)?;
            state.write_u32(entry.sample_description_id)?;
        }
        state.end_box()?; // stsc

        state.begin_box(b"co64")?;
        state.write_u32(0)?; // version + flags
        state.write_u32(tables.chunk_offsets.len() as u32)?;
        for &offset in &tables.chunk_offsets {
            state.write_u64(offset)?;
        }
        state.end_box()?; // co64

        state.end_box() // stbl
    }

    fn write_audio_sample_entry(&self, desc: &TrackDesc, state: &mut OutputState) -> MuxResult<()> {
        state.begin_box(desc.codec.sample_entry_fourcc())?;
        state.write_u32(0)?; // reserved
        state.write_u16(0)?; // reserved
        state.write_u16(1)?; // data reference index
        state.write_u32(0)?; // reserved
        state.write_u32(0)?;
        state.write_u16(desc.channel_count)?;
        state.write_u16(16)?; // sample size (bits)
        state.write_u16(0)?; // pre-defined
        state.write_u16(0)?; // reserved
        state.write_u32(desc.sample_rate << 16)?; // 16.16 fixed point
        if desc.codec == MediaCodec::Aac {
            let csd = self.tables.codec_specific_data.as_deref().unwrap_or(&[]);
            write_esds(state, 0x40, 0x15, 0x00, &AAC_DECODER_RATES, csd)?;
        }
        state.end_box()
    }

    fn write_video_sample_entry(&self, desc: &TrackDesc, state: &mut OutputState) -> MuxResult<()> {
        state.begin_box(desc.codec.sample_entry_fourcc())?;
        state.write_u32(0)?; // reserved
        state.write_u16(0)?; // reserved
        state.write_u16(0)?; // data reference index
        state.write_u16(0)?; // pre-defined
        state.write_u16(0)?; // reserved
        state.write_u32(0)?; // pre-defined
        state.write_u32(0)?;
        state.write_u32(0)?;
        state.write_u16(desc.width as u16)?;
        state.write_u16(desc.height as u16)?;
        state.write_u32(0x0048_0000)?; // horizontal resolution: 72 dpi
        state.write_u32(0x0048_0000)?; // vertical resolution: 72 dpi
        state.write_u32(0)?; // reserved
        state.write_u16(1)?; // frame count
        state.write_bytes(&[b' '; 32])?; // compressor name
        state.write_u16(0x0018)?; // depth
        state.write_i16(-1)?; // pre-defined
        match desc.codec {
            MediaCodec::Mpeg4Video => {
                let csd = self.tables.codec_specific_data.as_deref().unwrap_or(&[]);
                write_esds(state, 0x20, 0x11, 0x1F, &MPEG4_DECODER_RATES, csd)?;
            }
            MediaCodec::H263 => {
                state.begin_box(b"d263")?;
                state.write_u32(0)?; // vendor
                state.write_u8(0)?; // decoder version
                state.write_u8(10)?; // level
                state.write_u8(0)?; // profile
                state.end_box()?;
            }
            MediaCodec::Avc => {
                state.begin_box(b"avcC")?;
                if let Some(csd) = &self.tables.codec_specific_data {
                    state.write_bytes(csd)?;
                }
                state.end_box()?;
            }
            _ => unreachable!("audio codec in a video sample entry"),
        }
        state.end_box()
    }
}

/// MPEG-4 Systems elementary stream descriptor, embedded by the AAC and
/// MPEG-4 Visual sample entries.
fn write_esds(
    state: &mut OutputState,
    object_type_indication: u8,
    stream_type: u8,
    stream_priority: u8,
    decoder_rates: &[u8; 11],
    csd: &[u8],
) -> MuxResult<()> {
    // Descriptor lengths use the single-byte form; codec configs are tiny.
    if 23 + csd.len() >= 128 {
        return Err(MuxError::MalformedStream(
            "codec specific data too large for esds".into(),
        ));
    }
    state.begin_box(b"esds")?;
    state.write_u32(0)?; // version + flags
    state.write_u8(0x03)?; // ES_Descriptor
    state.write_u8(23 + csd.len() as u8)?;
    state.write_u16(0)?; // ES_ID
    state.write_u8(stream_priority)?;
    state.write_u8(0x04)?; // DecoderConfigDescriptor
    state.write_u8(15 + csd.len() as u8)?;
    state.write_u8(object_type_indication)?;
    state.write_u8(stream_type)?;
    state.write_bytes(decoder_rates)?;
    state.write_u8(0x05)?; // DecoderSpecificInfo
    state.write_u8(csd.len() as u8)?;
    state.write_bytes(csd)?;
    state.write_bytes(&[0x06, 0x01, 0x02])?; // SLConfigDescriptor
    state.end_box()
}

// ---------------------------------------------------------------------------
// Producer thread
// ---------------------------------------------------------------------------

/// The per-track pull loop. Owns the source for the duration of the
/// recording and returns the finished index tables through the join handle.
struct SampleWorker {
    writer: Arc<WriterShared>,
    track: Arc<TrackShared>,
    codec: MediaCodec,
    source: Box<dyn MediaSource>,
    tables: TrackTables,
    chunk_samples: Vec<Vec<u8>>,
    got_all_codec_specific_data: bool,
}

impl SampleWorker {
    fn run(mut self) -> TrackTables {
        let is_avc = self.codec == MediaCodec::Avc;
        // AAC and MPEG-4 Visual both carry an MPEG-4 Systems decoder
        // specific blob, stored verbatim when flagged.
        let stores_raw_config = matches!(self.codec, MediaCodec::Aac | MediaCodec::Mpeg4Video);
        let interleave_duration_us = self.writer.interleave_duration_us;

        let mut count: u32 = 0;
        let mut n_zero_length: u32 = 0;
        let mut chunk_timestamp_us: i64 = 0;
        let mut n_chunks: u32 = 0;
        let mut last_timestamp_ms: i64 = 0;
        // Spacing between the previous two samples; repeated for the final
        // sample, whose own duration is unknowable.
        let mut last_duration_ms: i64 = 0;
        let mut stts_sample_count: u32 = 1;
        let mut previous_sample_size: u32 = 0;
        // Accumulates unflagged SPS/PPS samples until both have arrived.
        let mut pending_avc_config: Vec<u8> = Vec::new();

        while !self.track.done.load(Ordering::SeqCst) {
            let Some(mut buffer) = self.source.read() else {
                break;
            };
            if buffer.range_length() == 0 {
                n_zero_length += 1;
                continue;
            }
            count += 1;

            // --- codec configuration capture -------------------------------
            if buffer.meta.is_codec_config {
                if self.got_all_codec_specific_data {
                    error!("codec config arrived twice, aborting track");
                    break;
                }
                if is_avc {
                    match avc::make_avc_config(buffer.bytes()) {
                        Ok(record) => self.tables.codec_specific_data = Some(record),
                        Err(err) => {
                            error!(%err, "bad AVC codec config, aborting track");
                            break;
                        }
                    }
                } else if stores_raw_config {
                    self.tables.codec_specific_data = Some(buffer.bytes().to_vec());
                }
                self.got_all_codec_specific_data = true;
                continue;
            } else if !self.got_all_codec_specific_data
                && count == 1
                && self.codec == MediaCodec::Mpeg4Video
                && self.tables.codec_specific_data.is_none()
            {
                // Some encoders fail to flag their configuration sample; the
                // VOL header runs up to the first VOP start code.
                let (vol_len, total_len) = {
                    let data = buffer.bytes();
                    let mut offset = 0;
                    while offset + 3 < data.len() {
                        if data[offset..offset + 4] == VOP_START_CODE {
                            break;
                        }
                        offset += 1;
                    }
                    if offset + 3 >= data.len() {
                        offset = data.len(); // no VOP: the whole sample is config
                    }
                    self.tables.codec_specific_data = Some(data[..offset].to_vec());
                    (offset, data.len())
                };
                if vol_len == total_len {
                    continue;
                }
                buffer.set_range(
                    buffer.range_offset() + vol_len,
                    buffer.range_length() - vol_len,
                );
                self.got_all_codec_specific_data = true;
            } else if !self.got_all_codec_specific_data && is_avc && count < 3 {
                // SPS and PPS may arrive unflagged as the first two samples.
                pending_avc_config.extend_from_slice(&[0x00, 0x00, 0x00, 0x01]);
                pending_avc_config.extend_from_slice(buffer.bytes());
                if count == 2 {
                    let blob = std::mem::take(&mut pending_avc_config);
                    match avc::make_avc_config(&blob) {
                        Ok(record) => self.tables.codec_specific_data = Some(record),
                        Err(err) => {
                            error!(%err, "bad AVC parameter sets, aborting track");
                            break;
                        }
                    }
                    self.got_all_codec_specific_data = true;
                }
                continue;
            }

            // --- sample acceptance -----------------------------------------

            // Copy the payload out of the source's buffer so it can be
            // recycled immediately.
            let meta = buffer.meta.clone();
            let payload = if is_avc {
                avc::strip_start_code(buffer.bytes()).to_vec()
            } else {
                buffer.bytes().to_vec()
            };
            drop(buffer);

            let mut info = SampleInfo {
                size: payload.len() as u32 + if is_avc { avc::NAL_LENGTH_SIZE } else { 0 },
                timestamp_ms: 0,
            };

            // Limits are checked against the running estimate before the
            // sample is accepted into the tables.
            self.track
                .estimated_size_bytes
                .fetch_add(info.size as i64, Ordering::SeqCst);
            if self.writer.exceeds_file_size_limit() {
                self.send_event(MuxerEvent::MaxFileSizeReached);
                break;
            }
            if self.writer.exceeds_file_duration_limit() {
                self.send_event(MuxerEvent::MaxDurationReached);
                break;
            }

            let Some(timestamp_us) = meta.timestamp_us else {
                error!("sample without a timestamp, aborting track");
                break;
            };

            if self.tables.sample_infos.is_empty() {
                let movie_start_us = self.writer.set_start_timestamp(timestamp_us);
                self.tables.start_timestamp_us = timestamp_us - movie_start_us;
                self.track
                    .first_timestamp_us
                    .store(timestamp_us, Ordering::SeqCst);
            }
            self.track
                .max_timestamp_us
                .fetch_max(timestamp_us, Ordering::SeqCst);

            info.timestamp_ms = (timestamp_us + 500) / 1000;
            self.tables.sample_infos.push(info);
            if self.tables.sample_infos.len() > 2 {
                let duration_ms = info.timestamp_ms - last_timestamp_ms;
                if last_duration_ms != duration_ms {
                    self.tables.stts.push(SttsEntry {
                        sample_count: stts_sample_count,
                        sample_duration_ms: last_duration_ms as u32,
                    });
                    stts_sample_count = 1;
                } else {
                    stts_sample_count += 1;
                }
            }
            if self.tables.samples_have_same_size {
                if self.tables.sample_infos.len() >= 2 && previous_sample_size != info.size {
                    self.tables.samples_have_same_size = false;
                }
                previous_sample_size = info.size;
            }
            last_duration_ms = info.timestamp_ms - last_timestamp_ms;
            last_timestamp_ms = info.timestamp_ms;

            if meta.is_sync_frame {
                self.tables.stss.push(self.tables.sample_infos.len() as u32);
            }

            // --- chunk interleaving ----------------------------------------
            self.chunk_samples.push(payload);
            if interleave_duration_us == 0 {
                n_chunks += 1;
                self.tables.stsc.push(StscEntry {
                    first_chunk: n_chunks,
                    samples_per_chunk: 1,
                    sample_description_id: 1,
                });
                if let Err(err) = self.write_one_chunk(is_avc) {
                    error!(%err, "chunk flush failed, aborting track");
                    break;
                }
            } else if chunk_timestamp_us == 0 {
                chunk_timestamp_us = timestamp_us;
            } else if timestamp_us - chunk_timestamp_us > interleave_duration_us {
                n_chunks += 1;
                let samples_in_chunk = self.chunk_samples.len() as u32;
                let previous_run = self.tables.stsc.last().map(|e| e.samples_per_chunk);
                if n_chunks == 1 || previous_run != Some(samples_in_chunk) {
                    self.tables.stsc.push(StscEntry {
                        first_chunk: n_chunks,
                        samples_per_chunk: samples_in_chunk,
                        sample_description_id: 1,
                    });
                }
                if let Err(err) = self.write_one_chunk(is_avc) {
                    error!(%err, "chunk flush failed, aborting track");
                    break;
                }
                chunk_timestamp_us = timestamp_us;
            }
        }

        // --- end of stream -------------------------------------------------

        if self.tables.sample_infos.is_empty() {
            self.send_event(MuxerEvent::StopPrematurely);
        }

        // Flush whatever is pending as the final chunk.
        if !self.chunk_samples.is_empty() {
            n_chunks += 1;
            self.tables.stsc.push(StscEntry {
                first_chunk: n_chunks,
                samples_per_chunk: self.chunk_samples.len() as u32,
                sample_description_id: 1,
            });
            if let Err(err) = self.write_one_chunk(is_avc) {
                error!(%err, "failed to flush the final chunk");
            }
        }

        // Close the timing table; a lone sample gets duration zero.
        if !self.tables.sample_infos.is_empty() {
            if self.tables.sample_infos.len() == 1 {
                last_duration_ms = 0;
            } else {
                stts_sample_count += 1;
            }
            self.tables.stts.push(SttsEntry {
                sample_count: stts_sample_count,
                sample_duration_ms: last_duration_ms as u32,
            });
        }

        self.source.stop();
        self.track.reached_eos.store(true, Ordering::SeqCst);
        info!(
            buffers = count,
            zero_length = n_zero_length,
            samples = self.tables.sample_infos.len(),
            chunks = n_chunks,
            audio = self.codec.is_audio(),
            "track reached end of stream"
        );
        self.tables
    }

    /// Flush the pending chunk under the writer lock; the first sample's
    /// offset becomes the chunk offset.
    fn write_one_chunk(&mut self, is_avc: bool) -> MuxResult<()> {
        let mut guard = self.writer.state.lock();
        let state = &mut *guard;
        for (index, sample) in self.chunk_samples.drain(..).enumerate() {
            let offset = if is_avc {
                state.add_length_prefixed_sample(&sample)?
            } else {
                state.add_sample(&sample)?
            };
            if index == 0 {
                self.tables.chunk_offsets.push(offset);
            }
        }
        Ok(())
    }

    fn send_event(&self, event: MuxerEvent) {
        info!(?event, "muxer event");
        let _ = self.writer.events.send(event);
    }
}
