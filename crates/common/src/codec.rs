//! Recognised elementary-stream MIME types and the codec identifier.

use serde::{Deserialize, Serialize};

/// MPEG-4 Part 2 video (`mp4v` sample entries).
pub const MIME_VIDEO_MPEG4: &str = "video/mp4v-es";
/// H.263 video (`s263` sample entries).
pub const MIME_VIDEO_H263: &str = "video/3gpp";
/// H.264 / AVC video (`avc1` sample entries).
pub const MIME_VIDEO_AVC: &str = "video/avc";
/// AMR narrow-band audio (`samr` sample entries).
pub const MIME_AUDIO_AMR_NB: &str = "audio/3gpp";
/// AMR wide-band audio (`sawb` sample entries).
pub const MIME_AUDIO_AMR_WB: &str = "audio/amr-wb";
/// AAC audio (`mp4a` sample entries).
pub const MIME_AUDIO_AAC: &str = "audio/mp4a-latm";

/// Codec identity of one elementary stream.
///
/// Resolved once from the source's MIME type when a track starts and carried
/// as an immutable field, so the per-sample loop never compares strings.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MediaCodec {
    Aac,
    AmrNb,
    AmrWb,
    Mpeg4Video,
    H263,
    Avc,
}

impl MediaCodec {
    /// Resolve a codec from its MIME type (case-insensitive).
    pub fn from_mime(mime: &str) -> Option<Self> {
        let mime = mime.to_ascii_lowercase();
        match mime.as_str() {
            MIME_AUDIO_AAC => Some(Self::Aac),
            MIME_AUDIO_AMR_NB => Some(Self::AmrNb),
            MIME_AUDIO_AMR_WB => Some(Self::AmrWb),
            MIME_VIDEO_MPEG4 => Some(Self::Mpeg4Video),
            MIME_VIDEO_H263 => Some(Self::H263),
            MIME_VIDEO_AVC => Some(Self::Avc),
            _ => None,
        }
    }

    /// Audio and video streams are discriminated by the `audio/` MIME prefix.
    pub fn is_audio(self) -> bool {
        matches!(self, Self::Aac | Self::AmrNb | Self::AmrWb)
    }

    /// FourCC of the sample description entry this codec uses in `stsd`.
    pub fn sample_entry_fourcc(self) -> &'static [u8; 4] {
        match self {
            Self::Aac => b"mp4a",
            Self::AmrNb => b"samr",
            Self::AmrWb => b"sawb",
            Self::Mpeg4Video => b"mp4v",
            Self::H263 => b"s263",
            Self::Avc => b"avc1",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Self::Aac => "AAC",
            Self::AmrNb => "AMR-NB",
            Self::AmrWb => "AMR-WB",
            Self::Mpeg4Video => "MPEG-4 Visual",
            Self::H263 => "H.263",
            Self::Avc => "H.264/AVC",
        }
    }
}
