//! Encoded frame types handed to the muxer by encoders
//!
//! Frames are cheap to clone: the payload is a reference-counted `Bytes`.

use bytes::Bytes;

/// Which elementary stream a frame belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Video,
    Audio,
}

impl std::fmt::Display for StreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamKind::Video => write!(f, "video"),
            StreamKind::Audio => write!(f, "audio"),
        }
    }
}

/// Flags attached to an encoder output buffer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameFlags {
    /// Payload carries decoder configuration (SPS/PPS, AudioSpecificConfig)
    pub config: bool,
    /// Payload is independently decodable
    pub keyframe: bool,
}

/// One unit of encoder output
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    /// Encoded bytes (Annex-B for video, raw or ADTS AAC for audio)
    pub data: Bytes,
    /// Presentation timestamp in microseconds
    pub pts_us: u64,
    pub flags: FrameFlags,
}

impl EncodedFrame {
    /// Create a regular (non-key) frame
    pub fn new(data: impl Into<Bytes>, pts_us: u64) -> Self {
        Self {
            data: data.into(),
            pts_us,
            flags: FrameFlags::default(),
        }
    }

    /// Create a key frame
    pub fn keyframe(data: impl Into<Bytes>, pts_us: u64) -> Self {
        Self {
            data: data.into(),
            pts_us,
            flags: FrameFlags {
                config: false,
                keyframe: true,
            },
        }
    }

    /// Create a configuration frame
    pub fn config(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            pts_us: 0,
            flags: FrameFlags {
                config: true,
                keyframe: false,
            },
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn is_keyframe(&self) -> bool {
        self.flags.keyframe
    }

    pub fn is_config(&self) -> bool {
        self.flags.config
    }

    /// Presentation timestamp on the 90 kHz MPEG system clock
    pub fn pts_90k(&self) -> u64 {
        us_to_90k(self.pts_us)
    }
}

/// Convert microseconds to 90 kHz ticks, wrapped to 33 bits
pub fn us_to_90k(us: u64) -> u64 {
    (us.wrapping_mul(9) / 100) & 0x1_FFFF_FFFF
}
