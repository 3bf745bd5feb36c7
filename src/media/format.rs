//! Stream format descriptions reported by encoders

use bytes::Bytes;

use super::aac::AudioSpecificConfig;
use super::frame::StreamKind;

/// Video codec carried in the transport stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoCodec {
    H264,
    H265,
}

impl VideoCodec {
    /// PMT stream_type for this codec
    pub fn stream_type(&self) -> u8 {
        match self {
            VideoCodec::H264 => 0x1B,
            VideoCodec::H265 => 0x24,
        }
    }
}

/// Video stream format
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoFormat {
    pub codec: VideoCodec,
    pub width: u32,
    pub height: u32,
    /// Parameter sets known at format time (Annex-B or avcC record)
    ///
    /// Encoders that deliver SPS/PPS as a config frame leave this empty.
    pub parameter_sets: Option<Bytes>,
}

impl VideoFormat {
    pub fn h264(width: u32, height: u32) -> Self {
        Self {
            codec: VideoCodec::H264,
            width,
            height,
            parameter_sets: None,
        }
    }

    pub fn h265(width: u32, height: u32) -> Self {
        Self {
            codec: VideoCodec::H265,
            width,
            height,
            parameter_sets: None,
        }
    }

    pub fn with_parameter_sets(mut self, parameter_sets: impl Into<Bytes>) -> Self {
        self.parameter_sets = Some(parameter_sets.into());
        self
    }

    /// Whether two formats describe the same elementary stream layout
    pub(crate) fn same_stream(&self, other: &VideoFormat) -> bool {
        self.codec == other.codec && self.width == other.width && self.height == other.height
    }
}

/// Audio stream format (AAC only)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFormat {
    /// Decoder config when known at format time
    pub config: Option<AudioSpecificConfig>,
}

impl AudioFormat {
    pub fn aac(config: AudioSpecificConfig) -> Self {
        Self {
            config: Some(config),
        }
    }

    /// AAC stream whose config arrives later as a config frame
    pub fn aac_pending() -> Self {
        Self { config: None }
    }

    /// PMT stream_type (AAC with ADTS transport)
    pub fn stream_type(&self) -> u8 {
        0x0F
    }
}

/// Format of either stream, as reported through an encoder output
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamFormat {
    Video(VideoFormat),
    Audio(AudioFormat),
}

impl StreamFormat {
    pub fn kind(&self) -> StreamKind {
        match self {
            StreamFormat::Video(_) => StreamKind::Video,
            StreamFormat::Audio(_) => StreamKind::Audio,
        }
    }
}

impl From<VideoFormat> for StreamFormat {
    fn from(format: VideoFormat) -> Self {
        StreamFormat::Video(format)
    }
}

impl From<AudioFormat> for StreamFormat {
    fn from(format: AudioFormat) -> Self {
        StreamFormat::Audio(format)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_types() {
        assert_eq!(VideoCodec::H264.stream_type(), 0x1B);
        assert_eq!(VideoCodec::H265.stream_type(), 0x24);
        assert_eq!(AudioFormat::aac_pending().stream_type(), 0x0F);
    }

    #[test]
    fn test_same_stream_ignores_parameter_sets() {
        let a = VideoFormat::h264(1280, 720);
        let b = VideoFormat::h264(1280, 720).with_parameter_sets(vec![0, 0, 0, 1, 0x67]);
        assert!(a.same_stream(&b));
        assert!(!a.same_stream(&VideoFormat::h265(1280, 720)));
        assert!(!a.same_stream(&VideoFormat::h264(640, 480)));
    }

    #[test]
    fn test_stream_format_kind() {
        let video: StreamFormat = VideoFormat::h264(320, 240).into();
        let audio: StreamFormat = AudioFormat::aac_pending().into();
        assert_eq!(video.kind(), StreamKind::Video);
        assert_eq!(audio.kind(), StreamKind::Audio);
    }
}
