//! AAC audio helpers
//!
//! The transport stream carries AAC as ADTS (stream type 0x0F). Encoders usually emit
//! raw access units plus one AudioSpecificConfig; the muxer keeps the config and uses
//! it to prefix every raw frame with a 7-byte ADTS header.
//!
//! ADTS fixed + variable header (no CRC):
//! ```text
//! syncword (12) | ID (1) | layer (2) | protection_absent (1)
//! | profile (2) | sampling_frequency_index (4) | private (1) | channel_config (3)
//! | original/copy (1) | home (1) | copyright id bit/start (2)
//! | frame_length (13) | buffer_fullness (11) | raw_data_blocks (2)
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{MediaError, Result};

/// Size of an ADTS header without CRC
pub const ADTS_HEADER_LEN: usize = 7;

/// Largest frame an ADTS header can describe (13-bit length field)
const ADTS_MAX_FRAME_LEN: usize = 0x1FFF;

/// AAC profile (audio object type)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AacProfile {
    Main = 1,
    /// Low Complexity, by far the most common
    Lc = 2,
    Ssr = 3,
    Ltp = 4,
    /// HE-AAC
    Sbr = 5,
    Scalable = 6,
}

impl AacProfile {
    pub fn from_object_type(ot: u8) -> Option<Self> {
        match ot {
            1 => Some(AacProfile::Main),
            2 => Some(AacProfile::Lc),
            3 => Some(AacProfile::Ssr),
            4 => Some(AacProfile::Ltp),
            5 => Some(AacProfile::Sbr),
            6 => Some(AacProfile::Scalable),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            AacProfile::Main => "AAC Main",
            AacProfile::Lc => "AAC LC",
            AacProfile::Ssr => "AAC SSR",
            AacProfile::Ltp => "AAC LTP",
            AacProfile::Sbr => "HE-AAC",
            AacProfile::Scalable => "AAC Scalable",
        }
    }
}

/// Decoder configuration reported by an AAC encoder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioSpecificConfig {
    /// Audio object type (profile)
    pub audio_object_type: u8,
    pub sampling_frequency_index: u8,
    /// Sampling frequency in Hz
    pub sampling_frequency: u32,
    /// Channel configuration (1=mono, 2=stereo, etc.)
    pub channel_configuration: u8,
    /// 960-sample frames when set, 1024 otherwise
    pub frame_length_flag: bool,
    /// Raw config bytes
    pub raw: Bytes,
}

impl AudioSpecificConfig {
    /// Standard sampling frequencies by index
    const SAMPLING_FREQUENCIES: [u32; 13] = [
        96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350,
    ];

    /// Parse the bit-packed config
    ///
    /// Explicit (escape index 0xF) frequencies cannot be expressed in ADTS and are
    /// rejected.
    pub fn parse(data: Bytes) -> Result<Self> {
        if data.len() < 2 {
            return Err(MediaError::InvalidAacPacket.into());
        }

        let b0 = data[0];
        let b1 = data[1];

        let audio_object_type = (b0 >> 3) & 0x1F;
        let sampling_frequency_index = ((b0 & 0x07) << 1) | ((b1 >> 7) & 0x01);
        let sampling_frequency = *Self::SAMPLING_FREQUENCIES
            .get(sampling_frequency_index as usize)
            .ok_or(MediaError::InvalidAacPacket)?;

        if audio_object_type == 0 {
            return Err(MediaError::InvalidAacPacket.into());
        }

        Ok(AudioSpecificConfig {
            audio_object_type,
            sampling_frequency_index,
            sampling_frequency,
            channel_configuration: (b1 >> 3) & 0x0F,
            frame_length_flag: (b1 & 0x04) != 0,
            raw: data,
        })
    }

    /// Build a config for the given profile, rate and channel layout
    pub fn new(profile: AacProfile, sampling_frequency: u32, channels: u8) -> Result<Self> {
        let index = Self::SAMPLING_FREQUENCIES
            .iter()
            .position(|&f| f == sampling_frequency)
            .ok_or(MediaError::InvalidAacPacket)? as u8;
        let object_type = profile as u8;
        let raw = Bytes::copy_from_slice(&[
            (object_type << 3) | (index >> 1),
            ((index & 0x01) << 7) | ((channels & 0x0F) << 3),
        ]);
        Self::parse(raw)
    }

    pub fn profile(&self) -> Option<AacProfile> {
        AacProfile::from_object_type(self.audio_object_type)
    }

    /// Get channel count
    pub fn channels(&self) -> u8 {
        match self.channel_configuration {
            1..=6 => self.channel_configuration,
            7 => 8,
            _ => 0,
        }
    }

    pub fn samples_per_frame(&self) -> u32 {
        if self.frame_length_flag {
            960
        } else {
            1024
        }
    }

    /// Frame duration in microseconds
    pub fn frame_duration_us(&self) -> u64 {
        self.samples_per_frame() as u64 * 1_000_000 / self.sampling_frequency as u64
    }
}

/// Generate the ADTS header for a raw AAC frame of `frame_length` bytes
pub fn generate_adts_header(config: &AudioSpecificConfig, frame_length: usize) -> [u8; 7] {
    // ADTS stores object type minus one
    let profile = config.audio_object_type.saturating_sub(1);
    let freq_idx = config.sampling_frequency_index;
    let channels = config.channel_configuration;
    let frame_len = frame_length + ADTS_HEADER_LEN;

    [
        0xFF,
        0xF1, // MPEG-4, layer 0, no CRC
        ((profile & 0x03) << 6) | ((freq_idx & 0x0F) << 2) | ((channels >> 2) & 0x01),
        ((channels & 0x03) << 6) | ((frame_len >> 11) & 0x03) as u8,
        ((frame_len >> 3) & 0xFF) as u8,
        (((frame_len & 0x07) << 5) | 0x1F) as u8,
        0xFC,
    ]
}

/// Whether a frame already starts with an ADTS syncword
pub fn is_adts(data: &[u8]) -> bool {
    data.len() >= ADTS_HEADER_LEN && data[0] == 0xFF && (data[1] & 0xF6) == 0xF0
}

/// Prefix a raw AAC frame with an ADTS header
///
/// Frames that are already ADTS framed are returned unchanged.
pub fn wrap_adts(config: &AudioSpecificConfig, frame: Bytes) -> Result<Bytes> {
    if is_adts(&frame) {
        return Ok(frame);
    }
    if frame.len() + ADTS_HEADER_LEN > ADTS_MAX_FRAME_LEN {
        return Err(MediaError::InvalidAacPacket.into());
    }

    let mut out = BytesMut::with_capacity(frame.len() + ADTS_HEADER_LEN);
    out.put_slice(&generate_adts_header(config, frame.len()));
    out.put_slice(&frame);
    Ok(out.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lc_stereo_44k() -> AudioSpecificConfig {
        AudioSpecificConfig::parse(Bytes::from_static(&[0x12, 0x10])).unwrap()
    }

    #[test]
    fn test_audio_specific_config_parse() {
        let config = lc_stereo_44k();
        assert_eq!(config.audio_object_type, 2);
        assert_eq!(config.sampling_frequency_index, 4);
        assert_eq!(config.sampling_frequency, 44100);
        assert_eq!(config.channel_configuration, 2);
        assert_eq!(config.channels(), 2);
        assert_eq!(config.profile(), Some(AacProfile::Lc));
        assert_eq!(config.samples_per_frame(), 1024);
    }

    #[test]
    fn test_audio_specific_config_various_rates() {
        // obj=2, freq_idx=3 (48 kHz): b0 = 0x11, b1 = 0x80 | (ch << 3)
        let cases = [
            (&[0x12, 0x10][..], 44100, 2),
            (&[0x11, 0x90][..], 48000, 2),
            (&[0x11, 0x88][..], 48000, 1),
        ];

        for (data, freq, channels) in cases {
            let config = AudioSpecificConfig::parse(Bytes::copy_from_slice(data)).unwrap();
            assert_eq!(config.sampling_frequency, freq, "rate for {:02X?}", data);
            assert_eq!(config.channel_configuration, channels, "channels for {:02X?}", data);
        }
    }

    #[test]
    fn test_audio_specific_config_rejects_bad_input() {
        assert!(AudioSpecificConfig::parse(Bytes::from_static(&[0x12])).is_err());
        // Escape frequency index 0xF
        assert!(AudioSpecificConfig::parse(Bytes::from_static(&[0x17, 0x90, 0, 0, 0])).is_err());
        // Object type 0
        assert!(AudioSpecificConfig::parse(Bytes::from_static(&[0x02, 0x10])).is_err());
    }

    #[test]
    fn test_config_new_matches_parse() {
        let built = AudioSpecificConfig::new(AacProfile::Lc, 44100, 2).unwrap();
        assert_eq!(built, lc_stereo_44k());
        assert!(AudioSpecificConfig::new(AacProfile::Lc, 12345, 2).is_err());
    }

    #[test]
    fn test_frame_duration() {
        let config = AudioSpecificConfig::new(AacProfile::Lc, 48000, 2).unwrap();
        assert_eq!(config.frame_duration_us(), 21_333);
    }

    #[test]
    fn test_channel_mapping() {
        let mut config = lc_stereo_44k();
        for (value, expected) in [(0, 0), (1, 1), (6, 6), (7, 8), (8, 0)] {
            config.channel_configuration = value;
            assert_eq!(config.channels(), expected);
        }
    }

    #[test]
    fn test_adts_header_fields() {
        let header = generate_adts_header(&lc_stereo_44k(), 100);
        assert_eq!(header[0], 0xFF);
        assert_eq!(header[1], 0xF1);
        // profile LC (1), index 4, channel high bit 0
        assert_eq!(header[2], 0x50);

        let frame_len = (((header[3] & 0x03) as usize) << 11)
            | ((header[4] as usize) << 3)
            | ((header[5] >> 5) as usize);
        assert_eq!(frame_len, 107);
        assert_eq!(header[3] >> 6, 2);
    }

    #[test]
    fn test_wrap_adts() {
        let config = lc_stereo_44k();
        let raw = Bytes::from_static(&[0x21, 0x00, 0x49, 0x90, 0x02]);

        let wrapped = wrap_adts(&config, raw.clone()).unwrap();
        assert_eq!(wrapped.len(), raw.len() + ADTS_HEADER_LEN);
        assert!(is_adts(&wrapped));
        assert_eq!(&wrapped[ADTS_HEADER_LEN..], &raw[..]);

        // Already framed input passes through
        let again = wrap_adts(&config, wrapped.clone()).unwrap();
        assert_eq!(again, wrapped);
    }

    #[test]
    fn test_wrap_adts_rejects_oversized_frame() {
        let big = Bytes::from(vec![0u8; ADTS_MAX_FRAME_LEN]);
        assert!(wrap_adts(&lc_stereo_44k(), big).is_err());
    }

    #[test]
    fn test_profile_names() {
        assert_eq!(AacProfile::Lc.name(), "AAC LC");
        assert_eq!(AacProfile::Sbr.name(), "HE-AAC");
        assert_eq!(AacProfile::from_object_type(7), None);
    }
}
