//! H.264/AVC helpers
//!
//! Encoders hand the muxer Annex-B byte streams (start-code delimited NAL units).
//! Some encoders describe their format with an `AVCDecoderConfigurationRecord`
//! instead; [`AvcConfig`] converts that record into Annex-B parameter sets so it can
//! be injected in front of key frames.
//!
//! AVCDecoderConfigurationRecord:
//! ```text
//! configurationVersion (1) | AVCProfileIndication (1) | profile_compatibility (1)
//! | AVCLevelIndication (1) | lengthSizeMinusOne (1, lower 2 bits)
//! | numOfSPS (1, lower 5 bits) | { spsLength (2) | spsNALUnit }*
//! | numOfPPS (1) | { ppsLength (2) | ppsNALUnit }*
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{MediaError, Result};

/// Four-byte Annex-B start code
pub const START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

/// Access unit delimiter NAL (primary_pic_type = 7, any slice type)
pub const ACCESS_UNIT_DELIMITER: [u8; 6] = [0x00, 0x00, 0x00, 0x01, 0x09, 0xF0];

/// NAL unit type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NaluType {
    /// Non-IDR slice
    Slice = 1,
    /// Slice data partition A
    SlicePartA = 2,
    /// Slice data partition B
    SlicePartB = 3,
    /// Slice data partition C
    SlicePartC = 4,
    /// IDR slice (keyframe)
    Idr = 5,
    /// Supplemental enhancement information
    Sei = 6,
    /// Sequence parameter set
    Sps = 7,
    /// Picture parameter set
    Pps = 8,
    /// Access unit delimiter
    Aud = 9,
    /// End of sequence
    EndSeq = 10,
    /// End of stream
    EndStream = 11,
    /// Filler data
    Filler = 12,
}

impl NaluType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b & 0x1F {
            1 => Some(NaluType::Slice),
            2 => Some(NaluType::SlicePartA),
            3 => Some(NaluType::SlicePartB),
            4 => Some(NaluType::SlicePartC),
            5 => Some(NaluType::Idr),
            6 => Some(NaluType::Sei),
            7 => Some(NaluType::Sps),
            8 => Some(NaluType::Pps),
            9 => Some(NaluType::Aud),
            10 => Some(NaluType::EndSeq),
            11 => Some(NaluType::EndStream),
            12 => Some(NaluType::Filler),
            _ => None,
        }
    }

    pub fn is_parameter_set(&self) -> bool {
        matches!(self, NaluType::Sps | NaluType::Pps)
    }
}

/// AVC decoder configuration (from an AVCDecoderConfigurationRecord)
#[derive(Debug, Clone)]
pub struct AvcConfig {
    /// AVC profile (66=Baseline, 77=Main, 100=High, etc.)
    pub profile: u8,
    /// Profile compatibility flags
    pub compatibility: u8,
    /// AVC level (e.g., 31 = 3.1)
    pub level: u8,
    /// NALU length size (usually 4)
    pub nalu_length_size: u8,
    /// Sequence Parameter Sets
    pub sps: Vec<Bytes>,
    /// Picture Parameter Sets
    pub pps: Vec<Bytes>,
}

impl AvcConfig {
    /// Parse from AVCDecoderConfigurationRecord
    pub fn parse(mut data: Bytes) -> Result<Self> {
        if data.len() < 7 {
            return Err(MediaError::InvalidAvcPacket.into());
        }

        let version = data.get_u8();
        if version != 1 {
            return Err(MediaError::InvalidAvcPacket.into());
        }

        let profile = data.get_u8();
        let compatibility = data.get_u8();
        let level = data.get_u8();
        let nalu_length_size = (data.get_u8() & 0x03) + 1;

        let num_sps = (data.get_u8() & 0x1F) as usize;
        let sps = read_parameter_sets(&mut data, num_sps)?;

        if data.is_empty() {
            return Err(MediaError::InvalidAvcPacket.into());
        }
        let num_pps = data.get_u8() as usize;
        let pps = read_parameter_sets(&mut data, num_pps)?;

        Ok(AvcConfig {
            profile,
            compatibility,
            level,
            nalu_length_size,
            sps,
            pps,
        })
    }

    /// Collect the SPS and PPS of an Annex-B byte stream
    ///
    /// Profile and level come from the first SPS; other NAL units are skipped.
    pub fn from_annex_b(data: &[u8]) -> Result<Self> {
        let mut sps = Vec::new();
        let mut pps = Vec::new();
        for nal in AnnexBIterator::new(data) {
            let Some(kind) = nal.first().copied().and_then(NaluType::from_byte) else {
                continue;
            };
            if !kind.is_parameter_set() {
                continue;
            }
            let set = Bytes::copy_from_slice(nal);
            match kind {
                NaluType::Sps => sps.push(set),
                _ => pps.push(set),
            }
        }

        let (profile, compatibility, level) = match sps.first() {
            Some(first) if first.len() >= 4 => (first[1], first[2], first[3]),
            _ => return Err(MediaError::InvalidAvcPacket.into()),
        };
        Ok(AvcConfig {
            profile,
            compatibility,
            level,
            nalu_length_size: 4,
            sps,
            pps,
        })
    }

    /// Serialize SPS then PPS as start-code prefixed NAL units
    pub fn to_annex_b(&self) -> Bytes {
        let size: usize = self
            .sps
            .iter()
            .chain(self.pps.iter())
            .map(|ps| ps.len() + START_CODE.len())
            .sum();
        let mut out = BytesMut::with_capacity(size);
        for ps in self.sps.iter().chain(self.pps.iter()) {
            out.put_slice(&START_CODE);
            out.put_slice(ps);
        }
        out.freeze()
    }

    /// Get profile name
    pub fn profile_name(&self) -> &'static str {
        match self.profile {
            66 => "Baseline",
            77 => "Main",
            88 => "Extended",
            100 => "High",
            110 => "High 10",
            122 => "High 4:2:2",
            244 => "High 4:4:4",
            _ => "Unknown",
        }
    }

    /// Get level as string (e.g., "3.1")
    pub fn level_string(&self) -> String {
        format!("{}.{}", self.level / 10, self.level % 10)
    }
}

fn read_parameter_sets(data: &mut Bytes, count: usize) -> Result<Vec<Bytes>> {
    let mut sets = Vec::with_capacity(count);
    for _ in 0..count {
        if data.len() < 2 {
            return Err(MediaError::InvalidAvcPacket.into());
        }
        let len = data.get_u16() as usize;
        if data.len() < len {
            return Err(MediaError::InvalidAvcPacket.into());
        }
        sets.push(data.copy_to_bytes(len));
    }
    Ok(sets)
}

/// Whether the bytes look like an AVCDecoderConfigurationRecord rather than Annex-B
pub fn is_avcc_record(data: &[u8]) -> bool {
    data.len() >= 7 && data[0] == 0x01 && !data.starts_with(&[0x00, 0x00])
}

/// Normalize video configuration bytes to Annex-B
///
/// Annex-B input is returned unchanged.
pub fn parameter_sets_to_annex_b(data: Bytes) -> Result<Bytes> {
    if is_avcc_record(&data) {
        Ok(AvcConfig::parse(data)?.to_annex_b())
    } else {
        Ok(data)
    }
}

/// Iterator over NAL units in an Annex-B byte stream
///
/// Yields NAL unit bodies without their start codes. Both three- and four-byte
/// start codes are recognized.
pub struct AnnexBIterator<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> AnnexBIterator<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        let offset = find_start_code(data, 0).map_or(data.len(), |(_, body)| body);
        Self { data, offset }
    }
}

impl<'a> Iterator for AnnexBIterator<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.data.len() {
            return None;
        }

        let start = self.offset;
        match find_start_code(self.data, start) {
            Some((code, body)) => {
                self.offset = body;
                Some(&self.data[start..code])
            }
            None => {
                self.offset = self.data.len();
                Some(&self.data[start..])
            }
        }
    }
}

/// Find the next start code at or after `from`
///
/// Returns (position of the start code, position of the NAL body).
fn find_start_code(data: &[u8], from: usize) -> Option<(usize, usize)> {
    let mut i = from;
    while i + 3 <= data.len() {
        if data[i] == 0 && data[i + 1] == 0 {
            if data[i + 2] == 1 {
                let code = if i > from && data[i - 1] == 0 { i - 1 } else { i };
                return Some((code, i + 3));
            }
            if data[i + 2] == 0 {
                i += 1;
                continue;
            }
        }
        i += 1;
    }
    None
}

/// Check whether an Annex-B access unit starts with an access unit delimiter
pub fn starts_with_aud(data: &[u8]) -> bool {
    AnnexBIterator::new(data)
        .next()
        .and_then(|nal| nal.first().copied())
        .and_then(NaluType::from_byte)
        == Some(NaluType::Aud)
}

/// Drop a leading access unit delimiter, keeping the start code of the next NAL
///
/// Input without a leading delimiter is returned unchanged.
pub fn strip_aud(data: &[u8]) -> &[u8] {
    if !starts_with_aud(data) {
        return data;
    }
    let after_first = find_start_code(data, 0).map_or(data.len(), |(_, body)| body);
    match find_start_code(data, after_first) {
        Some((code, _)) => &data[code..],
        None => &[],
    }
}
