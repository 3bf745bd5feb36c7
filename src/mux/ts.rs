//! MPEG-2 transport stream packetization (ITU-T H.222.0)
//!
//! Transport packet layout:
//! ```text
//! sync (0x47) | TEI (1) | PUSI (1) | priority (1) | PID (13)
//! | scrambling (2) | adaptation_field_control (2) | continuity_counter (4)
//! | [adaptation field] | payload
//! ```
//!
//! Every packet produced here carries payload, so the continuity counter of a PID
//! advances on each packet. Padding is always done through the adaptation field,
//! never by stuffing PES payload.

use std::collections::HashMap;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{MediaError, Result};

/// Size of one transport unit
pub const TS_PACKET_SIZE: usize = 188;

/// First byte of every transport unit
pub const SYNC_BYTE: u8 = 0x47;

/// Default number of units per network write (1316 bytes)
pub const MAX_UNITS_PER_WRITE: usize = 7;

pub const PAT_PID: u16 = 0x0000;
pub const PMT_PID: u16 = 0x1000;
pub const VIDEO_PID: u16 = 0x0100;
pub const AUDIO_PID: u16 = 0x0101;

pub const PROGRAM_NUMBER: u16 = 1;
pub const TRANSPORT_STREAM_ID: u16 = 1;

/// PES stream id for the first video stream
pub const STREAM_ID_VIDEO: u8 = 0xE0;
/// PES stream id for the first audio stream
pub const STREAM_ID_AUDIO: u8 = 0xC0;

const PACKET_PAYLOAD_SIZE: usize = TS_PACKET_SIZE - 4;
const STUFFING_BYTE: u8 = 0xFF;
const PES_HEADER_LEN: usize = 14;
const PCR_LEN: usize = 6;

const TABLE_ID_PAT: u8 = 0x00;
const TABLE_ID_PMT: u8 = 0x02;

const CRC32_TABLE: [u32; 256] = crc32_table();

const fn crc32_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = (i as u32) << 24;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x8000_0000 != 0 {
                (crc << 1) ^ 0x04C1_1DB7
            } else {
                crc << 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// CRC-32/MPEG-2 as used by PSI sections
pub fn crc32_mpeg2(data: &[u8]) -> u32 {
    data.iter().fold(0xFFFF_FFFF, |crc, &b| {
        (crc << 8) ^ CRC32_TABLE[(((crc >> 24) as u8) ^ b) as usize]
    })
}

/// One entry of the program map
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgramStream {
    pub stream_type: u8,
    pub pid: u16,
}

/// Streams announced in the PMT
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgramMap {
    /// PID whose packets carry the program clock reference
    pub pcr_pid: Option<u16>,
    pub streams: Vec<ProgramStream>,
    /// 5-bit PMT version
    pub version: u8,
}

impl ProgramMap {
    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// Replace the stream list; the version advances when it changed
    ///
    /// Returns whether the stream set changed.
    pub fn update(&mut self, streams: Vec<ProgramStream>) -> bool {
        if streams == self.streams {
            return false;
        }
        self.pcr_pid = streams.first().map(|s| s.pid);
        self.streams = streams;
        self.version = (self.version + 1) & 0x1F;
        true
    }
}

/// One PES-framed access unit waiting to be packetized
#[derive(Debug, Clone, Copy)]
pub struct ElementaryUnit<'a> {
    pub pid: u16,
    pub stream_id: u8,
    /// Presentation timestamp, 90 kHz
    pub pts: u64,
    /// Sets the random access indicator on the first unit
    pub random_access: bool,
    /// Emits a PCR on the first unit
    pub with_pcr: bool,
    pub payload: &'a [u8],
}

/// Packetizer state: continuity counters per PID
#[derive(Debug, Default)]
pub struct Segmenter {
    continuity: HashMap<u16, u8>,
}

impl Segmenter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget all continuity counters
    pub fn reset(&mut self) {
        self.continuity.clear();
    }

    fn next_cc(&mut self, pid: u16) -> u8 {
        let cc = self.continuity.entry(pid).or_insert(0x0F);
        *cc = (*cc + 1) & 0x0F;
        *cc
    }

    /// Split one access unit into transport units appended to `out`
    ///
    /// Returns the number of units written.
    pub fn segment(&mut self, unit: &ElementaryUnit<'_>, out: &mut BytesMut) -> Result<usize> {
        if unit.payload.is_empty() {
            return Err(MediaError::EmptyFrame.into());
        }

        let header = pes_header(unit.stream_id, unit.pts, unit.payload.len());
        let total = header.len() + unit.payload.len();
        let mut written = 0;
        let mut count = 0;

        while written < total {
            let first = written == 0;
            let fields = if first && (unit.random_access || unit.with_pcr) {
                1 + if unit.with_pcr { PCR_LEN } else { 0 }
            } else {
                0
            };
            // Adaptation field with content needs its length byte too
            let reserved = if fields > 0 { fields + 1 } else { 0 };
            let chunk = (total - written).min(PACKET_PAYLOAD_SIZE - reserved);
            let af_total = PACKET_PAYLOAD_SIZE - chunk;

            let cc = self.next_cc(unit.pid);
            out.reserve(TS_PACKET_SIZE);
            out.put_u8(SYNC_BYTE);
            let pusi = if first { 0x40 } else { 0x00 };
            out.put_u8(pusi | ((unit.pid >> 8) as u8 & 0x1F));
            out.put_u8(unit.pid as u8);

            if af_total == 0 {
                out.put_u8(0x10 | cc);
            } else {
                out.put_u8(0x30 | cc);
                out.put_u8((af_total - 1) as u8);
                if af_total > 1 {
                    let mut flags = 0u8;
                    if first && unit.random_access {
                        flags |= 0x40;
                    }
                    if first && unit.with_pcr {
                        flags |= 0x10;
                    }
                    out.put_u8(flags);
                    let mut used = 2;
                    if flags & 0x10 != 0 {
                        put_pcr(out, unit.pts);
                        used += PCR_LEN;
                    }
                    out.put_bytes(STUFFING_BYTE, af_total - used);
                }
            }

            put_range(out, &header, unit.payload, written, chunk);
            written += chunk;
            count += 1;
        }

        Ok(count)
    }

    /// Write PAT followed by PMT
    pub fn write_psi(&mut self, program: &ProgramMap, out: &mut BytesMut) {
        let pat = pat_section();
        self.write_section(PAT_PID, &pat, out);
        let pmt = pmt_section(program);
        self.write_section(PMT_PID, &pmt, out);
    }

    fn write_section(&mut self, pid: u16, section: &[u8], out: &mut BytesMut) {
        let cc = self.next_cc(pid);
        out.reserve(TS_PACKET_SIZE);
        out.put_u8(SYNC_BYTE);
        out.put_u8(0x40 | ((pid >> 8) as u8 & 0x1F));
        out.put_u8(pid as u8);
        out.put_u8(0x10 | cc);
        // pointer_field
        out.put_u8(0x00);
        out.put_slice(section);
        out.put_bytes(STUFFING_BYTE, PACKET_PAYLOAD_SIZE - 1 - section.len());
    }
}

/// PES header with PTS only
fn pes_header(stream_id: u8, pts: u64, payload_len: usize) -> [u8; PES_HEADER_LEN] {
    // Video PES may exceed 16 bits and is left unbounded
    let after_length = 3 + 5 + payload_len;
    let pes_len = if stream_id == STREAM_ID_VIDEO || after_length > 0xFFFF {
        0
    } else {
        after_length as u16
    };

    [
        0x00,
        0x00,
        0x01,
        stream_id,
        (pes_len >> 8) as u8,
        pes_len as u8,
        0x80, // marker '10', no scrambling
        0x80, // PTS only
        0x05, // header data length
        0x21 | ((pts >> 29) & 0x0E) as u8,
        (pts >> 22) as u8,
        (((pts >> 14) & 0xFE) | 0x01) as u8,
        (pts >> 7) as u8,
        (((pts << 1) & 0xFE) | 0x01) as u8,
    ]
}

fn put_pcr(out: &mut BytesMut, base: u64) {
    out.put_u8((base >> 25) as u8);
    out.put_u8((base >> 17) as u8);
    out.put_u8((base >> 9) as u8);
    out.put_u8((base >> 1) as u8);
    // low base bit, 6 reserved bits, extension high bit 0
    out.put_u8((((base & 0x01) << 7) as u8) | 0x7E);
    out.put_u8(0x00);
}

/// Copy `len` bytes starting at `offset` of `head ++ tail`
fn put_range(out: &mut BytesMut, head: &[u8], tail: &[u8], offset: usize, len: usize) {
    let end = offset + len;
    if offset < head.len() {
        out.put_slice(&head[offset..end.min(head.len())]);
    }
    if end > head.len() {
        let start = offset.max(head.len()) - head.len();
        out.put_slice(&tail[start..end - head.len()]);
    }
}

fn pat_section() -> Vec<u8> {
    let mut s = Vec::with_capacity(16);
    let section_length: u16 = 5 + 4 + 4;
    s.push(TABLE_ID_PAT);
    s.extend_from_slice(&(0xB000 | section_length).to_be_bytes());
    s.extend_from_slice(&TRANSPORT_STREAM_ID.to_be_bytes());
    s.push(0xC1); // version 0, current_next
    s.push(0x00); // section_number
    s.push(0x00); // last_section_number
    s.extend_from_slice(&PROGRAM_NUMBER.to_be_bytes());
    s.extend_from_slice(&(0xE000 | PMT_PID).to_be_bytes());
    let crc = crc32_mpeg2(&s);
    s.extend_from_slice(&crc.to_be_bytes());
    s
}

fn pmt_section(program: &ProgramMap) -> Vec<u8> {
    let section_length = (9 + 5 * program.streams.len() + 4) as u16;
    let pcr_pid = program.pcr_pid.unwrap_or(0x1FFF);

    let mut s = Vec::with_capacity(3 + section_length as usize);
    s.push(TABLE_ID_PMT);
    s.extend_from_slice(&(0xB000 | section_length).to_be_bytes());
    s.extend_from_slice(&PROGRAM_NUMBER.to_be_bytes());
    s.push(0xC1 | ((program.version & 0x1F) << 1));
    s.push(0x00);
    s.push(0x00);
    s.extend_from_slice(&(0xE000 | pcr_pid).to_be_bytes());
    s.extend_from_slice(&0xF000u16.to_be_bytes()); // program_info_length 0
    for stream in &program.streams {
        s.push(stream.stream_type);
        s.extend_from_slice(&(0xE000 | stream.pid).to_be_bytes());
        s.extend_from_slice(&0xF000u16.to_be_bytes()); // ES_info_length 0
    }
    let crc = crc32_mpeg2(&s);
    s.extend_from_slice(&crc.to_be_bytes());
    s
}

/// Transport units produced from one muxer call
#[derive(Debug, Clone)]
pub struct TsBatch {
    data: Bytes,
}

impl TsBatch {
    pub fn new(data: Bytes) -> Self {
        debug_assert_eq!(data.len() % TS_PACKET_SIZE, 0);
        Self { data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn unit_count(&self) -> usize {
        self.data.len() / TS_PACKET_SIZE
    }

    /// Iterate over the 188-byte units
    pub fn units(&self) -> impl Iterator<Item = &[u8]> {
        self.data.chunks_exact(TS_PACKET_SIZE)
    }

    /// Split into network writes of at most `max_units` units
    pub fn chunks(&self, max_units: usize) -> impl Iterator<Item = Bytes> + '_ {
        let step = max_units.max(1) * TS_PACKET_SIZE;
        (0..self.data.len())
            .step_by(step)
            .map(move |start| self.data.slice(start..(start + step).min(self.data.len())))
    }

    pub fn into_bytes(self) -> Bytes {
        self.data
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// (pusi, pid, cc, adaptation field, payload)
    pub(crate) fn parse_unit(unit: &[u8]) -> (bool, u16, u8, &[u8], &[u8]) {
        assert_eq!(unit.len(), TS_PACKET_SIZE);
        assert_eq!(unit[0], SYNC_BYTE);
        let pusi = unit[1] & 0x40 != 0;
        let pid = (((unit[1] & 0x1F) as u16) << 8) | unit[2] as u16;
        let afc = (unit[3] >> 4) & 0x03;
        let cc = unit[3] & 0x0F;
        let (af, payload_start) = if afc & 0x02 != 0 {
            let len = unit[4] as usize;
            (&unit[5..5 + len], 5 + len)
        } else {
            (&unit[4..4], 4)
        };
        (pusi, pid, cc, af, &unit[payload_start..])
    }

    fn reassemble(data: &[u8]) -> Vec<u8> {
        data.chunks(TS_PACKET_SIZE)
            .flat_map(|u| parse_unit(u).4.to_vec())
            .collect()
    }

    fn video_unit(payload: &[u8], random_access: bool, with_pcr: bool) -> ElementaryUnit<'_> {
        ElementaryUnit {
            pid: VIDEO_PID,
            stream_id: STREAM_ID_VIDEO,
            pts: 90_000,
            random_access,
            with_pcr,
            payload,
        }
    }

    #[test]
    fn test_crc32_known_pat() {
        let section = [
            0x00, 0xB0, 0x0D, 0x00, 0x01, 0xC1, 0x00, 0x00, 0x00, 0x01, 0xF0, 0x00,
        ];
        assert_eq!(crc32_mpeg2(&section), 0x2AB1_04B2);

        let mut with_crc = section.to_vec();
        with_crc.extend_from_slice(&0x2AB1_04B2u32.to_be_bytes());
        assert_eq!(crc32_mpeg2(&with_crc), 0);
    }

    #[test]
    fn test_pat_unit_bytes() {
        let mut seg = Segmenter::new();
        let mut out = BytesMut::new();
        seg.write_psi(&ProgramMap::default(), &mut out);

        assert_eq!(out.len(), 2 * TS_PACKET_SIZE);
        assert_eq!(
            &out[..21],
            &[
                0x47, 0x40, 0x00, 0x10, 0x00, 0x00, 0xB0, 0x0D, 0x00, 0x01, 0xC1, 0x00, 0x00,
                0x00, 0x01, 0xF0, 0x00, 0x2A, 0xB1, 0x04, 0xB2
            ]
        );
        assert!(out[21..TS_PACKET_SIZE].iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn test_pmt_section() {
        let mut program = ProgramMap::default();
        assert!(program.update(vec![
            ProgramStream {
                stream_type: 0x1B,
                pid: VIDEO_PID
            },
            ProgramStream {
                stream_type: 0x0F,
                pid: AUDIO_PID
            },
        ]));
        assert_eq!(program.version, 1);
        assert_eq!(program.pcr_pid, Some(VIDEO_PID));

        let section = pmt_section(&program);
        let section_length = (((section[1] & 0x0F) as usize) << 8) | section[2] as usize;
        assert_eq!(section_length, 9 + 5 * 2 + 4);
        assert_eq!(section.len(), 3 + section_length);
        assert_eq!((section[5] >> 1) & 0x1F, 1);
        assert_eq!(&section[8..10], &[0xE1, 0x00]);
        assert_eq!(&section[12..17], &[0x1B, 0xE1, 0x00, 0xF0, 0x00]);
        assert_eq!(&section[17..22], &[0x0F, 0xE1, 0x01, 0xF0, 0x00]);
        assert_eq!(crc32_mpeg2(&section), 0);
    }

    #[test]
    fn test_program_map_version_only_moves_on_change() {
        let mut program = ProgramMap::default();
        let streams = vec![ProgramStream {
            stream_type: 0x0F,
            pid: AUDIO_PID,
        }];
        assert!(program.update(streams.clone()));
        assert!(!program.update(streams));
        assert_eq!(program.version, 1);
        assert_eq!(program.pcr_pid, Some(AUDIO_PID));
    }

    #[test]
    fn test_small_payload_is_stuffed() {
        let mut seg = Segmenter::new();
        let mut out = BytesMut::new();
        let payload = [0xAB; 10];

        let n = seg.segment(&video_unit(&payload, false, false), &mut out).unwrap();
        assert_eq!(n, 1);
        assert_eq!(out.len(), TS_PACKET_SIZE);

        let (pusi, pid, cc, af, body) = parse_unit(&out);
        assert!(pusi);
        assert_eq!(pid, VIDEO_PID);
        assert_eq!(cc, 0);
        assert_eq!(af[0], 0x00);
        assert!(af[1..].iter().all(|&b| b == 0xFF));
        assert_eq!(body.len(), PES_HEADER_LEN + payload.len());
        assert_eq!(&body[PES_HEADER_LEN..], &payload);
    }

    #[test]
    fn test_large_payload_splits_in_order() {
        let mut seg = Segmenter::new();
        let mut out = BytesMut::new();
        let payload: Vec<u8> = (0..2000u32).map(|i| i as u8).collect();

        let n = seg.segment(&video_unit(&payload, true, true), &mut out).unwrap();
        assert_eq!(out.len(), n * TS_PACKET_SIZE);

        for (i, unit) in out.chunks(TS_PACKET_SIZE).enumerate() {
            let (pusi, pid, cc, _, _) = parse_unit(unit);
            assert_eq!(pusi, i == 0);
            assert_eq!(pid, VIDEO_PID);
            assert_eq!(cc as usize, i & 0x0F);
        }

        let data = reassemble(&out);
        assert_eq!(&data[..4], &[0x00, 0x00, 0x01, STREAM_ID_VIDEO]);
        assert_eq!(&data[PES_HEADER_LEN..], &payload[..]);
    }

    #[test]
    fn test_first_unit_adaptation_field() {
        let mut seg = Segmenter::new();
        let mut out = BytesMut::new();
        let payload = [0x11; 400];
        seg.segment(&video_unit(&payload, true, true), &mut out).unwrap();

        let (_, _, _, af, _) = parse_unit(&out[..TS_PACKET_SIZE]);
        assert_eq!(af.len(), 7);
        assert_eq!(af[0], 0x50);
        // PCR base 90000
        let base = ((af[1] as u64) << 25)
            | ((af[2] as u64) << 17)
            | ((af[3] as u64) << 9)
            | ((af[4] as u64) << 1)
            | ((af[5] as u64) >> 7);
        assert_eq!(base, 90_000);
    }

    #[test]
    fn test_single_byte_stuffing() {
        let mut seg = Segmenter::new();
        let mut out = BytesMut::new();
        // 183 bytes of PES leaves exactly one byte to pad
        let payload = vec![0x22; 183 - PES_HEADER_LEN];
        seg.segment(&video_unit(&payload, false, false), &mut out).unwrap();

        assert_eq!(out.len(), TS_PACKET_SIZE);
        assert_eq!(out[3] & 0x30, 0x30);
        assert_eq!(out[4], 0x00);
        assert_eq!(&reassemble(&out)[PES_HEADER_LEN..], &payload[..]);
    }

    #[test]
    fn test_exact_fit_has_no_adaptation_field() {
        let mut seg = Segmenter::new();
        let mut out = BytesMut::new();
        let payload = vec![0x33; PACKET_PAYLOAD_SIZE - PES_HEADER_LEN];
        seg.segment(&video_unit(&payload, false, false), &mut out).unwrap();

        assert_eq!(out.len(), TS_PACKET_SIZE);
        assert_eq!(out[3] & 0x30, 0x10);
    }

    #[test]
    fn test_audio_pes_length_and_pts() {
        let mut seg = Segmenter::new();
        let mut out = BytesMut::new();
        let payload = [0x44; 50];
        let unit = ElementaryUnit {
            pid: AUDIO_PID,
            stream_id: STREAM_ID_AUDIO,
            pts: 0x1_2345_6789,
            random_access: false,
            with_pcr: false,
            payload: &payload,
        };
        seg.segment(&unit, &mut out).unwrap();

        let data = reassemble(&out);
        assert_eq!(u16::from_be_bytes([data[4], data[5]]), 8 + 50);

        let p = &data[9..14];
        let pts = (((p[0] as u64 >> 1) & 0x07) << 30)
            | ((p[1] as u64) << 22)
            | (((p[2] as u64) >> 1) << 15)
            | ((p[3] as u64) << 7)
            | ((p[4] as u64) >> 1);
        assert_eq!(pts, 0x1_2345_6789);
        assert_eq!(p[0] & 0xF1, 0x21);
    }

    #[test]
    fn test_empty_payload_rejected() {
        let mut seg = Segmenter::new();
        let mut out = BytesMut::new();
        assert!(seg.segment(&video_unit(&[], true, false), &mut out).is_err());
        assert!(out.is_empty());
    }

    #[test]
    fn test_continuity_wraps_per_pid() {
        let mut seg = Segmenter::new();
        let mut out = BytesMut::new();
        for _ in 0..17 {
            seg.segment(&video_unit(&[1], false, false), &mut out).unwrap();
        }
        seg.write_psi(&ProgramMap::default(), &mut out);

        let ccs: Vec<(u16, u8)> = out
            .chunks(TS_PACKET_SIZE)
            .map(|u| {
                let (_, pid, cc, _, _) = parse_unit(u);
                (pid, cc)
            })
            .collect();
        assert_eq!(ccs[15], (VIDEO_PID, 15));
        assert_eq!(ccs[16], (VIDEO_PID, 0));
        assert_eq!(ccs[17], (PAT_PID, 0));
        assert_eq!(ccs[18], (PMT_PID, 0));
    }

    #[test]
    fn test_batch_units_and_chunks() {
        let batch = TsBatch::new(Bytes::from(vec![SYNC_BYTE; 20 * TS_PACKET_SIZE]));
        assert_eq!(batch.unit_count(), 20);
        assert!(batch.units().all(|u| u.len() == TS_PACKET_SIZE && u[0] == SYNC_BYTE));

        let sizes: Vec<usize> = batch.chunks(MAX_UNITS_PER_WRITE).map(|c| c.len()).collect();
        assert_eq!(sizes, vec![1316, 1316, 6 * TS_PACKET_SIZE]);
    }
}
