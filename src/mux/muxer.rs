//! Transport stream muxer
//!
//! Owns the segmenter and the per-stream state needed to produce a stream a client
//! can join at any point: cached decoder configuration is written in front of every
//! video key frame, and PAT/PMT are repeated ahead of key frames and periodically.
//!
//! ```text
//! encoder ──► on_frame ──► [config cache] ──► Segmenter ──► TsBatch ──► sink(chunk)
//!                                                                      ≤ 7 units
//! ```
//!
//! The muxer does no locking of its own. The session keeps it behind a mutex and the
//! sink is invoked while that mutex is held, so batches reach the sink in production
//! order across producer threads.

use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};

use super::ts::{
    ElementaryUnit, ProgramMap, ProgramStream, Segmenter, TsBatch, AUDIO_PID,
    MAX_UNITS_PER_WRITE, STREAM_ID_AUDIO, STREAM_ID_VIDEO, VIDEO_PID,
};
use crate::media::aac::{self, AudioSpecificConfig};
use crate::media::h264;
use crate::media::{AudioFormat, EncodedFrame, StreamKind, VideoCodec, VideoFormat};
use crate::stats::MuxerStats;

/// Receives each network chunk of produced transport units
pub type MuxerSink = Box<dyn FnMut(Bytes) + Send>;

const PTS_MASK: u64 = 0x1_FFFF_FFFF;

/// Muxer configuration
#[derive(Debug, Clone)]
pub struct MuxerConfig {
    /// Maximum PTS distance between PAT/PMT repetitions
    pub psi_interval: Duration,

    /// Maximum transport units per sink call
    pub max_units_per_write: usize,
}

impl Default for MuxerConfig {
    fn default() -> Self {
        Self {
            psi_interval: Duration::from_millis(500),
            max_units_per_write: MAX_UNITS_PER_WRITE,
        }
    }
}

impl MuxerConfig {
    /// Set the PAT/PMT repetition interval
    pub fn psi_interval(mut self, interval: Duration) -> Self {
        self.psi_interval = interval;
        self
    }

    /// Set the number of units per sink call (at least one)
    pub fn max_units_per_write(mut self, units: usize) -> Self {
        self.max_units_per_write = units.max(1);
        self
    }

    fn psi_interval_90k(&self) -> u64 {
        (self.psi_interval.as_micros() as u64).saturating_mul(9) / 100
    }
}

/// Muxer lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuxerState {
    /// No stream has been described
    Unprepared,
    /// At least one stream format is known
    Prepared,
    /// Transport units have been produced
    Running,
    /// Released; every call is a no-op
    Released,
}

#[derive(Debug)]
struct VideoTrack {
    format: VideoFormat,
    /// Annex-B SPS/PPS (VPS too for H.265)
    parameter_sets: Option<Bytes>,
}

#[derive(Debug)]
struct AudioTrack {
    format: AudioFormat,
    config: Option<AudioSpecificConfig>,
}

/// MPEG-TS muxer for one video and one audio stream
pub struct TsMuxer {
    config: MuxerConfig,
    state: MuxerState,
    segmenter: Segmenter,
    program: ProgramMap,
    video: Option<VideoTrack>,
    audio: Option<AudioTrack>,
    psi_pending: bool,
    last_psi_pts: Option<u64>,
    sink: MuxerSink,
    stats: MuxerStats,
}

impl TsMuxer {
    /// Create a muxer with default configuration
    pub fn new(sink: MuxerSink) -> Self {
        Self::with_config(MuxerConfig::default(), sink)
    }

    pub fn with_config(config: MuxerConfig, sink: MuxerSink) -> Self {
        Self {
            config,
            state: MuxerState::Unprepared,
            segmenter: Segmenter::new(),
            program: ProgramMap::default(),
            video: None,
            audio: None,
            psi_pending: true,
            last_psi_pts: None,
            sink,
            stats: MuxerStats::default(),
        }
    }

    pub fn state(&self) -> MuxerState {
        self.state
    }

    pub fn stats(&self) -> MuxerStats {
        self.stats
    }

    /// Current program map (streams announced in the PMT)
    pub fn program(&self) -> &ProgramMap {
        &self.program
    }

    pub fn has_video(&self) -> bool {
        self.video.is_some()
    }

    pub fn has_audio(&self) -> bool {
        self.audio.is_some()
    }

    /// Describe the format of one or both streams
    ///
    /// `None` leaves that stream as it is. Returns whether the muxer is prepared,
    /// that is whether at least one stream is described.
    pub fn on_format_described(
        &mut self,
        video: Option<VideoFormat>,
        audio: Option<AudioFormat>,
    ) -> bool {
        if self.state == MuxerState::Released {
            return false;
        }

        if let Some(format) = video {
            let parameter_sets = match format.parameter_sets.clone() {
                Some(ps) => self.normalize_parameter_sets(format.codec, ps),
                None => self
                    .video
                    .as_mut()
                    .filter(|track| track.format.same_stream(&format))
                    .and_then(|track| track.parameter_sets.take()),
            };
            let avc = parameter_sets
                .as_deref()
                .filter(|_| format.codec == VideoCodec::H264)
                .and_then(|ps| h264::AvcConfig::from_annex_b(ps).ok());
            let level = avc.as_ref().map(|c| c.level_string());
            tracing::debug!(
                codec = ?format.codec,
                width = format.width,
                height = format.height,
                profile = avc.as_ref().map(|c| c.profile_name()),
                level = level.as_deref(),
                has_parameter_sets = parameter_sets.is_some(),
                "Video format described"
            );
            self.video = Some(VideoTrack {
                format,
                parameter_sets,
            });
            self.psi_pending = true;
        }

        if let Some(format) = audio {
            let config = format.config.clone();
            tracing::debug!(
                profile = config.as_ref().and_then(|c| c.profile()).map(|p| p.name()),
                sample_rate = config.as_ref().map(|c| c.sampling_frequency),
                channels = config.as_ref().map(|c| c.channels()),
                "Audio format described"
            );
            self.audio = Some(AudioTrack { format, config });
            self.psi_pending = true;
        }

        self.refresh_program();
        self.is_prepared()
    }

    /// Mux one encoder output buffer
    ///
    /// Frames for a stream without a format description are dropped. Only the key
    /// frame flag marks a random access point; payloads are not inspected for IDR
    /// slices.
    pub fn on_frame(&mut self, kind: StreamKind, frame: EncodedFrame) {
        if self.state == MuxerState::Released {
            return;
        }

        match kind {
            StreamKind::Video => self.mux_video(frame),
            StreamKind::Audio => self.mux_audio(frame),
        }
    }

    /// Forget the format and cached configuration of one stream
    ///
    /// Used when an encoder restarts; frames are dropped until it describes its
    /// format again.
    pub fn reset_stream(&mut self, kind: StreamKind) {
        if self.state == MuxerState::Released {
            return;
        }

        match kind {
            StreamKind::Video => self.video = None,
            StreamKind::Audio => self.audio = None,
        }
        self.psi_pending = true;
        self.refresh_program();
        if !self.is_prepared() {
            self.state = MuxerState::Unprepared;
        }

        tracing::debug!(stream = %kind, "Muxer stream reset");
    }

    /// Release the muxer; later calls do nothing and the sink is never invoked again
    pub fn release(&mut self) {
        if self.state == MuxerState::Released {
            return;
        }

        self.state = MuxerState::Released;
        self.video = None;
        self.audio = None;
        self.segmenter.reset();
        self.sink = Box::new(|_| {});

        tracing::debug!(
            video_frames = self.stats.video_frames,
            audio_frames = self.stats.audio_frames,
            bytes = self.stats.bytes_out,
            "Muxer released"
        );
    }

    fn is_prepared(&self) -> bool {
        self.video.is_some() || self.audio.is_some()
    }

    fn refresh_program(&mut self) {
        let mut streams = Vec::with_capacity(2);
        if let Some(track) = &self.video {
            streams.push(ProgramStream {
                stream_type: track.format.codec.stream_type(),
                pid: VIDEO_PID,
            });
        }
        if let Some(track) = &self.audio {
            streams.push(ProgramStream {
                stream_type: track.format.stream_type(),
                pid: AUDIO_PID,
            });
        }

        if self.program.update(streams) {
            tracing::debug!(
                version = self.program.version,
                streams = self.program.streams.len(),
                "Program map changed"
            );
        }

        if self.state == MuxerState::Unprepared && self.is_prepared() {
            self.state = MuxerState::Prepared;
        }
    }

    fn normalize_parameter_sets(&mut self, codec: VideoCodec, data: Bytes) -> Option<Bytes> {
        let normalized = match codec {
            VideoCodec::H264 => h264::parameter_sets_to_annex_b(data),
            VideoCodec::H265 => Ok(data),
        };
        match normalized {
            Ok(ps) if !ps.is_empty() => Some(ps),
            Ok(_) => None,
            Err(e) => {
                tracing::warn!(error = %e, "Ignoring malformed video configuration");
                None
            }
        }
    }

    fn drop_frame(&mut self, kind: StreamKind, reason: &'static str) {
        self.stats.dropped_frames += 1;
        tracing::debug!(stream = %kind, reason, "Frame dropped");
    }

    fn mux_video(&mut self, frame: EncodedFrame) {
        let codec = match &self.video {
            Some(track) => track.format.codec,
            None => return self.drop_frame(StreamKind::Video, "format not described"),
        };
        if frame.is_empty() {
            return self.drop_frame(StreamKind::Video, "empty payload");
        }

        if frame.is_config() {
            let parameter_sets = self.normalize_parameter_sets(codec, frame.data);
            if let Some(track) = self.video.as_mut() {
                track.parameter_sets = parameter_sets;
            }
            self.stats.config_frames += 1;
            return;
        }

        let keyframe = frame.is_keyframe();
        let parameter_sets = self
            .video
            .as_ref()
            .and_then(|track| track.parameter_sets.clone())
            .filter(|_| keyframe);

        let extra =
            h264::ACCESS_UNIT_DELIMITER.len() + parameter_sets.as_ref().map_or(0, |p| p.len());
        let mut access_unit = BytesMut::with_capacity(frame.len() + extra);
        let body = match codec {
            VideoCodec::H264 => {
                access_unit.put_slice(&h264::ACCESS_UNIT_DELIMITER);
                h264::strip_aud(&frame.data)
            }
            VideoCodec::H265 => &frame.data[..],
        };
        if let Some(ps) = &parameter_sets {
            access_unit.put_slice(ps);
        }
        access_unit.put_slice(body);

        let pts = frame.pts_90k();
        let unit = ElementaryUnit {
            pid: VIDEO_PID,
            stream_id: STREAM_ID_VIDEO,
            pts,
            random_access: keyframe,
            with_pcr: self.program.pcr_pid == Some(VIDEO_PID),
            payload: &access_unit,
        };

        let mut out = BytesMut::new();
        if keyframe || self.psi_due(pts) {
            self.write_psi(pts, &mut out);
        }
        match self.segmenter.segment(&unit, &mut out) {
            Ok(_) => {
                self.stats.video_frames += 1;
                if keyframe {
                    self.stats.keyframes += 1;
                }
                tracing::trace!(pts, keyframe, bytes = access_unit.len(), "Video frame muxed");
                self.emit(out);
            }
            Err(_) => self.drop_frame(StreamKind::Video, "segmenter rejected"),
        }
    }

    fn mux_audio(&mut self, frame: EncodedFrame) {
        if self.audio.is_none() {
            return self.drop_frame(StreamKind::Audio, "format not described");
        }
        if frame.is_empty() {
            return self.drop_frame(StreamKind::Audio, "empty payload");
        }

        if frame.is_config() {
            match AudioSpecificConfig::parse(frame.data) {
                Ok(config) => {
                    if let Some(track) = self.audio.as_mut() {
                        track.config = Some(config);
                    }
                    self.stats.config_frames += 1;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Ignoring malformed audio configuration");
                    self.stats.dropped_frames += 1;
                }
            }
            return;
        }

        let pts = frame.pts_90k();
        let payload = if aac::is_adts(&frame.data) {
            frame.data
        } else {
            let wrapped = self
                .audio
                .as_ref()
                .and_then(|track| track.config.as_ref())
                .map(|config| aac::wrap_adts(config, frame.data));
            match wrapped {
                Some(Ok(data)) => data,
                Some(Err(_)) => {
                    return self.drop_frame(StreamKind::Audio, "frame too large for ADTS")
                }
                None => return self.drop_frame(StreamKind::Audio, "no audio config"),
            }
        };

        let unit = ElementaryUnit {
            pid: AUDIO_PID,
            stream_id: STREAM_ID_AUDIO,
            pts,
            random_access: true,
            with_pcr: self.program.pcr_pid == Some(AUDIO_PID),
            payload: &payload,
        };

        let mut out = BytesMut::new();
        if self.psi_due(pts) {
            self.write_psi(pts, &mut out);
        }
        match self.segmenter.segment(&unit, &mut out) {
            Ok(_) => {
                self.stats.audio_frames += 1;
                tracing::trace!(pts, bytes = payload.len(), "Audio frame muxed");
                self.emit(out);
            }
            Err(_) => self.drop_frame(StreamKind::Audio, "segmenter rejected"),
        }
    }

    fn psi_due(&self, pts: u64) -> bool {
        if self.psi_pending {
            return true;
        }
        match self.last_psi_pts {
            None => true,
            Some(last) => {
                let elapsed = pts.wrapping_sub(last) & PTS_MASK;
                // A small backwards step masks to a huge value; that is not elapsed time
                elapsed >= self.config.psi_interval_90k() && elapsed < PTS_MASK / 2
            }
        }
    }

    fn write_psi(&mut self, pts: u64, out: &mut BytesMut) {
        self.segmenter.write_psi(&self.program, out);
        self.psi_pending = false;
        self.last_psi_pts = Some(pts);
        self.stats.psi_writes += 1;
    }

    fn emit(&mut self, out: BytesMut) {
        let batch = TsBatch::new(out.freeze());
        self.stats.bytes_out += batch.len() as u64;
        self.stats.batches += 1;
        self.state = MuxerState::Running;

        for chunk in batch.chunks(self.config.max_units_per_write) {
            (self.sink)(chunk);
        }
    }
}

impl std::fmt::Debug for TsMuxer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TsMuxer")
            .field("state", &self.state)
            .field("program", &self.program)
            .field("video", &self.video)
            .field("audio", &self.audio)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}
