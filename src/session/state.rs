//! Streaming session state
//!
//! A session binds one muxer to at most one video and one audio encoder. It exists
//! exactly while at least one client is attached.

use std::time::Instant;

use super::encoder::{EncoderOutput, MediaEncoder, SharedMuxer};
use crate::error::SessionError;
use crate::media::StreamKind;
use crate::stats::MuxerStats;

/// Session lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Created, collaborator hook and encoder start pending
    Creating,
    /// Encoders started
    Running,
    /// Encoders stopped and muxer released
    Released,
}

struct EncoderSlot {
    encoder: Box<dyn MediaEncoder>,
    started: bool,
}

impl EncoderSlot {
    fn stop(&mut self) {
        if self.started {
            self.encoder.stop();
            self.started = false;
        }
    }
}

/// The unique streaming context of a server
pub struct Session {
    id: u64,
    phase: SessionPhase,
    created_at: Instant,
    muxer: SharedMuxer,
    video: Option<EncoderSlot>,
    audio: Option<EncoderSlot>,
}

impl Session {
    pub(crate) fn new(id: u64, muxer: SharedMuxer) -> Self {
        Self {
            id,
            phase: SessionPhase::Creating,
            created_at: Instant::now(),
            muxer,
            video: None,
            audio: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Muxer fed by this session's encoders
    pub fn muxer(&self) -> &SharedMuxer {
        &self.muxer
    }

    pub fn muxer_stats(&self) -> MuxerStats {
        self.muxer.lock().stats()
    }

    pub fn has_video_encoder(&self) -> bool {
        self.video.is_some()
    }

    pub fn has_audio_encoder(&self) -> bool {
        self.audio.is_some()
    }

    /// Attach the encoders that feed this session
    ///
    /// `None` keeps the current encoder of that stream. A replaced encoder that was
    /// running is stopped; a new encoder attached to a running session is started
    /// right away.
    pub fn attach_encoders(
        &mut self,
        video: Option<Box<dyn MediaEncoder>>,
        audio: Option<Box<dyn MediaEncoder>>,
    ) -> Result<(), SessionError> {
        if self.phase == SessionPhase::Released {
            return Err(SessionError::NoSession);
        }

        if let Some(encoder) = video {
            if let Some(mut old) = self.video.replace(EncoderSlot {
                encoder,
                started: false,
            }) {
                old.stop();
            }
        }
        if let Some(encoder) = audio {
            if let Some(mut old) = self.audio.replace(EncoderSlot {
                encoder,
                started: false,
            }) {
                old.stop();
            }
        }

        if self.phase == SessionPhase::Running {
            self.start_encoders()?;
        }
        Ok(())
    }

    /// Start every attached encoder that is not running yet
    pub(crate) fn start_encoders(&mut self) -> Result<(), SessionError> {
        self.start_encoder(StreamKind::Video)?;
        self.start_encoder(StreamKind::Audio)?;
        self.phase = SessionPhase::Running;
        Ok(())
    }

    fn start_encoder(&mut self, kind: StreamKind) -> Result<(), SessionError> {
        let output = EncoderOutput::new(kind, self.muxer.clone());
        let slot = match kind {
            StreamKind::Video => self.video.as_mut(),
            StreamKind::Audio => self.audio.as_mut(),
        };

        if let Some(slot) = slot.filter(|s| !s.started) {
            slot.encoder
                .start(output)
                .map_err(|source| SessionError::EncoderStart { kind, source })?;
            slot.started = true;
            tracing::debug!(session_id = self.id, stream = %kind, "Encoder started");
        }
        Ok(())
    }

    /// Stop an encoder, clear its stream in the muxer and start it again
    ///
    /// Does nothing when no encoder of that kind is attached.
    pub(crate) fn restart_encoder(&mut self, kind: StreamKind) -> Result<(), SessionError> {
        let slot = match kind {
            StreamKind::Video => self.video.as_mut(),
            StreamKind::Audio => self.audio.as_mut(),
        };
        let Some(slot) = slot else {
            return Ok(());
        };

        slot.stop();
        self.muxer.lock().reset_stream(kind);
        tracing::info!(session_id = self.id, stream = %kind, "Restarting encoder");
        self.start_encoder(kind)
    }

    /// Stop both encoders and release the muxer
    pub(crate) fn release(&mut self) {
        if self.phase == SessionPhase::Released {
            return;
        }

        if let Some(slot) = self.video.as_mut() {
            slot.stop();
        }
        if let Some(slot) = self.audio.as_mut() {
            slot.stop();
        }
        self.muxer.lock().release();
        self.phase = SessionPhase::Released;
    }

    /// Remove the encoders, handing them back to the collaborator
    pub fn take_encoders(
        &mut self,
    ) -> (Option<Box<dyn MediaEncoder>>, Option<Box<dyn MediaEncoder>>) {
        if let Some(slot) = self.video.as_mut() {
            slot.stop();
        }
        if let Some(slot) = self.audio.as_mut() {
            slot.stop();
        }
        (
            self.video.take().map(|s| s.encoder),
            self.audio.take().map(|s| s.encoder),
        )
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("phase", &self.phase)
            .field("video", &self.video.as_ref().map(|s| s.started))
            .field("audio", &self.audio.as_ref().map(|s| s.started))
            .finish_non_exhaustive()
    }
}
