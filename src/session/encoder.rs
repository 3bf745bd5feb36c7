//! Encoder collaborator interface

use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::EncoderError;
use crate::media::{EncodedFrame, StreamFormat, StreamKind};
use crate::mux::TsMuxer;

/// Muxer shared between a session and its encoders' output handles
pub type SharedMuxer = Arc<Mutex<TsMuxer>>;

/// A video or audio encoder supplied by the collaborator
///
/// `start` and `stop` are called from a blocking worker thread, never from an async
/// task, so implementations may block (open a camera, spin up a hardware context).
pub trait MediaEncoder: Send {
    /// Start producing frames into `output`
    fn start(&mut self, output: EncoderOutput) -> Result<(), EncoderError>;

    /// Stop producing frames; `output` must not be used afterwards
    fn stop(&mut self);
}

/// Handle through which an encoder delivers its format and frames
///
/// Cheap to clone and usable from any thread.
#[derive(Clone)]
pub struct EncoderOutput {
    kind: StreamKind,
    muxer: SharedMuxer,
}

impl EncoderOutput {
    pub(crate) fn new(kind: StreamKind, muxer: SharedMuxer) -> Self {
        Self { kind, muxer }
    }

    /// Stream this output feeds
    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    /// Report the stream format; frames are dropped until this is called
    ///
    /// Returns whether the muxer accepted the description. A format of the other
    /// stream kind is rejected.
    pub fn describe_format(&self, format: impl Into<StreamFormat>) -> bool {
        let format = format.into();
        if format.kind() != self.kind {
            tracing::warn!(
                output = %self.kind,
                format = %format.kind(),
                "Format description for the wrong stream ignored"
            );
            return false;
        }

        let mut muxer = self.muxer.lock();
        match format {
            StreamFormat::Video(video) => muxer.on_format_described(Some(video), None),
            StreamFormat::Audio(audio) => muxer.on_format_described(None, Some(audio)),
        }
    }

    /// Deliver one encoded frame
    pub fn push_frame(&self, frame: EncodedFrame) {
        self.muxer.lock().on_frame(self.kind, frame);
    }
}

impl std::fmt::Debug for EncoderOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncoderOutput")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::media::{AudioFormat, VideoFormat};
    use crate::mux::MuxerState;

    fn shared_muxer() -> (SharedMuxer, Arc<Mutex<Vec<Bytes>>>) {
        let chunks = Arc::new(Mutex::new(Vec::new()));
        let sink_chunks = Arc::clone(&chunks);
        let muxer = TsMuxer::new(Box::new(move |chunk| sink_chunks.lock().push(chunk)));
        (Arc::new(Mutex::new(muxer)), chunks)
    }

    #[test]
    fn test_output_feeds_its_stream() {
        let (muxer, chunks) = shared_muxer();
        let output = EncoderOutput::new(StreamKind::Video, Arc::clone(&muxer));

        assert!(output.describe_format(VideoFormat::h264(640, 480)));
        output.push_frame(EncodedFrame::keyframe(vec![0, 0, 0, 1, 0x65, 0x88], 0));

        assert_eq!(muxer.lock().state(), MuxerState::Running);
        assert!(!chunks.lock().is_empty());
    }

    #[test]
    fn test_wrong_kind_rejected() {
        let (muxer, _chunks) = shared_muxer();
        let output = EncoderOutput::new(StreamKind::Video, Arc::clone(&muxer));

        assert!(!output.describe_format(AudioFormat::aac_pending()));
        assert!(!muxer.lock().has_audio());
        assert_eq!(output.kind(), StreamKind::Video);
    }
}
