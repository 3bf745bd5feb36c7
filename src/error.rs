//! Error types
//!
//! Every fallible public operation returns [`Result`]. Collaborator-facing traits
//! report failures through [`EncoderError`] and [`RenderError`], which the core wraps
//! into [`SessionError`] when a session or render loop cannot be brought up.

use std::io;

use crate::media::StreamKind;

/// Crate-level result alias
pub type Result<T> = std::result::Result<T, Error>;

/// Crate-level error
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Socket or listener failure
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Malformed media input
    #[error(transparent)]
    Media(#[from] MediaError),

    /// Session or render loop could not be created
    #[error(transparent)]
    Session(#[from] SessionError),

    /// Still-image request or response could not be served
    #[error(transparent)]
    Http(#[from] HttpError),
}

/// Media parsing and packetization errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MediaError {
    #[error("invalid AVC decoder configuration record")]
    InvalidAvcPacket,

    #[error("invalid AAC audio specific config")]
    InvalidAacPacket,

    #[error("encoded frame has an empty payload")]
    EmptyFrame,
}

/// Failures while bringing up or restarting a session
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// An encoder refused to start
    #[error("{kind} encoder failed to start: {source}")]
    EncoderStart {
        kind: StreamKind,
        #[source]
        source: EncoderError,
    },

    /// The collaborator's session hook failed
    #[error("session handler failed: {0}")]
    Handler(String),

    /// The still-image renderer could not be created
    #[error("renderer creation failed: {0}")]
    Renderer(#[from] RenderError),

    /// The lifecycle worker was cancelled or panicked
    #[error("session lifecycle task aborted")]
    Aborted,

    /// Restart requested while no session exists
    #[error("no active session")]
    NoSession,
}

/// Still-image HTTP errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HttpError {
    #[error("unsupported method: {0}")]
    UnsupportedMethod(String),

    #[error("unknown path: {0}")]
    UnknownPath(String),

    /// Path is not valid percent-encoded UTF-8
    #[error("malformed path: {0}")]
    MalformedPath(String),

    /// A configured value cannot be sent as a response header
    #[error("invalid value for the {0} header")]
    InvalidHeader(&'static str),
}

/// Error reported by a collaborator's encoder
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct EncoderError {
    message: String,
}

impl EncoderError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Error reported by a collaborator's renderer or renderer factory
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct RenderError {
    message: String,
}

impl RenderError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}
