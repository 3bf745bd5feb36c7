//! Client sink abstraction used by the registry

use bytes::Bytes;

/// Identifier of an attached client
pub type ClientId = u64;

/// Why a payload could not be handed to a client
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("client connection closed")]
    Closed,

    #[error("client send queue full")]
    Backpressure,
}

/// Something the registry can fan payloads out to
///
/// `send` is called from producer threads and must never block: implementations
/// enqueue and return.
pub trait PacketSink: Send + Sync {
    fn id(&self) -> ClientId;

    /// Hand one payload to the client
    fn send(&self, payload: Bytes) -> Result<(), SendError>;

    /// Close the client; idempotent
    fn close(&self);

    fn is_closed(&self) -> bool;
}
