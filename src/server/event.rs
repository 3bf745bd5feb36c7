//! Server events
//!
//! Observers subscribe through `events()` on either server and receive these values
//! on a `tokio::sync::broadcast` channel. Lagging receivers lose the oldest events;
//! the servers never wait for observers.

use std::net::SocketAddr;

use tokio::sync::broadcast;

use crate::registry::ClientId;
use crate::stats::ServerStats;

/// Capacity of the event channel
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Why a connection was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Attached count reached `max_clients`
    MaxClients,
    /// The handler's `on_accept` returned false
    Vetoed,
    /// Malformed or unexpected request (still-image server)
    BadRequest,
    /// The session or render loop could not be created
    SessionFailed,
}

/// Why an attached connection ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Peer closed the socket or a read failed
    PeerClosed,
    /// A socket write failed or timed out
    WriteFailed,
    /// The outbound queue overflowed
    Backpressure,
    /// The server stopped
    ServerStopped,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CloseReason::PeerClosed => "peer closed",
            CloseReason::WriteFailed => "write failed",
            CloseReason::Backpressure => "send queue full",
            CloseReason::ServerStopped => "server stopped",
        };
        f.write_str(s)
    }
}

/// Something observable happened on a server
#[derive(Debug, Clone)]
pub enum ServerEvent {
    Listening {
        addr: SocketAddr,
    },
    Stopped,
    ClientAccepted {
        client_id: ClientId,
        peer: SocketAddr,
    },
    ClientRejected {
        peer: SocketAddr,
        reason: RejectReason,
    },
    ClientClosed {
        client_id: ClientId,
        peer: SocketAddr,
        reason: CloseReason,
    },
    /// Session (or render loop) brought up on the first attach
    SessionCreated {
        session_id: u64,
    },
    /// Session (or render loop) torn down
    SessionReleased {
        session_id: u64,
    },
    /// Session creation failed; the attaching client was refused
    SessionFailed {
        error: String,
    },
    Stats(ServerStats),
}

/// Sending half shared by a server's tasks
#[derive(Debug, Clone)]
pub(crate) struct EventSender {
    tx: broadcast::Sender<ServerEvent>,
}

impl EventSender {
    pub(crate) fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publish an event; dropped when nobody listens
    pub(crate) fn emit(&self, event: ServerEvent) {
        let _ = self.tx.send(event);
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.tx.subscribe()
    }
}
