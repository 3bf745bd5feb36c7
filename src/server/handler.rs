//! Server handler trait
//!
//! Implement [`ServerHandler`] to decide on admissions and to bring encoders up and
//! down with the session. Every method has a default, so a handler only overrides
//! what it needs.
//!
//! Calling threads: `on_accept` runs on the accept loop and must return quickly.
//! `on_session_create` and `on_session_release` run on a blocking worker thread
//! with the session lifecycle lock held; they may block. `on_closed` runs on the
//! connection's watch task after it detached.

use std::net::SocketAddr;
use std::time::Instant;

use crate::error::SessionError;
use crate::registry::ClientId;
use crate::session::Session;

/// Information about a connected client
#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub id: ClientId,
    pub peer: SocketAddr,
    pub connected_at: Instant,
}

impl ClientInfo {
    pub fn new(id: ClientId, peer: SocketAddr) -> Self {
        Self {
            id,
            peer,
            connected_at: Instant::now(),
        }
    }
}

/// Collaborator hooks of the transport stream server
pub trait ServerHandler: Send + Sync + 'static {
    /// Admit or refuse a connection that passed the client limit
    fn on_accept(&self, client: &ClientInfo) -> bool {
        let _ = client;
        true
    }

    /// A client was detached and its socket closed
    fn on_closed(&self, client: &ClientInfo) {
        let _ = client;
    }

    /// The first client attached; attach encoders with
    /// [`Session::attach_encoders`]. An error rejects that client.
    fn on_session_create(&self, session: &mut Session) -> Result<(), SessionError> {
        let _ = session;
        Ok(())
    }

    /// The session is going away; encoders are already stopped
    fn on_session_release(&self, session: &mut Session) {
        let _ = session;
    }
}

/// Handler that admits everyone and attaches no encoders
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultHandler;

impl ServerHandler for DefaultHandler {}
