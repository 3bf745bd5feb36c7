//! Lazy session lifecycle
//!
//! The controller creates the session when the first client attaches and destroys
//! it when the last one detaches. Attach, detach, forced release and encoder restart
//! are serialized by the lifecycle lock (the session slot itself). Lock order is
//! always lifecycle → registry and lifecycle → muxer; encoder threads only ever take
//! muxer → registry, so the two paths cannot deadlock.
//!
//! All methods block while collaborator hooks run. Async callers go through
//! `tokio::task::spawn_blocking`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::state::Session;
use crate::error::SessionError;
use crate::media::StreamKind;
use crate::mux::{MuxerConfig, MuxerSink, TsMuxer};
use crate::registry::{ClientId, ClientRegistry, PacketSink, Transition};
use crate::server::event::{EventSender, ServerEvent};
use crate::server::handler::ServerHandler;
use crate::stats::{MuxerStats, ServerCounters};

/// Owner of the at-most-one session of a server
pub struct SessionController<H: ServerHandler> {
    handler: Arc<H>,
    registry: Arc<ClientRegistry>,
    muxer_config: MuxerConfig,
    session: Mutex<Option<Session>>,
    next_session_id: AtomicU64,
    counters: Arc<ServerCounters>,
    events: EventSender,
}

impl<H: ServerHandler> SessionController<H> {
    pub(crate) fn new(
        handler: Arc<H>,
        registry: Arc<ClientRegistry>,
        muxer_config: MuxerConfig,
        counters: Arc<ServerCounters>,
        events: EventSender,
    ) -> Self {
        Self {
            handler,
            registry,
            muxer_config,
            session: Mutex::new(None),
            next_session_id: AtomicU64::new(1),
            counters,
            events,
        }
    }

    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    /// Attach a client, creating the session if none exists
    ///
    /// On failure the client is deregistered again and nothing of the attempted
    /// session is left running.
    pub fn attach<S: PacketSink + 'static>(&self, conn: &Arc<S>) -> Result<(), SessionError> {
        let mut slot = self.session.lock();
        let transition = self.registry.register(conn);

        if slot.is_some() {
            return Ok(());
        }
        if transition != Transition::FirstAttached {
            tracing::debug!(client_id = conn.id(), "Creating session for a non-first attach");
        }

        match self.create() {
            Ok(session) => {
                *slot = Some(session);
                Ok(())
            }
            Err(e) => {
                self.registry.deregister(conn.id());
                tracing::warn!(client_id = conn.id(), error = %e, "Session creation failed");
                self.events.emit(ServerEvent::SessionFailed {
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Detach a client; destroys the session when it was the last one
    ///
    /// Returns whether the session was torn down.
    pub fn detach(&self, id: ClientId) -> bool {
        let mut slot = self.session.lock();
        if self.registry.deregister(id) != Transition::LastDetached {
            return false;
        }

        match slot.take() {
            Some(session) => {
                self.destroy(session);
                true
            }
            None => false,
        }
    }

    /// Drop every client and tear the session down regardless of attach count
    ///
    /// Returns whether a session existed.
    pub fn force_release(&self) -> bool {
        let mut slot = self.session.lock();
        let clients = self.registry.clear();

        match slot.take() {
            Some(session) => {
                tracing::info!(
                    session_id = session.id(),
                    clients = clients,
                    "Forcing session release"
                );
                self.destroy(session);
                true
            }
            None => false,
        }
    }

    /// Restart the video encoder without touching client connections
    pub fn restart_video_encoder(&self) -> Result<(), SessionError> {
        self.restart_encoder(StreamKind::Video)
    }

    /// Restart the audio encoder without touching client connections
    pub fn restart_audio_encoder(&self) -> Result<(), SessionError> {
        self.restart_encoder(StreamKind::Audio)
    }

    fn restart_encoder(&self, kind: StreamKind) -> Result<(), SessionError> {
        let mut slot = self.session.lock();
        let session = slot.as_mut().ok_or(SessionError::NoSession)?;
        session.restart_encoder(kind)
    }

    pub fn has_session(&self) -> bool {
        self.session.lock().is_some()
    }

    /// Muxer counters of the live session
    ///
    /// Returns `None` without waiting when a lifecycle operation is in progress.
    pub fn muxer_stats(&self) -> Option<MuxerStats> {
        self.session
            .try_lock()
            .and_then(|slot| slot.as_ref().map(Session::muxer_stats))
    }

    fn create(&self) -> Result<Session, SessionError> {
        let id = self.next_session_id.fetch_add(1, Ordering::Relaxed);

        let registry = Arc::clone(&self.registry);
        let sink: MuxerSink = Box::new(move |chunk| {
            registry.broadcast(&chunk);
        });
        let muxer = TsMuxer::with_config(self.muxer_config.clone(), sink);
        let mut session = Session::new(id, Arc::new(Mutex::new(muxer)));

        let started = self
            .handler
            .on_session_create(&mut session)
            .and_then(|()| session.start_encoders());

        if let Err(e) = started {
            session.release();
            self.handler.on_session_release(&mut session);
            return Err(e);
        }

        self.counters.record_session_created();
        self.events.emit(ServerEvent::SessionCreated { session_id: id });
        tracing::info!(
            session_id = id,
            video = session.has_video_encoder(),
            audio = session.has_audio_encoder(),
            "Session created"
        );
        Ok(session)
    }

    fn destroy(&self, mut session: Session) {
        let id = session.id();
        let stats = session.muxer_stats();

        session.release();
        self.handler.on_session_release(&mut session);

        self.counters.record_session_released();
        self.events.emit(ServerEvent::SessionReleased { session_id: id });
        tracing::info!(
            session_id = id,
            video_frames = stats.video_frames,
            audio_frames = stats.audio_frames,
            bytes = stats.bytes_out,
            "Session released"
        );
    }
}
