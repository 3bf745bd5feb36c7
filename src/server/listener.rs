//! Transport stream server listener
//!
//! Runs the TCP accept loop, admits clients up to `max_clients` and spawns one watch
//! task per client. The watch task attaches the client (creating the session on the
//! first attach), waits until the connection ends and detaches it again.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::error::{Result, SessionError};
use crate::registry::{ClientId, ClientRegistry, PacketSink};
use crate::server::config::ServerConfig;
use crate::server::connection::{run_writer, ClientConnection, OutboxReceiver};
use crate::server::event::{CloseReason, EventSender, RejectReason, ServerEvent};
use crate::server::handler::{ClientInfo, ServerHandler};
use crate::session::SessionController;
use crate::stats::{ServerCounters, ServerStats};

struct Shared<H: ServerHandler> {
    config: ServerConfig,
    handler: Arc<H>,
    controller: Arc<SessionController<H>>,
    counters: Arc<ServerCounters>,
    events: EventSender,
    connections: Mutex<HashMap<ClientId, Arc<ClientConnection>>>,
    next_client_id: AtomicU64,
}

struct Running {
    addr: SocketAddr,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

/// MPEG transport stream server
///
/// Every attached client receives the same live transport stream. Encoders run only
/// while at least one client is attached.
pub struct TsServer<H: ServerHandler> {
    shared: Arc<Shared<H>>,
    lifecycle: tokio::sync::Mutex<()>,
    running: Mutex<Option<Running>>,
}

impl<H: ServerHandler> TsServer<H> {
    /// Create a new server with the given configuration and handler
    pub fn new(config: ServerConfig, handler: H) -> Self {
        let handler = Arc::new(handler);
        let counters = Arc::new(ServerCounters::new());
        let events = EventSender::new();
        let controller = Arc::new(SessionController::new(
            Arc::clone(&handler),
            Arc::new(ClientRegistry::new()),
            config.muxer.clone(),
            Arc::clone(&counters),
            events.clone(),
        ));

        Self {
            shared: Arc::new(Shared {
                config,
                handler,
                controller,
                counters,
                events,
                connections: Mutex::new(HashMap::new()),
                next_client_id: AtomicU64::new(1),
            }),
            lifecycle: tokio::sync::Mutex::new(()),
            running: Mutex::new(None),
        }
    }

    /// Bind and start accepting clients
    ///
    /// Returns the bound address. Calling it while listening returns the current
    /// address without rebinding.
    pub async fn start(&self) -> Result<SocketAddr> {
        let _guard = self.lifecycle.lock().await;
        if let Some(addr) = self.local_addr() {
            return Ok(addr);
        }

        let listener = TcpListener::bind(self.shared.config.bind_addr).await?;
        let addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();
        let tracker = TaskTracker::new();

        tracker.spawn(accept_loop(
            Arc::clone(&self.shared),
            listener,
            shutdown.clone(),
            tracker.clone(),
        ));
        if let Some(interval) = self.shared.config.stats_interval {
            tracker.spawn(stats_loop(
                Arc::clone(&self.shared),
                interval,
                shutdown.clone(),
            ));
        }

        *self.running.lock() = Some(Running {
            addr,
            shutdown,
            tracker,
        });

        tracing::info!(
            addr = %addr,
            server = %self.shared.config.server_name,
            max_clients = self.shared.config.max_clients,
            "Transport stream server listening"
        );
        self.shared.events.emit(ServerEvent::Listening { addr });
        Ok(addr)
    }

    /// Stop accepting, close every client and tear the session down
    ///
    /// Waits at most `join_timeout` for the server's tasks. A session still alive
    /// afterwards is released regardless of how many clients remain attached.
    pub async fn stop(&self) {
        let _guard = self.lifecycle.lock().await;
        let Some(running) = self.running.lock().take() else {
            return;
        };

        running.shutdown.cancel();
        running.tracker.close();
        let joined = tokio::time::timeout(self.shared.config.join_timeout, running.tracker.wait())
            .await
            .is_ok();
        if !joined {
            tracing::warn!(
                addr = %running.addr,
                pending = running.tracker.len(),
                "Server tasks did not stop in time"
            );
        }

        let controller = Arc::clone(&self.shared.controller);
        let released = tokio::task::spawn_blocking(move || controller.force_release())
            .await
            .unwrap_or(false);

        tracing::info!(
            addr = %running.addr,
            forced_release = released,
            "Transport stream server stopped"
        );
        self.shared.events.emit(ServerEvent::Stopped);
    }

    pub fn is_listening(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Bound address while listening
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().as_ref().map(|r| r.addr)
    }

    /// Number of attached clients
    pub fn client_count(&self) -> usize {
        self.shared.controller.registry().attached_count()
    }

    /// Whether a streaming session is live
    pub fn has_session(&self) -> bool {
        self.shared.controller.has_session()
    }

    /// Subscribe to server events
    pub fn events(&self) -> broadcast::Receiver<ServerEvent> {
        self.shared.events.subscribe()
    }

    /// Restart the video encoder of the live session
    pub async fn restart_video_encoder(&self) -> Result<()> {
        let controller = Arc::clone(&self.shared.controller);
        tokio::task::spawn_blocking(move || controller.restart_video_encoder())
            .await
            .map_err(|_| SessionError::Aborted)??;
        Ok(())
    }

    /// Restart the audio encoder of the live session
    pub async fn restart_audio_encoder(&self) -> Result<()> {
        let controller = Arc::clone(&self.shared.controller);
        tokio::task::spawn_blocking(move || controller.restart_audio_encoder())
            .await
            .map_err(|_| SessionError::Aborted)??;
        Ok(())
    }

    /// Current server statistics
    pub fn stats(&self) -> ServerStats {
        self.shared.stats()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }

    pub fn handler(&self) -> &Arc<H> {
        &self.shared.handler
    }
}

impl<H: ServerHandler> Drop for TsServer<H> {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            running.shutdown.cancel();
        }
    }
}

impl<H: ServerHandler> Shared<H> {
    fn stats(&self) -> ServerStats {
        let clients = self
            .connections
            .lock()
            .values()
            .map(|conn| conn.stats())
            .collect();
        let mut stats = self
            .counters
            .snapshot(self.controller.registry().attached_count(), clients);
        stats.muxer = self.controller.muxer_stats();
        stats
    }

    fn reject(&self, peer: SocketAddr, reason: RejectReason) {
        self.counters.record_reject();
        self.events.emit(ServerEvent::ClientRejected { peer, reason });
    }

    fn handle_connection(
        self: &Arc<Self>,
        socket: TcpStream,
        peer: SocketAddr,
        shutdown: &CancellationToken,
        tracker: &TaskTracker,
    ) {
        // Admitted connections are counted, not only attached ones, so a burst of
        // connects cannot overshoot the limit while attaches are in flight.
        let admitted = self.connections.lock().len();
        if admitted >= self.config.max_clients {
            tracing::warn!(
                peer = %peer,
                max_clients = self.config.max_clients,
                "Connection rejected: client limit reached"
            );
            self.reject(peer, RejectReason::MaxClients);
            return;
        }

        let id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
        let info = ClientInfo::new(id, peer);

        if !self.handler.on_accept(&info) {
            tracing::warn!(client_id = id, peer = %peer, "Connection rejected by handler");
            self.reject(peer, RejectReason::Vetoed);
            return;
        }

        if let Err(e) = self.configure_socket(&socket) {
            tracing::error!(client_id = id, error = %e, "Failed to configure socket");
            return;
        }

        let (conn, outbox) =
            ClientConnection::queued(info, self.config.send_queue_capacity, shutdown);
        self.connections.lock().insert(id, Arc::clone(&conn));
        self.counters.record_accept();
        self.events.emit(ServerEvent::ClientAccepted {
            client_id: id,
            peer,
        });

        tracing::debug!(client_id = id, peer = %peer, "New connection");

        let shared = Arc::clone(self);
        tracker.spawn(async move {
            shared.watch_client(socket, conn, outbox).await;
        });
    }

    async fn watch_client(
        self: Arc<Self>,
        socket: TcpStream,
        conn: Arc<ClientConnection>,
        outbox: OutboxReceiver,
    ) {
        let id = conn.id();
        let peer = conn.peer();
        let (mut reader, writer) = socket.into_split();
        let writer = tokio::spawn(run_writer(
            Arc::clone(&conn),
            writer,
            outbox,
            self.config.send_timeout,
        ));

        let controller = Arc::clone(&self.controller);
        let attach_conn = Arc::clone(&conn);
        let attached = tokio::task::spawn_blocking(move || controller.attach(&attach_conn))
            .await
            .unwrap_or(Err(SessionError::Aborted));

        let was_attached = attached.is_ok();
        let reason = match attached {
            Ok(()) => {
                tracing::debug!(client_id = id, "Client attached");
                tokio::select! {
                    _ = conn.closed() => conn.close_reason().unwrap_or(CloseReason::ServerStopped),
                    _ = wait_for_eof(&mut reader) => CloseReason::PeerClosed,
                }
            }
            Err(e) => {
                tracing::debug!(client_id = id, error = %e, "Attach failed");
                self.reject(peer, RejectReason::SessionFailed);
                CloseReason::ServerStopped
            }
        };

        conn.close_with(reason);
        let controller = Arc::clone(&self.controller);
        let _ = tokio::task::spawn_blocking(move || controller.detach(id)).await;
        let _ = writer.await;

        let stats = conn.stats();
        self.connections.lock().remove(&id);

        if was_attached {
            self.handler.on_closed(conn.info());
            self.events.emit(ServerEvent::ClientClosed {
                client_id: id,
                peer,
                reason,
            });
        }

        tracing::debug!(
            client_id = id,
            reason = %reason,
            bytes = stats.bytes_sent,
            dropped = stats.dropped,
            "Connection closed"
        );
    }

    fn configure_socket(&self, socket: &TcpStream) -> std::io::Result<()> {
        if self.config.tcp_nodelay {
            socket.set_nodelay(true)?;
        }
        Ok(())
    }
}

async fn accept_loop<H: ServerHandler>(
    shared: Arc<Shared<H>>,
    listener: TcpListener,
    shutdown: CancellationToken,
    tracker: TaskTracker,
) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((socket, peer)) => {
                shared.handle_connection(socket, peer, &shutdown, &tracker);
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to accept connection");
            }
        }
    }
    tracing::debug!("Accept loop stopped");
}

async fn stats_loop<H: ServerHandler>(
    shared: Arc<Shared<H>>,
    interval: std::time::Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let stats = shared.stats();
                tracing::debug!(
                    active_clients = stats.active_clients,
                    accepted = stats.total_accepted,
                    rejected = stats.total_rejected,
                    bytes = stats.total_bytes_sent,
                    "Server stats"
                );
                shared.events.emit(ServerEvent::Stats(stats));
            }
        }
    }
}

/// Resolves when the peer closes its side or a read fails
pub(crate) async fn wait_for_eof<R: AsyncRead + Unpin>(reader: &mut R) {
    let mut buf = [0u8; 512];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
    }
}
