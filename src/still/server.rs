//! Still-image HTTP server
//!
//! Serves one `multipart/x-mixed-replace` stream over axum. Every client that
//! requests the configured path receives the newest rendered image as one part per
//! frame until it disconnects or the server stops.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::body::Body;
use axum::extract::connect_info::Connected;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, Method, Response, StatusCode, Uri};
use axum::serve::IncomingStream;
use axum::Router;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::config::StillImageConfig;
use super::controller::RenderController;
use super::frame::StillImageFrame;
use super::http;
use super::listener::StillListener;
use super::renderer::RendererFactory;
use crate::error::{Result, SessionError};
use crate::registry::ClientId;
use crate::server::connection::{ClientConnection, OutboxReceiver};
use crate::server::event::{CloseReason, EventSender, RejectReason, ServerEvent};
use crate::server::handler::{ClientInfo, DefaultHandler};
use crate::stats::{ServerCounters, ServerStats};

/// Collaborator hooks of the still-image server
///
/// Both methods must return quickly. `on_accept` runs on the request's task,
/// `on_closed` on a blocking worker.
pub trait StillImageHandler: Send + Sync + 'static {
    /// Admit or refuse a client whose request was valid; refusal answers `500`
    fn on_accept(&self, client: &ClientInfo) -> bool {
        let _ = client;
        true
    }

    /// A streaming client went away
    fn on_closed(&self, client: &ClientInfo) {
        let _ = client;
    }
}

impl StillImageHandler for DefaultHandler {}

struct Shared<H: StillImageHandler> {
    config: StillImageConfig,
    handler: Arc<H>,
    controller: Arc<RenderController>,
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

/// Router state of one running server
struct Endpoint<H: StillImageHandler> {
    shared: Arc<Shared<H>>,
    headers: Arc<HeaderMap>,
    shutdown: CancellationToken,
}

impl<H: StillImageHandler> Clone for Endpoint<H> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            headers: Arc::clone(&self.headers),
            shutdown: self.shutdown.clone(),
        }
    }
}

/// Peer address of a connection accepted by [`StillListener`]
#[derive(Clone, Copy)]
struct PeerAddr(SocketAddr);

impl Connected<IncomingStream<'_, StillListener>> for PeerAddr {
    fn connect_info(stream: IncomingStream<'_, StillListener>) -> Self {
        PeerAddr(*stream.remote_addr())
    }
}

/// Multipart still-image server
pub struct StillImageServer<H: StillImageHandler = DefaultHandler> {
    shared: Arc<Shared<H>>,
    lifecycle: tokio::sync::Mutex<()>,
    running: Mutex<Option<Running>>,
}

impl StillImageServer<DefaultHandler> {
    /// Server that admits every valid request
    pub fn with_factory<F: RendererFactory>(config: StillImageConfig, factory: F) -> Self {
        Self::new(config, factory, DefaultHandler)
    }
}

impl<H: StillImageHandler> StillImageServer<H> {
    pub fn new<F: RendererFactory>(config: StillImageConfig, factory: F, handler: H) -> Self {
        let counters = Arc::new(ServerCounters::new());
        let events = EventSender::new();
        let controller = Arc::new(RenderController::new(
            config.clone(),
            Arc::new(factory),
            Arc::clone(&counters),
            events.clone(),
        ));

        Self {
            shared: Arc::new(Shared {
                config,
                handler: Arc::new(handler),
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

    /// Bind and start serving
    ///
    /// Returns the bound address; a no-op while already listening. Fails when the
    /// configured server name or boundary cannot be sent as a header.
    pub async fn start(&self) -> Result<SocketAddr> {
        let _guard = self.lifecycle.lock().await;
        if let Some(addr) = self.local_addr() {
            return Ok(addr);
        }

        let config = &self.shared.config;
        let headers = http::stream_headers(&config.server_name, &config.boundary)?;
        let listener = TcpListener::bind(config.bind_addr).await?;
        let addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();
        let tracker = TaskTracker::new();

        let endpoint = Endpoint {
            shared: Arc::clone(&self.shared),
            headers: Arc::new(headers),
            shutdown: shutdown.clone(),
        };
        let app = Router::new()
            .fallback(serve_stream::<H>)
            .with_state(endpoint)
            .into_make_service_with_connect_info::<PeerAddr>();
        let listener = StillListener::new(listener, config);
        let signal = shutdown.clone();

        tracker.spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async move { signal.cancelled().await })
                .await;
            if let Err(e) = served {
                tracing::error!(error = %e, "Still-image server failed");
            }
            tracing::debug!("Still-image accept loop stopped");
        });
        tracker.spawn(broadcast_loop(
            Arc::clone(&self.shared.controller),
            self.shared.controller.frames(),
            shutdown.clone(),
        ));

        *self.running.lock() = Some(Running {
            addr,
            shutdown,
            tracker,
        });

        tracing::info!(
            addr = %addr,
            path = %config.path,
            max_clients = config.max_clients,
            "Still-image server listening"
        );
        self.shared.events.emit(ServerEvent::Listening { addr });
        Ok(addr)
    }

    /// Stop serving, close every client and stop the render loop
    pub async fn stop(&self) {
        let _guard = self.lifecycle.lock().await;
        let Some(running) = self.running.lock().take() else {
            return;
        };

        running.shutdown.cancel();
        running.tracker.close();
        let join = tokio::time::timeout(self.shared.config.join_timeout, running.tracker.wait());
        if join.await.is_err() {
            tracing::warn!(
                addr = %running.addr,
                pending = running.tracker.len(),
                "Still-image tasks did not stop in time"
            );
        }

        let controller = Arc::clone(&self.shared.controller);
        let released = tokio::task::spawn_blocking(move || controller.force_release())
            .await
            .unwrap_or(false);

        tracing::info!(
            addr = %running.addr,
            forced_release = released,
            "Still-image server stopped"
        );
        self.shared.events.emit(ServerEvent::Stopped);
    }

    pub fn is_listening(&self) -> bool {
        self.running.lock().is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().as_ref().map(|r| r.addr)
    }

    /// Stream URL while listening, e.g. `http://localhost:8080/<path>`
    pub fn url(&self) -> Option<String> {
        self.local_addr().map(|addr| {
            format!("http://localhost:{}/{}", addr.port(), self.shared.config.path)
        })
    }

    /// Number of streaming clients
    pub fn client_count(&self) -> usize {
        self.shared.controller.registry().attached_count()
    }

    /// Whether the render loop is running
    pub fn is_rendering(&self) -> bool {
        self.shared.controller.is_rendering()
    }

    pub fn events(&self) -> broadcast::Receiver<ServerEvent> {
        self.shared.events.subscribe()
    }

    pub fn stats(&self) -> ServerStats {
        let clients = self
            .shared
            .connections
            .lock()
            .values()
            .map(|conn| conn.stats())
            .collect();
        self.shared.counters.snapshot(self.client_count(), clients)
    }

    pub fn config(&self) -> &StillImageConfig {
        &self.shared.config
    }
}

impl<H: StillImageHandler> Drop for StillImageServer<H> {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            running.shutdown.cancel();
        }
    }
}

impl<H: StillImageHandler> Shared<H> {
    fn reject(&self, peer: SocketAddr, reason: RejectReason, status: StatusCode) -> Response<Body> {
        self.counters.record_reject();
        self.events.emit(ServerEvent::ClientRejected { peer, reason });
        http::error_response(status, &self.config.server_name)
    }

    /// Admit under the connection lock so concurrent requests cannot overshoot
    fn admit(
        &self,
        info: ClientInfo,
        shutdown: &CancellationToken,
    ) -> Option<(Arc<ClientConnection>, OutboxReceiver)> {
        let mut connections = self.connections.lock();
        if connections.len() >= self.config.max_clients {
            return None;
        }

        let id = info.id;
        let (conn, outbox) = ClientConnection::latest(info, shutdown);
        connections.insert(id, Arc::clone(&conn));
        Some((conn, outbox))
    }

    async fn detach(&self, id: ClientId) {
        let controller = Arc::clone(&self.controller);
        let _ = tokio::task::spawn_blocking(move || controller.detach(id)).await;
        self.connections.lock().remove(&id);
    }

    /// Blocking teardown of a client whose stream ended
    fn finish(&self, conn: &ClientConnection, reason: CloseReason) {
        let id = conn.info().id;
        self.controller.detach(id);
        self.connections.lock().remove(&id);

        let stats = conn.stats();
        self.handler.on_closed(conn.info());
        self.events.emit(ServerEvent::ClientClosed {
            client_id: id,
            peer: conn.peer(),
            reason,
        });
        tracing::debug!(
            client_id = id,
            reason = %reason,
            frames = stats.writes,
            bytes = stats.bytes_sent,
            "Streaming client closed"
        );
    }
}

/// Answer every request: stream on the configured path, an error status otherwise
async fn serve_stream<H: StillImageHandler>(
    State(endpoint): State<Endpoint<H>>,
    ConnectInfo(PeerAddr(peer)): ConnectInfo<PeerAddr>,
    method: Method,
    uri: Uri,
) -> Response<Body> {
    let shared = endpoint.shared;

    if let Err(e) = http::check_request(&method, &uri, &shared.config.path) {
        tracing::debug!(peer = %peer, error = %e, "Bad request");
        return shared.reject(peer, RejectReason::BadRequest, StatusCode::BAD_REQUEST);
    }

    let id = shared.next_client_id.fetch_add(1, Ordering::Relaxed);
    let info = ClientInfo::new(id, peer);

    if !shared.handler.on_accept(&info) {
        tracing::warn!(client_id = id, peer = %peer, "Client rejected by handler");
        return shared.reject(peer, RejectReason::Vetoed, StatusCode::INTERNAL_SERVER_ERROR);
    }

    let Some((conn, outbox)) = shared.admit(info, &endpoint.shutdown) else {
        tracing::warn!(
            peer = %peer,
            max_clients = shared.config.max_clients,
            "Client rejected: client limit reached"
        );
        return shared.reject(peer, RejectReason::MaxClients, StatusCode::SERVICE_UNAVAILABLE);
    };

    let controller = Arc::clone(&shared.controller);
    let attach_conn = Arc::clone(&conn);
    let attached = tokio::task::spawn_blocking(move || controller.attach(&attach_conn))
        .await
        .unwrap_or(Err(SessionError::Aborted));
    if let Err(e) = attached {
        tracing::debug!(client_id = id, error = %e, "Attach failed");
        conn.close_with(CloseReason::ServerStopped);
        shared.detach(id).await;
        return shared.reject(
            peer,
            RejectReason::SessionFailed,
            StatusCode::INTERNAL_SERVER_ERROR,
        );
    }

    shared.counters.record_accept();
    shared.events.emit(ServerEvent::ClientAccepted { client_id: id, peer });
    tracing::debug!(client_id = id, peer = %peer, "Streaming client attached");

    let guard = StreamGuard { shared, conn };
    http::stream_response(&endpoint.headers, part_stream(guard, outbox))
}

/// Tears a streaming client down once hyper drops its response body
///
/// The body is dropped when it ends after the connection closed, when a write to the
/// peer failed or timed out, and when hyper gives up on the socket.
struct StreamGuard<H: StillImageHandler> {
    shared: Arc<Shared<H>>,
    conn: Arc<ClientConnection>,
}

impl<H: StillImageHandler> Drop for StreamGuard<H> {
    fn drop(&mut self) {
        let reason = self.conn.close_reason().unwrap_or(CloseReason::PeerClosed);
        self.conn.close_with(reason);

        let shared = Arc::clone(&self.shared);
        let conn = Arc::clone(&self.conn);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let _ = runtime.spawn_blocking(move || shared.finish(&conn, reason));
            }
            Err(_) => shared.finish(&conn, reason),
        }
    }
}

/// Response body draining the client's latest-wins outbox
fn part_stream<H: StillImageHandler>(guard: StreamGuard<H>, mut outbox: OutboxReceiver) -> Body {
    Body::from_stream(async_stream::stream! {
        let conn = Arc::clone(&guard.conn);
        loop {
            let next = tokio::select! {
                biased;
                _ = conn.closed() => None,
                next = outbox.next() => next,
            };
            let Some(part) = next else {
                break;
            };
            conn.record_write(part.len());
            yield Ok::<Bytes, io::Error>(part);
        }
        drop(guard);
    })
}

/// Forward every new frame of the mailbox to the attached clients
async fn broadcast_loop(
    controller: Arc<RenderController>,
    mut frames: watch::Receiver<Option<StillImageFrame>>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            changed = frames.changed() => {
                if changed.is_err() {
                    break;
                }
                let frame = frames.borrow_and_update().clone();
                if let Some(frame) = frame {
                    controller.publish(&frame);
                }
            }
        }
    }
}
