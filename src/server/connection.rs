//! Client connection
//!
//! A [`ClientConnection`] is the registry's view of one socket: payloads handed to
//! `send` land in an outbox that a writer task (or a streaming response body) drains
//! onto the socket. Two outbox flavors exist. The transport stream server uses a
//! bounded FIFO queue, where a full queue means the client stalled. The still-image
//! server uses a single-slot latest-wins mailbox, where a slow client simply skips
//! frames.

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::registry::{ClientId, PacketSink, SendError};
use crate::server::event::CloseReason;
use crate::server::handler::ClientInfo;
use crate::stats::{ConnectionCounters, ConnectionStats};

/// Bound for the socket shutdown after the writer stops
const SHUTDOWN_TIMEOUT: Duration = Duration::from_millis(100);

enum Outbox {
    Queue(mpsc::Sender<Bytes>),
    Latest(watch::Sender<Option<Bytes>>),
}

/// Receiving half of a connection's outbox, owned by its writer task
pub(crate) enum OutboxReceiver {
    Queue(mpsc::Receiver<Bytes>),
    Latest(watch::Receiver<Option<Bytes>>),
}

impl OutboxReceiver {
    /// Next payload; `None` once the sending side is gone
    pub(crate) async fn next(&mut self) -> Option<Bytes> {
        match self {
            OutboxReceiver::Queue(rx) => rx.recv().await,
            OutboxReceiver::Latest(rx) => loop {
                if rx.changed().await.is_err() {
                    return None;
                }
                if let Some(payload) = rx.borrow_and_update().clone() {
                    return Some(payload);
                }
            },
        }
    }
}

/// One attached client socket
pub struct ClientConnection {
    info: ClientInfo,
    outbox: Outbox,
    closed: CancellationToken,
    close_reason: OnceLock<CloseReason>,
    counters: ConnectionCounters,
}

impl ClientConnection {
    /// Connection with a bounded FIFO outbox
    ///
    /// The connection is closed when `parent` is cancelled.
    pub(crate) fn queued(
        info: ClientInfo,
        capacity: usize,
        parent: &CancellationToken,
    ) -> (Arc<Self>, OutboxReceiver) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let conn = Self::new(info, Outbox::Queue(tx), parent);
        (conn, OutboxReceiver::Queue(rx))
    }

    /// Connection with a single-slot latest-wins outbox
    pub(crate) fn latest(
        info: ClientInfo,
        parent: &CancellationToken,
    ) -> (Arc<Self>, OutboxReceiver) {
        let (tx, rx) = watch::channel(None);
        let conn = Self::new(info, Outbox::Latest(tx), parent);
        (conn, OutboxReceiver::Latest(rx))
    }

    fn new(info: ClientInfo, outbox: Outbox, parent: &CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            info,
            outbox,
            closed: parent.child_token(),
            close_reason: OnceLock::new(),
            counters: ConnectionCounters::new(),
        })
    }

    pub fn info(&self) -> &ClientInfo {
        &self.info
    }

    pub fn peer(&self) -> SocketAddr {
        self.info.peer
    }

    pub fn connected_at(&self) -> Instant {
        self.info.connected_at
    }

    /// Close the connection, recording the first reason given
    pub fn close_with(&self, reason: CloseReason) {
        let _ = self.close_reason.set(reason);
        self.closed.cancel();
    }

    /// Why the connection closed, once it has
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason.get().copied()
    }

    /// Resolves once the connection is closed
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    pub fn stats(&self) -> ConnectionStats {
        self.counters
            .snapshot(self.info.id, self.info.peer, self.info.connected_at)
    }

    /// Count a payload handed to the transport outside [`run_writer`]
    pub(crate) fn record_write(&self, bytes: usize) {
        self.counters.record_write(bytes);
    }
}

impl PacketSink for ClientConnection {
    fn id(&self) -> ClientId {
        self.info.id
    }

    fn send(&self, payload: Bytes) -> Result<(), SendError> {
        if self.closed.is_cancelled() {
            return Err(SendError::Closed);
        }

        match &self.outbox {
            Outbox::Queue(tx) => tx.try_send(payload).map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => {
                    self.counters.record_drop();
                    let _ = self.close_reason.set(CloseReason::Backpressure);
                    SendError::Backpressure
                }
                mpsc::error::TrySendError::Closed(_) => {
                    let _ = self.close_reason.set(CloseReason::WriteFailed);
                    SendError::Closed
                }
            }),
            Outbox::Latest(tx) => {
                tx.send_replace(Some(payload));
                Ok(())
            }
        }
    }

    fn close(&self) {
        self.close_with(CloseReason::ServerStopped);
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

impl std::fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConnection")
            .field("id", &self.info.id)
            .field("peer", &self.info.peer)
            .field("closed", &self.closed.is_cancelled())
            .finish()
    }
}

/// Drain the outbox onto the socket until the connection closes
///
/// Each write is bounded by `send_timeout`; a failed or timed out write closes the
/// connection with [`CloseReason::WriteFailed`].
pub(crate) async fn run_writer<W>(
    conn: Arc<ClientConnection>,
    mut writer: W,
    mut outbox: OutboxReceiver,
    send_timeout: Duration,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let payload = tokio::select! {
            biased;
            _ = conn.closed.cancelled() => break,
            next = outbox.next() => match next {
                Some(payload) => payload,
                None => break,
            },
        };

        match tokio::time::timeout(send_timeout, writer.write_all(&payload)).await {
            Ok(Ok(())) => conn.counters.record_write(payload.len()),
            Ok(Err(e)) => {
                tracing::debug!(client_id = conn.id(), error = %e, "Write failed");
                conn.close_with(CloseReason::WriteFailed);
                break;
            }
            Err(_) => {
                tracing::debug!(client_id = conn.id(), "Write timed out");
                conn.close_with(CloseReason::WriteFailed);
                break;
            }
        }
    }

    let _ = tokio::time::timeout(SHUTDOWN_TIMEOUT, writer.shutdown()).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(id: ClientId) -> ClientInfo {
        ClientInfo::new(id, "127.0.0.1:6000".parse().unwrap())
    }

    #[test]
    fn test_queue_full_is_backpressure() {
        let parent = CancellationToken::new();
        let (conn, _rx) = ClientConnection::queued(info(1), 2, &parent);

        conn.send(Bytes::from_static(b"a")).unwrap();
        conn.send(Bytes::from_static(b"b")).unwrap();
        assert_eq!(
            conn.send(Bytes::from_static(b"c")),
            Err(SendError::Backpressure)
        );
        assert_eq!(conn.stats().dropped, 1);

        // The registry closes the sink after a failed send
        conn.close();
        assert!(conn.is_closed());
        assert_eq!(conn.close_reason(), Some(CloseReason::Backpressure));
        assert_eq!(conn.send(Bytes::from_static(b"d")), Err(SendError::Closed));
    }

    #[test]
    fn test_parent_cancel_closes() {
        let parent = CancellationToken::new();
        let (conn, _rx) = ClientConnection::queued(info(1), 4, &parent);

        parent.cancel();
        assert!(conn.is_closed());
        assert_eq!(conn.send(Bytes::from_static(b"x")), Err(SendError::Closed));
    }

    #[tokio::test]
    async fn test_writer_preserves_order() {
        let parent = CancellationToken::new();
        let (conn, rx) = ClientConnection::queued(info(1), 8, &parent);
        let mock = tokio_test::io::Builder::new()
            .write(b"first")
            .write(b"second")
            .build();

        conn.send(Bytes::from_static(b"first")).unwrap();
        conn.send(Bytes::from_static(b"second")).unwrap();

        let writer = tokio::spawn(run_writer(
            Arc::clone(&conn),
            mock,
            rx,
            Duration::from_secs(1),
        ));
        tokio::time::sleep(Duration::from_millis(50)).await;
        conn.close_with(CloseReason::PeerClosed);
        writer.await.unwrap();

        let stats = conn.stats();
        assert_eq!(stats.writes, 2);
        assert_eq!(stats.bytes_sent, 11);
        assert_eq!(conn.close_reason(), Some(CloseReason::PeerClosed));
    }

    #[tokio::test]
    async fn test_write_error_closes_connection() {
        let parent = CancellationToken::new();
        let (conn, rx) = ClientConnection::queued(info(7), 8, &parent);
        let mock = tokio_test::io::Builder::new()
            .write_error(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone"))
            .build();

        conn.send(Bytes::from_static(b"payload")).unwrap();
        run_writer(Arc::clone(&conn), mock, rx, Duration::from_secs(1)).await;

        assert!(conn.is_closed());
        assert_eq!(conn.close_reason(), Some(CloseReason::WriteFailed));
    }

    #[tokio::test]
    async fn test_latest_outbox_keeps_newest() {
        let parent = CancellationToken::new();
        let (conn, mut rx) = ClientConnection::latest(info(2), &parent);

        conn.send(Bytes::from_static(b"old")).unwrap();
        conn.send(Bytes::from_static(b"new")).unwrap();

        assert_eq!(rx.next().await, Some(Bytes::from_static(b"new")));
    }
}
