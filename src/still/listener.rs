//! Accepting side of the still-image server
//!
//! Every accepted socket is wrapped in [`TimedIo`] before hyper sees it. That bounds
//! the size of the request and the time a client may take to send it, and how long a
//! single write may stall once the stream runs.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Sleep;

use super::config::StillImageConfig;

/// Bound of everything a client may send before the response starts
pub(crate) const MAX_REQUEST_HEAD: usize = 1024;

/// Pause after a failed accept, e.g. when out of file descriptors
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// TCP listener handing hyper deadline-bounded sockets
pub(crate) struct StillListener {
    inner: TcpListener,
    tcp_nodelay: bool,
    request_timeout: Duration,
    send_timeout: Duration,
}

impl StillListener {
    pub(crate) fn new(inner: TcpListener, config: &StillImageConfig) -> Self {
        Self {
            inner,
            tcp_nodelay: config.tcp_nodelay,
            request_timeout: config.request_timeout,
            send_timeout: config.send_timeout,
        }
    }
}

impl axum::serve::Listener for StillListener {
    type Io = TimedIo<TcpStream>;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        loop {
            match self.inner.accept().await {
                Ok((socket, peer)) => {
                    if self.tcp_nodelay {
                        if let Err(e) = socket.set_nodelay(true) {
                            tracing::debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
                        }
                    }
                    let io = TimedIo::new(socket, self.request_timeout, self.send_timeout);
                    return (io, peer);
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to accept connection");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        self.inner.local_addr()
    }
}

/// Socket wrapper enforcing the request bounds and the per-write deadline
///
/// Until the first byte is written back, reads fail with [`io::ErrorKind::TimedOut`]
/// once `request_timeout` passes and with [`io::ErrorKind::InvalidData`] past
/// [`MAX_REQUEST_HEAD`] bytes. A write or flush that makes no progress for
/// `send_timeout` fails with [`io::ErrorKind::TimedOut`].
pub(crate) struct TimedIo<T> {
    inner: T,
    send_timeout: Duration,
    request_read: usize,
    request_deadline: Option<Pin<Box<Sleep>>>,
    write_deadline: Option<Pin<Box<Sleep>>>,
}

impl<T> TimedIo<T> {
    pub(crate) fn new(inner: T, request_timeout: Duration, send_timeout: Duration) -> Self {
        Self {
            inner,
            send_timeout,
            request_read: 0,
            request_deadline: Some(Box::pin(tokio::time::sleep(request_timeout))),
            write_deadline: None,
        }
    }

    /// Arm the write deadline if needed and report whether it passed
    fn poll_stalled(&mut self, cx: &mut Context<'_>) -> Poll<io::Error> {
        let timeout = self.send_timeout;
        let deadline = self
            .write_deadline
            .get_or_insert_with(|| Box::pin(tokio::time::sleep(timeout)));

        match deadline.as_mut().poll(cx) {
            Poll::Ready(()) => Poll::Ready(io::Error::new(
                io::ErrorKind::TimedOut,
                "write made no progress in time",
            )),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for TimedIo<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let polled = Pin::new(&mut this.inner).poll_read(cx, buf);

        let Some(deadline) = this.request_deadline.as_mut() else {
            return polled;
        };
        match polled {
            Poll::Ready(Ok(())) => {
                this.request_read += buf.filled().len() - before;
                if this.request_read > MAX_REQUEST_HEAD {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "request head too large",
                    )));
                }
                Poll::Ready(Ok(()))
            }
            Poll::Pending if deadline.as_mut().poll(cx).is_ready() => Poll::Ready(Err(
                io::Error::new(io::ErrorKind::TimedOut, "request not received in time"),
            )),
            other => other,
        }
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for TimedIo<T> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Ready(result) => {
                this.write_deadline = None;
                if matches!(result, Ok(n) if n > 0) {
                    this.request_deadline = None;
                }
                Poll::Ready(result)
            }
            Poll::Pending => this.poll_stalled(cx).map(Err),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_flush(cx) {
            Poll::Ready(result) => {
                this.write_deadline = None;
                Poll::Ready(result)
            }
            Poll::Pending => this.poll_stalled(cx).map(Err),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    const LONG: Duration = Duration::from_secs(5);
    const SHORT: Duration = Duration::from_millis(50);

    #[tokio::test]
    async fn test_stalled_write_times_out() {
        let (_peer, socket) = tokio::io::duplex(16);
        let mut io = TimedIo::new(socket, LONG, SHORT);

        let err = io.write_all(&[0u8; 64]).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn test_writes_pass_while_peer_reads() {
        let (mut peer, socket) = tokio::io::duplex(16);
        let mut io = TimedIo::new(socket, LONG, SHORT);

        let reader = tokio::spawn(async move {
            let mut received = Vec::new();
            peer.read_to_end(&mut received).await.unwrap();
            received.len()
        });

        io.write_all(&[7u8; 1024]).await.unwrap();
        io.shutdown().await.unwrap();
        drop(io);
        assert_eq!(reader.await.unwrap(), 1024);
    }

    #[tokio::test]
    async fn test_missing_request_times_out() {
        let (_peer, socket) = tokio::io::duplex(64);
        let mut io = TimedIo::new(socket, SHORT, LONG);

        let mut buf = [0u8; 8];
        let err = io.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn test_oversized_request_rejected() {
        let (mut peer, socket) = tokio::io::duplex(4096);
        let mut io = TimedIo::new(socket, LONG, LONG);
        peer.write_all(&[b'a'; MAX_REQUEST_HEAD + 1]).await.unwrap();

        let mut received = Vec::new();
        let err = io.read_to_end(&mut received).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_request_deadline_ends_with_first_write() {
        let (_peer, socket) = tokio::io::duplex(64);
        let mut io = TimedIo::new(socket, SHORT, LONG);
        io.write_all(b"HTTP/1.0 200 OK\r\n").await.unwrap();

        // Idle reads are fine once the response started
        let mut buf = [0u8; 8];
        let read = tokio::time::timeout(Duration::from_millis(150), io.read(&mut buf)).await;
        assert!(read.is_err());
    }
}
