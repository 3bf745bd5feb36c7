use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;

use tscast::error::{EncoderError, SessionError};
use tscast::media::{EncodedFrame, VideoFormat};
use tscast::server::{ClientInfo, CloseReason, RejectReason, ServerEvent};
use tscast::{EncoderOutput, MediaEncoder, ServerConfig, ServerHandler, Session, TsServer};

/// Video encoder pushing a key frame every 10 frames from its own thread
struct TickEncoder {
    frame_len: usize,
    interval: Duration,
    running: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl TickEncoder {
    fn new() -> Self {
        Self::with_load(7, Duration::from_millis(5))
    }

    fn with_load(frame_len: usize, interval: Duration) -> Self {
        Self {
            frame_len,
            interval,
            running: Arc::new(AtomicBool::new(false)),
            thread: None,
        }
    }
}

impl MediaEncoder for TickEncoder {
    fn start(&mut self, output: EncoderOutput) -> Result<(), EncoderError> {
        output.describe_format(
            VideoFormat::h264(320, 240)
                .with_parameter_sets(vec![0, 0, 0, 1, 0x67, 0x42, 0, 0, 0, 1, 0x68, 0xCE]),
        );
        self.running.store(true, Ordering::SeqCst);
        let running = Arc::clone(&self.running);
        let (frame_len, interval) = (self.frame_len, self.interval);
        self.thread = Some(thread::spawn(move || {
            let mut n = 0u64;
            while running.load(Ordering::SeqCst) {
                let nal = if n % 10 == 0 { 0x65 } else { 0x41 };
                let mut data = vec![0, 0, 0, 1, nal, 0x88, n as u8];
                data.resize(frame_len.max(data.len()), 0x88);
                let frame = if n % 10 == 0 {
                    EncodedFrame::keyframe(data, n * 33_000)
                } else {
                    EncodedFrame::new(data, n * 33_000)
                };
                output.push_frame(frame);
                n += 1;
                thread::sleep(interval);
            }
        }));
        Ok(())
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            handle.join().unwrap();
        }
    }
}

#[derive(Default)]
struct TestHandler {
    creates: AtomicUsize,
    releases: AtomicUsize,
    closed: AtomicUsize,
    fail_create: AtomicBool,
    veto: AtomicBool,
    /// Attach an encoder producing large frames back to back
    flood: AtomicBool,
}

impl ServerHandler for TestHandler {
    fn on_accept(&self, _client: &ClientInfo) -> bool {
        !self.veto.load(Ordering::SeqCst)
    }

    fn on_closed(&self, _client: &ClientInfo) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }

    fn on_session_create(&self, session: &mut Session) -> Result<(), SessionError> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(SessionError::Handler("camera unavailable".into()));
        }
        let encoder = if self.flood.load(Ordering::SeqCst) {
            TickEncoder::with_load(16 * 1024, Duration::from_millis(1))
        } else {
            TickEncoder::new()
        };
        session.attach_encoders(Some(Box::new(encoder)), None)
    }

    fn on_session_release(&self, _session: &mut Session) {
        self.releases.fetch_add(1, Ordering::SeqCst);
    }
}

fn config(max_clients: usize) -> ServerConfig {
    ServerConfig::with_addr("127.0.0.1:0".parse().unwrap())
        .max_clients(max_clients)
        .disable_stats()
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Read until EOF or a reset; panics if the server keeps the socket open
async fn expect_closed(stream: &mut TcpStream) {
    let mut buf = [0u8; 4096];
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(_) => {}
            }
        }
    })
    .await
    .expect("connection was not closed");
}

#[tokio::test]
async fn test_clients_receive_transport_units() {
    let server = TsServer::new(config(4), TestHandler::default());
    let addr = server.start().await.unwrap();

    let mut client = TcpStream::connect(addr).await.unwrap();
    let mut units = vec![0u8; 188 * 20];
    tokio::time::timeout(Duration::from_secs(5), client.read_exact(&mut units))
        .await
        .unwrap()
        .unwrap();

    assert!(units.chunks(188).all(|unit| unit[0] == 0x47));
    // PAT comes first so a decoder can start right away
    let pid = ((units[1] as u16 & 0x1F) << 8) | units[2] as u16;
    assert_eq!(pid, 0);

    drop(client);
    wait_until(|| !server.has_session()).await;
    assert_eq!(server.handler().creates.load(Ordering::SeqCst), 1);
    assert_eq!(server.handler().releases.load(Ordering::SeqCst), 1);

    server.stop().await;
}

#[tokio::test]
async fn test_admission_limit_and_readmission() {
    let server = TsServer::new(config(2), TestHandler::default());
    let addr = server.start().await.unwrap();
    let mut events = server.events();

    let first = TcpStream::connect(addr).await.unwrap();
    let _second = TcpStream::connect(addr).await.unwrap();
    wait_until(|| server.client_count() == 2).await;

    let mut third = TcpStream::connect(addr).await.unwrap();
    expect_closed(&mut third).await;
    assert_eq!(server.client_count(), 2);

    let rejected = loop {
        match events.recv().await.unwrap() {
            ServerEvent::ClientRejected { reason, .. } => break reason,
            _ => continue,
        }
    };
    assert_eq!(rejected, RejectReason::MaxClients);

    drop(first);
    wait_until(|| server.client_count() == 1 && server.stats().clients.len() == 1).await;

    let _again = TcpStream::connect(addr).await.unwrap();
    wait_until(|| server.client_count() == 2).await;

    // One session served every client
    assert_eq!(server.handler().creates.load(Ordering::SeqCst), 1);

    server.stop().await;
}

#[tokio::test]
async fn test_stop_closes_all_clients_with_one_teardown() {
    let server = TsServer::new(config(4), TestHandler::default());
    let addr = server.start().await.unwrap();

    let mut clients = Vec::new();
    for _ in 0..3 {
        clients.push(TcpStream::connect(addr).await.unwrap());
    }
    wait_until(|| server.client_count() == 3).await;
    assert!(server.has_session());

    server.stop().await;

    assert!(!server.is_listening());
    assert!(!server.has_session());
    assert_eq!(server.client_count(), 0);
    assert_eq!(server.handler().creates.load(Ordering::SeqCst), 1);
    assert_eq!(server.handler().releases.load(Ordering::SeqCst), 1);

    for client in clients.iter_mut() {
        expect_closed(client).await;
    }
    assert!(TcpStream::connect(addr).await.is_err());
}

#[tokio::test]
async fn test_failed_session_closes_client() {
    let handler = TestHandler::default();
    handler.fail_create.store(true, Ordering::SeqCst);
    let server = TsServer::new(config(4), handler);
    let mut events = server.events();
    let addr = server.start().await.unwrap();

    let mut client = TcpStream::connect(addr).await.unwrap();
    expect_closed(&mut client).await;

    let error = loop {
        match events.recv().await.unwrap() {
            ServerEvent::SessionFailed { error } => break error,
            _ => continue,
        }
    };
    assert!(error.contains("camera unavailable"));
    wait_until(|| server.stats().clients.is_empty()).await;
    assert!(!server.has_session());
    assert_eq!(server.handler().releases.load(Ordering::SeqCst), 1);
    // Never attached, so never reported closed
    assert_eq!(server.handler().closed.load(Ordering::SeqCst), 0);

    server.stop().await;
}

#[tokio::test]
async fn test_vetoed_client_is_dropped() {
    let handler = TestHandler::default();
    handler.veto.store(true, Ordering::SeqCst);
    let server = TsServer::new(config(4), handler);
    let addr = server.start().await.unwrap();

    let mut client = TcpStream::connect(addr).await.unwrap();
    expect_closed(&mut client).await;

    assert_eq!(server.handler().creates.load(Ordering::SeqCst), 0);
    assert_eq!(server.stats().total_rejected, 1);

    server.stop().await;
}

#[tokio::test]
async fn test_restart_keeps_clients() {
    let server = TsServer::new(config(4), TestHandler::default());
    let addr = server.start().await.unwrap();

    let mut client = TcpStream::connect(addr).await.unwrap();
    wait_until(|| server.has_session()).await;

    server.restart_video_encoder().await.unwrap();
    // No audio encoder attached: restarting it is a no-op
    server.restart_audio_encoder().await.unwrap();
    assert_eq!(server.client_count(), 1);

    let mut units = vec![0u8; 188 * 4];
    tokio::time::timeout(Duration::from_secs(5), client.read_exact(&mut units))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(units[0], 0x47);

    server.stop().await;
}

#[tokio::test]
async fn test_stalled_client_is_evicted_while_others_keep_receiving() {
    let handler = TestHandler::default();
    handler.flood.store(true, Ordering::SeqCst);
    let config = config(4)
        .send_queue_capacity(2048)
        .send_timeout(Duration::from_millis(200));
    let server = TsServer::new(config, handler);
    let mut events = server.events();
    let addr = server.start().await.unwrap();

    // Never read from
    let _stalled = TcpStream::connect(addr).await.unwrap();
    let mut reader = TcpStream::connect(addr).await.unwrap();
    wait_until(|| server.client_count() == 2).await;

    let received = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&received);
    let reading = tokio::spawn(async move {
        let mut buf = vec![0u8; 64 * 1024];
        while let Ok(n) = reader.read(&mut buf).await {
            if n == 0 {
                break;
            }
            counter.fetch_add(n, Ordering::Relaxed);
        }
    });

    let reason = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Ok(ServerEvent::ClientClosed { reason, .. }) = events.recv().await {
                break reason;
            }
        }
    })
    .await
    .expect("stalled client was not evicted");
    assert!(matches!(reason, CloseReason::Backpressure | CloseReason::WriteFailed));
    wait_until(|| server.client_count() == 1).await;

    // The reading client is still served after the eviction
    let before = received.load(Ordering::Relaxed);
    wait_until(|| received.load(Ordering::Relaxed) > before + 188 * 100).await;
    assert_eq!(server.client_count(), 1);
    assert_eq!(server.handler().creates.load(Ordering::SeqCst), 1);

    server.stop().await;
    reading.await.unwrap();
}
