//! Statistics for muxing, client connections and servers

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Muxer counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MuxerStats {
    /// Video access units segmented
    pub video_frames: u64,
    /// Audio frames segmented
    pub audio_frames: u64,
    /// Video key frames segmented
    pub keyframes: u64,
    /// Configuration frames cached
    pub config_frames: u64,
    /// Frames dropped (no format, empty, malformed)
    pub dropped_frames: u64,
    /// PAT/PMT pairs written
    pub psi_writes: u64,
    /// Transport bytes handed to the sink
    pub bytes_out: u64,
    /// Batches handed to the sink
    pub batches: u64,
}

impl MuxerStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total frames segmented on both streams
    pub fn frames(&self) -> u64 {
        self.video_frames + self.audio_frames
    }
}

/// Live counters of one client connection
///
/// Updated by the connection's writer task, read by stats snapshots.
#[derive(Debug, Default)]
pub struct ConnectionCounters {
    bytes_sent: AtomicU64,
    writes: AtomicU64,
    dropped: AtomicU64,
}

impl ConnectionCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_write(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    /// A payload the client never received (queue full or superseded)
    pub fn record_drop(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn snapshot(
        &self,
        client_id: u64,
        peer: SocketAddr,
        connected_at: Instant,
    ) -> ConnectionStats {
        ConnectionStats {
            client_id,
            peer,
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            duration: connected_at.elapsed(),
        }
    }
}

/// Point-in-time statistics of one client connection
#[derive(Debug, Clone)]
pub struct ConnectionStats {
    pub client_id: u64,
    pub peer: SocketAddr,
    /// Total bytes written to the socket
    pub bytes_sent: u64,
    /// Number of socket writes
    pub writes: u64,
    /// Payloads dropped for this client
    pub dropped: u64,
    /// Time since the connection was accepted
    pub duration: Duration,
}

impl ConnectionStats {
    /// Average send bitrate in bits per second
    pub fn bitrate(&self) -> u64 {
        let millis = self.duration.as_millis() as u64;
        if millis > 0 {
            self.bytes_sent * 8 * 1000 / millis
        } else {
            0
        }
    }
}

/// Server-wide counters, shared between the accept loop and watch tasks
#[derive(Debug)]
pub struct ServerCounters {
    started_at: Instant,
    accepted: AtomicU64,
    rejected: AtomicU64,
    sessions_created: AtomicU64,
    sessions_released: AtomicU64,
}

impl Default for ServerCounters {
    fn default() -> Self {
        Self {
            started_at: Instant::now(),
            accepted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            sessions_created: AtomicU64::new(0),
            sessions_released: AtomicU64::new(0),
        }
    }
}

impl ServerCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_accept(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reject(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_session_created(&self) {
        self.sessions_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_session_released(&self) {
        self.sessions_released.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, active_clients: usize, clients: Vec<ConnectionStats>) -> ServerStats {
        ServerStats {
            total_accepted: self.accepted.load(Ordering::Relaxed),
            total_rejected: self.rejected.load(Ordering::Relaxed),
            active_clients: active_clients as u64,
            total_bytes_sent: clients.iter().map(|c| c.bytes_sent).sum(),
            sessions_created: self.sessions_created.load(Ordering::Relaxed),
            sessions_released: self.sessions_released.load(Ordering::Relaxed),
            uptime: self.started_at.elapsed(),
            clients,
            muxer: None,
        }
    }
}

/// Server-wide statistics
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    /// Connections that passed admission
    pub total_accepted: u64,
    /// Connections refused (over limit or vetoed)
    pub total_rejected: u64,
    /// Currently attached clients
    pub active_clients: u64,
    /// Bytes sent by the currently attached clients
    pub total_bytes_sent: u64,
    pub sessions_created: u64,
    pub sessions_released: u64,
    pub uptime: Duration,
    /// Per-client statistics
    pub clients: Vec<ConnectionStats>,
    /// Muxer counters of the live session, if any
    pub muxer: Option<MuxerStats>,
}

impl ServerStats {
    pub fn new() -> Self {
        Self::default()
    }
}
