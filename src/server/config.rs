//! Server configuration

use std::net::SocketAddr;
use std::time::Duration;

use crate::mux::MuxerConfig;

/// Default TCP port of the transport stream server
pub const DEFAULT_PORT: u16 = 9000;

/// Transport stream server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: SocketAddr,

    /// Name reported in logs
    pub server_name: String,

    /// Maximum simultaneously attached clients
    pub max_clients: usize,

    /// Outbound chunks buffered per client before it counts as stalled
    pub send_queue_capacity: usize,

    /// Upper bound for one socket write
    pub send_timeout: Duration,

    /// How long `stop` waits for the server's tasks
    pub join_timeout: Duration,

    /// Enable TCP_NODELAY (disable Nagle's algorithm)
    pub tcp_nodelay: bool,

    /// Stats snapshot interval (None = no stats task)
    pub stats_interval: Option<Duration>,

    /// Muxer settings used for every session
    pub muxer: MuxerConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            server_name: String::from("tscast"),
            max_clients: 4,
            send_queue_capacity: 64,
            send_timeout: Duration::from_secs(1),
            join_timeout: Duration::from_millis(200),
            tcp_nodelay: true, // Important for low latency
            stats_interval: Some(Duration::from_secs(5)),
            muxer: MuxerConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Create a new config with custom bind address
    pub fn with_addr(addr: SocketAddr) -> Self {
        Self {
            bind_addr: addr,
            ..Default::default()
        }
    }

    /// Set the bind address
    pub fn bind(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Set the port, keeping the bind IP
    pub fn port(mut self, port: u16) -> Self {
        self.bind_addr.set_port(port);
        self
    }

    pub fn server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = name.into();
        self
    }

    /// Set maximum attached clients (at least 1)
    pub fn max_clients(mut self, max: usize) -> Self {
        self.max_clients = max.max(1);
        self
    }

    /// Set the per-client outbound queue length (at least 1)
    pub fn send_queue_capacity(mut self, capacity: usize) -> Self {
        self.send_queue_capacity = capacity.max(1);
        self
    }

    pub fn send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    pub fn join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout = timeout;
        self
    }

    pub fn tcp_nodelay(mut self, enabled: bool) -> Self {
        self.tcp_nodelay = enabled;
        self
    }

    /// Set the stats interval
    pub fn stats_interval(mut self, interval: Duration) -> Self {
        self.stats_interval = Some(interval);
        self
    }

    /// Disable the periodic stats task
    pub fn disable_stats(mut self) -> Self {
        self.stats_interval = None;
        self
    }

    pub fn muxer(mut self, muxer: MuxerConfig) -> Self {
        self.muxer = muxer;
        self
    }
}
