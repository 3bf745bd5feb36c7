//! Still-image server configuration

use std::net::SocketAddr;
use std::time::Duration;

/// Still-image server configuration
///
/// `path` and `boundary` default to fresh random tokens, so the stream URL is not
/// guessable unless the application sets a path explicitly.
#[derive(Debug, Clone)]
pub struct StillImageConfig {
    /// Address to bind to (port 0 picks an ephemeral port)
    pub bind_addr: SocketAddr,

    /// Last path segment clients must request
    pub path: String,

    /// Multipart boundary
    pub boundary: String,

    /// Content type of every part
    pub content_type: String,

    /// Value of the `Server` response header
    pub server_name: String,

    /// Raster size requested from the renderer
    pub width: u32,
    pub height: u32,

    /// Compression quality hint for the renderer, 1..=100
    pub quality: u8,

    /// Frames rendered per second
    pub frame_rate: u32,

    /// Maximum simultaneously streaming clients
    pub max_clients: usize,

    /// Time allowed for the request head to arrive
    pub request_timeout: Duration,

    /// Upper bound for one socket write
    pub send_timeout: Duration,

    /// How long stopping waits for the render thread and server tasks
    pub join_timeout: Duration,

    /// Enable TCP_NODELAY
    pub tcp_nodelay: bool,
}

impl Default for StillImageConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            path: random_token(),
            boundary: random_token(),
            content_type: String::from("image/jpeg"),
            server_name: String::from("tscast"),
            width: 640,
            height: 480,
            quality: 80,
            frame_rate: 10,
            max_clients: 8,
            request_timeout: Duration::from_secs(5),
            send_timeout: Duration::from_secs(2),
            join_timeout: Duration::from_millis(200),
            tcp_nodelay: true,
        }
    }
}

impl StillImageConfig {
    /// Create a new config with custom bind address
    pub fn with_addr(addr: SocketAddr) -> Self {
        Self {
            bind_addr: addr,
            ..Default::default()
        }
    }

    pub fn bind(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Set the port, keeping the bind IP
    pub fn port(mut self, port: u16) -> Self {
        self.bind_addr.set_port(port);
        self
    }

    /// Set the request path; leading and trailing slashes are ignored
    pub fn path(mut self, path: impl Into<String>) -> Self {
        let path = path.into();
        let trimmed = path.trim_matches('/');
        if !trimmed.is_empty() {
            self.path = trimmed.to_string();
        }
        self
    }

    /// Set the multipart boundary; an empty boundary is ignored
    pub fn boundary(mut self, boundary: impl Into<String>) -> Self {
        let boundary = boundary.into();
        if !boundary.is_empty() {
            self.boundary = boundary;
        }
        self
    }

    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    pub fn server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = name.into();
        self
    }

    pub fn size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    /// Set the quality (clamped to 1..=100)
    pub fn quality(mut self, quality: u8) -> Self {
        self.quality = quality.clamp(1, 100);
        self
    }

    /// Set the frame rate (at least 1)
    pub fn frame_rate(mut self, fps: u32) -> Self {
        self.frame_rate = fps.max(1);
        self
    }

    /// Set maximum streaming clients (at least 1)
    pub fn max_clients(mut self, max: usize) -> Self {
        self.max_clients = max.max(1);
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
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

    /// Time between two render cycles
    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs(1) / self.frame_rate.max(1)
    }
}

fn random_token() -> String {
    uuid::Uuid::new_v4().to_string()
}
