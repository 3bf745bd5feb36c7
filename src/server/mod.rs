//! Transport stream server
//!
//! ```text
//!   encoder threads ──► TsMuxer ──► ClientRegistry::broadcast
//!                                        │ try_send
//!   accept loop ──► watch task ──► ClientConnection outbox ──► writer task ──► TCP
//!                      │ attach/detach
//!                      ▼
//!               SessionController (lazy Session)
//! ```

pub mod config;
pub mod connection;
pub mod event;
pub mod handler;
pub mod listener;

pub use config::ServerConfig;
pub use connection::ClientConnection;
pub use event::{CloseReason, RejectReason, ServerEvent};
pub use handler::{ClientInfo, DefaultHandler, ServerHandler};
pub use listener::TsServer;
