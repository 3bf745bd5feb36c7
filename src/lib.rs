//! # tscast
//!
//! Live MPEG transport stream fan-out over plain TCP, plus a multipart
//! (`multipart/x-mixed-replace`) still-image server.
//!
//! Encoders supplied by the embedding application produce compressed H.264/H.265
//! and AAC frames. The muxer packetizes them into 188-byte transport units and the
//! registry fans each batch out to every attached TCP client. The streaming session,
//! and with it the encoders, exists only while at least one client is attached.
//!
//! # Example
//!
//! ```no_run
//! use tscast::{DefaultHandler, ServerConfig, TsServer};
//!
//! #[tokio::main]
//! async fn main() -> tscast::Result<()> {
//!     let server = TsServer::new(ServerConfig::default().max_clients(4), DefaultHandler);
//!     let addr = server.start().await?;
//!     println!("Streaming on tcp://{}", addr);
//!
//!     tokio::signal::ctrl_c().await?;
//!     server.stop().await;
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod media;
pub mod mux;
pub mod registry;
pub mod server;
pub mod session;
pub mod stats;
pub mod still;

pub use error::{Error, Result};
pub use server::{DefaultHandler, ServerConfig, ServerEvent, ServerHandler, TsServer};
pub use session::{EncoderOutput, MediaEncoder, Session};
pub use still::{StillImageConfig, StillImageServer};
