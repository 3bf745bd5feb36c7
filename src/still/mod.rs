//! Multipart still-image streaming
//!
//! ```text
//!   render thread ──► watch mailbox ──► broadcast task ──► ClientRegistry
//!   (ImageRenderer)   (newest frame)    (multipart part)       │ send_replace
//!                                                              ▼
//!                                latest-wins outbox ──► response body ──► HTTP client
//!                                                       (axum / hyper)
//! ```
//!
//! The render loop runs only while at least one client streams.

mod controller;
mod listener;
pub mod config;
pub mod frame;
pub mod http;
pub mod renderer;
pub mod server;

pub use config::StillImageConfig;
pub use frame::StillImageFrame;
pub use renderer::{ImageRenderer, RendererFactory};
pub use server::{StillImageHandler, StillImageServer};
