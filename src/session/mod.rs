//! Streaming session management
//!
//! A [`Session`] ties the muxer to the collaborator's encoders. The
//! [`SessionController`] creates it lazily on the first attach and tears it down on
//! the last detach.

pub mod controller;
pub mod encoder;
pub mod state;

pub use controller::SessionController;
pub use encoder::{EncoderOutput, MediaEncoder, SharedMuxer};
pub use state::{Session, SessionPhase};
