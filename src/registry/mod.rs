//! Client registry and fan-out
//!
//! The registry tracks which clients are attached and fans transport chunks out to
//! all of them.
//!
//! # Architecture
//!
//! ```text
//!                        Arc<ClientRegistry>
//!                   ┌──────────────────────────┐
//!                   │ attached: {id, ..}       │──► FirstAttached / LastDetached
//!                   │ targets: [Weak<Sink>, ..]│      (session lifecycle)
//!                   └────────────┬─────────────┘
//!                                │ broadcast(chunk)
//!         ┌──────────────────────┼──────────────────────┐
//!         ▼                      ▼                      ▼
//!   [ClientConnection]    [ClientConnection]    [ClientConnection]
//!    outbox.try_send()     outbox.try_send()     outbox.try_send()
//!         │                      │                      │
//!      writer task ──► TCP    writer task ──► TCP    writer task ──► TCP
//! ```
//!
//! # Zero-Copy Design
//!
//! `bytes::Bytes` is reference counted, so every client shares the same
//! allocation; a broadcast clones only the handle.

pub mod sink;
pub mod store;

pub use sink::{ClientId, PacketSink, SendError};
pub use store::{BroadcastOutcome, ClientRegistry, Transition};
