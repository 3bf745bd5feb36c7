//! MPEG-2 transport stream muxing
//!
//! - [`ts`]: packet segmenter, PSI tables and CRC
//! - [`muxer`]: per-session muxer with configuration re-injection

pub mod muxer;
pub mod ts;

pub use muxer::{MuxerConfig, MuxerSink, MuxerState, TsMuxer};
pub use ts::{Segmenter, TsBatch, MAX_UNITS_PER_WRITE, SYNC_BYTE, TS_PACKET_SIZE};
