//! Elementary stream handling
//!
//! This module provides:
//! - Encoded frame and stream format types shared by encoders and the muxer
//! - H.264 Annex-B parsing and parameter set conversion
//! - AAC config parsing and ADTS framing

pub mod aac;
pub mod format;
pub mod frame;
pub mod h264;

pub use aac::{AacProfile, AudioSpecificConfig};
pub use format::{AudioFormat, StreamFormat, VideoCodec, VideoFormat};
pub use frame::{EncodedFrame, FrameFlags, StreamKind};
pub use h264::{AvcConfig, NaluType};
