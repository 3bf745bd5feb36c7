//! Rendered still image

use std::time::Instant;

use bytes::Bytes;

/// One compressed raster published by the render loop
#[derive(Debug, Clone)]
pub struct StillImageFrame {
    /// Compressed image bytes
    pub data: Bytes,
    /// Increments with every published frame of one render loop, starting at 1
    pub sequence: u64,
    pub produced_at: Instant,
}

impl StillImageFrame {
    pub fn new(data: Bytes, sequence: u64) -> Self {
        Self {
            data,
            sequence,
            produced_at: Instant::now(),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
