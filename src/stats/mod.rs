//! Statistics and metrics

pub mod metrics;

pub use metrics::{ConnectionCounters, ConnectionStats, MuxerStats, ServerCounters, ServerStats};
