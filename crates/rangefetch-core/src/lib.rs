//! Rangefetch Core - concurrent chunked download engine
//!
//! Splits remote files into byte ranges, downloads them in parallel with
//! per-chunk resume and retry, and assembles them into the destination.
//! Requests are scheduled from a bounded priority queue by a fixed pool of
//! workers, and progress is observable through a lock-light tracker.

pub mod config;
pub mod engine;
mod error;
pub mod logging;
mod queue;

#[cfg(test)]
mod test_support;

pub use engine::{DownloadEngine, ProgressView, ShutdownReport, Transport};
pub use error::*;
pub use queue::*;

pub use rangefetch_types::{
    AggregateProgress, DownloadProgress, DownloadRequest, DownloadStatus, EngineConfig, FileChunk,
    Priority, ProgressEvent, SaturationPolicy,
};
