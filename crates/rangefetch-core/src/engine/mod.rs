//! Download engine
//!
//! - Chunk planning and ranged transfers with per-chunk resume
//! - Bounded per-file chunk parallelism
//! - Single-stream fallback for servers that do not honour ranges
//! - Atomic assembly into the destination
//! - Clean pause/resume/cancel and graceful shutdown

pub mod assembler;
mod chunk_downloader;
mod control;
mod download_task;
mod manager;
pub mod planner;
mod progress;
mod retry;
mod shared;
pub mod transport;
mod worker_pool;

pub use chunk_downloader::{ChunkDownloader, ChunkResult};
pub use control::{StopReason, TransferControl};
pub use download_task::{DownloadTask, TaskOutcome};
pub use manager::{DownloadEngine, ShutdownReport};
pub use progress::{spawn_reporter, ProgressTracker, ProgressView};
pub use retry::RetryPolicy;
pub use transport::{HttpTransport, Transport};
pub use worker_pool::DownloadWorkerPool;
