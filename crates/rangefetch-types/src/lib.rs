//! Shared types for Rangefetch
//!
//! This crate contains the plain data structures exchanged between the
//! download engine and whatever application embeds it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

// ============================================================================
// Request Types
// ============================================================================

/// Scheduling priority of a download request.
///
/// Ordered so that `High > Normal > Low`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

/// A download submitted to the engine.
///
/// Built once by the engine when the request is accepted; the queue owns it
/// until a worker dequeues it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadRequest {
    pub id: Uuid,
    pub url: String,
    pub destination: PathBuf,
    pub priority: Priority,
    /// Submission order, used to break ties within a priority
    pub sequence: u64,
    /// Transfer attempts allowed per chunk
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
}

impl DownloadRequest {
    pub fn new(
        url: String,
        destination: PathBuf,
        priority: Priority,
        sequence: u64,
        max_attempts: u32,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            url,
            destination,
            priority,
            sequence,
            max_attempts: max_attempts.max(1),
            created_at: Utc::now(),
        }
    }
}

/// A contiguous byte range of a resource, downloaded into its own part file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChunk {
    pub index: u32,
    pub url: String,
    /// Local file the chunk's bytes are written to
    pub part_path: PathBuf,
    /// First byte of the range (inclusive)
    pub start: u64,
    /// End of the range (exclusive); `None` when the resource size is unknown
    pub end: Option<u64>,
}

impl FileChunk {
    pub fn new(index: u32, url: String, part_path: PathBuf, start: u64, end: Option<u64>) -> Self {
        Self {
            index,
            url,
            part_path,
            start,
            end,
        }
    }

    /// Number of bytes in the range, if the end is known
    pub fn len(&self) -> Option<u64> {
        self.end.map(|end| end.saturating_sub(self.start))
    }

    /// Whether the range is empty (only possible for a zero-byte resource)
    pub fn is_empty(&self) -> bool {
        self.len() == Some(0)
    }

    /// Whether this chunk runs to the end of a resource of unknown size
    pub fn is_open_ended(&self) -> bool {
        self.end.is_none()
    }
}

// ============================================================================
// Progress Types
// ============================================================================

/// Status of a download
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    Pending,
    Downloading,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl DownloadStatus {
    /// Terminal statuses never transition again
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            DownloadStatus::Completed | DownloadStatus::Failed | DownloadStatus::Cancelled
        )
    }

    /// Pending or downloading: work is still owed on this request
    pub fn is_unsettled(self) -> bool {
        matches!(self, DownloadStatus::Pending | DownloadStatus::Downloading)
    }
}

/// Point-in-time view of one download's progress
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadProgress {
    pub id: Uuid,
    /// Total size in bytes, unknown until the resource has been probed
    pub total_bytes: Option<u64>,
    pub downloaded_bytes: u64,
    /// Bytes per second over the last reporting window
    pub speed: u64,
    pub status: DownloadStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl DownloadProgress {
    pub fn percent(&self) -> Option<f64> {
        match self.total_bytes {
            Some(0) => Some(100.0),
            Some(total) => Some((self.downloaded_bytes as f64 / total as f64) * 100.0),
            None => None,
        }
    }

    /// Estimated seconds remaining at the current speed
    pub fn eta_secs(&self) -> Option<u64> {
        let total = self.total_bytes?;
        if self.speed == 0 {
            return None;
        }
        Some(total.saturating_sub(self.downloaded_bytes) / self.speed)
    }
}

/// Metrics derived across every download known to the tracker
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateProgress {
    pub pending_count: usize,
    pub active_count: usize,
    pub paused_count: usize,
    pub completed_count: usize,
    pub failed_count: usize,
    pub cancelled_count: usize,
    /// Downloaded over total bytes, counting only downloads with a known size
    pub overall_percent: f64,
    /// Sum of the windowed speeds of active downloads
    pub overall_speed: u64,
}

// ============================================================================
// Event Types
// ============================================================================

/// Events published by the engine's progress tracker
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ProgressEvent {
    Added {
        id: Uuid,
    },
    StatusChanged {
        id: Uuid,
        status: DownloadStatus,
        error: Option<String>,
    },
    Progress {
        id: Uuid,
        downloaded: u64,
        total: Option<u64>,
        speed: u64,
    },
    ChunkCompleted {
        id: Uuid,
        index: u32,
    },
}

// ============================================================================
// Configuration Types
// ============================================================================

/// What `add_download` does when the pending queue is full
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SaturationPolicy {
    /// Wait for a slot to free up
    #[default]
    Block,
    /// Run the download on the submitting task
    CallerRuns,
    /// Fail immediately with a capacity error
    Reject,
}

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of worker loops pulling from the queue
    pub thread_pool_size: usize,
    /// How many requests may be downloading at once
    pub max_concurrent_downloads: usize,
    /// How many chunks of one file may transfer at once
    pub per_file_chunk_concurrency: usize,
    pub connection_timeout_secs: u64,
    /// Longest wait for the next body read of a chunk transfer
    pub read_timeout_secs: u64,
    /// Deadline for a whole request, if set
    pub request_timeout_secs: Option<u64>,
    pub chunk_size: u64,
    pub download_directory: PathBuf,
    pub resume_supported: bool,
    pub progress_reporting: bool,
    pub progress_interval_ms: u64,
    /// Total transfer attempts per chunk, including the first
    pub max_retry_attempts: u32,
    pub retry_backoff_base_ms: u64,
    pub retry_backoff_max_ms: u64,
    pub queue_capacity: usize,
    pub saturation_policy: SaturationPolicy,
    pub user_agent: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            thread_pool_size: 4,
            max_concurrent_downloads: 4,
            per_file_chunk_concurrency: 4,
            connection_timeout_secs: 30,
            read_timeout_secs: 60,
            request_timeout_secs: None,
            chunk_size: 4 * 1024 * 1024,
            download_directory: dirs::download_dir()
                .map(|p| p.join("Rangefetch"))
                .unwrap_or_else(|| PathBuf::from(".")),
            resume_supported: true,
            progress_reporting: true,
            progress_interval_ms: 1000,
            max_retry_attempts: 3,
            retry_backoff_base_ms: 500,
            retry_backoff_max_ms: 30_000,
            queue_capacity: 256,
            saturation_policy: SaturationPolicy::Block,
            user_agent: "Rangefetch/0.1".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs.map(Duration::from_secs)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn retry_backoff_base(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_base_ms)
    }

    pub fn retry_backoff_max(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_max_ms)
    }

    /// Directory holding the per-request part files
    pub fn work_root(&self) -> PathBuf {
        self.download_directory.join(".rangefetch")
    }
}
