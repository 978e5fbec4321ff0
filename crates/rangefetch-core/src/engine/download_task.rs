//! Download task - drives one request from probe to finished file
//!
//! The task probes the resource, plans its chunks, downloads them in parallel
//! (bounded by the per-file chunk limit), falls back to a single stream if
//! the server turns out not to honour ranges, and assembles the result.

use crate::engine::assembler;
use crate::engine::chunk_downloader::ChunkDownloader;
use crate::engine::control::{StopReason, TransferControl};
use crate::engine::planner;
use crate::engine::progress::ProgressTracker;
use crate::engine::retry::RetryPolicy;
use crate::engine::transport::{ResourceInfo, Transport};
use crate::error::{EngineError, NetworkError};
use rangefetch_types::{DownloadRequest, DownloadStatus, EngineConfig, FileChunk};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Part file used when the whole resource is streamed in one request
const WHOLE_FILE_PART: &str = "whole.part";

/// How a task run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed(u64),
    Paused,
    Cancelled,
    Failed(String),
}

/// One run of one download request
pub struct DownloadTask {
    request: DownloadRequest,
    config: Arc<EngineConfig>,
    transport: Arc<dyn Transport>,
    tracker: Arc<ProgressTracker>,
    control: Arc<TransferControl>,
    deadline: Option<Duration>,
}

impl DownloadTask {
    pub fn new(
        request: DownloadRequest,
        config: Arc<EngineConfig>,
        transport: Arc<dyn Transport>,
        tracker: Arc<ProgressTracker>,
        control: Arc<TransferControl>,
    ) -> Self {
        let deadline = config.request_timeout();
        Self {
            request,
            config,
            transport,
            tracker,
            control,
            deadline,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_deadline(mut self, limit: Duration) -> Self {
        self.deadline = Some(limit);
        self
    }

    /// Directory holding this request's part files
    pub fn work_dir(config: &EngineConfig, id: Uuid) -> PathBuf {
        config.work_root().join(id.to_string())
    }

    /// Run the request to a settled state and record it in the tracker.
    ///
    /// A request that is no longer pending (cancelled while queued) is not
    /// touched and no I/O happens.
    pub async fn run(self) -> TaskOutcome {
        let id = self.request.id;

        if !self
            .tracker
            .transition(id, DownloadStatus::Pending, DownloadStatus::Downloading)
        {
            debug!(
                "Download {} is {:?}, not starting",
                id,
                self.tracker.status(id)
            );
            return match self.tracker.status(id) {
                Some(DownloadStatus::Paused) => TaskOutcome::Paused,
                _ => TaskOutcome::Cancelled,
            };
        }

        info!("Starting download {} from {}", id, self.request.url);

        // Past the deadline the run is stopped, then awaited while it unwinds
        let execution = self.execute();
        tokio::pin!(execution);
        let result = match self.deadline {
            Some(limit) => {
                tokio::select! {
                    result = &mut execution => result,
                    _ = tokio::time::sleep(limit) => {
                        warn!("Download {} exceeded its {:?} limit, stopping", id, limit);
                        self.control.stop(StopReason::TimedOut);
                        execution.await
                    }
                }
            }
            None => execution.await,
        };

        self.settle(result)
    }

    fn settle(&self, result: Result<u64, EngineError>) -> TaskOutcome {
        let id = self.request.id;
        match result {
            Ok(size) => {
                let known_total = self.tracker.snapshot(id).and_then(|p| p.total_bytes);
                if known_total.is_none() {
                    self.tracker.set_total(id, size);
                }
                self.tracker.raise_to(id, size);
                // A pause that raced the rename still ends completed
                let completed = self
                    .tracker
                    .transition(id, DownloadStatus::Downloading, DownloadStatus::Completed)
                    || self
                        .tracker
                        .transition(id, DownloadStatus::Paused, DownloadStatus::Completed);
                if !completed {
                    warn!(
                        "Download {} published its file while {:?}",
                        id,
                        self.tracker.status(id)
                    );
                }
                info!(
                    "Download completed: {} -> {:?} ({} bytes)",
                    id, self.request.destination, size
                );
                TaskOutcome::Completed(size)
            }
            Err(EngineError::Paused) => {
                info!("Download paused: {}", id);
                // Usually already Paused by the engine; covers a stop that raced it
                self.tracker
                    .transition(id, DownloadStatus::Downloading, DownloadStatus::Paused);
                TaskOutcome::Paused
            }
            Err(EngineError::Cancelled) => {
                info!("Download cancelled: {}", id);
                self.tracker.set_status(id, DownloadStatus::Cancelled, None);
                TaskOutcome::Cancelled
            }
            Err(e) => {
                error!("Download failed: {} - {}", id, e);
                let message = e.to_string();
                self.tracker
                    .set_status(id, DownloadStatus::Failed, Some(message.clone()));
                TaskOutcome::Failed(message)
            }
        }
    }

    async fn execute(&self) -> Result<u64, EngineError> {
        let id = self.request.id;
        self.control.check()?;

        let retry = RetryPolicy::from_config(&self.config, self.request.max_attempts);
        let resource = self.probe(&retry).await?;
        if let Some(total) = resource.total_size {
            self.tracker.set_total(id, total);
        }
        info!(
            "Probed {}: size {:?}, ranges {}",
            self.request.url, resource.total_size, resource.accepts_ranges
        );
        self.control.check()?;

        let work_dir = Self::work_dir(&self.config, id);
        tokio::fs::create_dir_all(&work_dir).await?;

        let chunks = planner::plan(
            &self.request.url,
            &resource,
            self.config.chunk_size,
            &work_dir,
        )?;
        debug!("Planned {} chunks for {}", chunks.len(), id);

        let downloader = ChunkDownloader::new(
            self.transport.clone(),
            retry,
            self.config.read_timeout(),
            self.config.resume_supported,
        );

        let chunks = match self.download_chunks(&downloader, chunks).await {
            Ok(chunks) => chunks,
            Err(EngineError::RangeMismatch(reason)) => {
                warn!(
                    "Ranged download of {} failed ({}), falling back to a single stream",
                    id, reason
                );
                self.download_whole(&downloader, &work_dir, resource.total_size)
                    .await?
            }
            Err(e) => return Err(e),
        };

        self.control.check()?;
        let size =
            assembler::assemble(id, &chunks, &self.request.destination, &self.control).await?;

        if let Err(e) = tokio::fs::remove_dir_all(&work_dir).await {
            warn!("Failed to remove work directory {:?}: {}", work_dir, e);
        }
        Ok(size)
    }

    async fn probe(&self, retry: &RetryPolicy) -> Result<ResourceInfo, EngineError> {
        let timeout = self.config.read_timeout();
        let mut attempt = 0;

        loop {
            attempt += 1;
            let result = tokio::select! {
                biased;
                _ = self.control.stopped() => return Err(self.control.stop_error()),
                probed = tokio::time::timeout(timeout, self.transport.probe(&self.request.url)) => {
                    probed.unwrap_or_else(|_| Err(NetworkError::Timeout.into()))
                }
            };

            match result {
                Ok(info) => return Ok(info),
                Err(e) if e.is_retryable() && retry.has_attempts_left(attempt) => {
                    let delay = retry.delay_after(attempt);
                    warn!(
                        "Probe of {} failed (attempt {}/{}): {}. Retrying in {:?}",
                        self.request.url, attempt, retry.max_attempts, e, delay
                    );
                    self.control.sleep(delay).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Download every planned chunk, at most `per_file_chunk_concurrency` at a time.
    ///
    /// After the first chunk failure no further chunks start; chunks already
    /// running are allowed to finish so their part files stay usable.
    async fn download_chunks(
        &self,
        downloader: &ChunkDownloader,
        chunks: Vec<FileChunk>,
    ) -> Result<Vec<FileChunk>, EngineError> {
        let id = self.request.id;

        let mut baseline = 0;
        for chunk in &chunks {
            baseline += downloader.resumable_bytes(chunk).await;
        }
        if baseline > 0 {
            info!("Resuming {} with {} bytes already on disk", id, baseline);
        }
        let run_bytes = Arc::new(AtomicU64::new(baseline));
        self.tracker.raise_to(id, baseline);

        let limiter = Arc::new(Semaphore::new(self.config.per_file_chunk_concurrency));
        let halted = Arc::new(AtomicBool::new(false));
        let mut join_set = JoinSet::new();

        for chunk in chunks.iter().cloned() {
            let downloader = downloader.clone();
            let control = self.control.clone();
            let tracker = self.tracker.clone();
            let run_bytes = run_bytes.clone();
            let limiter = limiter.clone();
            let halted = halted.clone();

            join_set.spawn(async move {
                let index = chunk.index;
                let _permit = match limiter.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return (index, Ok(None)),
                };
                if halted.load(Ordering::Acquire) {
                    return (index, Ok(None));
                }
                if let Err(e) = control.check() {
                    return (index, Err(e));
                }

                let progress = tracker.clone();
                let on_bytes = move |n: u64| {
                    let now = run_bytes.fetch_add(n, Ordering::AcqRel) + n;
                    progress.raise_to(id, now);
                };
                let result = downloader.download(&chunk, &control, &on_bytes).await;
                if result.is_ok() {
                    tracker.chunk_completed(id, index);
                }
                (index, result.map(Some))
            });
        }

        let mut failure: Option<EngineError> = None;
        let mut discovered = None;

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((_, Ok(Some(result)))) => {
                    if result.discovered_size.is_some() {
                        discovered = result.discovered_size;
                    }
                }
                Ok((_, Ok(None))) => {}
                Ok((index, Err(e))) => {
                    halted.store(true, Ordering::Release);
                    if !e.is_interruption() {
                        error!("Chunk {} of {} failed: {}", index, id, e);
                    }
                    failure = Some(match failure.take() {
                        Some(previous) => more_relevant(previous, e),
                        None => e,
                    });
                }
                Err(join_error) => {
                    halted.store(true, Ordering::Release);
                    error!("Chunk task of {} panicked: {}", id, join_error);
                    failure.get_or_insert(EngineError::Internal(join_error.to_string()));
                }
            }
        }

        if self.control.is_stopped() {
            return Err(self.control.stop_error());
        }
        if let Some(e) = failure {
            return Err(e);
        }
        if let Some(size) = discovered {
            self.tracker.set_total(id, size);
        }
        Ok(chunks)
    }

    /// Stream the whole resource in one request without a Range header
    async fn download_whole(
        &self,
        downloader: &ChunkDownloader,
        work_dir: &Path,
        expected: Option<u64>,
    ) -> Result<Vec<FileChunk>, EngineError> {
        let id = self.request.id;
        let chunk = FileChunk::new(
            0,
            self.request.url.clone(),
            work_dir.join(WHOLE_FILE_PART),
            0,
            None,
        );

        match tokio::fs::remove_file(&chunk.part_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let run_bytes = AtomicU64::new(0);
        let tracker = &self.tracker;
        let on_bytes = |n: u64| {
            let now = run_bytes.fetch_add(n, Ordering::AcqRel) + n;
            tracker.raise_to(id, now);
        };

        let result = downloader.download(&chunk, &self.control, &on_bytes).await?;

        match expected {
            Some(expected) if result.bytes_on_disk != expected => {
                return Err(EngineError::RangeMismatch(format!(
                    "single stream delivered {} bytes, expected {}",
                    result.bytes_on_disk, expected
                )));
            }
            Some(_) => {}
            None => {
                self.tracker.set_total(id, result.bytes_on_disk);
            }
        }
        Ok(vec![chunk])
    }
}

/// Pick the error that best describes a multi-chunk failure.
///
/// Stop signals outrank everything, and a range mismatch outranks ordinary
/// failures because it triggers the single-stream fallback.
fn more_relevant(current: EngineError, candidate: EngineError) -> EngineError {
    fn rank(e: &EngineError) -> u8 {
        match e {
            e if e.is_interruption() => 2,
            EngineError::RangeMismatch(_) => 1,
            _ => 0,
        }
    }
    if rank(&candidate) > rank(&current) {
        candidate
    } else {
        current
    }
}
