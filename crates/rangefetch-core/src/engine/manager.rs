//! Download engine - the public facade
//!
//! Accepts requests, owns the worker pool and the progress tracker, and
//! implements pause, resume, cancel and shutdown. Downstream failures are
//! never returned from these calls; they show up as tracker status.

use crate::config;
use crate::engine::control::StopReason;
use crate::engine::progress::{spawn_reporter, ProgressView};
use crate::engine::shared::EngineShared;
use crate::engine::transport::{HttpTransport, Transport};
use crate::engine::worker_pool::DownloadWorkerPool;
use crate::error::EngineError;
use crate::queue::TryPutError;
use parking_lot::Mutex;
use rangefetch_types::{
    AggregateProgress, DownloadRequest, DownloadStatus, EngineConfig, Priority, SaturationPolicy,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

/// What `shutdown` did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownReport {
    /// Queued requests cancelled without being started
    pub drained: usize,
    /// True if in-flight downloads had to be aborted after the timeout
    pub forced: bool,
}

pub struct DownloadEngine {
    shared: Arc<EngineShared>,
    pool: Mutex<Option<DownloadWorkerPool>>,
    reporter: Mutex<Option<JoinHandle<()>>>,
    reporter_stop: CancellationToken,
    next_sequence: AtomicU64,
}

impl DownloadEngine {
    /// Create an engine that downloads over HTTP
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        let transport = Arc::new(HttpTransport::new(&config)?);
        Self::with_transport(config, transport)
    }

    /// Create an engine on top of the given transport
    pub fn with_transport(
        config: EngineConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, EngineError> {
        config::validate(&config)?;
        info!(
            "Download engine created: {} workers, {} concurrent downloads, {} chunks per file",
            config.thread_pool_size, config.max_concurrent_downloads, config.per_file_chunk_concurrency
        );
        Ok(Self {
            shared: Arc::new(EngineShared::new(config, transport)),
            pool: Mutex::new(None),
            reporter: Mutex::new(None),
            reporter_stop: CancellationToken::new(),
            next_sequence: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    /// Validate and enqueue a download, returning its id.
    ///
    /// What happens when the queue is full depends on the saturation policy.
    /// Only validation, capacity and shutdown errors are returned here.
    pub async fn add_download(
        &self,
        url: &str,
        destination: impl AsRef<Path>,
        priority: Priority,
    ) -> Result<Uuid, EngineError> {
        if self.shared.queue.is_closed() {
            return Err(EngineError::ShuttingDown);
        }
        let url = validate_url(url)?;
        let destination = self.resolve_destination(destination.as_ref())?;

        let request = DownloadRequest::new(
            url,
            destination.clone(),
            priority,
            self.next_sequence.fetch_add(1, Ordering::AcqRel),
            self.shared.config.max_retry_attempts,
        );
        let id = request.id;

        {
            let mut destinations = self.shared.destinations.lock();
            if let Some(owner) = destinations.get(&destination) {
                return Err(EngineError::Validation(format!(
                    "destination {:?} is already used by download {}",
                    destination, owner
                )));
            }
            destinations.insert(destination.clone(), id);
        }
        self.shared.requests.lock().insert(id, request.clone());
        self.shared.tracker.register(id);

        info!(
            "Added download {} ({:?}): {} -> {:?}",
            id, priority, request.url, destination
        );

        match self.shared.queue.try_put(request) {
            Ok(()) => Ok(id),
            Err(TryPutError::Closed(_)) => {
                self.shared.discard(id);
                Err(EngineError::ShuttingDown)
            }
            Err(TryPutError::Full(request)) => match self.shared.config.saturation_policy {
                SaturationPolicy::Block => {
                    info!("Queue full, waiting for room for {}", id);
                    if let Err(e) = self.shared.queue.put(request).await {
                        self.shared.discard(id);
                        return Err(e);
                    }
                    Ok(id)
                }
                SaturationPolicy::Reject => {
                    warn!("Queue full, rejecting {}", id);
                    self.shared.discard(id);
                    Err(EngineError::Capacity(self.shared.queue.capacity()))
                }
                SaturationPolicy::CallerRuns => {
                    info!("Queue full, running {} on the caller", id);
                    self.shared.run_request(request).await;
                    Ok(id)
                }
            },
        }
    }

    fn resolve_destination(&self, destination: &Path) -> Result<PathBuf, EngineError> {
        if destination.as_os_str().is_empty() {
            return Err(EngineError::Validation("destination is empty".into()));
        }
        let resolved = if destination.is_relative() {
            self.shared.config.download_directory.join(destination)
        } else {
            destination.to_path_buf()
        };
        let has_name = resolved
            .file_name()
            .is_some_and(|name| !name.to_string_lossy().trim().is_empty());
        if !has_name {
            return Err(EngineError::Validation(format!(
                "destination {:?} does not name a file",
                destination
            )));
        }
        if resolved.is_dir() {
            return Err(EngineError::Validation(format!(
                "destination {:?} is a directory",
                resolved
            )));
        }
        Ok(resolved)
    }

    /// Start the workers if they are not running yet.
    ///
    /// The returned handle resolves, with the final aggregate, once the queue
    /// is empty and no request is pending or downloading. Paused requests
    /// count as settled.
    pub fn start_downloads(&self) -> JoinHandle<AggregateProgress> {
        if !self.shared.queue.is_closed() {
            let mut pool = self.pool.lock();
            if pool.is_none() {
                *pool = Some(DownloadWorkerPool::spawn(
                    self.shared.clone(),
                    self.shared.config.thread_pool_size,
                ));
            }
        }

        if self.shared.config.progress_reporting {
            let mut reporter = self.reporter.lock();
            if reporter.is_none() && !self.reporter_stop.is_cancelled() {
                *reporter = Some(spawn_reporter(
                    self.shared.tracker.clone(),
                    self.shared.config.progress_interval(),
                    self.reporter_stop.clone(),
                ));
            }
        }

        let shared = self.shared.clone();
        tokio::spawn(async move {
            shared.wait_settled().await;
            shared.tracker.aggregate()
        })
    }

    /// Pause a downloading request, keeping its part files
    pub fn pause(&self, id: Uuid) -> Result<(), EngineError> {
        match self.shared.tracker.status(id) {
            None => return Err(EngineError::NotFound(id)),
            Some(DownloadStatus::Paused) => return Ok(()),
            Some(DownloadStatus::Downloading) => {}
            Some(status) => {
                return Err(EngineError::InvalidOperation(format!(
                    "cannot pause download {} while {:?}",
                    id, status
                )))
            }
        }

        if !self.shared.tracker.transition(
            id,
            DownloadStatus::Downloading,
            DownloadStatus::Paused,
        ) {
            return Err(EngineError::InvalidOperation(format!(
                "download {} stopped downloading before it could be paused",
                id
            )));
        }
        if let Some(control) = self.shared.controls.lock().get(&id) {
            control.stop(StopReason::Paused);
        }
        info!("Paused download {}", id);
        self.shared.settled.notify_waiters();
        Ok(())
    }

    /// Re-queue a paused request at its original priority.
    ///
    /// Waits for the paused run to release its files first. Chunks already
    /// complete on disk are not downloaded again.
    pub async fn resume(&self, id: Uuid) -> Result<(), EngineError> {
        match self.shared.tracker.status(id) {
            None => return Err(EngineError::NotFound(id)),
            Some(DownloadStatus::Paused) => {}
            Some(status) => {
                return Err(EngineError::InvalidOperation(format!(
                    "cannot resume download {} while {:?}",
                    id, status
                )))
            }
        }
        if self.shared.queue.is_closed() {
            return Err(EngineError::ShuttingDown);
        }

        let control = self.shared.controls.lock().get(&id).cloned();
        if let Some(control) = control {
            control.finished().await;
        }

        let request = self
            .shared
            .requests
            .lock()
            .get(&id)
            .cloned()
            .ok_or(EngineError::NotFound(id))?;

        if !self
            .shared
            .tracker
            .transition(id, DownloadStatus::Paused, DownloadStatus::Pending)
        {
            return Err(EngineError::InvalidOperation(format!(
                "download {} is no longer paused",
                id
            )));
        }

        if let Err(e) = self.shared.queue.put(request).await {
            self.shared.tracker.set_status(id, DownloadStatus::Cancelled, None);
            self.shared.release(id);
            return Err(e);
        }
        info!("Resumed download {}", id);
        Ok(())
    }

    /// Cancel a request that has not settled.
    ///
    /// A queued request is removed without any I/O. A running one is told to
    /// stop and settles as cancelled once its run has unwound, keeping the part
    /// files it wrote; a run that already published its file stays completed.
    pub fn cancel(&self, id: Uuid) -> Result<(), EngineError> {
        loop {
            let status = self
                .shared
                .tracker
                .status(id)
                .ok_or(EngineError::NotFound(id))?;
            if status.is_terminal() {
                return Err(EngineError::InvalidOperation(format!(
                    "download {} already {:?}",
                    id, status
                )));
            }

            if self.shared.queue.remove(id).is_some() {
                self.shared
                    .tracker
                    .set_status(id, DownloadStatus::Cancelled, None);
                info!("Cancelled queued download {}", id);
                self.shared.release(id);
                break;
            }

            let control = self.shared.controls.lock().get(&id).cloned();
            if status == DownloadStatus::Downloading {
                if let Some(control) = control {
                    info!("Cancelling running download {}", id);
                    control.stop(StopReason::Cancelled);
                    break;
                }
            }

            // Not running: pending outside the queue, or paused
            if self
                .shared
                .tracker
                .transition(id, status, DownloadStatus::Cancelled)
            {
                if let Some(control) = control {
                    control.stop(StopReason::Cancelled);
                }
                info!("Cancelled {:?} download {}", status, id);
                self.shared.release(id);
                break;
            }
        }
        self.shared.settled.notify_waiters();
        Ok(())
    }

    /// Read-only view of the progress tracker
    pub fn get_progress_tracker(&self) -> ProgressView {
        ProgressView::new(self.shared.tracker.clone())
    }

    /// Drop terminal requests from the tracker, returning how many went
    pub fn clear_finished(&self) -> usize {
        self.shared.tracker.remove_finished()
    }

    /// Stop accepting work and wind down.
    ///
    /// Queued requests are cancelled. Running requests get `timeout` to
    /// finish; after that they are aborted, fail, and keep their part files.
    pub async fn shutdown(&self, timeout: Duration) -> ShutdownReport {
        info!("Shutting down download engine (timeout {:?})", timeout);
        self.shared.queue.close();

        let drained = self.shared.queue.drain_all();
        for request in &drained {
            self.shared
                .tracker
                .set_status(request.id, DownloadStatus::Cancelled, None);
            self.shared.release(request.id);
        }
        if !drained.is_empty() {
            info!("Cancelled {} queued downloads", drained.len());
        }
        self.shared.admission.close();

        let pool = self.pool.lock().take();
        let mut forced = false;
        if let Some(mut pool) = pool {
            if !pool.join(timeout).await {
                forced = true;
                let controls: Vec<_> = self.shared.controls.lock().values().cloned().collect();
                warn!(
                    "Shutdown timed out, aborting {} running downloads",
                    controls.len()
                );
                for control in controls {
                    control.stop(StopReason::Aborted);
                }
                pool.join_all().await;
            }
        }

        self.reporter_stop.cancel();
        let reporter = self.reporter.lock().take();
        if let Some(reporter) = reporter {
            let _ = reporter.await;
        }

        self.shared.settled.notify_waiters();
        info!(
            "Download engine stopped ({} drained, forced: {})",
            drained.len(),
            forced
        );
        ShutdownReport {
            drained: drained.len(),
            forced,
        }
    }
}

fn validate_url(url: &str) -> Result<String, EngineError> {
    let parsed = url::Url::parse(url.trim())?;
    match parsed.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(EngineError::Validation(format!(
                "unsupported URL scheme: {}",
                scheme
            )))
        }
    }
    if parsed.host_str().is_none() {
        return Err(EngineError::Validation(format!("URL has no host: {}", url)));
    }
    Ok(parsed.to_string())
}
