//! State shared between the engine facade and its workers

use crate::engine::control::TransferControl;
use crate::engine::download_task::{DownloadTask, TaskOutcome};
use crate::engine::progress::ProgressTracker;
use crate::engine::transport::Transport;
use crate::queue::PriorityDownloadQueue;
use parking_lot::Mutex;
use rangefetch_types::{DownloadRequest, EngineConfig};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Notify, Semaphore};
use tracing::debug;
use uuid::Uuid;

pub(crate) struct EngineShared {
    pub config: Arc<EngineConfig>,
    pub transport: Arc<dyn Transport>,
    pub tracker: Arc<ProgressTracker>,
    pub queue: PriorityDownloadQueue,
    /// Caps how many requests are downloading at once
    pub admission: Semaphore,
    /// Control handles of runs in progress
    pub controls: Mutex<HashMap<Uuid, Arc<TransferControl>>>,
    /// Requests that have not reached a terminal state, kept for resume
    pub requests: Mutex<HashMap<Uuid, DownloadRequest>>,
    /// Destination paths reserved by non-terminal requests
    pub destinations: Mutex<HashMap<PathBuf, Uuid>>,
    /// Signalled whenever a request may have settled
    pub settled: Notify,
}

impl EngineShared {
    pub fn new(config: EngineConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            queue: PriorityDownloadQueue::new(config.queue_capacity),
            admission: Semaphore::new(config.max_concurrent_downloads),
            config: Arc::new(config),
            transport,
            tracker: Arc::new(ProgressTracker::new()),
            controls: Mutex::new(HashMap::new()),
            requests: Mutex::new(HashMap::new()),
            destinations: Mutex::new(HashMap::new()),
            settled: Notify::new(),
        }
    }

    /// Run one request on the current task, then clean up after it
    pub async fn run_request(&self, request: DownloadRequest) -> TaskOutcome {
        let id = request.id;
        let control = Arc::new(TransferControl::new());
        self.controls.lock().insert(id, control.clone());

        let outcome = DownloadTask::new(
            request,
            self.config.clone(),
            self.transport.clone(),
            self.tracker.clone(),
            control.clone(),
        )
        .run()
        .await;

        {
            let mut controls = self.controls.lock();
            if controls
                .get(&id)
                .is_some_and(|current| Arc::ptr_eq(current, &control))
            {
                controls.remove(&id);
            }
        }
        control.finish();

        if self.tracker.status(id).is_some_and(|s| s.is_terminal()) {
            self.release(id);
        }
        debug!("Run of {} ended: {:?}", id, outcome);
        self.settled.notify_waiters();
        outcome
    }

    /// Forget a request that will not run again
    pub fn release(&self, id: Uuid) {
        self.requests.lock().remove(&id);
        self.destinations.lock().retain(|_, owner| *owner != id);
    }

    /// Forget a request entirely, including its progress entry
    pub fn discard(&self, id: Uuid) {
        self.release(id);
        self.tracker.remove(id);
    }

    /// True when nothing is queued and no request is pending or downloading
    pub fn is_settled(&self) -> bool {
        self.queue.is_empty() && self.tracker.unsettled_count() == 0
    }

    pub async fn wait_settled(&self) {
        loop {
            let notified = self.settled.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_settled() {
                return;
            }
            notified.await;
        }
    }
}
