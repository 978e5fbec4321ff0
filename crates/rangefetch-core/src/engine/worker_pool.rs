//! Worker pool - fixed set of tasks pulling requests off the queue
//!
//! A worker first takes an admission permit, then the next request, so no
//! more than `max_concurrent_downloads` requests are downloading at once
//! however many workers there are.

use crate::engine::shared::EngineShared;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, info};

pub struct DownloadWorkerPool {
    workers: JoinSet<()>,
    size: usize,
}

impl DownloadWorkerPool {
    pub(crate) fn spawn(shared: Arc<EngineShared>, size: usize) -> Self {
        let mut workers = JoinSet::new();
        for worker in 0..size {
            workers.spawn(worker_loop(worker, shared.clone()));
        }
        info!("Started {} download workers", size);
        Self { workers, size }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Wait for every worker to exit. Returns false if `timeout` elapsed first;
    /// the pool can be joined again afterwards.
    pub async fn join(&mut self, timeout: Duration) -> bool {
        let workers = &mut self.workers;
        tokio::time::timeout(timeout, async {
            while workers.join_next().await.is_some() {}
        })
        .await
        .is_ok()
    }

    /// Wait for every worker to exit, however long it takes
    pub async fn join_all(&mut self) {
        while self.workers.join_next().await.is_some() {}
    }
}

async fn worker_loop(worker: usize, shared: Arc<EngineShared>) {
    debug!("Worker {} started", worker);
    loop {
        let permit = match shared.admission.acquire().await {
            Ok(permit) => permit,
            Err(_) => break,
        };
        let Some(request) = shared.queue.take().await else {
            break;
        };

        info!(
            "Worker {} picked up {} ({:?}, sequence {})",
            worker, request.id, request.priority, request.sequence
        );
        shared.run_request(request).await;
        drop(permit);
    }
    debug!("Worker {} stopped", worker);
}
