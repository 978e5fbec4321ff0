//! Bounded priority queue of pending download requests
//!
//! Higher priority first; within a priority, lower submission sequence first.
//! `put` waits while the queue is full and `take` waits while it is empty.
//! The lock is held only to push or pop, never across an await.

use crate::error::EngineError;
use parking_lot::Mutex;
use rangefetch_types::DownloadRequest;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::Duration;
use tokio::sync::Notify;
use uuid::Uuid;

/// Heap entry ordered so the max is the next request to run
struct Queued(DownloadRequest);

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .priority
            .cmp(&other.0.priority)
            .then_with(|| other.0.sequence.cmp(&self.0.sequence))
    }
}

/// Why a non-blocking put did not enqueue
#[derive(Debug)]
pub enum TryPutError {
    Full(DownloadRequest),
    Closed(DownloadRequest),
}

struct Inner {
    heap: BinaryHeap<Queued>,
    closed: bool,
}

pub struct PriorityDownloadQueue {
    inner: Mutex<Inner>,
    capacity: usize,
    not_empty: Notify,
    not_full: Notify,
}

impl PriorityDownloadQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                heap: BinaryHeap::new(),
                closed: false,
            }),
            capacity: capacity.max(1),
            not_empty: Notify::new(),
            not_full: Notify::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.inner.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Enqueue without waiting
    pub fn try_put(&self, request: DownloadRequest) -> Result<(), TryPutError> {
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(TryPutError::Closed(request));
            }
            if inner.heap.len() >= self.capacity {
                return Err(TryPutError::Full(request));
            }
            inner.heap.push(Queued(request));
        }
        self.not_empty.notify_one();
        Ok(())
    }

    /// Enqueue, waiting for room while the queue is full
    pub async fn put(&self, mut request: DownloadRequest) -> Result<(), EngineError> {
        loop {
            let notified = self.not_full.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.try_put(request) {
                Ok(()) => return Ok(()),
                Err(TryPutError::Closed(_)) => return Err(EngineError::ShuttingDown),
                Err(TryPutError::Full(returned)) => request = returned,
            }

            notified.await;
        }
    }

    /// Dequeue without waiting
    pub fn try_take_now(&self) -> Option<DownloadRequest> {
        let taken = self.inner.lock().heap.pop().map(|q| q.0);
        if taken.is_some() {
            self.not_full.notify_one();
        }
        taken
    }

    /// Dequeue, waiting while the queue is empty.
    ///
    /// Returns `None` once the queue is closed and has nothing left.
    pub async fn take(&self) -> Option<DownloadRequest> {
        loop {
            let notified = self.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(request) = self.try_take_now() {
                return Some(request);
            }
            if self.is_closed() {
                return None;
            }

            notified.await;
        }
    }

    /// Dequeue, giving up after `timeout`
    pub async fn try_take(&self, timeout: Duration) -> Option<DownloadRequest> {
        tokio::time::timeout(timeout, self.take()).await.ok().flatten()
    }

    /// Remove a request that has not been dequeued yet
    pub fn remove(&self, id: Uuid) -> Option<DownloadRequest> {
        let removed = {
            let mut inner = self.inner.lock();
            let mut items = std::mem::take(&mut inner.heap).into_vec();
            let removed = items
                .iter()
                .position(|q| q.0.id == id)
                .map(|pos| items.swap_remove(pos).0);
            inner.heap = BinaryHeap::from(items);
            removed
        };
        if removed.is_some() {
            self.not_full.notify_one();
        }
        removed
    }

    /// Remove everything, in dequeue order
    pub fn drain_all(&self) -> Vec<DownloadRequest> {
        let drained: Vec<DownloadRequest> = {
            let mut inner = self.inner.lock();
            std::mem::take(&mut inner.heap)
                .into_sorted_vec()
                .into_iter()
                .rev()
                .map(|q| q.0)
                .collect()
        };
        self.not_full.notify_waiters();
        drained
    }

    /// Stop accepting requests and wake everyone waiting
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.not_empty.notify_waiters();
        self.not_full.notify_waiters();
    }
}
