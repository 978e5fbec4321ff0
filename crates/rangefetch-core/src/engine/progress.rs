//! Progress tracker - concurrent registry of per-download progress
//!
//! The registry map is only locked to add, remove or iterate entries. Each
//! entry's counters and status are atomics, so chunk tasks report bytes
//! without contending on a shared lock.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rangefetch_types::{AggregateProgress, DownloadProgress, DownloadStatus, ProgressEvent};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

const UNKNOWN_TOTAL: u64 = u64::MAX;
const NO_TIME: i64 = i64::MIN;
const EVENT_CAPACITY: usize = 1024;

/// Status lives in the top bits of the entry state, downloaded bytes below
const STATUS_SHIFT: u32 = 61;
const BYTES_MASK: u64 = (1 << STATUS_SHIFT) - 1;

fn encode_status(status: DownloadStatus) -> u8 {
    match status {
        DownloadStatus::Pending => 0,
        DownloadStatus::Downloading => 1,
        DownloadStatus::Paused => 2,
        DownloadStatus::Completed => 3,
        DownloadStatus::Failed => 4,
        DownloadStatus::Cancelled => 5,
    }
}

fn decode_status(value: u8) -> DownloadStatus {
    match value {
        0 => DownloadStatus::Pending,
        1 => DownloadStatus::Downloading,
        2 => DownloadStatus::Paused,
        3 => DownloadStatus::Completed,
        4 => DownloadStatus::Failed,
        _ => DownloadStatus::Cancelled,
    }
}

fn status_of(state: u64) -> DownloadStatus {
    decode_status((state >> STATUS_SHIFT) as u8)
}

fn bytes_of(state: u64) -> u64 {
    state & BYTES_MASK
}

fn with_status(state: u64, status: DownloadStatus) -> u64 {
    bytes_of(state) | ((encode_status(status) as u64) << STATUS_SHIFT)
}

fn with_bytes(state: u64, bytes: u64) -> u64 {
    (state & !BYTES_MASK) | bytes.min(BYTES_MASK)
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn from_millis(ms: i64) -> Option<DateTime<Utc>> {
    if ms == NO_TIME {
        None
    } else {
        DateTime::from_timestamp_millis(ms)
    }
}

/// Progress of one download
#[derive(Debug)]
struct ProgressEntry {
    id: Uuid,
    total: AtomicU64,
    /// Status and downloaded bytes in one word, so no byte count can land
    /// once the status is terminal
    state: AtomicU64,
    speed: AtomicU64,
    started_at: AtomicI64,
    finished_at: AtomicI64,
    /// Byte count and time (nanos since tracker epoch) at the last speed sample
    sample_bytes: AtomicU64,
    sample_at: AtomicU64,
    /// Written once, when the download fails
    error: Mutex<Option<String>>,
}

impl ProgressEntry {
    fn new(id: Uuid, sample_at: u64) -> Self {
        Self {
            id,
            total: AtomicU64::new(UNKNOWN_TOTAL),
            state: AtomicU64::new(with_status(0, DownloadStatus::Pending)),
            speed: AtomicU64::new(0),
            started_at: AtomicI64::new(NO_TIME),
            finished_at: AtomicI64::new(NO_TIME),
            sample_bytes: AtomicU64::new(0),
            sample_at: AtomicU64::new(sample_at),
            error: Mutex::new(None),
        }
    }

    fn status(&self) -> DownloadStatus {
        status_of(self.state.load(Ordering::Acquire))
    }

    fn downloaded(&self) -> u64 {
        bytes_of(self.state.load(Ordering::Acquire))
    }

    fn total(&self) -> Option<u64> {
        match self.total.load(Ordering::Acquire) {
            UNKNOWN_TOTAL => None,
            total => Some(total),
        }
    }

    fn snapshot(&self) -> DownloadProgress {
        let state = self.state.load(Ordering::Acquire);
        DownloadProgress {
            id: self.id,
            total_bytes: self.total(),
            downloaded_bytes: bytes_of(state),
            speed: self.speed.load(Ordering::Acquire),
            status: status_of(state),
            started_at: from_millis(self.started_at.load(Ordering::Acquire)),
            finished_at: from_millis(self.finished_at.load(Ordering::Acquire)),
            error: self.error.lock().clone(),
        }
    }
}

/// Concurrent registry of download progress
#[derive(Debug)]
pub struct ProgressTracker {
    entries: RwLock<HashMap<Uuid, Arc<ProgressEntry>>>,
    event_tx: broadcast::Sender<ProgressEvent>,
    epoch: Instant,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressTracker {
    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            entries: RwLock::new(HashMap::new()),
            event_tx,
            epoch: Instant::now(),
        }
    }

    fn elapsed_nanos(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    fn entry(&self, id: Uuid) -> Option<Arc<ProgressEntry>> {
        self.entries.read().get(&id).cloned()
    }

    fn emit(&self, event: ProgressEvent) {
        let _ = self.event_tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.event_tx.subscribe()
    }

    /// Start tracking `id` as pending. Registering a known id does nothing.
    pub fn register(&self, id: Uuid) {
        let sample_at = self.elapsed_nanos();
        let inserted = {
            let mut entries = self.entries.write();
            if entries.contains_key(&id) {
                false
            } else {
                entries.insert(id, Arc::new(ProgressEntry::new(id, sample_at)));
                true
            }
        };
        if inserted {
            self.emit(ProgressEvent::Added { id });
        }
    }

    pub fn remove(&self, id: Uuid) -> bool {
        self.entries.write().remove(&id).is_some()
    }

    /// Drop every entry in a terminal status; returns how many were removed
    pub fn remove_finished(&self) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| !entry.status().is_terminal());
        before - entries.len()
    }

    /// Add `delta` downloaded bytes. Ignored once the download is terminal,
    /// and capped at the total size when that is known.
    pub fn update(&self, id: Uuid, delta: u64) -> bool {
        let Some(entry) = self.entry(id) else {
            return false;
        };
        if delta == 0 {
            return false;
        }
        let total = entry.total.load(Ordering::Acquire);
        entry
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |state| {
                if status_of(state).is_terminal() {
                    return None;
                }
                Some(with_bytes(state, bytes_of(state).saturating_add(delta).min(total)))
            })
            .is_ok()
    }

    /// Raise the downloaded count to `downloaded` if that is higher.
    ///
    /// Used by runs that count their own bytes from a baseline, so bytes a
    /// resumed or restarted run fetches again are not counted twice.
    pub fn raise_to(&self, id: Uuid, downloaded: u64) -> bool {
        let Some(entry) = self.entry(id) else {
            return false;
        };
        let target = downloaded.min(entry.total.load(Ordering::Acquire));
        entry
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |state| {
                if status_of(state).is_terminal() {
                    return None;
                }
                Some(with_bytes(state, bytes_of(state).max(target)))
            })
            .is_ok()
    }

    /// Record the resource size once it is known
    pub fn set_total(&self, id: Uuid, total: u64) -> bool {
        let Some(entry) = self.entry(id) else {
            return false;
        };
        if entry.status().is_terminal() {
            return false;
        }
        entry.total.store(total, Ordering::Release);
        true
    }

    pub fn status(&self, id: Uuid) -> Option<DownloadStatus> {
        self.entry(id).map(|e| e.status())
    }

    /// Move to `status` from any non-terminal status.
    ///
    /// Returns `false` if the download is unknown or already terminal.
    pub fn set_status(&self, id: Uuid, status: DownloadStatus, error: Option<String>) -> bool {
        let Some(entry) = self.entry(id) else {
            return false;
        };
        let result = entry
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |state| {
                (!status_of(state).is_terminal()).then(|| with_status(state, status))
            });
        if result.is_err() {
            return false;
        }
        self.after_transition(&entry, status, error);
        true
    }

    /// Move from exactly `from` to `to`; returns whether the swap happened
    pub fn transition(&self, id: Uuid, from: DownloadStatus, to: DownloadStatus) -> bool {
        let Some(entry) = self.entry(id) else {
            return false;
        };
        if entry
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |state| {
                (status_of(state) == from).then(|| with_status(state, to))
            })
            .is_err()
        {
            return false;
        }
        self.after_transition(&entry, to, None);
        true
    }

    fn after_transition(&self, entry: &ProgressEntry, status: DownloadStatus, error: Option<String>) {
        let now = now_millis();
        if status == DownloadStatus::Downloading {
            let _ = entry
                .started_at
                .compare_exchange(NO_TIME, now, Ordering::AcqRel, Ordering::Acquire);
            entry
                .sample_bytes
                .store(entry.downloaded(), Ordering::Release);
            entry.sample_at.store(self.elapsed_nanos(), Ordering::Release);
        } else {
            entry.speed.store(0, Ordering::Release);
        }
        if status.is_terminal() {
            entry.finished_at.store(now, Ordering::Release);
        }
        if error.is_some() {
            *entry.error.lock() = error.clone();
        }

        debug!("Download {} is now {:?}", entry.id, status);
        self.emit(ProgressEvent::StatusChanged {
            id: entry.id,
            status,
            error,
        });
    }

    pub fn chunk_completed(&self, id: Uuid, index: u32) {
        self.emit(ProgressEvent::ChunkCompleted { id, index });
    }

    pub fn snapshot(&self, id: Uuid) -> Option<DownloadProgress> {
        self.entry(id).map(|e| e.snapshot())
    }

    pub fn snapshots(&self) -> Vec<DownloadProgress> {
        let entries: Vec<Arc<ProgressEntry>> = self.entries.read().values().cloned().collect();
        entries.iter().map(|e| e.snapshot()).collect()
    }

    /// Pending or downloading entries
    pub fn unsettled_count(&self) -> usize {
        self.entries
            .read()
            .values()
            .filter(|e| e.status().is_unsettled())
            .count()
    }

    pub fn aggregate(&self) -> AggregateProgress {
        let mut aggregate = AggregateProgress::default();
        let mut downloaded_sum: u64 = 0;
        let mut total_sum: u64 = 0;

        for entry in self.entries.read().values() {
            match entry.status() {
                DownloadStatus::Pending => aggregate.pending_count += 1,
                DownloadStatus::Downloading => {
                    aggregate.active_count += 1;
                    aggregate.overall_speed += entry.speed.load(Ordering::Acquire);
                }
                DownloadStatus::Paused => aggregate.paused_count += 1,
                DownloadStatus::Completed => aggregate.completed_count += 1,
                DownloadStatus::Failed => aggregate.failed_count += 1,
                DownloadStatus::Cancelled => aggregate.cancelled_count += 1,
            }
            if let Some(total) = entry.total() {
                total_sum = total_sum.saturating_add(total);
                downloaded_sum = downloaded_sum.saturating_add(entry.downloaded());
            }
        }

        aggregate.overall_percent = if total_sum > 0 {
            (downloaded_sum as f64 / total_sum as f64) * 100.0
        } else {
            0.0
        };
        aggregate
    }

    /// Refresh the windowed speed of every downloading entry from the bytes
    /// moved since the previous tick, optionally publishing progress events.
    pub fn tick(&self, emit: bool) {
        let now = self.elapsed_nanos();
        let entries: Vec<Arc<ProgressEntry>> = self.entries.read().values().cloned().collect();

        for entry in entries {
            if entry.status() != DownloadStatus::Downloading {
                continue;
            }
            let downloaded = entry.downloaded();
            let previous_bytes = entry.sample_bytes.swap(downloaded, Ordering::AcqRel);
            let previous_at = entry.sample_at.swap(now, Ordering::AcqRel);

            let elapsed = now.saturating_sub(previous_at);
            let speed = if elapsed > 0 {
                (downloaded.saturating_sub(previous_bytes) as u128 * 1_000_000_000 / elapsed as u128)
                    as u64
            } else {
                0
            };
            entry.speed.store(speed, Ordering::Release);

            if emit {
                self.emit(ProgressEvent::Progress {
                    id: entry.id,
                    downloaded,
                    total: entry.total(),
                    speed,
                });
            }
        }
    }
}

/// Read-only handle on the tracker, handed out to observers
#[derive(Debug, Clone)]
pub struct ProgressView {
    tracker: Arc<ProgressTracker>,
}

impl ProgressView {
    pub fn new(tracker: Arc<ProgressTracker>) -> Self {
        Self { tracker }
    }

    pub fn snapshot(&self, id: Uuid) -> Option<DownloadProgress> {
        self.tracker.snapshot(id)
    }

    pub fn snapshots(&self) -> Vec<DownloadProgress> {
        self.tracker.snapshots()
    }

    pub fn status(&self, id: Uuid) -> Option<DownloadStatus> {
        self.tracker.status(id)
    }

    pub fn aggregate(&self) -> AggregateProgress {
        self.tracker.aggregate()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.tracker.subscribe()
    }
}

/// Refresh speeds and publish progress events every `interval` until `stop` fires
pub fn spawn_reporter(
    tracker: Arc<ProgressTracker>,
    interval: Duration,
    stop: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => tracker.tick(true),
            }
        }
        debug!("Progress reporter stopped");
    })
}
