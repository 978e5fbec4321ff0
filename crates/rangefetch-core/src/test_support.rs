//! In-memory transport for exercising the engine without a network

use crate::engine::transport::{
    ContentRange, RangeRequest, ResourceInfo, Transport, TransportResponse,
};
use crate::error::{EngineError, NetworkError};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Deterministic, non-repeating-looking test payload
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i * 31 + i / 251) % 256) as u8).collect()
}

/// Serves one byte buffer, with knobs for range support and injected failures.
///
/// Failures are keyed by the first byte a request asks for.
pub struct MemoryTransport {
    data: Bytes,
    accepts_ranges: bool,
    honour_ranges: bool,
    reject_ranges: bool,
    advertise_size: bool,
    piece_size: usize,
    piece_delay: Duration,
    transient_failures: Mutex<HashMap<u64, u32>>,
    permanent_failures: Mutex<HashSet<u64>>,
    requests: Mutex<Vec<Option<RangeRequest>>>,
    fetches: AtomicUsize,
    bytes_served: Arc<AtomicU64>,
}

impl MemoryTransport {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data: Bytes::from(data),
            accepts_ranges: true,
            honour_ranges: true,
            reject_ranges: false,
            advertise_size: true,
            piece_size: 1024,
            piece_delay: Duration::ZERO,
            transient_failures: Mutex::new(HashMap::new()),
            permanent_failures: Mutex::new(HashSet::new()),
            requests: Mutex::new(Vec::new()),
            fetches: AtomicUsize::new(0),
            bytes_served: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Answer every GET with the full body and status 200
    pub fn ignoring_ranges(mut self) -> Self {
        self.accepts_ranges = false;
        self.honour_ranges = false;
        self
    }

    /// Advertise range support but answer ranged GETs with 416
    pub fn rejecting_ranges(mut self) -> Self {
        self.reject_ranges = true;
        self
    }

    pub fn without_size(mut self) -> Self {
        self.advertise_size = false;
        self
    }

    pub fn with_piece_delay(mut self, delay: Duration) -> Self {
        self.piece_delay = delay;
        self
    }

    /// Fail the next `times` fetches starting at `offset`
    pub fn fail_times(&self, offset: u64, times: u32) {
        self.transient_failures.lock().insert(offset, times);
    }

    /// Fail every fetch starting at `offset`
    pub fn fail_always(&self, offset: u64) {
        self.permanent_failures.lock().insert(offset);
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn bytes_served(&self) -> u64 {
        self.bytes_served.load(Ordering::SeqCst)
    }

    pub fn requested_ranges(&self) -> Vec<Option<RangeRequest>> {
        self.requests.lock().clone()
    }

    fn should_fail(&self, offset: u64) -> bool {
        if self.permanent_failures.lock().contains(&offset) {
            return true;
        }
        let mut transient = self.transient_failures.lock();
        match transient.get_mut(&offset) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }

    fn respond(&self, status: u16, body: Bytes, content_range: Option<ContentRange>) -> TransportResponse {
        let content_length = self.advertise_size.then_some(body.len() as u64);
        let pieces: Vec<Bytes> = body
            .chunks(self.piece_size.max(1))
            .map(|piece| body.slice_ref(piece))
            .collect();
        let served = self.bytes_served.clone();
        let delay = self.piece_delay;

        let stream = futures::stream::iter(pieces)
            .then(move |piece| {
                let served = served.clone();
                async move {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    served.fetch_add(piece.len() as u64, Ordering::SeqCst);
                    Ok::<Bytes, EngineError>(piece)
                }
            })
            .boxed();

        TransportResponse {
            status,
            content_length,
            content_range,
            body: stream,
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn probe(&self, _url: &str) -> Result<ResourceInfo, EngineError> {
        Ok(ResourceInfo {
            total_size: self.advertise_size.then_some(self.data.len() as u64),
            accepts_ranges: self.accepts_ranges,
        })
    }

    async fn fetch(
        &self,
        _url: &str,
        range: Option<RangeRequest>,
    ) -> Result<TransportResponse, EngineError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(range);

        let offset = range.map(|r| r.start).unwrap_or(0);
        if self.should_fail(offset) {
            return Err(NetworkError::ConnectionFailed("connection reset by peer".into()).into());
        }

        let total = self.data.len() as u64;
        match range {
            Some(_) if self.reject_ranges => Ok(self.respond(416, Bytes::new(), None)),
            Some(range) if self.honour_ranges => {
                if range.start >= total {
                    return Ok(self.respond(416, Bytes::new(), None));
                }
                let end = range.end.unwrap_or(total).min(total);
                let body = self.data.slice(range.start as usize..end as usize);
                let content_range = ContentRange {
                    start: range.start,
                    end: end - 1,
                    total: self.advertise_size.then_some(total),
                };
                Ok(self.respond(206, body, Some(content_range)))
            }
            _ => Ok(self.respond(200, self.data.clone(), None)),
        }
    }
}
