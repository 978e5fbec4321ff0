//! Chunk downloader - transfers one byte range into its part file
//!
//! Each chunk writes to its own part file. If the part file already holds
//! some of the range, only the rest is requested and appended, so an
//! interrupted download picks up where it stopped.

use crate::engine::control::TransferControl;
use crate::engine::retry::RetryPolicy;
use crate::engine::transport::{RangeRequest, Transport};
use crate::error::{EngineError, NetworkError};
use futures::StreamExt;
use rangefetch_types::FileChunk;
use std::io::SeekFrom;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info, warn};

/// Result of a chunk download
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkResult {
    /// Size of the finished part file
    pub bytes_on_disk: u64,
    /// Bytes received over the wire across all attempts
    pub bytes_transferred: u64,
    /// Resource size learned from the response, for open-ended chunks
    pub discovered_size: Option<u64>,
    pub attempts: u32,
}

/// Downloads chunks through a transport, retrying transient failures
#[derive(Clone)]
pub struct ChunkDownloader {
    transport: Arc<dyn Transport>,
    retry: RetryPolicy,
    read_timeout: Duration,
    resume: bool,
}

/// Counters carried across the attempts of one chunk download
struct Tally {
    /// Highest byte count of this chunk already reported to the caller
    reported: u64,
    transferred: u64,
}

impl ChunkDownloader {
    pub fn new(
        transport: Arc<dyn Transport>,
        retry: RetryPolicy,
        read_timeout: Duration,
        resume: bool,
    ) -> Self {
        Self {
            transport,
            retry,
            read_timeout,
            resume,
        }
    }

    /// Bytes of `chunk` already on disk that a download will keep.
    ///
    /// Zero when resume is off or the part file is larger than the chunk
    /// (it will be discarded).
    pub async fn resumable_bytes(&self, chunk: &FileChunk) -> u64 {
        if !self.resume {
            return 0;
        }
        let existing = match tokio::fs::metadata(&chunk.part_path).await {
            Ok(metadata) => metadata.len(),
            Err(_) => return 0,
        };
        match chunk.len() {
            Some(len) if existing > len => 0,
            _ => existing,
        }
    }

    /// Download `chunk`, calling `on_bytes` with each newly written byte count.
    ///
    /// Bytes already on disk when the call starts (see `resumable_bytes`)
    /// are not reported again, and neither are bytes re-fetched after a
    /// restart, so the reported total never goes backwards. The part file is
    /// left on disk whatever the outcome.
    pub async fn download(
        &self,
        chunk: &FileChunk,
        control: &TransferControl,
        on_bytes: &(dyn Fn(u64) + Send + Sync),
    ) -> Result<ChunkResult, EngineError> {
        let mut tally = Tally {
            reported: self.resumable_bytes(chunk).await,
            transferred: 0,
        };
        let mut attempt = 0;

        loop {
            attempt += 1;
            control.check()?;

            match self.attempt(chunk, control, &mut tally, on_bytes).await {
                Ok((bytes_on_disk, discovered_size)) => {
                    info!(
                        "Chunk {} complete ({} bytes, {} over the wire, attempt {})",
                        chunk.index, bytes_on_disk, tally.transferred, attempt
                    );
                    return Ok(ChunkResult {
                        bytes_on_disk,
                        bytes_transferred: tally.transferred,
                        discovered_size,
                        attempts: attempt,
                    });
                }
                Err(e) if e.is_retryable() && self.retry.has_attempts_left(attempt) => {
                    let delay = self.retry.delay_after(attempt);
                    warn!(
                        "Chunk {} failed (attempt {}/{}): {}. Retrying in {:?}",
                        chunk.index, attempt, self.retry.max_attempts, e, delay
                    );
                    control.sleep(delay).await?;
                }
                Err(e) => {
                    if !e.is_interruption() {
                        warn!(
                            "Chunk {} giving up after attempt {}/{}: {}",
                            chunk.index, attempt, self.retry.max_attempts, e
                        );
                    }
                    return Err(e);
                }
            }
        }
    }

    /// One transfer attempt. Returns the part file size and any discovered
    /// resource size.
    async fn attempt(
        &self,
        chunk: &FileChunk,
        control: &TransferControl,
        tally: &mut Tally,
        on_bytes: &(dyn Fn(u64) + Send + Sync),
    ) -> Result<(u64, Option<u64>), EngineError> {
        if let Some(parent) = chunk.part_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .read(true)
            .truncate(false)
            .open(&chunk.part_path)
            .await?;

        let mut existing = file.metadata().await?.len();
        let oversized = chunk.len().is_some_and(|len| existing > len);
        if existing > 0 && (!self.resume || oversized) {
            debug!(
                "Discarding {} bytes in {:?} (resume: {}, oversized: {})",
                existing, chunk.part_path, self.resume, oversized
            );
            file.set_len(0).await?;
            existing = 0;
        }

        if chunk.len() == Some(existing) {
            debug!("Chunk {} already complete on disk", chunk.index);
            return Ok((existing, None));
        }

        file.seek(SeekFrom::Start(existing)).await?;
        if existing > 0 {
            info!("Resuming chunk {} from byte {}", chunk.index, existing);
        }

        let offset = chunk.start + existing;
        let range = if offset == 0 && chunk.is_open_ended() {
            None
        } else {
            Some(RangeRequest::new(offset, chunk.end))
        };

        let response = tokio::select! {
            biased;
            _ = control.stopped() => return Err(control.stop_error()),
            response = tokio::time::timeout(self.read_timeout, self.transport.fetch(&chunk.url, range)) => {
                response.map_err(|_| NetworkError::Timeout)??
            }
        };

        let mut discovered_size = None;
        match response.status {
            206 => {
                if let Some(content_range) = response.content_range {
                    if content_range.start != offset {
                        return Err(EngineError::RangeMismatch(format!(
                            "asked for chunk {} from byte {}, server sent from byte {}",
                            chunk.index, offset, content_range.start
                        )));
                    }
                    if chunk.is_open_ended() {
                        discovered_size = content_range.total;
                    }
                }
            }
            200 => {
                let whole = chunk.start == 0
                    && match (chunk.end, response.content_length) {
                        (None, _) => true,
                        (Some(end), Some(length)) => end == length,
                        (Some(_), None) => true,
                    };
                if range.is_some() && !whole {
                    return Err(EngineError::RangeMismatch(format!(
                        "server ignored the range request for chunk {}",
                        chunk.index
                    )));
                }
                if existing > 0 {
                    // Full body coming; start the part file over
                    debug!("Server ignored resume range for chunk {}, restarting", chunk.index);
                    file.set_len(0).await?;
                    file.seek(SeekFrom::Start(0)).await?;
                    existing = 0;
                }
                if chunk.is_open_ended() {
                    discovered_size = response.content_length;
                }
            }
            416 => {
                return Err(EngineError::RangeMismatch(format!(
                    "range {} not satisfiable for chunk {}",
                    range.map(|r| r.header_value()).unwrap_or_default(),
                    chunk.index
                )));
            }
            status => return Err(NetworkError::HttpStatus(status).into()),
        }

        let mut written = existing;
        let mut body = response.body;

        loop {
            let next = tokio::select! {
                biased;
                _ = control.stopped() => {
                    file.flush().await?;
                    return Err(control.stop_error());
                }
                next = tokio::time::timeout(self.read_timeout, body.next()) => next,
            };

            let piece = match next {
                Err(_) => {
                    file.flush().await?;
                    return Err(NetworkError::Timeout.into());
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    file.flush().await?;
                    return Err(e);
                }
                Ok(Some(Ok(piece))) => piece,
            };

            let piece_len = piece.len() as u64;
            if let Some(len) = chunk.len() {
                if written + piece_len > len {
                    file.flush().await?;
                    return Err(EngineError::RangeMismatch(format!(
                        "server sent more than the {} bytes of chunk {}",
                        len, chunk.index
                    )));
                }
            }

            file.write_all(&piece).await?;
            written += piece_len;
            tally.transferred += piece_len;

            if written > tally.reported {
                on_bytes(written - tally.reported);
                tally.reported = written;
            }
        }

        file.flush().await?;
        file.sync_all().await?;

        if let Some(len) = chunk.len() {
            if written < len {
                return Err(NetworkError::ConnectionFailed(format!(
                    "connection closed after {} of {} bytes of chunk {}",
                    written, len, chunk.index
                ))
                .into());
            }
        }

        Ok((written, discovered_size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{pattern, MemoryTransport};
    use std::sync::atomic::{AtomicU64, Ordering};

    fn downloader(transport: Arc<MemoryTransport>, attempts: u32, resume: bool) -> ChunkDownloader {
        ChunkDownloader::new(
            transport,
            RetryPolicy {
                max_attempts: attempts,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
            },
            Duration::from_secs(5),
            resume,
        )
    }

    fn chunk(dir: &std::path::Path, start: u64, end: Option<u64>) -> FileChunk {
        FileChunk::new(0, "mem://file".into(), dir.join("chunk_0.part"), start, end)
    }

    #[tokio::test]
    async fn test_downloads_exact_range() {
        let dir = tempfile::tempdir().unwrap();
        let data = pattern(10 * 1024);
        let transport = Arc::new(MemoryTransport::new(data.clone()));
        let reported = AtomicU64::new(0);

        let c = chunk(dir.path(), 4096, Some(8192));
        let result = downloader(transport.clone(), 3, true)
            .download(&c, &TransferControl::new(), &|n| {
                reported.fetch_add(n, Ordering::Relaxed);
            })
            .await
            .unwrap();

        assert_eq!(result.bytes_on_disk, 4096);
        assert_eq!(reported.load(Ordering::Relaxed), 4096);
        let on_disk = tokio::fs::read(&c.part_path).await.unwrap();
        assert_eq!(on_disk, &data[4096..8192]);
    }

    #[tokio::test]
    async fn test_resume_requests_only_missing_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let data = pattern(8 * 1024);
        let transport = Arc::new(MemoryTransport::new(data.clone()));

        let (start, end, k) = (2048u64, 6144u64, 1000u64);
        let c = chunk(dir.path(), start, Some(end));
        tokio::fs::write(&c.part_path, &data[start as usize..(start + k) as usize])
            .await
            .unwrap();

        let dl = downloader(transport.clone(), 3, true);
        assert_eq!(dl.resumable_bytes(&c).await, k);

        let reported = AtomicU64::new(0);
        let result = dl
            .download(&c, &TransferControl::new(), &|n| {
                reported.fetch_add(n, Ordering::Relaxed);
            })
            .await
            .unwrap();

        assert_eq!(transport.bytes_served(), end - start - k);
        assert_eq!(result.bytes_transferred, end - start - k);
        assert_eq!(reported.load(Ordering::Relaxed), end - start - k);
        assert_eq!(
            transport.requested_ranges(),
            vec![Some(RangeRequest::new(start + k, Some(end)))]
        );
        let on_disk = tokio::fs::read(&c.part_path).await.unwrap();
        assert_eq!(on_disk, &data[start as usize..end as usize]);
    }

    #[tokio::test]
    async fn test_without_resume_part_file_is_restarted() {
        let dir = tempfile::tempdir().unwrap();
        let data = pattern(4096);
        let transport = Arc::new(MemoryTransport::new(data.clone()));
        let c = chunk(dir.path(), 0, Some(4096));
        tokio::fs::write(&c.part_path, b"garbage").await.unwrap();

        let result = downloader(transport.clone(), 1, false)
            .download(&c, &TransferControl::new(), &|_| {})
            .await
            .unwrap();

        assert_eq!(result.bytes_transferred, 4096);
        assert_eq!(tokio::fs::read(&c.part_path).await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(MemoryTransport::new(pattern(4096)));
        transport.fail_times(0, 1);

        let result = downloader(transport.clone(), 3, true)
            .download(&chunk(dir.path(), 0, Some(4096)), &TransferControl::new(), &|_| {})
            .await
            .unwrap();

        assert_eq!(result.attempts, 2);
        assert_eq!(transport.fetch_count(), 2);
    }

    #[tokio::test]
    async fn test_budget_exhausted_keeps_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(MemoryTransport::new(pattern(4096)));
        transport.fail_always(0);

        let c = chunk(dir.path(), 0, Some(4096));
        let err = downloader(transport.clone(), 3, true)
            .download(&c, &TransferControl::new(), &|_| {})
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::Network(NetworkError::ConnectionFailed(_))));
        assert_eq!(transport.fetch_count(), 3);
        assert!(c.part_path.exists());
    }

    #[tokio::test]
    async fn test_416_is_range_mismatch_without_retry() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(MemoryTransport::new(pattern(4096)).rejecting_ranges());

        let err = downloader(transport.clone(), 3, true)
            .download(&chunk(dir.path(), 1024, Some(2048)), &TransferControl::new(), &|_| {})
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::RangeMismatch(_)));
        assert_eq!(transport.fetch_count(), 1);
    }

    #[tokio::test]
    async fn test_ignored_range_on_later_chunk_is_range_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(MemoryTransport::new(pattern(4096)).ignoring_ranges());

        let err = downloader(transport, 3, true)
            .download(&chunk(dir.path(), 1024, Some(2048)), &TransferControl::new(), &|_| {})
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::RangeMismatch(_)));
    }

    #[tokio::test]
    async fn test_open_ended_chunk_discovers_size() {
        let dir = tempfile::tempdir().unwrap();
        let data = pattern(3000);
        let transport = Arc::new(MemoryTransport::new(data.clone()).ignoring_ranges());

        let c = chunk(dir.path(), 0, None);
        let result = downloader(transport.clone(), 1, true)
            .download(&c, &TransferControl::new(), &|_| {})
            .await
            .unwrap();

        assert_eq!(result.discovered_size, Some(3000));
        assert_eq!(transport.requested_ranges(), vec![None]);
        assert_eq!(tokio::fs::read(&c.part_path).await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_cancel_stops_between_reads() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(
            MemoryTransport::new(pattern(64 * 1024)).with_piece_delay(Duration::from_millis(20)),
        );
        let control = Arc::new(TransferControl::new());
        let stopper = control.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            stopper.stop(crate::engine::control::StopReason::Cancelled);
        });

        let c = chunk(dir.path(), 0, Some(64 * 1024));
        let err = downloader(transport.clone(), 3, true)
            .download(&c, &control, &|_| {})
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::Cancelled));
        assert!(transport.bytes_served() < 64 * 1024);
        assert!(c.part_path.exists());
    }
}
