//! Transport seam - how chunk bytes get off the network
//!
//! The engine only needs two things from a transport: a probe telling it how
//! big a resource is and whether ranges work, and a GET that may carry a
//! `Range` header and streams the body back. `HttpTransport` is the reqwest
//! implementation; anything else (tests, mirrors, caches) can plug in here.

use crate::error::{EngineError, NetworkError};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use rangefetch_types::EngineConfig;
use reqwest::{header, Client, StatusCode};
use tracing::{debug, info, warn};

/// Body of a response, yielded in whatever pieces the transport reads
pub type ByteStream = BoxStream<'static, Result<Bytes, EngineError>>;

/// A byte range to request. `end` is exclusive; `None` means "to the end".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeRequest {
    pub start: u64,
    pub end: Option<u64>,
}

impl RangeRequest {
    pub fn new(start: u64, end: Option<u64>) -> Self {
        Self { start, end }
    }

    /// Value for the HTTP `Range` header (inclusive end, as HTTP wants it)
    pub fn header_value(&self) -> String {
        match self.end {
            Some(end) => format!("bytes={}-{}", self.start, end.saturating_sub(1)),
            None => format!("bytes={}-", self.start),
        }
    }

    /// Number of bytes requested, if bounded
    pub fn len(&self) -> Option<u64> {
        self.end.map(|end| end.saturating_sub(self.start))
    }
}

/// Parsed `Content-Range: bytes start-end/total` header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    pub start: u64,
    /// Last byte, inclusive
    pub end: u64,
    pub total: Option<u64>,
}

impl ContentRange {
    pub fn parse(value: &str) -> Option<Self> {
        let rest = value.trim().strip_prefix("bytes")?.trim_start();
        let (range, total) = rest.split_once('/')?;
        let (start, end) = range.split_once('-')?;
        let total = match total.trim() {
            "*" => None,
            t => Some(t.parse().ok()?),
        };
        Some(Self {
            start: start.trim().parse().ok()?,
            end: end.trim().parse().ok()?,
            total,
        })
    }
}

/// What a probe learned about a resource
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceInfo {
    pub total_size: Option<u64>,
    pub accepts_ranges: bool,
}

/// Response to a (possibly ranged) GET
pub struct TransportResponse {
    pub status: u16,
    pub content_length: Option<u64>,
    pub content_range: Option<ContentRange>,
    pub body: ByteStream,
}

impl std::fmt::Debug for TransportResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportResponse")
            .field("status", &self.status)
            .field("content_length", &self.content_length)
            .field("content_range", &self.content_range)
            .finish_non_exhaustive()
    }
}

/// A range-capable byte source
#[async_trait]
pub trait Transport: Send + Sync {
    /// Discover the resource's size and whether it serves byte ranges
    async fn probe(&self, url: &str) -> Result<ResourceInfo, EngineError>;

    /// Issue a GET, with a `Range` header when `range` is given.
    ///
    /// Any HTTP status is returned as a response; only failures to talk to
    /// the server at all are errors.
    async fn fetch(
        &self,
        url: &str,
        range: Option<RangeRequest>,
    ) -> Result<TransportResponse, EngineError>;
}

/// reqwest-backed transport
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(config: &EngineConfig) -> Result<Self, EngineError> {
        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(config.connection_timeout())
            .build()
            .map_err(|e| EngineError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    /// Ask for the first byte only; servers that honour ranges answer 206
    /// with the full size in `Content-Range`.
    async fn probe_with_range_get(&self, url: &str) -> Result<ResourceInfo, EngineError> {
        let response = self
            .client
            .get(url)
            .header(header::RANGE, "bytes=0-0")
            .send()
            .await?;

        let status = response.status();
        debug!("Partial GET probe of {} returned {}", url, status);

        let info = if status == StatusCode::PARTIAL_CONTENT {
            let total_size = header_str(response.headers(), header::CONTENT_RANGE)
                .and_then(ContentRange::parse)
                .and_then(|range| range.total);
            ResourceInfo {
                total_size,
                accepts_ranges: true,
            }
        } else if status.is_success() {
            // Server ignored the range and is sending everything
            ResourceInfo {
                total_size: header_u64(response.headers(), header::CONTENT_LENGTH),
                accepts_ranges: false,
            }
        } else {
            return Err(NetworkError::HttpStatus(status.as_u16()).into());
        };

        Ok(info)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn probe(&self, url: &str) -> Result<ResourceInfo, EngineError> {
        info!("Probing URL: {}", url);

        let response = match self.client.head(url).send().await {
            Ok(response) => response,
            Err(e) => {
                warn!("HEAD request for {} failed ({}), trying partial GET", url, e);
                return self.probe_with_range_get(url).await;
            }
        };

        let status = response.status();
        if !status.is_success() {
            if status.is_server_error() {
                return Err(NetworkError::HttpStatus(status.as_u16()).into());
            }
            // Plenty of servers refuse HEAD but serve GET fine
            debug!("HEAD for {} returned {}, trying partial GET", url, status);
            return self.probe_with_range_get(url).await;
        }

        let accepts_ranges = header_str(response.headers(), header::ACCEPT_RANGES)
            .map(|v| v.eq_ignore_ascii_case("bytes"))
            .unwrap_or(false);
        let total_size = header_u64(response.headers(), header::CONTENT_LENGTH);

        if total_size.is_none() || !accepts_ranges {
            // HEAD is often incomplete behind CDNs; a one-byte GET settles it
            match self.probe_with_range_get(url).await {
                Ok(info) => {
                    return Ok(ResourceInfo {
                        total_size: info.total_size.or(total_size),
                        accepts_ranges: info.accepts_ranges,
                    })
                }
                Err(e) => warn!("Partial GET probe failed: {} - using HEAD result", e),
            }
        }

        Ok(ResourceInfo {
            total_size,
            accepts_ranges,
        })
    }

    async fn fetch(
        &self,
        url: &str,
        range: Option<RangeRequest>,
    ) -> Result<TransportResponse, EngineError> {
        let mut request = self.client.get(url);
        if let Some(range) = range {
            let value = range.header_value();
            debug!("Requesting {} with Range: {}", url, value);
            request = request.header(header::RANGE, value);
        }

        let response = request.send().await?;
        let status = response.status().as_u16();
        let content_length = header_u64(response.headers(), header::CONTENT_LENGTH);
        let content_range =
            header_str(response.headers(), header::CONTENT_RANGE).and_then(ContentRange::parse);
        let body = response.bytes_stream().map_err(EngineError::from).boxed();

        Ok(TransportResponse {
            status,
            content_length,
            content_range,
            body,
        })
    }
}

fn header_str(headers: &header::HeaderMap, name: header::HeaderName) -> Option<&str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn header_u64(headers: &header::HeaderMap, name: header::HeaderName) -> Option<u64> {
    header_str(headers, name).and_then(|v| v.trim().parse().ok())
}
