//! Network seam for the resource loader.
//!
//! The loader only needs "send a (possibly ranged) GET, get a status, headers and a
//! byte stream back". Production code uses [`HttpTransport`]; tests plug in fakes.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use http::HeaderMap;
use reqwest::Client;
use std::fmt;
use std::time::Duration;
use url::Url;

use crate::cache::range::ByteRange;
use crate::http_retry::{RetryConfig, send_with_retry};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The request was cancelled locally.
    #[error("request cancelled")]
    Cancelled,

    /// The connection dropped after the response started.
    #[error("network connection lost: {0}")]
    ConnectionLost(String),

    /// The origin answered with a non-success status.
    #[error("origin returned HTTP {0}")]
    Status(u16),

    /// The request could not be sent.
    #[error("request failed: {0}")]
    Request(String),
}

impl TransportError {
    /// Whether bytes received before this error are still worth caching.
    pub fn is_partial_success(&self) -> bool {
        matches!(self, TransportError::Cancelled | TransportError::ConnectionLost(_))
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if let Some(status) = e.status() {
            TransportError::Status(status.as_u16())
        } else if e.is_body() || e.is_decode() {
            TransportError::ConnectionLost(e.to_string())
        } else {
            TransportError::Request(e.to_string())
        }
    }
}

/// An outgoing fetch.
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub url: Url,
    pub headers: HeaderMap,
    /// `None` fetches the whole resource without a `Range` header.
    pub range: Option<ByteRange>,
}

pub type BodyStream = BoxStream<'static, Result<Bytes, TransportError>>;

/// Response head plus a body stream delivered in arrival order.
pub struct TransportResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: BodyStream,
}

impl fmt::Debug for TransportResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn fetch(&self, request: TransportRequest) -> Result<TransportResponse, TransportError>;
}

/// reqwest-backed transport with retry on the initial request.
#[derive(Clone, Debug)]
pub struct HttpTransport {
    client: Client,
    retry: RetryConfig,
}

impl HttpTransport {
    pub fn new(client: Client, retry: RetryConfig) -> Self {
        Self { client, retry }
    }

    /// Client tuned for long-lived media streams.
    pub fn with_defaults() -> Result<Self, TransportError> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(10)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(TransportError::from)?;
        Ok(Self::new(client, RetryConfig::default()))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn fetch(&self, request: TransportRequest) -> Result<TransportResponse, TransportError> {
        let mut headers = request.headers;
        if let Some(range) = request.range {
            let value = http::HeaderValue::from_str(&range.to_header_value())
                .map_err(|e| TransportError::Request(e.to_string()))?;
            headers.insert(http::header::RANGE, value);
        }

        let response = send_with_retry(&self.client, request.url.as_str(), &headers, &self.retry)
            .await
            .map_err(TransportError::from)?;

        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| TransportError::ConnectionLost(e.to_string())))
            .boxed();

        Ok(TransportResponse {
            status,
            headers,
            body,
        })
    }
}
