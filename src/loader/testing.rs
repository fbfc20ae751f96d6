//! In-memory transport for unit tests.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream;
use http::{HeaderMap, HeaderValue};
use std::sync::Mutex;

use super::transport::{Transport, TransportError, TransportRequest, TransportResponse};

/// Serves byte ranges of a fixed body, recording every request it sees.
pub(crate) struct FakeTransport {
    body: Bytes,
    content_type: String,
    chunk_size: usize,
    accept_ranges: bool,
    fail_after: Option<usize>,
    stall_after: Option<usize>,
    requests: Mutex<Vec<TransportRequest>>,
}

impl FakeTransport {
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            content_type: "video/mp4".to_string(),
            chunk_size: 64 * 1024,
            accept_ranges: true,
            fail_after: None,
            stall_after: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn with_content_type(mut self, content_type: &str) -> Self {
        self.content_type = content_type.to_string();
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Answer every request with the full body, ignoring `Range`.
    pub fn ignoring_ranges(mut self) -> Self {
        self.accept_ranges = false;
        self
    }

    /// Drop the connection after `bytes` body bytes.
    pub fn failing_after(mut self, bytes: usize) -> Self {
        self.fail_after = Some(bytes);
        self
    }

    /// Stop sending (without closing) after `bytes` body bytes.
    pub fn stalling_after(mut self, bytes: usize) -> Self {
        self.stall_after = Some(bytes);
        self
    }

    pub fn requests(&self) -> Vec<TransportRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn fetch(&self, request: TransportRequest) -> Result<TransportResponse, TransportError> {
        self.requests.lock().unwrap().push(request.clone());

        let total = self.body.len() as u64;
        let (status, start, end) = match request.range {
            Some(range) if self.accept_ranges => {
                if range.start >= total {
                    return Err(TransportError::Status(416));
                }
                let end = range.end.unwrap_or(total - 1).min(total - 1);
                (206u16, range.start, end)
            }
            _ => (200u16, 0, total - 1),
        };

        let mut headers = HeaderMap::new();
        headers.insert(
            "content-type",
            HeaderValue::from_str(&self.content_type).unwrap(),
        );
        headers.insert("content-length", HeaderValue::from(end - start + 1));
        if self.accept_ranges {
            headers.insert("accept-ranges", HeaderValue::from_static("bytes"));
        }
        if status == 206 {
            headers.insert(
                "content-range",
                HeaderValue::from_str(&format!("bytes {}-{}/{}", start, end, total)).unwrap(),
            );
        }

        let mut slice = self.body.slice(start as usize..=end as usize);
        let cutoff = self.fail_after.or(self.stall_after);
        if let Some(cutoff) = cutoff {
            slice.truncate(cutoff);
        }

        let mut chunks: Vec<Result<Bytes, TransportError>> = Vec::new();
        let mut offset = 0;
        while offset < slice.len() {
            let next = (offset + self.chunk_size).min(slice.len());
            chunks.push(Ok(slice.slice(offset..next)));
            offset = next;
        }
        if self.fail_after.is_some() {
            chunks.push(Err(TransportError::ConnectionLost("connection reset".into())));
        }

        let body = if self.stall_after.is_some() {
            stream::iter(chunks).chain(stream::pending()).boxed()
        } else {
            stream::iter(chunks).boxed()
        };

        Ok(TransportResponse {
            status,
            headers,
            body,
        })
    }
}
