//! State of one in-flight network request.

use bytes::{Bytes, BytesMut};
use http::HeaderMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::request::LoadingRequest;
use crate::cache::range::{ByteRange, ContentRange, extract_requested_range, parse_content_range};

pub type TaskId = u64;

/// Received bytes are written to the cache once this many are pending.
pub const CACHE_FLUSH_BYTES: usize = 4 * 1024 * 1024;

#[derive(Debug)]
pub struct CachableRequest {
    loading_request: Arc<LoadingRequest>,
    /// Range sent to the origin; `None` for an unranged fetch.
    network_range: Option<ByteRange>,
    /// Resource bytes still owed to the consumer by this request.
    delivery_range: Option<ByteRange>,
    /// Resource offset of the first body byte, known once the response arrives.
    response_start: Option<u64>,
    received: u64,
    unpersisted: BytesMut,
    unpersisted_offset: u64,
    pending: BytesMut,
    delivered: u64,
    is_fulfilled: bool,
    cancel: CancellationToken,
}

impl CachableRequest {
    pub fn new(
        loading_request: Arc<LoadingRequest>,
        network_range: Option<ByteRange>,
        delivery_range: Option<ByteRange>,
        is_fulfilled: bool,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            loading_request,
            network_range,
            delivery_range,
            response_start: None,
            received: 0,
            unpersisted: BytesMut::new(),
            unpersisted_offset: 0,
            pending: BytesMut::new(),
            delivered: 0,
            is_fulfilled,
            cancel,
        }
    }

    pub fn loading_request(&self) -> &Arc<LoadingRequest> {
        &self.loading_request
    }

    pub fn is_fulfilled(&self) -> bool {
        self.is_fulfilled
    }

    pub fn set_fulfilled(&mut self) {
        self.is_fulfilled = true;
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Record where the response body starts within the resource.
    pub fn on_response(&mut self, status: u16, headers: &HeaderMap) {
        let content_range = headers
            .get(http::header::CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_range);

        let start = match content_range {
            Some(range) => range.start,
            // A 206 without Content-Range: trust that the server honoured our range.
            None if status == 206 => self.network_range.map(|r| r.start).unwrap_or(0),
            None => 0,
        };
        self.response_start = Some(start);
    }

    /// Take in a body chunk. Returns the bytes to hand to the consumer now, if any.
    ///
    /// Bounded requests are answered once the whole requested length has arrived;
    /// requests to the end of the resource are answered chunk by chunk.
    pub fn ingest(&mut self, chunk: &[u8]) -> Option<Bytes> {
        if chunk.is_empty() {
            return None;
        }

        let chunk_start = self.response_start.unwrap_or(0).saturating_add(self.received);
        self.received += chunk.len() as u64;

        if self.unpersisted.is_empty() {
            self.unpersisted_offset = chunk_start;
        }
        self.unpersisted.extend_from_slice(chunk);

        let delivery = self.delivery_range?;
        let chunk_range = ContentRange {
            start: chunk_start,
            end: chunk_start.saturating_add(chunk.len() as u64 - 1),
            total: None,
        };
        let slice = extract_requested_range(chunk, Some(delivery), Some(chunk_range));
        if slice.is_empty() {
            return None;
        }

        match delivery.len() {
            None => {
                self.delivered += slice.len() as u64;
                Some(Bytes::copy_from_slice(slice))
            }
            Some(wanted) => {
                self.pending.extend_from_slice(slice);
                if self.delivered + self.pending.len() as u64 >= wanted {
                    self.take_pending()
                } else {
                    None
                }
            }
        }
    }

    /// Bytes buffered for a bounded request but not yet handed over.
    pub fn take_pending(&mut self) -> Option<Bytes> {
        if self.pending.is_empty() {
            return None;
        }
        self.delivered += self.pending.len() as u64;
        Some(self.pending.split().freeze())
    }

    pub fn should_flush(&self) -> bool {
        self.unpersisted.len() >= CACHE_FLUSH_BYTES
    }

    /// Received bytes not yet written to the cache, with their resource offset.
    pub fn take_unpersisted(&mut self) -> Option<(u64, Bytes)> {
        if self.unpersisted.is_empty() {
            return None;
        }
        Some((self.unpersisted_offset, self.unpersisted.split().freeze()))
    }

    pub fn received_bytes(&self) -> u64 {
        self.received
    }

    pub fn delivered_bytes(&self) -> u64 {
        self.delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::request::DataRequest;
    use http::HeaderValue;

    fn request(range: Option<ByteRange>) -> CachableRequest {
        let data_request = range.map(DataRequest::from_range);
        let (loading, _rx) = LoadingRequest::new(false, data_request);
        CachableRequest::new(loading, range, range, false, CancellationToken::new())
    }

    fn partial_headers(value: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("content-range", HeaderValue::from_static(value));
        headers
    }

    #[test]
    fn bounded_request_answers_once_complete() {
        let mut req = request(Some(ByteRange::new(100, Some(199))));
        req.on_response(206, &partial_headers("bytes 100-299/1000"));

        assert!(req.ingest(&[1u8; 60]).is_none());
        let data = req.ingest(&[2u8; 140]).unwrap();

        assert_eq!(data.len(), 100);
        assert_eq!(&data[..60], &[1u8; 60]);
        assert_eq!(&data[60..], &[2u8; 40]);
        assert!(req.take_pending().is_none());
        assert_eq!(req.received_bytes(), 200);
    }

    #[test]
    fn open_request_streams_each_chunk() {
        let mut req = request(Some(ByteRange::new(10, None)));
        req.on_response(206, &partial_headers("bytes 10-99/100"));

        assert_eq!(req.ingest(&[0u8; 5]).unwrap().len(), 5);
        assert_eq!(req.ingest(&[0u8; 7]).unwrap().len(), 7);
        assert_eq!(req.delivered_bytes(), 12);
    }

    #[test]
    fn full_response_is_sliced_to_requested_window() {
        let body: Vec<u8> = (0..=255u8).collect();
        let mut req = request(Some(ByteRange::new(100, Some(149))));
        // Server ignored the Range header.
        req.on_response(200, &HeaderMap::new());

        let mut delivered = Vec::new();
        for chunk in body.chunks(64) {
            if let Some(data) = req.ingest(chunk) {
                delivered.extend_from_slice(&data);
            }
        }
        assert_eq!(delivered, &body[100..150]);

        // Everything received is still cached at its true offset.
        let (offset, raw) = req.take_unpersisted().unwrap();
        assert_eq!(offset, 0);
        assert_eq!(raw.len(), 256);
    }

    #[test]
    fn unpersisted_bytes_track_offset_across_flushes() {
        let mut req = request(Some(ByteRange::new(500, None)));
        req.on_response(206, &partial_headers("bytes 500-999/1000"));

        req.ingest(&[0u8; 10]);
        assert_eq!(req.take_unpersisted().map(|(o, b)| (o, b.len())), Some((500, 10)));

        req.ingest(&[0u8; 20]);
        assert_eq!(req.take_unpersisted().map(|(o, b)| (o, b.len())), Some((510, 20)));
        assert!(req.take_unpersisted().is_none());
        assert!(!req.should_flush());
    }

    #[test]
    fn content_information_only_request_delivers_nothing() {
        let (loading, _rx) = LoadingRequest::new(true, None);
        let mut req = CachableRequest::new(loading, None, None, false, CancellationToken::new());
        req.on_response(200, &HeaderMap::new());

        assert!(req.ingest(b"abc").is_none());
        assert_eq!(req.received_bytes(), 3);
    }
}
