//! Consumer-side loading requests.
//!
//! A loading request asks for content information, a byte range, or both. The
//! loader answers through an event channel and finishes each request at most once.
//! A cancelled request never receives a finish event.

use bytes::Bytes;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::trace;

use crate::cache::media_info::ContentInformation;
use crate::cache::range::ByteRange;
use crate::error::CacheError;

pub type LoadingRequestId = u64;

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// The byte-range part of a loading request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataRequest {
    pub requested_offset: u64,
    /// Ignored when `requests_all_data_to_end_of_resource` is set.
    pub requested_length: u64,
    pub requests_all_data_to_end_of_resource: bool,
}

impl DataRequest {
    pub fn bounded(offset: u64, length: u64) -> Self {
        Self {
            requested_offset: offset,
            requested_length: length,
            requests_all_data_to_end_of_resource: false,
        }
    }

    pub fn to_end(offset: u64) -> Self {
        Self {
            requested_offset: offset,
            requested_length: 0,
            requests_all_data_to_end_of_resource: true,
        }
    }

    /// Build from a parsed `Range` header.
    pub fn from_range(range: ByteRange) -> Self {
        match range.len() {
            Some(len) => Self::bounded(range.start, len),
            None => Self::to_end(range.start),
        }
    }

    /// Requested range, bounded when the request is.
    pub fn byte_range(&self) -> ByteRange {
        if self.requests_all_data_to_end_of_resource || self.requested_length == 0 {
            ByteRange::new(self.requested_offset, None)
        } else {
            ByteRange::new(
                self.requested_offset,
                Some(
                    self.requested_offset
                        .saturating_add(self.requested_length - 1),
                ),
            )
        }
    }

    /// Inclusive `(from, to)` bounds, resolving "to end" against `content_length`.
    pub fn bounds(&self, content_length: Option<u64>) -> Option<(u64, u64)> {
        let from = self.requested_offset;
        let last = content_length.and_then(|len| len.checked_sub(1));
        let to = match self.byte_range().end {
            Some(end) => match last {
                Some(last) => end.min(last),
                None => end,
            },
            None => last?,
        };
        (from <= to).then_some((from, to))
    }
}

/// What the loader reports back to the consumer.
#[derive(Debug)]
pub enum LoadingEvent {
    ContentInformation(ContentInformation),
    Data(Bytes),
    Finished(Result<(), CacheError>),
}

#[derive(Debug)]
pub struct LoadingRequest {
    id: LoadingRequestId,
    content_information_requested: bool,
    data_request: Option<DataRequest>,
    delivered: AtomicU64,
    finished: AtomicBool,
    cancelled: AtomicBool,
    events: mpsc::UnboundedSender<LoadingEvent>,
}

impl LoadingRequest {
    pub fn new(
        content_information_requested: bool,
        data_request: Option<DataRequest>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<LoadingEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let request = Arc::new(Self {
            id: NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed),
            content_information_requested,
            data_request,
            delivered: AtomicU64::new(0),
            finished: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            events: tx,
        });
        (request, rx)
    }

    pub fn id(&self) -> LoadingRequestId {
        self.id
    }

    pub fn content_information_requested(&self) -> bool {
        self.content_information_requested
    }

    pub fn data_request(&self) -> Option<&DataRequest> {
        self.data_request.as_ref()
    }

    /// Bytes handed to the consumer so far.
    pub fn delivered_bytes(&self) -> u64 {
        self.delivered.load(Ordering::Acquire)
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    fn send(&self, event: LoadingEvent) {
        if self.is_finished() {
            return;
        }
        // A dropped receiver means the consumer went away; cancellation handles cleanup.
        let _ = self.events.send(event);
    }

    pub fn respond_with_content_information(&self, info: ContentInformation) {
        self.send(LoadingEvent::ContentInformation(info));
    }

    pub fn respond_with_data(&self, data: Bytes) {
        if data.is_empty() || self.is_finished() {
            return;
        }
        self.delivered
            .fetch_add(data.len() as u64, Ordering::AcqRel);
        self.send(LoadingEvent::Data(data));
    }

    /// Finish successfully. Returns `false` if the request was already finished or
    /// cancelled.
    pub fn finish_loading(&self) -> bool {
        self.finish(Ok(()))
    }

    pub fn finish_loading_with_error(&self, error: CacheError) -> bool {
        self.finish(Err(error))
    }

    fn finish(&self, result: Result<(), CacheError>) -> bool {
        if self
            .finished
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            trace!("Loading request {} already finished", self.id);
            return false;
        }
        let _ = self.events.send(LoadingEvent::Finished(result));
        true
    }

    /// Mark the request cancelled by its consumer. Also closes it, so no finish
    /// event follows. Returns `false` if it had already finished.
    pub(crate) fn mark_cancelled(&self) -> bool {
        self.cancelled.store(true, Ordering::Release);
        self.finished
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}
