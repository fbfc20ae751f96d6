//! Answers loading requests for one resource, from cache where possible and from
//! the network otherwise.
//!
//! Each network fetch is a [`CachableRequest`] driven by its own task. Two maps track
//! the active set: loading request to task, and task to request state. Removing a task
//! from the latter is the single point of completion, so every request is completed
//! exactly once no matter how cancellation and network callbacks interleave.
//!
//! Disk reads and cache writes run on the blocking pool. Cached bytes reach the
//! consumer in pieces of at most [`CACHE_READ_CHUNK`], so a large prefix never sits
//! in memory or on a runtime worker all at once.

use bytes::Bytes;
use dashmap::DashMap;
use futures_util::StreamExt;
use http::HeaderMap;
use std::fmt;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use super::cachable::{CachableRequest, TaskId};
use super::request::{LoadingRequest, LoadingRequestId};
use super::transport::{Transport, TransportError, TransportRequest};
use crate::cache::media_info::ContentInformation;
use crate::cache::range::ByteRange;
use crate::cache::resource::CachedResource;
use crate::error::CacheError;
use crate::metrics;

pub type ErrorHandler = Arc<dyn Fn(&CacheError) + Send + Sync>;

/// Largest piece of cached data read and delivered at once.
pub const CACHE_READ_CHUNK: u64 = 1024 * 1024;

/// Outcome of trying to answer a request from disk.
enum CacheLookup {
    /// Fully answered from metadata and finished.
    Hit,
    /// `[from, disk_end]` is on disk. `remaining`, when set, must come from the network.
    Disk {
        from: u64,
        disk_end: u64,
        remaining: Option<ByteRange>,
    },
    /// Nothing usable was cached.
    Miss,
}

pub struct ResourceLoader {
    url: Url,
    headers: HeaderMap,
    resource: Arc<CachedResource>,
    transport: Arc<dyn Transport>,
    tasks_by_request: DashMap<LoadingRequestId, (TaskId, CancellationToken)>,
    requests_by_task: DashMap<TaskId, Arc<Mutex<CachableRequest>>>,
    next_task_id: AtomicU64,
    error_handler: Option<ErrorHandler>,
}

impl fmt::Debug for ResourceLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceLoader")
            .field("url", &self.url.as_str())
            .field("active", &self.requests_by_task.len())
            .finish_non_exhaustive()
    }
}

impl ResourceLoader {
    /// `headers` are sent with every origin request.
    pub fn new(
        url: Url,
        headers: HeaderMap,
        resource: Arc<CachedResource>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            url,
            headers,
            resource,
            transport,
            tasks_by_request: DashMap::new(),
            requests_by_task: DashMap::new(),
            next_task_id: AtomicU64::new(1),
            error_handler: None,
        }
    }

    /// Called once for every request rejected with an error of our own making
    /// (currently unsupported formats).
    pub fn with_error_handler(
        mut self,
        handler: impl Fn(&CacheError) + Send + Sync + 'static,
    ) -> Self {
        self.error_handler = Some(Arc::new(handler));
        self
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn resource(&self) -> &Arc<CachedResource> {
        &self.resource
    }

    /// Network requests still in flight.
    pub fn active_request_count(&self) -> usize {
        self.requests_by_task.len()
    }

    /// Start answering `request`. Returns `true` when the answer needs the network,
    /// `false` when the cache alone settles it. Cached bytes are delivered
    /// asynchronously either way.
    ///
    /// Must be called from within a tokio runtime.
    pub fn load(self: &Arc<Self>, request: Arc<LoadingRequest>) -> bool {
        if request.is_finished() {
            return false;
        }

        match self.respond_from_cache(&request) {
            CacheLookup::Hit => false,
            CacheLookup::Disk {
                from,
                disk_end,
                remaining,
            } => {
                let loader = Arc::clone(self);
                tokio::spawn(async move {
                    loader.serve_from_disk(request, from, disk_end, remaining).await;
                });
                remaining.is_some()
            }
            CacheLookup::Miss => {
                let range = request.data_request().map(|d| d.byte_range());
                self.start_network_request(request, range, false);
                true
            }
        }
    }

    /// Cancel `request`. Its network task stops, received bytes are kept, and no
    /// finish event is sent.
    pub fn cancel(&self, request: &LoadingRequest) {
        let was_open = request.mark_cancelled();
        let task = self
            .tasks_by_request
            .get(&request.id())
            .map(|entry| entry.value().clone());

        if let Some((task_id, token)) = task {
            debug!(
                "Cancelling loading request {} (task {}) for {}",
                request.id(),
                task_id,
                self.url
            );
            token.cancel();
        } else if was_open {
            debug!("Cancelled idle loading request {} for {}", request.id(), self.url);
        }
    }

    /// Cancel every request still in flight.
    pub fn cancel_all(&self) {
        let tokens: Vec<CancellationToken> = self
            .tasks_by_request
            .iter()
            .map(|entry| entry.value().1.clone())
            .collect();
        for token in tokens {
            token.cancel();
        }
    }

    fn respond_from_cache(&self, request: &LoadingRequest) -> CacheLookup {
        let cached_info = self.resource.content_information();

        // Content information can only be answered from disk if we have it.
        let content = if request.content_information_requested() {
            match cached_info {
                Some(info) => Some(info),
                None => {
                    metrics::record_lookup("miss");
                    return CacheLookup::Miss;
                }
            }
        } else {
            None
        };

        let Some(data_request) = request.data_request().copied() else {
            if let Some(info) = content {
                request.respond_with_content_information(info);
                request.finish_loading();
                metrics::record_lookup("hit");
                return CacheLookup::Hit;
            }
            // Nothing asked for; settle it.
            request.finish_loading();
            return CacheLookup::Hit;
        };

        let Some((from, to)) = data_request.bounds(self.resource.content_length()) else {
            metrics::record_lookup("miss");
            return CacheLookup::Miss;
        };

        if self.resource.can_respond_with_data(from, to) {
            debug!("Cache hit for {} bytes {}-{}", self.url, from, to);
            Self::respond_with_content(request, content);
            metrics::record_lookup("hit");
            return CacheLookup::Disk {
                from,
                disk_end: to,
                remaining: None,
            };
        }

        if let Some(disk_end) = self.resource.cached_prefix_end(from, to) {
            let next = disk_end + 1;
            debug!(
                "Partial cache hit for {}: serving {}-{} from disk, fetching from {}",
                self.url, from, disk_end, next
            );
            Self::respond_with_content(request, content);
            metrics::record_lookup("partial");

            let remaining = if data_request.requests_all_data_to_end_of_resource {
                ByteRange::new(next, None)
            } else {
                ByteRange::new(next, Some(to))
            };
            return CacheLookup::Disk {
                from,
                disk_end,
                remaining: Some(remaining),
            };
        }

        metrics::record_lookup("miss");
        CacheLookup::Miss
    }

    /// Deliver `[from, disk_end]` from the cache file, then finish or hand `remaining`
    /// to the network. A failed read hands everything not yet delivered to the network.
    async fn serve_from_disk(
        self: Arc<Self>,
        request: Arc<LoadingRequest>,
        from: u64,
        disk_end: u64,
        remaining: Option<ByteRange>,
    ) {
        let mut offset = from;
        while offset <= disk_end {
            if request.is_finished() {
                return;
            }

            let end = disk_end.min(offset.saturating_add(CACHE_READ_CHUNK - 1));
            let resource = Arc::clone(&self.resource);
            let read =
                tokio::task::spawn_blocking(move || resource.request_data(offset, end)).await;

            match read {
                Ok(Some(data)) => {
                    metrics::record_bytes("cache", data.len() as u64);
                    request.respond_with_data(data);
                }
                Ok(None) | Err(_) => {
                    let tail_end = remaining.map_or(Some(disk_end), |r| r.end);
                    warn!(
                        "Cache read of {} bytes {}-{} failed; fetching from origin",
                        self.url, offset, end
                    );
                    self.start_network_request(
                        request,
                        Some(ByteRange::new(offset, tail_end)),
                        true,
                    );
                    return;
                }
            }
            offset = end + 1;
        }

        if request.is_finished() {
            return;
        }
        match remaining {
            None => {
                request.finish_loading();
            }
            Some(range) => self.start_network_request(request, Some(range), true),
        }
    }

    fn respond_with_content(request: &LoadingRequest, content: Option<ContentInformation>) {
        if let Some(info) = content {
            request.respond_with_content_information(info);
        }
    }

    fn start_network_request(
        self: &Arc<Self>,
        request: Arc<LoadingRequest>,
        range: Option<ByteRange>,
        content_fulfilled: bool,
    ) {
        let task_id = self.next_task_id.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let state = CachableRequest::new(
            Arc::clone(&request),
            range,
            range,
            content_fulfilled,
            cancel.clone(),
        );

        self.requests_by_task
            .insert(task_id, Arc::new(Mutex::new(state)));
        self.tasks_by_request
            .insert(request.id(), (task_id, cancel.clone()));

        // Cancelled between the finished check in `load` and registration.
        if request.is_cancelled() {
            cancel.cancel();
        }

        info!(
            "Fetching {} ({}) for loading request {}",
            self.url,
            range
                .map(|r| r.to_header_value())
                .unwrap_or_else(|| "full".to_string()),
            request.id()
        );

        let transport_request = TransportRequest {
            url: self.url.clone(),
            headers: self.headers.clone(),
            range,
        };
        let loader = Arc::clone(self);
        tokio::spawn(async move {
            loader.run(task_id, transport_request, cancel).await;
        });
    }

    async fn run(
        self: Arc<Self>,
        task_id: TaskId,
        transport_request: TransportRequest,
        cancel: CancellationToken,
    ) {
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.complete(task_id, Some(TransportError::Cancelled)).await;
                return;
            }
            result = self.transport.fetch(transport_request) => result,
        };

        let mut response = match response {
            Ok(response) => response,
            Err(e) => {
                self.complete(task_id, Some(e)).await;
                return;
            }
        };

        if let ControlFlow::Break(outcome) =
            self.did_receive_response(task_id, response.status, &response.headers)
        {
            self.complete(task_id, outcome).await;
            return;
        }

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(TransportError::Cancelled),
                chunk = response.body.next() => Ok(chunk),
            };

            match next {
                Ok(Some(Ok(chunk))) => {
                    if let Some((offset, bytes)) = self.did_receive_data(task_id, chunk) {
                        self.persist(offset, bytes).await;
                    }
                }
                Ok(Some(Err(e))) | Err(e) => {
                    self.complete(task_id, Some(e)).await;
                    return;
                }
                Ok(None) => {
                    self.complete(task_id, None).await;
                    return;
                }
            }
        }
    }

    fn state(&self, task_id: TaskId) -> Option<Arc<Mutex<CachableRequest>>> {
        self.requests_by_task
            .get(&task_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    fn lock(state: &Mutex<CachableRequest>) -> MutexGuard<'_, CachableRequest> {
        state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn did_receive_response(
        &self,
        task_id: TaskId,
        status: u16,
        headers: &HeaderMap,
    ) -> ControlFlow<Option<TransportError>> {
        if !(200..300).contains(&status) {
            return ControlFlow::Break(Some(TransportError::Status(status)));
        }
        let Some(state) = self.state(task_id) else {
            return ControlFlow::Break(None);
        };
        let mut state = Self::lock(&state);
        state.on_response(status, headers);
        let request = Arc::clone(state.loading_request());

        if !request.content_information_requested() || state.is_fulfilled() {
            // Data-only requests still seed metadata so their bytes can be cached.
            self.resource.on_response_received(status, headers);
            return ControlFlow::Continue(());
        }

        let content = ContentInformation::from_response(status, headers);
        if !content.is_playable() {
            let error = CacheError::UnsupportedFormat {
                url: self.url.to_string(),
                mime_type: content.content_type.clone().unwrap_or_default(),
            };
            warn!("Rejecting {}: {}", self.url, error);
            if let Some(handler) = &self.error_handler {
                handler(&error);
            }
            request.finish_loading_with_error(error);
            return ControlFlow::Break(Some(TransportError::Cancelled));
        }

        self.resource.on_response_received(status, headers);
        request.respond_with_content_information(content);
        state.set_fulfilled();

        if request.data_request().is_none() {
            request.finish_loading();
            state.cancel_token().cancel();
            return ControlFlow::Break(Some(TransportError::Cancelled));
        }
        ControlFlow::Continue(())
    }

    /// Hand the chunk's share to the consumer. Returns bytes due for the cache once
    /// enough have piled up.
    fn did_receive_data(&self, task_id: TaskId, chunk: Bytes) -> Option<(u64, Bytes)> {
        let state = self.state(task_id)?;
        let mut state = Self::lock(&state);

        if let Some(data) = state.ingest(&chunk) {
            metrics::record_bytes("network", data.len() as u64);
            state.loading_request().respond_with_data(data);
        }

        if state.should_flush() {
            state.take_unpersisted()
        } else {
            None
        }
    }

    async fn persist(&self, offset: u64, bytes: Bytes) {
        let resource = Arc::clone(&self.resource);
        let write = tokio::task::spawn_blocking(move || resource.write_data(&bytes, offset));
        if let Err(e) = write.await {
            warn!("Cache write at {} for {} did not run: {}", offset, self.url, e);
        }
    }

    /// Settle a network task. Only the first call for a task has any effect.
    ///
    /// Received bytes are persisted before the task leaves the active set, so an
    /// idle loader has everything it fetched on disk.
    async fn complete(&self, task_id: TaskId, error: Option<TransportError>) {
        let Some(state) = self.state(task_id) else {
            return;
        };
        let keep = error.as_ref().is_none_or(TransportError::is_partial_success);
        let unpersisted = if keep {
            Self::lock(&state).take_unpersisted()
        } else {
            None
        };
        if let Some((offset, bytes)) = unpersisted {
            self.persist(offset, bytes).await;
        }

        if self.requests_by_task.remove(&task_id).is_none() {
            return;
        }
        let mut state = Self::lock(&state);
        let request = Arc::clone(state.loading_request());
        self.tasks_by_request
            .remove_if(&request.id(), |_, (task, _)| *task == task_id);

        if keep {
            if let Some(rest) = state.take_pending() {
                metrics::record_bytes("network", rest.len() as u64);
                request.respond_with_data(rest);
            }
        }

        match error {
            None => {
                debug!(
                    "Task {} for {} finished: {} bytes received, {} delivered",
                    task_id,
                    self.url,
                    state.received_bytes(),
                    state.delivered_bytes()
                );
                request.finish_loading();
            }
            Some(TransportError::Cancelled) => {
                debug!("Task {} for {} cancelled", task_id, self.url);
                request.finish_loading();
            }
            Some(e) => {
                warn!("Task {} for {} failed: {}", task_id, self.url, e);
                request.finish_loading_with_error(CacheError::Network(e));
            }
        }
    }
}
