//! `GET|HEAD /media?url=...`: the caching proxy endpoint.
//!
//! Each HTTP request becomes one loading request on the URL's player item. HEAD asks
//! for content information only; GET asks for content information plus the range
//! named by the `Range` header (the whole resource without one).

use crate::{
    cache::{
        media_info::ContentInformation,
        range::{ByteRange, parse_range_header},
    },
    error::{CacheError, Result},
    loader::request::{DataRequest, LoadingEvent, LoadingRequest},
    metrics,
    player_item::CachingPlayerItem,
    server::{state::AppState, url_validation::validate_media_url},
};
use axum::{
    body::Body,
    extract::{Query, State},
    http::{HeaderMap, Method, StatusCode, header, response::Builder},
    response::Response,
};
use futures_util::stream;
use serde::Deserialize;
use std::io;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info};

/// Player headers passed through to the origin
const FORWARDED_HEADERS: [header::HeaderName; 2] = [header::AUTHORIZATION, header::COOKIE];

#[derive(Debug, Deserialize)]
pub struct MediaParams {
    url: String,
}

/// Cancels the loading request if the response is abandoned before it finishes
struct CancelOnDrop {
    item: Arc<CachingPlayerItem>,
    request: Arc<LoadingRequest>,
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if !self.request.is_finished() {
            debug!(
                "Client went away; cancelling loading request {}",
                self.request.id()
            );
            self.item.cancel(&self.request);
        }
    }
}

struct MediaBody {
    events: UnboundedReceiver<LoadingEvent>,
    _guard: CancelOnDrop,
    done: bool,
}

pub async fn serve_media(
    method: Method,
    Query(params): Query<MediaParams>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response> {
    let start = Instant::now();
    let url = validate_media_url(&params.url, state.config.allow_private_origins)?;

    let item = state.items.get_or_create(&url, || {
        CachingPlayerItem::new(
            url.clone(),
            origin_headers(&headers),
            &state.cache,
            Arc::clone(&state.transport),
        )
    })?;

    let result = if method == Method::HEAD {
        info!("HEAD {}", url);
        serve_head(item).await
    } else {
        serve_get(item, &headers).await
    };

    let status = match &result {
        Ok(response) => response.status(),
        Err(e) => e.status(),
    };
    metrics::record_request("media", status.as_u16());
    metrics::record_duration("media", start);
    result
}

fn origin_headers(headers: &HeaderMap) -> HeaderMap {
    let mut forwarded = HeaderMap::new();
    for name in FORWARDED_HEADERS {
        if let Some(value) = headers.get(&name) {
            forwarded.insert(name, value.clone());
        }
    }
    forwarded
}

async fn serve_head(item: Arc<CachingPlayerItem>) -> Result<Response> {
    let (request, mut events) = LoadingRequest::new(true, None);
    let _guard = CancelOnDrop {
        item: Arc::clone(&item),
        request: Arc::clone(&request),
    };
    item.load(request);

    let info = await_content_information(&mut events).await?;
    let mut builder = media_headers(Response::builder().status(StatusCode::OK), &info);
    if let Some(length) = info.content_length {
        builder = builder.header(header::CONTENT_LENGTH, length);
    }
    builder
        .body(Body::empty())
        .map_err(|e| CacheError::Internal(e.to_string()))
}

async fn serve_get(item: Arc<CachingPlayerItem>, headers: &HeaderMap) -> Result<Response> {
    // Malformed or multi-range headers are ignored and the whole resource is served.
    let requested = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_range_header);

    // With the length known, an end past the last byte is pinned to it.
    let requested = match (requested, item.resource().content_length()) {
        (Some(range), Some(total)) if range.start >= total => {
            return Err(CacheError::InvalidRange { total });
        }
        (Some(range), Some(total)) => Some(clamp_to_length(range, total)),
        (requested, _) => requested,
    };

    let data_request = requested
        .map(DataRequest::from_range)
        .unwrap_or_else(|| DataRequest::to_end(0));
    debug!(
        "GET {} offset={} length={:?}",
        item.original_url(),
        data_request.requested_offset,
        requested.and_then(|r| r.len())
    );

    let (request, mut events) = LoadingRequest::new(true, Some(data_request));
    let guard = CancelOnDrop {
        item: Arc::clone(&item),
        request: Arc::clone(&request),
    };
    item.load(request);

    let info = await_content_information(&mut events).await?;
    let builder = media_headers(Response::builder(), &info);
    let builder = match (requested, info.content_length) {
        (Some(range), Some(total)) => {
            if range.start >= total {
                return Err(CacheError::InvalidRange { total });
            }
            let end = range.end.map_or(total - 1, |end| end.min(total - 1));
            builder
                .status(StatusCode::PARTIAL_CONTENT)
                .header(
                    header::CONTENT_RANGE,
                    format!("bytes {}-{}/{}", range.start, end, total),
                )
                .header(header::CONTENT_LENGTH, end - range.start + 1)
        }
        (Some(range), None) => match range.end {
            Some(end) => builder
                .status(StatusCode::PARTIAL_CONTENT)
                .header(
                    header::CONTENT_RANGE,
                    format!("bytes {}-{}/*", range.start, end),
                )
                .header(
                    header::CONTENT_LENGTH,
                    end.saturating_sub(range.start).saturating_add(1),
                ),
            None => builder.status(StatusCode::OK),
        },
        (None, Some(total)) => builder
            .status(StatusCode::OK)
            .header(header::CONTENT_LENGTH, total),
        (None, None) => builder.status(StatusCode::OK),
    };

    let body = MediaBody {
        events,
        _guard: guard,
        done: false,
    };
    builder
        .body(Body::from_stream(stream::unfold(body, next_chunk)))
        .map_err(|e| CacheError::Internal(e.to_string()))
}

fn media_headers(builder: Builder, info: &ContentInformation) -> Builder {
    let builder = builder.header(header::ACCEPT_RANGES, "bytes");
    match &info.content_type {
        Some(content_type) => builder.header(header::CONTENT_TYPE, content_type.as_str()),
        None => builder,
    }
}

/// `range` with an explicit end pinned to `total - 1`. Callers ensure `range.start < total`.
fn clamp_to_length(range: ByteRange, total: u64) -> ByteRange {
    ByteRange::new(range.start, range.end.map(|end| end.min(total - 1)))
}

/// Wait for the content information that precedes any data.
async fn await_content_information(
    events: &mut UnboundedReceiver<LoadingEvent>,
) -> Result<ContentInformation> {
    match events.recv().await {
        Some(LoadingEvent::ContentInformation(info)) => Ok(info),
        Some(LoadingEvent::Finished(Err(e))) => Err(e),
        // Settled or dropped before answering: the request was cancelled under us.
        Some(LoadingEvent::Finished(Ok(()))) | None => Err(CacheError::Cancelled),
        Some(LoadingEvent::Data(_)) => Err(CacheError::Internal(
            "loader sent data before content information".to_string(),
        )),
    }
}

async fn next_chunk(mut body: MediaBody) -> Option<(io::Result<bytes::Bytes>, MediaBody)> {
    if body.done {
        return None;
    }
    loop {
        match body.events.recv().await {
            Some(LoadingEvent::Data(bytes)) => return Some((Ok(bytes), body)),
            Some(LoadingEvent::ContentInformation(_)) => continue,
            Some(LoadingEvent::Finished(Ok(()))) | None => return None,
            Some(LoadingEvent::Finished(Err(e))) => {
                // Headers are already sent; abort the body so the player sees a short read.
                body.done = true;
                return Some((Err(io::Error::other(e.to_string())), body));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn request_closed_before_answer_is_cancelled() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(LoadingEvent::Finished(Ok(()))).unwrap();
        assert!(matches!(
            await_content_information(&mut rx).await,
            Err(CacheError::Cancelled)
        ));

        drop(tx);
        assert!(matches!(
            await_content_information(&mut rx).await,
            Err(CacheError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn data_before_content_information_is_internal() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(LoadingEvent::Data(bytes::Bytes::from_static(b"x"))).unwrap();
        assert!(matches!(
            await_content_information(&mut rx).await,
            Err(CacheError::Internal(_))
        ));
    }

    #[test]
    fn oversized_end_is_pinned_to_last_byte() {
        let range = clamp_to_length(ByteRange::new(5, Some(u64::MAX)), 1000);
        assert_eq!(range, ByteRange::new(5, Some(999)));
        assert_eq!(
            clamp_to_length(ByteRange::new(5, None), 1000),
            ByteRange::new(5, None)
        );
    }
}
