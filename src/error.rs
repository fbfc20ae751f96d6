//! Crate-wide error type and its HTTP mapping.

use axum::{
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use std::io;
use tracing::{error, warn};

use crate::loader::transport::TransportError;

/// Result alias used across the crate.
pub type Result<T, E = CacheError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// The origin answered with a MIME type the player cannot decode.
    #[error("unsupported content type '{mime_type}' for {url}")]
    UnsupportedFormat { url: String, mime_type: String },

    /// Network fetch failed.
    #[error("network error: {0}")]
    Network(#[from] TransportError),

    /// Cache file I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Sidecar or settings file could not be (de)serialized.
    #[error("metadata error: {0}")]
    Metadata(#[from] serde_json::Error),

    /// Requested range starts at or past the end of a resource of `total` bytes.
    #[error("range not satisfiable: resource has {total} bytes")]
    InvalidRange { total: u64 },

    /// Media URL rejected by validation.
    #[error("invalid origin: {0}")]
    InvalidOrigin(String),

    /// Consumer cancelled the loading request.
    #[error("loading request cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl CacheError {
    /// HTTP status this error maps to.
    pub fn status(&self) -> StatusCode {
        match self {
            CacheError::UnsupportedFormat { .. } => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            CacheError::Network(TransportError::Status(code)) => {
                StatusCode::from_u16(*code).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            CacheError::Network(_) => StatusCode::BAD_GATEWAY,
            CacheError::InvalidRange { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
            CacheError::InvalidOrigin(_) => StatusCode::BAD_REQUEST,
            CacheError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
            CacheError::Io(_) | CacheError::Metadata(_) | CacheError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for CacheError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("Request failed: {}", self);
        } else {
            warn!("Request rejected: {}", self);
        }
        let body = format!("{}\n", self);
        match self {
            CacheError::InvalidRange { total } => (
                status,
                [(header::CONTENT_RANGE, format!("bytes */{}", total))],
                body,
            )
                .into_response(),
            _ => (status, body).into_response(),
        }
    }
}
