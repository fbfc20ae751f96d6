//! One remote resource bound to its cache file and metadata.

use bytes::Bytes;
use http::HeaderMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};
use url::Url;

use super::file_handle::MediaFileHandle;
use super::media_info::{ContentInformation, MediaInfo, sidecar_path};
use super::open_files::OpenFileRegistry;
use crate::error::Result;

/// Smallest cached prefix worth answering before topping up from the network.
pub const MIN_CACHED_PREFIX_BYTES: u64 = 3_000_000;

#[derive(Debug)]
pub struct CachedResource {
    url: Url,
    file: MediaFileHandle,
    // Guards interval-set mutation and the write that precedes it, so concurrent
    // requests for this resource record their ranges one at a time.
    media_info: Mutex<Option<MediaInfo>>,
}

impl CachedResource {
    /// Open the cache file at `path` and load its sidecar, if one exists.
    ///
    /// An unreadable sidecar is logged and ignored: the resource then behaves like a
    /// fresh cache miss and the sidecar is rewritten on the next response.
    pub fn open(url: Url, path: impl Into<PathBuf>, registry: OpenFileRegistry) -> Result<Self> {
        let path = path.into();
        let file = MediaFileHandle::open(&path, registry)?;

        let sidecar = sidecar_path(&path);
        let media_info = if sidecar.exists() {
            match MediaInfo::load(&sidecar) {
                Ok(info) => {
                    debug!(
                        "Loaded cache metadata for {} ({} bytes cached)",
                        url,
                        info.loaded_bytes()
                    );
                    Some(info)
                }
                Err(e) => {
                    warn!("Discarding unreadable cache metadata {}: {}", sidecar.display(), e);
                    None
                }
            }
        } else {
            None
        };

        Ok(Self {
            url,
            file,
            media_info: Mutex::new(media_info),
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    fn info(&self) -> MutexGuard<'_, Option<MediaInfo>> {
        self.media_info.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Record content information from the first successful origin response.
    /// Later responses leave the stored metadata untouched.
    pub fn on_response_received(&self, status: u16, headers: &HeaderMap) {
        if !(status == 200 || status == 206) {
            return;
        }

        let mut guard = self.info();
        if guard.is_some() {
            return;
        }

        let content = ContentInformation::from_response(status, headers);
        let info = MediaInfo::new(sidecar_path(self.file.path()), &content);
        if let Err(e) = info.save_to_file() {
            warn!("Failed to persist cache metadata for {}: {}", self.url, e);
        }
        info!(
            "Cached content information for {} (length={:?}, type={:?})",
            self.url, info.expected_content_length, info.mime_type
        );
        *guard = Some(info);
    }

    /// Content information replayed from cached metadata, shaped exactly like the
    /// answer a live fetch would produce.
    pub fn content_information(&self) -> Option<ContentInformation> {
        self.info().as_ref().map(|info| ContentInformation {
            content_length: info.expected_content_length,
            content_type: info.mime_type.clone(),
            is_byte_range_access_supported: info.supports_byte_range_access,
            header_fields: info.header_fields.clone(),
        })
    }

    pub fn content_length(&self) -> Option<u64> {
        self.info().as_ref().and_then(|info| info.expected_content_length)
    }

    pub fn supports_byte_range_access(&self) -> bool {
        self.info()
            .as_ref()
            .is_some_and(|info| info.supports_byte_range_access)
    }

    /// Persist bytes received from the network at `offset`.
    ///
    /// Best effort: failures are logged and the interval is not recorded, so the range
    /// simply stays a cache miss.
    pub fn write_data(&self, data: &[u8], offset: u64) {
        if data.is_empty() {
            return;
        }

        let mut guard = self.info();
        let Some(info) = guard.as_mut() else {
            warn!(
                "Dropping {} bytes at {} for {}: data arrived before content information",
                data.len(),
                offset,
                self.url
            );
            return;
        };

        if let Err(e) = self.file.write(data, offset) {
            warn!(
                "Failed to write {} bytes at {} to {}: {}",
                data.len(),
                offset,
                self.file.path().display(),
                e
            );
            return;
        }

        info.add_data_range((offset, offset + data.len() as u64 - 1));
        if let Err(e) = info.save_to_file() {
            warn!("Failed to persist cache metadata for {}: {}", self.url, e);
        }
    }

    /// Whether `[from, to]` lies inside a single cached interval.
    pub fn can_respond_with_data(&self, from: u64, to: u64) -> bool {
        self.info()
            .as_ref()
            .is_some_and(|info| info.covering_range(from, to).is_some())
    }

    /// The bytes `[from, to]`, only when all of them are cached.
    pub fn request_data(&self, from: u64, to: u64) -> Option<Bytes> {
        if to < from || !self.can_respond_with_data(from, to) {
            return None;
        }
        self.file.read_data(from, (to - from + 1) as usize)
    }

    /// Last byte of the cached prefix of `[from, to]`, when that prefix is at least
    /// [`MIN_CACHED_PREFIX_BYTES`] long.
    pub fn cached_prefix_end(&self, from: u64, to: u64) -> Option<u64> {
        if to < from {
            return None;
        }

        let (_, cached_end) = self.info().as_ref()?.range_containing(from)?;
        let prefix_end = cached_end.min(to);
        (prefix_end - from + 1 >= MIN_CACHED_PREFIX_BYTES).then_some(prefix_end)
    }

    /// The cached prefix of `[from, to]`, when it is at least
    /// [`MIN_CACHED_PREFIX_BYTES`] long.
    pub fn request_beginning_of_data(&self, from: u64, to: u64) -> Option<Bytes> {
        let prefix_end = self.cached_prefix_end(from, to)?;
        self.file.read_data(from, (prefix_end - from + 1) as usize)
    }

    /// Snapshot of the cached intervals.
    pub fn loaded_data_ranges(&self) -> Vec<(u64, u64)> {
        self.info()
            .as_ref()
            .map(|info| info.loaded_data_ranges().to_vec())
            .unwrap_or_default()
    }
}
