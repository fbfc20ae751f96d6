//! Cache-aware playable item for one remote URL.

use http::HeaderMap;
use sha2::{Digest, Sha256};
use std::fmt::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, error};
use url::Url;

use crate::cache::manager::VideoCacheManager;
use crate::cache::resource::CachedResource;
use crate::error::{CacheError, Result};
use crate::loader::delegate::ResourceLoader;
use crate::loader::request::LoadingRequest;
use crate::loader::transport::Transport;

/// Prefix marking a URL as routed through the cache.
pub const CACHE_SCHEME_PREFIX: &str = "rangecache-";

const MAX_EXTENSION_LEN: usize = 8;

/// Cache file name for `url`: hex SHA-256 of the URL plus its path extension, if the
/// extension looks like one.
pub fn cache_file_name(url: &Url) -> String {
    let digest = Sha256::digest(url.as_str().as_bytes());
    let mut name = String::with_capacity(digest.len() * 2 + MAX_EXTENSION_LEN + 1);
    for byte in digest {
        let _ = write!(name, "{:02x}", byte);
    }

    let extension = Path::new(url.path())
        .extension()
        .and_then(|ext| ext.to_str())
        .filter(|ext| {
            !ext.is_empty()
                && ext.len() <= MAX_EXTENSION_LEN
                && ext.chars().all(|c| c.is_ascii_alphanumeric())
        });
    if let Some(ext) = extension {
        name.push('.');
        name.push_str(ext);
    }
    name
}

/// `https://host/a.mp4` becomes `rangecache-https://host/a.mp4`.
pub fn cache_url(url: &Url) -> Result<Url> {
    let substituted = format!("{}{}", CACHE_SCHEME_PREFIX, url.as_str());
    Url::parse(&substituted)
        .map_err(|e| CacheError::Internal(format!("cannot build cache URL for {}: {}", url, e)))
}

/// Inverse of [`cache_url`]. `None` if `cache_url` was not produced by it.
pub fn original_url(cache_url: &Url) -> Option<Url> {
    let original = cache_url.as_str().strip_prefix(CACHE_SCHEME_PREFIX)?;
    Url::parse(original).ok()
}

pub struct CachingPlayerItem {
    url: Url,
    cache_url: Url,
    loader: Arc<ResourceLoader>,
    last_error: Arc<Mutex<Option<String>>>,
}

impl CachingPlayerItem {
    /// Bind `url` to its cache file under `manager` and wire up a loader.
    ///
    /// `headers` go out with every origin request. Triggers a background sweep when
    /// auto-clean is enabled.
    pub fn new(
        url: Url,
        headers: HeaderMap,
        manager: &VideoCacheManager,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        let cache_url = cache_url(&url)?;
        let path = manager.cache_dir().join(cache_file_name(&url));
        let resource = manager.open_resource(&url, &path)?;

        let last_error = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&last_error);
        let failed_url = url.clone();
        let loader = ResourceLoader::new(url.clone(), headers, resource, transport)
            .with_error_handler(move |e| {
                error!("Playback of {} failed: {}", failed_url, e);
                *sink.lock().unwrap_or_else(|p| p.into_inner()) = Some(e.to_string());
            });

        if manager.config().auto_clean_cache {
            // Fire and forget; the sweep logs its own outcome.
            drop(manager.clean_cache());
        }

        debug!("Player item for {} cached at {}", url, path.display());
        Ok(Self {
            url,
            cache_url,
            loader: Arc::new(loader),
            last_error,
        })
    }

    pub fn original_url(&self) -> &Url {
        &self.url
    }

    pub fn cache_url(&self) -> &Url {
        &self.cache_url
    }

    pub fn resource(&self) -> &Arc<CachedResource> {
        self.loader.resource()
    }

    pub fn loader(&self) -> &Arc<ResourceLoader> {
        &self.loader
    }

    /// See [`ResourceLoader::load`].
    pub fn load(&self, request: Arc<LoadingRequest>) -> bool {
        self.loader.load(request)
    }

    pub fn cancel(&self, request: &LoadingRequest) {
        self.loader.cancel(request);
    }

    /// Message of the most recent playback error reported by the loader.
    pub fn last_error(&self) -> Option<String> {
        self.last_error
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}

impl Drop for CachingPlayerItem {
    fn drop(&mut self) {
        self.loader.cancel_all();
    }
}
