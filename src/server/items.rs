//! Player items kept alive between proxy requests.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::debug;
use url::Url;

use crate::error::Result;
use crate::player_item::CachingPlayerItem;

/// Serde helper: SystemTime as u64 epoch seconds
mod epoch_secs {
    use serde::Serializer;
    use std::time::{SystemTime, UNIX_EPOCH};

    pub fn serialize<S>(time: &SystemTime, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let secs = time
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        serializer.serialize_u64(secs)
    }
}

struct ItemEntry {
    item: Arc<CachingPlayerItem>,
    created_at: SystemTime,
    last_accessed: SystemTime,
}

/// Snapshot of one registered item.
#[derive(Debug, Clone, Serialize)]
pub struct ItemSummary {
    pub url: String,
    pub cache_file: String,
    pub cached_bytes: u64,
    pub active_requests: usize,
    #[serde(with = "epoch_secs")]
    pub created_at: SystemTime,
    #[serde(with = "epoch_secs")]
    pub last_accessed: SystemTime,
}

/// Player items by media URL. Idle items expire after `ttl`; items with requests
/// still in flight are never expired.
#[derive(Clone)]
pub struct PlayerItemRegistry {
    items: Arc<DashMap<String, ItemEntry>>,
    ttl: Duration,
}

impl PlayerItemRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            items: Arc::new(DashMap::new()),
            ttl,
        }
    }

    /// Return the item for `url`, building it with `create` on first use.
    ///
    /// The first caller's origin headers stick to the item until it expires.
    pub fn get_or_create(
        &self,
        url: &Url,
        create: impl FnOnce() -> Result<CachingPlayerItem>,
    ) -> Result<Arc<CachingPlayerItem>> {
        let now = SystemTime::now();
        match self.items.entry(url.to_string()) {
            Entry::Occupied(mut entry) => {
                let entry = entry.get_mut();
                entry.last_accessed = now;
                Ok(Arc::clone(&entry.item))
            }
            Entry::Vacant(entry) => {
                let item = Arc::new(create()?);
                debug!("Registered player item for {}", url);
                entry.insert(ItemEntry {
                    item: Arc::clone(&item),
                    created_at: now,
                    last_accessed: now,
                });
                Ok(item)
            }
        }
    }

    pub fn get(&self, url: &Url) -> Option<Arc<CachingPlayerItem>> {
        self.items
            .get(url.as_str())
            .map(|entry| Arc::clone(&entry.item))
    }

    pub fn remove(&self, url: &Url) -> Option<Arc<CachingPlayerItem>> {
        self.items.remove(url.as_str()).map(|(_, entry)| entry.item)
    }

    /// Drop idle items past their TTL. Returns how many were removed.
    pub fn cleanup_expired(&self) -> usize {
        let now = SystemTime::now();
        let before = self.items.len();
        self.items.retain(|_, entry| {
            if entry.item.loader().active_request_count() > 0 {
                return true;
            }
            match now.duration_since(entry.last_accessed) {
                Ok(idle) => idle < self.ttl,
                Err(_) => true,
            }
        });
        before.saturating_sub(self.items.len())
    }

    pub fn summaries(&self) -> Vec<ItemSummary> {
        self.items
            .iter()
            .map(|entry| {
                let item = &entry.item;
                ItemSummary {
                    url: entry.key().clone(),
                    cache_file: item.resource().path().display().to_string(),
                    cached_bytes: item
                        .resource()
                        .loaded_data_ranges()
                        .iter()
                        .map(|(start, end)| end - start + 1)
                        .sum(),
                    active_requests: item.loader().active_request_count(),
                    created_at: entry.created_at,
                    last_accessed: entry.last_accessed,
                }
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::manager::VideoCacheManager;
    use crate::cache::settings::CacheConfiguration;
    use crate::error::CacheError;
    use crate::loader::testing::FakeTransport;
    use http::HeaderMap;

    fn create(manager: &VideoCacheManager, url: &Url) -> Result<CachingPlayerItem> {
        CachingPlayerItem::new(
            url.clone(),
            HeaderMap::new(),
            manager,
            Arc::new(FakeTransport::new(vec![0u8; 16])),
        )
    }

    fn manager(dir: &std::path::Path) -> VideoCacheManager {
        let config = CacheConfiguration {
            auto_clean_cache: false,
            ..Default::default()
        };
        VideoCacheManager::new(dir, config, None).unwrap()
    }

    #[tokio::test]
    async fn get_or_create_returns_existing_item() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        let registry = PlayerItemRegistry::new(Duration::from_secs(300));
        let url = Url::parse("https://cdn.example.com/a.mp4").unwrap();

        let first = registry.get_or_create(&url, || create(&manager, &url)).unwrap();
        let second = registry
            .get_or_create(&url, || panic!("should reuse the existing item"))
            .unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
        assert!(registry.get(&url).is_some());
    }

    #[tokio::test]
    async fn failed_creation_registers_nothing() {
        let registry = PlayerItemRegistry::new(Duration::from_secs(300));
        let url = Url::parse("https://cdn.example.com/a.mp4").unwrap();

        let result = registry.get_or_create(&url, || Err(CacheError::Internal("boom".into())));
        assert!(result.is_err());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn cleanup_expired_removes_idle_items() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        let registry = PlayerItemRegistry::new(Duration::from_millis(1));
        let url = Url::parse("https://cdn.example.com/a.mp4").unwrap();
        registry.get_or_create(&url, || create(&manager, &url)).unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(registry.cleanup_expired(), 1);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn summaries_describe_items() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        let registry = PlayerItemRegistry::new(Duration::from_secs(300));
        let url = Url::parse("https://cdn.example.com/a.mp4").unwrap();
        registry.get_or_create(&url, || create(&manager, &url)).unwrap();

        let summaries = registry.summaries();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].url, url.as_str());
        assert!(summaries[0].cache_file.ends_with(".mp4"));
        assert_eq!(summaries[0].cached_bytes, 0);

        assert!(registry.remove(&url).is_some());
        assert!(registry.remove(&url).is_none());
    }
}
