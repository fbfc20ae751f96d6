//! Eviction budgets and their persisted overrides.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

use crate::error::Result;

pub const DEFAULT_MAX_CACHE_COUNT: usize = 100;
pub const DEFAULT_MAX_CACHE_SIZE_BYTES: u64 = 512_000_000;
/// 30 days.
pub const DEFAULT_MAX_CACHE_AGE_SECS: u64 = 2_592_000;

/// Name of the persisted settings file, stored next to (not inside) the cache directory
/// so the sweep never sees it.
pub const SETTINGS_FILE_NAME: &str = "video-cache-settings.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheConfiguration {
    pub max_cache_count: usize,
    pub max_cache_size_bytes: u64,
    pub max_cache_age_seconds: u64,
    pub auto_clean_cache: bool,
}

impl Default for CacheConfiguration {
    fn default() -> Self {
        Self {
            max_cache_count: DEFAULT_MAX_CACHE_COUNT,
            max_cache_size_bytes: DEFAULT_MAX_CACHE_SIZE_BYTES,
            max_cache_age_seconds: DEFAULT_MAX_CACHE_AGE_SECS,
            auto_clean_cache: true,
        }
    }
}

impl CacheConfiguration {
    pub fn max_cache_age(&self) -> Duration {
        Duration::from_secs(self.max_cache_age_seconds)
    }

    /// Apply the fields present in `update`.
    pub fn apply(&mut self, update: &CacheConfigUpdate) {
        if let Some(count) = update.max_cache_count {
            self.max_cache_count = count;
        }
        if let Some(size) = update.max_cache_size_bytes {
            self.max_cache_size_bytes = size;
        }
        if let Some(age) = update.max_cache_age_seconds {
            self.max_cache_age_seconds = age;
        }
        if let Some(auto) = update.auto_clean_cache {
            self.auto_clean_cache = auto;
        }
    }
}

/// Partial configuration change; absent fields keep their current value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheConfigUpdate {
    pub max_cache_count: Option<usize>,
    pub max_cache_size_bytes: Option<u64>,
    pub max_cache_age_seconds: Option<u64>,
    pub auto_clean_cache: Option<bool>,
}

impl CacheConfigUpdate {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

/// JSON file holding configuration overrides. Keys missing from the file read
/// through to the defaults.
#[derive(Debug, Clone)]
pub struct CacheConfigStore {
    path: PathBuf,
}

impl CacheConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the persisted configuration. Missing or unreadable files yield defaults.
    pub fn load(&self) -> CacheConfiguration {
        let raw = match fs::read(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return CacheConfiguration::default();
            }
            Err(e) => {
                warn!(
                    "Failed to read cache settings {}: {}",
                    self.path.display(),
                    e
                );
                return CacheConfiguration::default();
            }
        };

        serde_json::from_slice(&raw).unwrap_or_else(|e| {
            warn!(
                "Ignoring malformed cache settings {}: {}",
                self.path.display(),
                e
            );
            CacheConfiguration::default()
        })
    }

    pub fn save(&self, config: &CacheConfiguration) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, serde_json::to_vec_pretty(config)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_budgets() {
        let config = CacheConfiguration::default();
        assert_eq!(config.max_cache_count, 100);
        assert_eq!(config.max_cache_size_bytes, 512_000_000);
        assert_eq!(config.max_cache_age(), Duration::from_secs(30 * 24 * 60 * 60));
        assert!(config.auto_clean_cache);
    }

    #[test]
    fn missing_file_reads_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheConfigStore::new(dir.path().join(SETTINGS_FILE_NAME));
        assert_eq!(store.load(), CacheConfiguration::default());
    }

    #[test]
    fn persisted_keys_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SETTINGS_FILE_NAME);
        fs::write(&path, br#"{"maxCacheCount": 5}"#).unwrap();

        let config = CacheConfigStore::new(&path).load();
        assert_eq!(config.max_cache_count, 5);
        assert_eq!(config.max_cache_size_bytes, DEFAULT_MAX_CACHE_SIZE_BYTES);
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheConfigStore::new(dir.path().join("nested").join(SETTINGS_FILE_NAME));

        let mut config = CacheConfiguration::default();
        config.apply(&CacheConfigUpdate {
            max_cache_size_bytes: Some(1024),
            auto_clean_cache: Some(false),
            ..Default::default()
        });
        store.save(&config).unwrap();

        let loaded = store.load();
        assert_eq!(loaded.max_cache_size_bytes, 1024);
        assert!(!loaded.auto_clean_cache);
        assert_eq!(loaded.max_cache_count, DEFAULT_MAX_CACHE_COUNT);
    }

    #[test]
    fn malformed_file_reads_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SETTINGS_FILE_NAME);
        fs::write(&path, b"[]").unwrap();
        assert_eq!(CacheConfigStore::new(&path).load(), CacheConfiguration::default());
    }

    #[test]
    fn empty_update_detection() {
        assert!(CacheConfigUpdate::default().is_empty());
        assert!(
            !CacheConfigUpdate {
                max_cache_count: Some(1),
                ..Default::default()
            }
            .is_empty()
        );
    }
}
