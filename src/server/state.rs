use crate::{
    cache::{
        manager::{CACHE_DIR_NAME, VideoCacheManager},
        settings::{CacheConfigStore, SETTINGS_FILE_NAME},
    },
    config::Config,
    error::Result,
    loader::transport::{HttpTransport, Transport},
    server::items::PlayerItemRegistry,
};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<Config>,
    /// On-disk cache and its sweep worker
    pub cache: VideoCacheManager,
    /// Origin transport shared by every player item
    pub transport: Arc<dyn Transport>,
    /// Player items by media URL
    pub items: PlayerItemRegistry,
    pub started_at: Instant,
    /// Prometheus render handle, when the recorder is installed
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    /// Create state with the default reqwest transport
    pub fn new(config: Config) -> Result<Self> {
        let transport = HttpTransport::with_defaults()?;
        Self::with_transport(config, Arc::new(transport))
    }

    /// Create state around a caller-supplied transport
    pub fn with_transport(config: Config, transport: Arc<dyn Transport>) -> Result<Self> {
        // Defaults, then the settings file, then environment overrides.
        let store = CacheConfigStore::new(config.cache_root.join(SETTINGS_FILE_NAME));
        let mut cache_config = store.load();
        cache_config.apply(&config.cache_overrides);

        let cache = VideoCacheManager::new(
            config.cache_root.join(CACHE_DIR_NAME),
            cache_config,
            Some(store),
        )?;
        info!("Cache configuration: {:?}", cache.config());

        let items = PlayerItemRegistry::new(Duration::from_secs(config.item_ttl_secs));

        Ok(Self {
            config: Arc::new(config),
            cache,
            transport,
            items,
            started_at: Instant::now(),
            metrics: crate::metrics::init(),
        })
    }
}
