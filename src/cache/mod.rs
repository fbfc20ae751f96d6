//! On-disk media cache: files, metadata sidecars and eviction.

pub mod file_handle;
pub mod manager;
pub mod media_info;
pub mod open_files;
pub mod range;
pub mod resource;
pub mod settings;

pub use manager::{SweepReport, VideoCacheManager};
pub use media_info::{ContentInformation, MediaInfo};
pub use resource::CachedResource;
pub use settings::{CacheConfigStore, CacheConfigUpdate, CacheConfiguration};
