//! Range-aware on-disk media cache.
//!
//! A player's loading requests (content information and byte ranges) are answered from
//! a local cache file when the bytes are there and from the origin otherwise. Fetched
//! bytes are written back, the set of cached intervals is persisted next to the file,
//! and a background sweeper keeps the cache within its age, count and size budget.
//!
//! The [`server`] module exposes the same machinery as a local HTTP caching proxy.

pub mod cache;
pub mod config;
pub mod error;
pub mod http_retry;
pub mod loader;
pub mod metrics;
pub mod player_item;
pub mod server;

pub use error::{CacheError, Result};
pub use player_item::CachingPlayerItem;
