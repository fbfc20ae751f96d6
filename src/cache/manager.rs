//! Cache directory ownership, configuration and eviction.
//!
//! Sweeps run one at a time on a dedicated thread. `clean_cache` and
//! `clean_all_cache` only enqueue work, so callers on the request path never block
//! on directory scans.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::{Arc, RwLock, Weak};
use std::thread;
use std::time::SystemTime;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};
use url::Url;

use super::media_info::{SIDECAR_SUFFIX, sidecar_path};
use super::open_files::OpenFileRegistry;
use super::resource::CachedResource;
use super::settings::{CacheConfigStore, CacheConfigUpdate, CacheConfiguration};
use crate::error::Result;
use crate::metrics;

/// Directory name under the platform cache root.
pub const CACHE_DIR_NAME: &str = "expo-video-cache";

/// Outcome of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub deleted_files: usize,
    pub freed_bytes: u64,
    pub skipped_open: usize,
    pub remaining_files: usize,
    pub remaining_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SweepKind {
    Budgeted,
    All,
}

struct SweepJob {
    kind: SweepKind,
    done: oneshot::Sender<SweepReport>,
}

/// Process-wide cache owner. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct VideoCacheManager {
    inner: Arc<Inner>,
}

struct Inner {
    cache_dir: PathBuf,
    config: Arc<RwLock<CacheConfiguration>>,
    store: Option<CacheConfigStore>,
    open_files: OpenFileRegistry,
    resources: DashMap<PathBuf, Weak<CachedResource>>,
    sweeper: mpsc::Sender<SweepJob>,
}

impl VideoCacheManager {
    /// Create a manager for `cache_dir` and start its sweep thread.
    pub fn new(
        cache_dir: impl Into<PathBuf>,
        config: CacheConfiguration,
        store: Option<CacheConfigStore>,
    ) -> Result<Self> {
        let cache_dir = cache_dir.into();
        fs::create_dir_all(&cache_dir)?;

        let config = Arc::new(RwLock::new(config));
        let open_files = OpenFileRegistry::new();
        let (tx, rx) = mpsc::channel::<SweepJob>();

        let worker = Sweeper {
            cache_dir: cache_dir.clone(),
            config: Arc::clone(&config),
            open_files: open_files.clone(),
        };
        thread::Builder::new()
            .name("video-cache-sweeper".to_string())
            .spawn(move || worker.run(rx))?;

        info!("Video cache ready at {}", cache_dir.display());

        Ok(Self {
            inner: Arc::new(Inner {
                cache_dir,
                config,
                store,
                open_files,
                resources: DashMap::new(),
                sweeper: tx,
            }),
        })
    }

    /// Create a manager whose configuration is read through the settings file.
    pub fn with_store(cache_dir: impl Into<PathBuf>, store: CacheConfigStore) -> Result<Self> {
        let config = store.load();
        Self::new(cache_dir, config, Some(store))
    }

    pub fn cache_dir(&self) -> &Path {
        &self.inner.cache_dir
    }

    pub fn open_files(&self) -> &OpenFileRegistry {
        &self.inner.open_files
    }

    pub fn config(&self) -> CacheConfiguration {
        self.inner
            .config
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Apply a partial update and persist it when a settings store is attached.
    pub fn update_config(&self, update: &CacheConfigUpdate) -> Result<CacheConfiguration> {
        let updated = {
            let mut config = self
                .inner
                .config
                .write()
                .unwrap_or_else(|p| p.into_inner());
            config.apply(update);
            config.clone()
        };

        if let Some(store) = &self.inner.store {
            store.save(&updated)?;
        }
        info!("Cache configuration updated: {:?}", updated);
        Ok(updated)
    }

    /// The shared resource for `path`, opening it if no live one exists.
    ///
    /// Only one `CachedResource` (and therefore one file handle and one interval set)
    /// exists per path at a time.
    pub fn open_resource(&self, url: &Url, path: &Path) -> Result<Arc<CachedResource>> {
        match self.inner.resources.entry(path.to_path_buf()) {
            Entry::Occupied(mut entry) => {
                if let Some(existing) = entry.get().upgrade() {
                    return Ok(existing);
                }
                let resource = Arc::new(CachedResource::open(
                    url.clone(),
                    path,
                    self.inner.open_files.clone(),
                )?);
                entry.insert(Arc::downgrade(&resource));
                Ok(resource)
            }
            Entry::Vacant(entry) => {
                let resource = Arc::new(CachedResource::open(
                    url.clone(),
                    path,
                    self.inner.open_files.clone(),
                )?);
                entry.insert(Arc::downgrade(&resource));
                Ok(resource)
            }
        }
    }

    /// Forget table entries whose resource has been dropped.
    pub fn prune_resources(&self) {
        self.inner
            .resources
            .retain(|_, resource| resource.strong_count() > 0);
    }

    /// Queue a budgeted sweep (age, count, size).
    pub fn clean_cache(&self) -> oneshot::Receiver<SweepReport> {
        self.enqueue(SweepKind::Budgeted)
    }

    /// Queue removal of every cache file that is not currently open.
    pub fn clean_all_cache(&self) -> oneshot::Receiver<SweepReport> {
        self.enqueue(SweepKind::All)
    }

    fn enqueue(&self, kind: SweepKind) -> oneshot::Receiver<SweepReport> {
        self.prune_resources();
        let (done, rx) = oneshot::channel();
        if self.inner.sweeper.send(SweepJob { kind, done }).is_err() {
            error!("Cache sweeper thread is gone; sweep request dropped");
        }
        rx
    }
}

/// State owned by the sweep thread.
struct Sweeper {
    cache_dir: PathBuf,
    config: Arc<RwLock<CacheConfiguration>>,
    open_files: OpenFileRegistry,
}

#[derive(Debug, Clone)]
struct CacheFile {
    path: PathBuf,
    size: u64,
    modified: SystemTime,
    accessed: SystemTime,
}

impl Sweeper {
    fn run(self, jobs: mpsc::Receiver<SweepJob>) {
        for job in jobs {
            let config = self
                .config
                .read()
                .unwrap_or_else(|p| p.into_inner())
                .clone();

            let result = match job.kind {
                SweepKind::Budgeted => self.clean(&config),
                SweepKind::All => self.clean_all(),
            };

            let report = match result {
                Ok(report) => {
                    info!(
                        "Cache sweep ({:?}) removed {} files ({} bytes), {} open files skipped",
                        job.kind, report.deleted_files, report.freed_bytes, report.skipped_open
                    );
                    report
                }
                Err(e) => {
                    error!("Cache sweep ({:?}) stopped: {}", job.kind, e);
                    SweepReport::default()
                }
            };

            let _ = job.done.send(report);
        }
        debug!("Cache sweeper exiting");
    }

    /// Cache files that are not open, plus the number of open ones skipped.
    fn list_files(&self) -> io::Result<(Vec<CacheFile>, usize)> {
        let mut files = Vec::new();
        let mut skipped_open = 0;

        for entry in fs::read_dir(&self.cache_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.ends_with(SIDECAR_SUFFIX) || name.starts_with('.') || name.ends_with(".tmp") {
                continue;
            }

            let meta = entry.metadata()?;
            if !meta.is_file() {
                continue;
            }

            let path = entry.path();
            if self.open_files.contains(&path) {
                skipped_open += 1;
                continue;
            }

            let modified = meta.modified()?;
            files.push(CacheFile {
                path,
                size: meta.len(),
                modified,
                accessed: meta.accessed().unwrap_or(modified),
            });
        }

        Ok((files, skipped_open))
    }

    /// Delete a media file and its sidecar. Returns `false` if the file was opened
    /// since it was listed.
    ///
    /// The registry holds the path's slot for the whole deletion, so a handle opening
    /// the same path waits until both files are gone and then starts from empty.
    fn remove(&self, file: &CacheFile, reason: &'static str) -> io::Result<bool> {
        let removed = self.open_files.remove_if_closed(&file.path, || {
            fs::remove_file(&file.path)?;
            match fs::remove_file(sidecar_path(&file.path)) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(
                    "Failed to remove metadata for {}: {}",
                    file.path.display(),
                    e
                ),
            }
            Ok::<_, io::Error>(())
        });

        match removed {
            None => {
                debug!("Skipping {}: opened during sweep", file.path.display());
                Ok(false)
            }
            Some(result) => {
                result?;
                debug!("Evicted {} ({}, {} bytes)", file.path.display(), reason, file.size);
                metrics::record_eviction(reason, file.size);
                Ok(true)
            }
        }
    }

    fn clean(&self, config: &CacheConfiguration) -> io::Result<SweepReport> {
        let (files, skipped_open) = self.list_files()?;
        let mut report = SweepReport {
            skipped_open,
            ..Default::default()
        };

        // Age.
        let now = SystemTime::now();
        let max_age = config.max_cache_age();
        let mut survivors = Vec::with_capacity(files.len());
        for file in files {
            let expired = now
                .duration_since(file.modified)
                .is_ok_and(|age| age > max_age);
            if expired && self.remove(&file, "age")? {
                report.deleted_files += 1;
                report.freed_bytes += file.size;
            } else {
                survivors.push(file);
            }
        }

        // Count: newest first, keep the budget.
        survivors.sort_by(|a, b| b.modified.cmp(&a.modified));
        let mut kept = Vec::with_capacity(survivors.len());
        for (index, file) in survivors.into_iter().enumerate() {
            if index >= config.max_cache_count && self.remove(&file, "count")? {
                report.deleted_files += 1;
                report.freed_bytes += file.size;
            } else {
                kept.push(file);
            }
        }

        // Size: least recently accessed first.
        let mut total: u64 = kept.iter().map(|f| f.size).sum();
        if total > config.max_cache_size_bytes {
            kept.sort_by(|a, b| a.accessed.cmp(&b.accessed));
            let mut remaining = Vec::with_capacity(kept.len());
            let mut candidates = kept.into_iter();
            for file in candidates.by_ref() {
                if total <= config.max_cache_size_bytes {
                    remaining.push(file);
                    break;
                }
                if self.remove(&file, "size")? {
                    total -= file.size;
                    report.deleted_files += 1;
                    report.freed_bytes += file.size;
                } else {
                    remaining.push(file);
                }
            }
            remaining.extend(candidates);
            kept = remaining;
        }

        report.remaining_files = kept.len();
        report.remaining_bytes = kept.iter().map(|f| f.size).sum();
        Ok(report)
    }

    fn clean_all(&self) -> io::Result<SweepReport> {
        let (files, skipped_open) = self.list_files()?;
        let mut report = SweepReport {
            skipped_open,
            ..Default::default()
        };

        for file in files {
            if self.remove(&file, "manual")? {
                report.deleted_files += 1;
                report.freed_bytes += file.size;
            } else {
                report.remaining_files += 1;
                report.remaining_bytes += file.size;
            }
        }

        // Sidecars whose media file vanished are orphans.
        for entry in fs::read_dir(&self.cache_dir)? {
            let path = entry?.path();
            let is_orphan = path
                .to_str()
                .and_then(|p| p.strip_suffix(SIDECAR_SUFFIX))
                .is_some_and(|media| !Path::new(media).exists());
            if is_orphan {
                fs::remove_file(&path)?;
            }
        }

        Ok(report)
    }
}
