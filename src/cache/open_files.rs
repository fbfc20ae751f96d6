//! Registry of cache files currently backing a live handle.
//!
//! Paths are reference counted so two handles on the same file keep it protected
//! until both are gone. The eviction sweep skips every path with a non-zero count.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::trace;

#[derive(Clone, Debug, Default)]
pub struct OpenFileRegistry {
    counts: Arc<DashMap<PathBuf, usize>>,
}

impl OpenFileRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, path: &Path) {
        let mut count = self.counts.entry(path.to_path_buf()).or_insert(0);
        *count += 1;
        trace!("open files: register {} (count={})", path.display(), *count);
    }

    pub fn unregister(&self, path: &Path) {
        if let Entry::Occupied(mut entry) = self.counts.entry(path.to_path_buf()) {
            if *entry.get() <= 1 {
                entry.remove();
                trace!("open files: release {}", path.display());
            } else {
                *entry.get_mut() -= 1;
            }
        }
    }

    /// Run `remove` only while `path` has no open handle, holding the path's slot so
    /// no handle can register until `remove` returns. `None` when the path is open.
    ///
    /// `remove` must not call back into the registry.
    pub fn remove_if_closed<T>(&self, path: &Path, remove: impl FnOnce() -> T) -> Option<T> {
        match self.counts.entry(path.to_path_buf()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(_slot) => Some(remove()),
        }
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.counts.contains_key(path)
    }

    /// Number of distinct open paths.
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_unregister() {
        let registry = OpenFileRegistry::new();
        let path = Path::new("/tmp/cache/abc.mp4");

        registry.register(path);
        assert!(registry.contains(path));
        assert_eq!(registry.len(), 1);

        registry.unregister(path);
        assert!(!registry.contains(path));
        assert!(registry.is_empty());
    }

    #[test]
    fn path_stays_open_until_last_handle_releases() {
        let registry = OpenFileRegistry::new();
        let path = Path::new("/tmp/cache/shared.mp4");

        registry.register(path);
        registry.register(path);
        registry.unregister(path);
        assert!(registry.contains(path), "second holder still protects the file");

        registry.unregister(path);
        assert!(!registry.contains(path));
    }

    #[test]
    fn unregister_unknown_path_is_noop() {
        let registry = OpenFileRegistry::new();
        registry.unregister(Path::new("/nowhere"));
        assert!(registry.is_empty());
    }

    #[test]
    fn remove_if_closed_skips_open_paths() {
        let registry = OpenFileRegistry::new();
        let path = Path::new("/tmp/cache/busy.mp4");

        registry.register(path);
        assert_eq!(registry.remove_if_closed(path, || "removed"), None);

        registry.unregister(path);
        assert_eq!(registry.remove_if_closed(path, || "removed"), Some("removed"));
        assert!(registry.is_empty());
    }

    #[test]
    fn register_waits_for_in_progress_removal() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::thread;
        use std::time::Duration;

        let registry = OpenFileRegistry::new();
        let path = Path::new("/tmp/cache/evicting.mp4");
        let removed = Arc::new(AtomicBool::new(false));

        let opener = registry.remove_if_closed(path, || {
            let registry = registry.clone();
            let removed_seen = removed.clone();
            let opener = thread::spawn(move || {
                registry.register(path);
                removed_seen.load(Ordering::SeqCst)
            });
            thread::sleep(Duration::from_millis(50));
            removed.store(true, Ordering::SeqCst);
            opener
        });

        let saw_removal = opener.unwrap().join().unwrap();
        assert!(saw_removal, "register ran while removal was in progress");
        assert!(registry.contains(path));
    }

    #[test]
    fn clones_share_state() {
        let registry = OpenFileRegistry::new();
        let clone = registry.clone();
        clone.register(Path::new("/tmp/cache/x"));
        assert!(registry.contains(Path::new("/tmp/cache/x")));
    }
}
