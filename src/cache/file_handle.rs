//! Lock-guarded access to a single cache file.

use bytes::Bytes;
use std::fs::{self, File, FileTimes, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;
use tracing::debug;

use super::open_files::OpenFileRegistry;

/// Owns one on-disk media file.
///
/// Every read and write seeks and then transfers under the same mutex, so concurrent
/// requests for one resource never interleave their I/O. The path is registered as
/// open before the file is opened and stays registered for the lifetime of the handle.
#[derive(Debug)]
pub struct MediaFileHandle {
    path: PathBuf,
    file: Mutex<File>,
    registry: OpenFileRegistry,
}

impl MediaFileHandle {
    /// Open `path`, creating it (and its parent directory) when absent.
    pub fn open(path: impl Into<PathBuf>, registry: OpenFileRegistry) -> io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        // Registered first so a concurrent sweep cannot delete the file under us.
        registry.register(&path);
        let file = match OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
        {
            Ok(file) => file,
            Err(e) => {
                registry.unregister(&path);
                return Err(e);
            }
        };

        Ok(Self {
            path,
            file: Mutex::new(file),
            registry,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read exactly `length` bytes at `offset`. `None` if the file is shorter or I/O fails.
    ///
    /// A successful read stamps the access time, which the size sweep evicts by.
    /// Mounts with `noatime` or `relatime` would not do it for us.
    pub fn read_data(&self, offset: u64, length: usize) -> Option<Bytes> {
        let mut file = self.file.lock().unwrap_or_else(|p| p.into_inner());
        let mut buf = vec![0u8; length];

        let result = file
            .seek(SeekFrom::Start(offset))
            .and_then(|_| file.read_exact(&mut buf));

        match result {
            Ok(()) => {
                let touched = FileTimes::new().set_accessed(SystemTime::now());
                if let Err(e) = file.set_times(touched) {
                    debug!("Failed to touch {}: {}", self.path.display(), e);
                }
                Some(Bytes::from(buf))
            }
            Err(e) => {
                debug!(
                    "Read of {} bytes at {} from {} failed: {}",
                    length,
                    offset,
                    self.path.display(),
                    e
                );
                None
            }
        }
    }

    /// Overwrite bytes at `offset`, extending the file if needed.
    pub fn write(&self, data: &[u8], offset: u64) -> io::Result<()> {
        let mut file = self.file.lock().unwrap_or_else(|p| p.into_inner());
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        file.flush()
    }

    /// Write at the current end of file.
    pub fn append(&self, data: &[u8]) -> io::Result<()> {
        let mut file = self.file.lock().unwrap_or_else(|p| p.into_inner());
        file.seek(SeekFrom::End(0))?;
        file.write_all(data)?;
        file.flush()
    }

    /// Current on-disk size.
    pub fn len(&self) -> io::Result<u64> {
        let file = self.file.lock().unwrap_or_else(|p| p.into_inner());
        Ok(file.metadata()?.len())
    }

    pub fn is_empty(&self) -> io::Result<bool> {
        Ok(self.len()? == 0)
    }
}

impl Drop for MediaFileHandle {
    fn drop(&mut self) {
        self.registry.unregister(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_missing_file_and_parent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("video.mp4");

        let handle = MediaFileHandle::open(&path, OpenFileRegistry::new()).unwrap();
        assert!(path.exists());
        assert!(handle.is_empty().unwrap());
    }

    #[test]
    fn write_at_offset_then_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let handle =
            MediaFileHandle::open(dir.path().join("a.mp4"), OpenFileRegistry::new()).unwrap();

        handle.write(b"world", 6).unwrap();
        handle.write(b"hello ", 0).unwrap();

        assert_eq!(handle.read_data(0, 11).unwrap(), Bytes::from_static(b"hello world"));
        assert_eq!(handle.read_data(6, 5).unwrap(), Bytes::from_static(b"world"));
        assert_eq!(handle.len().unwrap(), 11);
    }

    #[test]
    fn read_past_end_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let handle =
            MediaFileHandle::open(dir.path().join("a.mp4"), OpenFileRegistry::new()).unwrap();
        handle.write(b"abc", 0).unwrap();

        assert!(handle.read_data(1, 10).is_none());
    }

    #[test]
    fn append_writes_at_end() {
        let dir = tempfile::tempdir().unwrap();
        let handle =
            MediaFileHandle::open(dir.path().join("a.mp4"), OpenFileRegistry::new()).unwrap();

        handle.append(b"abc").unwrap();
        handle.read_data(0, 1).unwrap();
        handle.append(b"def").unwrap();

        assert_eq!(handle.read_data(0, 6).unwrap(), Bytes::from_static(b"abcdef"));
    }

    #[test]
    fn handle_lifetime_tracks_open_registry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.mp4");
        let registry = OpenFileRegistry::new();

        let handle = MediaFileHandle::open(&path, registry.clone()).unwrap();
        assert!(registry.contains(&path));

        drop(handle);
        assert!(!registry.contains(&path));
    }

    #[test]
    fn failed_open_releases_registration() {
        let dir = tempfile::tempdir().unwrap();
        // A directory cannot be opened for writing.
        let path = dir.path().join("taken");
        fs::create_dir(&path).unwrap();
        let registry = OpenFileRegistry::new();

        assert!(MediaFileHandle::open(&path, registry.clone()).is_err());
        assert!(registry.is_empty());
    }

    #[test]
    fn read_refreshes_access_time() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.mp4");
        let handle = MediaFileHandle::open(&path, OpenFileRegistry::new()).unwrap();
        handle.write(b"abc", 0).unwrap();

        let stale = SystemTime::now() - std::time::Duration::from_secs(3600);
        let file = File::options().write(true).open(&path).unwrap();
        file.set_times(FileTimes::new().set_accessed(stale)).unwrap();

        handle.read_data(0, 3).unwrap();
        let accessed = fs::metadata(&path).unwrap().accessed().unwrap();
        assert!(accessed > stale + std::time::Duration::from_secs(3000));
    }

    #[test]
    fn reopen_keeps_existing_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.mp4");

        let handle = MediaFileHandle::open(&path, OpenFileRegistry::new()).unwrap();
        handle.write(b"persisted", 0).unwrap();
        drop(handle);

        let handle = MediaFileHandle::open(&path, OpenFileRegistry::new()).unwrap();
        assert_eq!(handle.read_data(0, 9).unwrap(), Bytes::from_static(b"persisted"));
    }
}
