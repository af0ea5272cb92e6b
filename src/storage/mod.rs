// Storage layer: the cache, its snapshot codec and on-disk persistence
use std::fs::File;
use std::hash::Hash;
use std::io::Write;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{CacheError, PersistError};

pub mod cache;
pub mod path;
pub mod persist;
pub mod snapshot;

pub use cache::{Pair, RecencyCache};
pub use path::validate_persistence_path;
pub use persist::{CachePersist, DirtyNotifier, PersistStats};
pub use snapshot::{SnapshotRecord, SnapshotSource};

const TEMP_PREFIX: &str = ".ipcache-";
const TEMP_SUFFIX: &str = ".tmp";

/// Replace `path` with `bytes` so readers see either the old file or the
/// complete new one.
///
/// The data goes to a temp file in the same directory, is synced and closed,
/// then renamed over `path`. On any failure the temp file is removed.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), PersistError> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    if path.file_name().is_none() {
        return Err(PersistError::InvalidTarget(path.to_path_buf()));
    }

    // NamedTempFile deletes itself on drop, which covers every early return.
    let mut tmp = tempfile::Builder::new()
        .prefix(TEMP_PREFIX)
        .suffix(TEMP_SUFFIX)
        .tempfile_in(dir)
        .map_err(PersistError::TempFile)?;

    tmp.write_all(bytes).map_err(PersistError::Write)?;
    tmp.as_file().sync_all().map_err(PersistError::Sync)?;

    // Closes the handle; the path is still cleaned up if the rename fails.
    let tmp_path = tmp.into_temp_path();
    tmp_path
        .persist(path)
        .map_err(|e| PersistError::Rename(e.error))?;

    sync_dir(dir);
    Ok(())
}

// Best effort: makes the rename itself durable where the platform allows.
#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Ok(handle) = File::open(dir) {
        let _ = handle.sync_all();
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}

impl<K, V> RecencyCache<K, V>
where
    K: Hash + Eq + Clone + Serialize,
    V: Clone + Serialize,
{
    /// Write a snapshot straight to `path`. A crash mid-write leaves a
    /// broken file; prefer [`RecencyCache::export_to_file_atomic`].
    pub fn export_to_file(&self, path: impl AsRef<Path>) -> Result<(), CacheError> {
        let file = File::create(path.as_ref())?;
        self.export(file)?;
        Ok(())
    }

    /// Write a snapshot to `path` through temp file and rename.
    pub fn export_to_file_atomic(&self, path: impl AsRef<Path>) -> Result<(), PersistError> {
        let bytes = self.export_bytes().map_err(PersistError::Snapshot)?;
        write_atomic(path.as_ref(), &bytes)
    }
}

impl<K, V> RecencyCache<K, V>
where
    K: Hash + Eq + DeserializeOwned,
    V: DeserializeOwned,
{
    /// Load a snapshot file. A missing file is reported as
    /// [`CacheError::Io`] with [`CacheError::is_not_found`] set.
    pub fn import_from_file(&self, path: impl AsRef<Path>) -> Result<(), CacheError> {
        let bytes = std::fs::read(path.as_ref())?;
        self.import_bytes(&bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn sample_cache() -> RecencyCache<String, String> {
        let cache = RecencyCache::new(4).unwrap();
        cache.add("10.0.0.1".to_string(), "CH".to_string());
        cache.add("10.0.0.2".to_string(), "DE".to_string());
        cache.add("10.0.0.3".to_string(), "FR".to_string());
        cache
    }

    fn temp_files(dir: &Path) -> Vec<String> {
        fs::read_dir(dir)
            .unwrap()
            .filter_map(Result::ok)
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| n.starts_with(TEMP_PREFIX))
            .collect()
    }

    #[test]
    fn test_export_import_file() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("cache.bin");

        let cache = sample_cache();
        let want = cache.keys();
        cache.export_to_file(&file).unwrap();
        assert!(fs::metadata(&file).unwrap().len() > 0);

        cache.purge();
        cache.import_from_file(&file).unwrap();
        assert_eq!(cache.keys(), want);
    }

    #[test]
    fn test_import_missing_file_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let cache = sample_cache();

        let err = cache.import_from_file(tmp.path().join("absent.bin")).unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn test_atomic_export_replaces_corrupt_file() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("cache.bin");
        fs::write(&file, b"\x00garbage from an interrupted writer").unwrap();

        let cache = sample_cache();
        cache.get(&"10.0.0.1".to_string());
        cache.export_to_file_atomic(&file).unwrap();

        let restored = RecencyCache::<String, String>::new(2).unwrap();
        restored.import_from_file(&file).unwrap();
        assert_eq!(restored.snapshot(), cache.snapshot());
        assert!(temp_files(tmp.path()).is_empty());
    }

    #[test]
    fn test_write_atomic_failure_leaves_target_alone() {
        let tmp = TempDir::new().unwrap();
        // Renaming a file over a non-empty directory fails everywhere.
        let target = tmp.path().join("occupied");
        fs::create_dir(&target).unwrap();
        fs::write(target.join("inner"), b"x").unwrap();

        let err = write_atomic(&target, b"payload").unwrap_err();
        assert!(matches!(err, PersistError::Rename(_)), "{err}");
        assert!(target.is_dir());
        assert!(temp_files(tmp.path()).is_empty());
    }

    #[test]
    fn test_write_atomic_missing_dir() {
        let tmp = TempDir::new().unwrap();
        let target = tmp.path().join("gone").join("cache.bin");

        let err = write_atomic(&target, b"payload").unwrap_err();
        assert!(matches!(err, PersistError::TempFile(_)));
        assert!(!target.exists());
    }
}
