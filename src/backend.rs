//! Storage backends: the file-like namespace the store runs against.
//!
//! The store depends on a small set of namespace operations (read, write,
//! atomic-write, mkdir, exists, remove, list, advisory locking) so tests can
//! run against an in-memory fake. The default implementation is the host
//! filesystem.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::{Result, StoreError};
use crate::fsio::{self, FileLock};

// ---------------------------------------------------------------------------
// Backend trait
// ---------------------------------------------------------------------------

/// Held advisory lock; released on drop.
pub trait LockGuard: Send {}

/// File-like namespace the store persists into.
///
/// Implement this for your infrastructure:
/// - `HostFs` (production; the host filesystem)
/// - `MemBackend` (testing)
pub trait Backend: Send + Sync {
    fn read(&self, path: &Path) -> Result<Vec<u8>>;
    /// Direct (non-atomic) write. Used for per-secret backup files, which are
    /// never read concurrently with their producer.
    fn write(&self, path: &Path, data: &[u8], mode: u32) -> Result<()>;
    /// Temp-plus-rename write; the commit point for every database mutation.
    fn atomic_write(&self, path: &Path, data: &[u8], mode: u32) -> Result<()>;
    fn create_dir_all(&self, path: &Path, mode: u32) -> Result<()>;
    fn exists(&self, path: &Path) -> bool;
    fn is_dir(&self, path: &Path) -> bool;
    fn remove_file(&self, path: &Path) -> Result<()>;
    fn remove_dir_all(&self, path: &Path) -> Result<()>;
    /// Entries directly under `path`, as full paths. Missing directory is an
    /// empty listing.
    fn list_dir(&self, path: &Path) -> Result<Vec<PathBuf>>;
    fn rename(&self, from: &Path, to: &Path) -> Result<()>;
    /// Exclusive advisory lock on `<resource>.lock`. Serializes writers
    /// across processes; in-process callers must already hold the store's
    /// writer lock.
    fn lock(&self, resource: &Path) -> Result<Box<dyn LockGuard>>;
}

// ---------------------------------------------------------------------------
// Host filesystem backend
// ---------------------------------------------------------------------------

pub struct HostFs;

impl HostFs {
    pub fn new() -> Self {
        Self
    }
}

impl Default for HostFs {
    fn default() -> Self {
        Self::new()
    }
}

struct HostLock(#[allow(dead_code)] FileLock);

impl LockGuard for HostLock {}

impl Backend for HostFs {
    fn read(&self, path: &Path) -> Result<Vec<u8>> {
        std::fs::read(path).map_err(|e| StoreError::io(path, e))
    }

    fn write(&self, path: &Path, data: &[u8], mode: u32) -> Result<()> {
        use std::io::Write;
        let mut opts = std::fs::OpenOptions::new();
        opts.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            opts.mode(mode);
        }
        #[cfg(not(unix))]
        let _ = mode;
        let mut file = opts.open(path).map_err(|e| StoreError::io(path, e))?;
        file.write_all(data).map_err(|e| StoreError::io(path, e))
    }

    fn atomic_write(&self, path: &Path, data: &[u8], mode: u32) -> Result<()> {
        fsio::atomic_write(path, data, mode)
    }

    fn create_dir_all(&self, path: &Path, mode: u32) -> Result<()> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            std::fs::DirBuilder::new()
                .recursive(true)
                .mode(mode)
                .create(path)
                .map_err(|e| StoreError::io(path, e))
        }
        #[cfg(not(unix))]
        {
            let _ = mode;
            std::fs::create_dir_all(path).map_err(|e| StoreError::io(path, e))
        }
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn is_dir(&self, path: &Path) -> bool {
        path.is_dir()
    }

    fn remove_file(&self, path: &Path) -> Result<()> {
        std::fs::remove_file(path).map_err(|e| StoreError::io(path, e))
    }

    fn remove_dir_all(&self, path: &Path) -> Result<()> {
        std::fs::remove_dir_all(path).map_err(|e| StoreError::io(path, e))
    }

    fn list_dir(&self, path: &Path) -> Result<Vec<PathBuf>> {
        if !path.is_dir() {
            return Ok(Vec::new());
        }
        let entries = std::fs::read_dir(path).map_err(|e| StoreError::io(path, e))?;
        let mut out = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io(path, e))?;
            out.push(entry.path());
        }
        Ok(out)
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        std::fs::rename(from, to).map_err(|e| StoreError::io(from, e))
    }

    fn lock(&self, resource: &Path) -> Result<Box<dyn LockGuard>> {
        Ok(Box::new(HostLock(FileLock::acquire(resource)?)))
    }
}

// ---------------------------------------------------------------------------
// In-memory backend
// ---------------------------------------------------------------------------

/// In-memory namespace (for testing and ephemeral use).
pub struct MemBackend {
    files: Mutex<BTreeMap<PathBuf, Vec<u8>>>,
    dirs: Mutex<BTreeSet<PathBuf>>,
    locks: Arc<Mutex<BTreeSet<PathBuf>>>,
}

impl MemBackend {
    pub fn new() -> Self {
        Self {
            files: Mutex::new(BTreeMap::new()),
            dirs: Mutex::new(BTreeSet::new()),
            locks: Arc::new(Mutex::new(BTreeSet::new())),
        }
    }
}

impl Default for MemBackend {
    fn default() -> Self {
        Self::new()
    }
}

struct MemLock {
    locks: Arc<Mutex<BTreeSet<PathBuf>>>,
    path: PathBuf,
}

impl LockGuard for MemLock {}

impl Drop for MemLock {
    fn drop(&mut self) {
        self.locks.lock().unwrap().remove(&self.path);
    }
}

impl Backend for MemBackend {
    fn read(&self, path: &Path) -> Result<Vec<u8>> {
        self.files
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| StoreError::Storage {
                path: path.to_path_buf(),
                detail: "no such file".into(),
            })
    }

    fn write(&self, path: &Path, data: &[u8], _mode: u32) -> Result<()> {
        self.files
            .lock()
            .unwrap()
            .insert(path.to_path_buf(), data.to_vec());
        Ok(())
    }

    fn atomic_write(&self, path: &Path, data: &[u8], mode: u32) -> Result<()> {
        // The map insert is already indivisible under the mutex.
        self.write(path, data, mode)
    }

    fn create_dir_all(&self, path: &Path, _mode: u32) -> Result<()> {
        let mut dirs = self.dirs.lock().unwrap();
        let mut cur = PathBuf::new();
        for part in path.components() {
            cur.push(part);
            dirs.insert(cur.clone());
        }
        Ok(())
    }

    fn exists(&self, path: &Path) -> bool {
        self.files.lock().unwrap().contains_key(path) || self.dirs.lock().unwrap().contains(path)
    }

    fn is_dir(&self, path: &Path) -> bool {
        self.dirs.lock().unwrap().contains(path)
    }

    fn remove_file(&self, path: &Path) -> Result<()> {
        self.files
            .lock()
            .unwrap()
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| StoreError::Storage {
                path: path.to_path_buf(),
                detail: "no such file".into(),
            })
    }

    fn remove_dir_all(&self, path: &Path) -> Result<()> {
        self.dirs.lock().unwrap().retain(|d| !d.starts_with(path));
        self.files.lock().unwrap().retain(|f, _| !f.starts_with(path));
        Ok(())
    }

    fn list_dir(&self, path: &Path) -> Result<Vec<PathBuf>> {
        let files = self.files.lock().unwrap();
        let dirs = self.dirs.lock().unwrap();
        let mut out: BTreeSet<PathBuf> = BTreeSet::new();
        for candidate in files.keys().chain(dirs.iter()) {
            if candidate.parent() == Some(path) {
                out.insert(candidate.clone());
            }
        }
        Ok(out.into_iter().collect())
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        let mut files = self.files.lock().unwrap();
        match files.remove(from) {
            Some(data) => {
                files.insert(to.to_path_buf(), data);
                Ok(())
            }
            None => Err(StoreError::Storage {
                path: from.to_path_buf(),
                detail: "no such file".into(),
            }),
        }
    }

    fn lock(&self, resource: &Path) -> Result<Box<dyn LockGuard>> {
        // Same polling discipline as the host lock, against a shared set.
        let mut backoff = Duration::from_millis(10);
        for _ in 0..100 {
            {
                let mut locks = self.locks.lock().unwrap();
                if locks.insert(resource.to_path_buf()) {
                    return Ok(Box::new(MemLock {
                        locks: Arc::clone(&self.locks),
                        path: resource.to_path_buf(),
                    }));
                }
            }
            std::thread::sleep(backoff);
            backoff = (backoff + Duration::from_millis(2)).min(Duration::from_millis(100));
        }
        Err(StoreError::LockTimeout(resource.to_path_buf()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_backend_read_write_list() {
        let be = MemBackend::new();
        let root = Path::new("/store");
        be.create_dir_all(root, 0o700).unwrap();
        be.write(&root.join("a.json"), b"{}", 0o600).unwrap();
        be.write(&root.join("b.json"), b"[]", 0o600).unwrap();

        assert_eq!(be.read(&root.join("a.json")).unwrap(), b"{}");
        let listed = be.list_dir(root).unwrap();
        assert_eq!(listed.len(), 2);
        assert!(be.exists(&root.join("b.json")));
        assert!(!be.exists(&root.join("c.json")));
    }

    #[test]
    fn mem_backend_rename_moves_content() {
        let be = MemBackend::new();
        be.write(Path::new("/x.tmp"), b"v", 0o600).unwrap();
        be.rename(Path::new("/x.tmp"), Path::new("/x")).unwrap();
        assert!(!be.exists(Path::new("/x.tmp")));
        assert_eq!(be.read(Path::new("/x")).unwrap(), b"v");
    }

    #[test]
    fn mem_backend_lock_is_exclusive() {
        let be = MemBackend::new();
        let guard = be.lock(Path::new("/db")).unwrap();
        // A second holder would need the first to drop.
        drop(guard);
        let _second = be.lock(Path::new("/db")).unwrap();
    }

    #[test]
    fn host_fs_lists_missing_dir_as_empty() {
        let be = HostFs::new();
        let dir = tempfile::tempdir().unwrap();
        let listed = be.list_dir(&dir.path().join("absent")).unwrap();
        assert!(listed.is_empty());
    }
}
