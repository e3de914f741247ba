//! Atomic file writes and the cross-process advisory lock.
//!
//! `atomic_write` stages data in a sibling temp file and renames it over the
//! destination; the rename is the commit point, so concurrent readers observe
//! either the old contents or the new contents, never a mixture.
//!
//! `FileLock` serializes writers across processes on the same host. It only
//! coordinates between processes; within a process, callers must already hold
//! the store's writer lock before acquiring it.

use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::{Result, StoreError};

/// Owner read/write only. Every file holding secret material uses this.
pub const SECRET_FILE_MODE: u32 = 0o600;

/// Owner-only directories (config root, snapshot dirs).
pub const SECRET_DIR_MODE: u32 = 0o700;

// Lock acquisition backoff: starts at 10 ms, grows 2 ms per attempt,
// capped at 100 ms, for at most 100 attempts (~10 s wall time).
const LOCK_INITIAL_BACKOFF: Duration = Duration::from_millis(10);
const LOCK_BACKOFF_STEP: Duration = Duration::from_millis(2);
const LOCK_MAX_BACKOFF: Duration = Duration::from_millis(100);
const LOCK_MAX_ATTEMPTS: u32 = 100;

// ---------------------------------------------------------------------------
// Atomic write
// ---------------------------------------------------------------------------

/// Derive a temp sibling name that cannot collide across processes.
fn temp_path_for(path: &Path) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as u128 + d.as_secs() as u128 * 1_000_000_000)
        .unwrap_or(0);
    let mut name = path.as_os_str().to_os_string();
    name.push(format!(".tmp.{}.{}", std::process::id(), nanos));
    PathBuf::from(name)
}

fn open_with_mode(path: &Path, mode: u32) -> std::io::Result<File> {
    let mut opts = OpenOptions::new();
    opts.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.mode(mode);
    }
    #[cfg(not(unix))]
    let _ = mode;
    opts.open(path)
}

/// Write `data` to `path` through a temp sibling plus rename.
///
/// On any failure the temp file is deleted; the destination keeps its old
/// contents.
pub fn atomic_write(path: &Path, data: &[u8], mode: u32) -> Result<()> {
    let tmp = temp_path_for(path);

    let commit = (|| -> std::io::Result<()> {
        let mut file = open_with_mode(&tmp, mode)?;
        file.write_all(data)?;
        // Re-assert the mode: an inherited umask may have masked bits off.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            file.set_permissions(fs::Permissions::from_mode(mode))?;
        }
        drop(file);
        fs::rename(&tmp, path)
    })();

    match commit {
        Ok(()) => Ok(()),
        Err(err) => {
            let _ = fs::remove_file(&tmp);
            Err(StoreError::AtomicWriteFailed {
                path: path.to_path_buf(),
                detail: err.to_string(),
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Cross-process file lock
// ---------------------------------------------------------------------------

fn lock_path_for(resource: &Path) -> PathBuf {
    let mut name: OsString = resource.as_os_str().to_os_string();
    name.push(".lock");
    PathBuf::from(name)
}

/// Exclusive advisory lock on `<resource>.lock`, held until drop.
///
/// Acquisition polls a non-blocking create-exclusive open with backoff; on
/// timeout it fails with `LockTimeout` and changes nothing. Release closes
/// the descriptor and unlinks the lock file.
pub struct FileLock {
    lock_path: PathBuf,
    file: Option<File>,
}

impl FileLock {
    pub fn acquire(resource: &Path) -> Result<Self> {
        let lock_path = lock_path_for(resource);
        let mut backoff = LOCK_INITIAL_BACKOFF;

        for _ in 0..LOCK_MAX_ATTEMPTS {
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&lock_path)
            {
                Ok(mut file) => {
                    // Holder pid, for operators inspecting a stuck lock.
                    let _ = write!(file, "{}", std::process::id());
                    return Ok(Self {
                        lock_path,
                        file: Some(file),
                    });
                }
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    std::thread::sleep(backoff);
                    backoff = (backoff + LOCK_BACKOFF_STEP).min(LOCK_MAX_BACKOFF);
                }
                Err(err) => return Err(StoreError::io(&lock_path, err)),
            }
        }

        Err(StoreError::LockTimeout(resource.to_path_buf()))
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        drop(self.file.take());
        let _ = fs::remove_file(&self.lock_path);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_write_creates_and_replaces() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("target.txt");

        atomic_write(&path, b"first", SECRET_FILE_MODE).unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"first");

        atomic_write(&path, b"second", SECRET_FILE_MODE).unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"second");
    }

    #[test]
    fn atomic_write_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("target.txt");
        for i in 0..20 {
            atomic_write(&path, format!("v{}", i).as_bytes(), SECRET_FILE_MODE).unwrap();
        }
        for entry in fs::read_dir(dir.path()).unwrap() {
            let name = entry.unwrap().file_name();
            assert!(
                !name.to_string_lossy().contains(".tmp"),
                "leftover temp file: {:?}",
                name
            );
        }
    }

    #[cfg(unix)]
    #[test]
    fn atomic_write_sets_owner_only_mode() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secret.bin");
        atomic_write(&path, b"x", SECRET_FILE_MODE).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn atomic_write_failure_cleans_temp() {
        let dir = tempfile::tempdir().unwrap();
        // Destination parent does not exist: the temp create fails.
        let path = dir.path().join("missing").join("target.txt");
        assert!(atomic_write(&path, b"x", SECRET_FILE_MODE).is_err());
        assert!(fs::read_dir(dir.path()).unwrap().next().is_none());
    }

    #[test]
    fn lock_excludes_and_releases() {
        let dir = tempfile::tempdir().unwrap();
        let resource = dir.path().join("secrets.json");

        let lock = FileLock::acquire(&resource).unwrap();
        assert!(dir.path().join("secrets.json.lock").exists());
        drop(lock);
        assert!(!dir.path().join("secrets.json.lock").exists());

        // Reacquirable after release.
        let _lock = FileLock::acquire(&resource).unwrap();
    }

    #[test]
    fn contended_lock_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let resource = dir.path().join("secrets.json");

        let _held = FileLock::acquire(&resource).unwrap();
        let started = std::time::Instant::now();
        let second = FileLock::acquire(&resource);
        assert!(matches!(second, Err(StoreError::LockTimeout(_))));
        // 100 attempts with growing backoff lands near ten seconds.
        assert!(started.elapsed() >= Duration::from_secs(1));
    }

    #[test]
    fn lock_handoff_between_threads() {
        let dir = tempfile::tempdir().unwrap();
        let resource = dir.path().join("db.json");

        let held = FileLock::acquire(&resource).unwrap();
        let resource2 = resource.clone();
        let waiter = std::thread::spawn(move || FileLock::acquire(&resource2).is_ok());

        std::thread::sleep(Duration::from_millis(50));
        drop(held);
        assert!(waiter.join().unwrap());
    }
}
