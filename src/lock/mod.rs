//! Advisory locks
//!
//! A lock is an empty file under the lock directory held with
//! `flock(LOCK_EX | LOCK_NB)`. The manager also keeps the set of lock paths
//! held through it, so a second acquire from the same manager fails before the
//! OS is asked.
//!
//! On acquire the lock file's identity (creation time, device, inode) is
//! recorded. `HeldLock::validate` fails once that identity changes, the file
//! gains content, or the lock was released.

use crate::{Result, StorageError};
use dashmap::DashSet;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, error};

/// Identity of a lock file at acquisition time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockFingerprint {
    created: Option<SystemTime>,
    device: u64,
    inode: u64,
}

impl LockFingerprint {
    pub fn of(path: &Path) -> io::Result<Self> {
        let meta = fs::metadata(path)?;
        #[cfg(unix)]
        let (device, inode) = {
            use std::os::unix::fs::MetadataExt;
            (meta.dev(), meta.ino())
        };
        #[cfg(not(unix))]
        let (device, inode) = (0, 0);
        Ok(Self {
            created: meta.created().ok(),
            device,
            inode,
        })
    }
}

pub struct LockManager {
    dir: PathBuf,
    held: Arc<DashSet<PathBuf>>,
}

impl LockManager {
    /// Creates `dir` when missing
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        Ok(Self {
            dir: fs::canonicalize(dir)?,
            held: Arc::new(DashSet::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn is_held(&self, name: &str) -> bool {
        self.held.contains(&self.dir.join(name))
    }

    pub fn acquire(&self, name: &str) -> Result<HeldLock> {
        validate_name(name)?;
        let path = self.dir.join(name);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)?;
        let fingerprint = LockFingerprint::of(&path)?;

        if !self.held.insert(path.clone()) {
            return Err(StorageError::LockConflict(format!(
                "lock held by this process: {}",
                path.display()
            )));
        }

        if let Err(e) = try_lock(&file) {
            self.held.remove(&path);
            return Err(if e.kind() == io::ErrorKind::WouldBlock {
                StorageError::LockConflict(format!("lock held by another program: {}", path.display()))
            } else {
                StorageError::Io(e)
            });
        }

        debug!(lock = %path.display(), "lock acquired");
        Ok(HeldLock {
            name: name.to_string(),
            path,
            file: Some(file),
            fingerprint,
            held: self.held.clone(),
        })
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
        return Err(StorageError::InvalidArgument(format!("invalid lock name '{}'", name)));
    }
    Ok(())
}

#[cfg(unix)]
fn try_lock(file: &File) -> io::Result<()> {
    use libc::{flock, LOCK_EX, LOCK_NB};
    use std::os::unix::io::AsRawFd;

    let result = unsafe { flock(file.as_raw_fd(), LOCK_EX | LOCK_NB) };
    if result != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(unix)]
fn unlock(file: &File) -> io::Result<()> {
    use libc::{flock, LOCK_UN};
    use std::os::unix::io::AsRawFd;

    let result = unsafe { flock(file.as_raw_fd(), LOCK_UN) };
    if result != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

// Only the in-process held set protects the lock elsewhere
#[cfg(not(unix))]
fn try_lock(_file: &File) -> io::Result<()> {
    Ok(())
}

#[cfg(not(unix))]
fn unlock(_file: &File) -> io::Result<()> {
    Ok(())
}

/// An acquired lock; released on drop
#[derive(Debug)]
pub struct HeldLock {
    name: String,
    path: PathBuf,
    /// `None` once released
    file: Option<File>,
    fingerprint: LockFingerprint,
    held: Arc<DashSet<PathBuf>>,
}

impl HeldLock {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn fingerprint(&self) -> LockFingerprint {
        self.fingerprint
    }

    pub fn is_released(&self) -> bool {
        self.file.is_none()
    }

    /// Check that the lock is still exclusively ours
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| StorageError::LockInvalidated(format!("{}: {}", reason, self.path.display()));

        let Some(file) = &self.file else {
            return Err(invalid("lock instance already released".into()));
        };
        if !self.held.contains(&self.path) {
            return Err(invalid("lock path unexpectedly cleared from held set".into()));
        }
        let size = file.metadata().map_err(|e| invalid(format!("lock handle unusable ({})", e)))?.len();
        if size != 0 {
            return Err(invalid(format!("unexpected lock file size {}", size)));
        }
        let current = LockFingerprint::of(&self.path).map_err(|e| invalid(format!("lock file unreadable ({})", e)))?;
        if current != self.fingerprint {
            return Err(invalid(format!(
                "lock file changed by an external force: {:?} != {:?}",
                current, self.fingerprint
            )));
        }
        Ok(())
    }

    /// Release the lock; a second call is a no-op
    pub fn release(&mut self) -> Result<()> {
        let Some(file) = self.file.take() else {
            return Ok(());
        };
        let unlocked = unlock(&file);
        drop(file);
        if self.held.remove(&self.path).is_none() {
            return Err(StorageError::LockInvalidated(format!(
                "lock path was not in the held set at release: {}",
                self.path.display()
            )));
        }
        unlocked?;
        debug!(lock = %self.path.display(), "lock released");
        Ok(())
    }
}

impl Drop for HeldLock {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            error!(lock = %self.path.display(), error = %e, "failed to release lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_second_acquire_conflicts_until_release() {
        let tmp = tempfile::tempdir().unwrap();
        let locks = LockManager::new(tmp.path()).unwrap();

        let mut lock = locks.acquire("write.lock").unwrap();
        assert!(locks.is_held("write.lock"));
        assert!(locks.acquire("write.lock").unwrap_err().is_lock_conflict());

        lock.release().unwrap();
        lock.release().unwrap();
        assert!(!locks.is_held("write.lock"));
        let again = locks.acquire("write.lock").unwrap();
        again.validate().unwrap();
    }

    #[test]
    fn test_other_manager_blocked_by_os_lock() {
        let tmp = tempfile::tempdir().unwrap();
        let first = LockManager::new(tmp.path()).unwrap();
        let second = LockManager::new(tmp.path()).unwrap();

        let _lock = first.acquire("write.lock").unwrap();
        let err = second.acquire("write.lock").unwrap_err();
        assert!(err.is_lock_conflict());
        // the failed attempt leaves nothing behind in its held set
        assert!(!second.is_held("write.lock"));
    }

    #[test]
    fn test_drop_releases() {
        let tmp = tempfile::tempdir().unwrap();
        let locks = LockManager::new(tmp.path()).unwrap();
        {
            let _lock = locks.acquire("write.lock").unwrap();
        }
        assert!(!locks.is_held("write.lock"));
        assert!(locks.acquire("write.lock").is_ok());
    }

    #[test]
    fn test_validate_detects_content() {
        let tmp = tempfile::tempdir().unwrap();
        let locks = LockManager::new(tmp.path()).unwrap();
        let lock = locks.acquire("write.lock").unwrap();
        lock.validate().unwrap();

        let mut f = OpenOptions::new().append(true).open(lock.path()).unwrap();
        f.write_all(b"pid").unwrap();
        assert!(matches!(lock.validate(), Err(StorageError::LockInvalidated(_))));
    }

    #[test]
    fn test_validate_detects_replaced_file() {
        let tmp = tempfile::tempdir().unwrap();
        let locks = LockManager::new(tmp.path()).unwrap();
        let lock = locks.acquire("write.lock").unwrap();

        let imposter = tmp.path().join("imposter");
        File::create(&imposter).unwrap();
        fs::rename(&imposter, lock.path()).unwrap();
        assert_ne!(LockFingerprint::of(lock.path()).unwrap(), lock.fingerprint());
        assert!(matches!(lock.validate(), Err(StorageError::LockInvalidated(_))));
    }

    #[test]
    fn test_validate_detects_deleted_file() {
        let tmp = tempfile::tempdir().unwrap();
        let locks = LockManager::new(tmp.path()).unwrap();
        let lock = locks.acquire("write.lock").unwrap();
        assert_eq!(LockFingerprint::of(lock.path()).unwrap(), lock.fingerprint());

        fs::remove_file(lock.path()).unwrap();
        match lock.validate() {
            Err(StorageError::LockInvalidated(msg)) => assert!(msg.contains("unreadable"), "{}", msg),
            other => panic!("expected LockInvalidated, got {:?}", other),
        }
        assert!(locks.is_held("write.lock"));
    }

    #[test]
    fn test_validate_after_release_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let locks = LockManager::new(tmp.path()).unwrap();
        let mut lock = locks.acquire("write.lock").unwrap();
        lock.release().unwrap();
        assert!(lock.is_released());
        assert!(matches!(lock.validate(), Err(StorageError::LockInvalidated(_))));
    }

    #[test]
    fn test_existing_lock_file_is_not_truncated_or_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        File::create(tmp.path().join("write.lock")).unwrap();
        let locks = LockManager::new(tmp.path()).unwrap();
        let lock = locks.acquire("write.lock").unwrap();
        lock.validate().unwrap();
    }

    #[test]
    fn test_rejects_path_like_names() {
        let tmp = tempfile::tempdir().unwrap();
        let locks = LockManager::new(tmp.path()).unwrap();
        assert!(matches!(locks.acquire("../escape"), Err(StorageError::InvalidArgument(_))));
        assert!(matches!(locks.acquire(""), Err(StorageError::InvalidArgument(_))));
    }
}
