use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;

#[derive(thiserror::Error, Debug)]
pub enum LockError {
    #[error("another instance holds the lock on {0}")]
    Contended(PathBuf),
    #[error("could not lock {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Exclusive advisory lock on a lockfile. One briefcase, one writer.
///
/// The lock is per-process (flock semantics); threads inside the process are
/// expected to coordinate through ordinary synchronization. Dropping the
/// handle unlocks and makes a best-effort attempt to delete the lockfile.
pub struct LockHandle {
    path: PathBuf,
    file: Option<File>,
}

/// Acquire an exclusive lock on `path`, creating the file if needed.
/// Contention is an error, not a wait: a held lock means another instance is
/// already managing this briefcase.
pub fn lock_file(path: &Path) -> Result<LockHandle, LockError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|source| LockError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        }
    }

    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(path)
        .map_err(|source| LockError::Io {
            path: path.to_path_buf(),
            source,
        })?;

    tracing::debug!(lockfile = %path.display(), "attempting exclusive lock");
    match file.try_lock_exclusive() {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
            return Err(LockError::Contended(path.to_path_buf()));
        }
        Err(source) => {
            return Err(LockError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    }
    tracing::debug!(lockfile = %path.display(), "acquired exclusive lock");

    Ok(LockHandle {
        path: path.to_path_buf(),
        file: Some(file),
    })
}

impl LockHandle {
    /// Release the lock and try to delete the lockfile. Failing to delete is
    /// not an error.
    pub fn unlock(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(file) = self.file.take() {
            if let Err(err) = fs2::FileExt::unlock(&file) {
                tracing::warn!(lockfile = %self.path.display(), error = %err, "could not release lock");
                return;
            }
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_lock_attempt_is_contended() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("briefcase.lck");

        let held = lock_file(&path).unwrap();
        match lock_file(&path) {
            Err(LockError::Contended(p)) => assert_eq!(p, path),
            other => panic!("expected contention, got {:?}", other.map(|_| ())),
        }
        held.unlock();

        // After unlock the lockfile is gone and the lock is free again.
        assert!(!path.exists());
        let _relock = lock_file(&path).unwrap();
    }

    #[test]
    fn lock_creates_parent_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("deep/nested/briefcase.lck");
        let handle = lock_file(&path).unwrap();
        assert!(path.exists());
        drop(handle);
        assert!(!path.exists());
    }
}
