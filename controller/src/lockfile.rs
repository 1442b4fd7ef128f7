//! Single-instance lockfile
//!
//! Exactly one controller process may operate a given focal plane. An
//! exclusive OS-level file lock advertises ownership; a second instance
//! fails startup with `AlreadyRunning`. The lock is released when the
//! holder drops it (or dies).

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use fps_comms_shared::error::{FpsError, Result};
use tracing::debug;

/// Held for the lifetime of the controlling process
#[derive(Debug)]
pub struct InstanceLock {
    file: File,
    path: PathBuf,
}

impl InstanceLock {
    /// Acquire the lock at `path`, creating the file if needed
    ///
    /// The holder's pid is written into the file for operators inspecting a
    /// stuck lock; the pid is advisory, the flock is what matters.
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(path)?;

        file.try_lock_exclusive().map_err(|_| FpsError::AlreadyRunning {
            path: path.to_path_buf(),
        })?;

        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;
        debug!(path = %path.display(), "instance lock acquired");

        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Path of the held lockfile
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
        debug!(path = %self.path.display(), "instance lock released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_acquire_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fps.lock");

        let held = InstanceLock::acquire(&path).unwrap();
        let error = InstanceLock::acquire(&path).unwrap_err();
        assert!(matches!(error, FpsError::AlreadyRunning { .. }));

        drop(held);
        InstanceLock::acquire(&path).unwrap();
    }

    #[test]
    fn test_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/deeper/fps.lock");
        let lock = InstanceLock::acquire(&path).unwrap();
        assert_eq!(lock.path(), path);
    }
}
