//! Single-instance advisory lock over a PID file.
//!
//! The file holds the decimal PID plus LF and stays exclusively locked for
//! the daemon's whole lifetime. Acquisition is non-blocking: contention
//! reports the PID of the instance that owns the slot.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;

use crate::core::errors::{Result, SageError};

/// Held exclusive lock. Releasing (or dropping) unlocks and removes the
/// PID file.
#[derive(Debug)]
pub struct InstanceLock {
    path: PathBuf,
    file: Option<File>,
}

impl InstanceLock {
    /// Try to acquire the lock, non-blocking.
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| SageError::io(parent, e))?;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| SageError::io(path, e))?;

        if file.try_lock_exclusive().is_err() {
            let mut existing = String::new();
            let _ = file.read_to_string(&mut existing);
            let pid = existing.trim().to_string();
            return Err(SageError::LockContention {
                path: path.to_path_buf(),
                pid: if pid.is_empty() { "unknown".to_string() } else { pid },
            });
        }

        file.set_len(0).map_err(|e| SageError::io(path, e))?;
        file.seek(SeekFrom::Start(0)).map_err(|e| SageError::io(path, e))?;
        writeln!(file, "{}", std::process::id()).map_err(|e| SageError::io(path, e))?;
        file.flush().map_err(|e| SageError::io(path, e))?;

        Ok(Self {
            path: path.to_path_buf(),
            file: Some(file),
        })
    }

    /// The PID file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Unlock and remove the PID file. Idempotent.
    pub fn release(&mut self) {
        if let Some(file) = self.file.take() {
            let _ = fs2::FileExt::unlock(&file);
            drop(file);
            let _ = fs::remove_file(&self.path);
        }
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_writes_pid_with_lf() {
        let tmp = tempfile::tempdir().unwrap();
        let pid_file = tmp.path().join("daemon.pid");
        let lock = InstanceLock::acquire(&pid_file).unwrap();

        let contents = fs::read_to_string(&pid_file).unwrap();
        assert_eq!(contents, format!("{}\n", std::process::id()));
        drop(lock);
    }

    #[test]
    fn second_acquire_reports_existing_pid() {
        let tmp = tempfile::tempdir().unwrap();
        let pid_file = tmp.path().join("daemon.pid");
        let _held = InstanceLock::acquire(&pid_file).unwrap();

        let err = InstanceLock::acquire(&pid_file).unwrap_err();
        match err {
            SageError::LockContention { pid, .. } => {
                assert_eq!(pid, std::process::id().to_string());
            }
            other => panic!("expected LockContention, got {other}"),
        }
    }

    #[test]
    fn release_removes_pid_file_and_frees_slot() {
        let tmp = tempfile::tempdir().unwrap();
        let pid_file = tmp.path().join("daemon.pid");

        let mut lock = InstanceLock::acquire(&pid_file).unwrap();
        lock.release();
        assert!(!pid_file.exists());
        // Idempotent.
        lock.release();

        // Slot is free again.
        let again = InstanceLock::acquire(&pid_file).unwrap();
        drop(again);
        assert!(!pid_file.exists());
    }

    #[test]
    fn drop_releases() {
        let tmp = tempfile::tempdir().unwrap();
        let pid_file = tmp.path().join("daemon.pid");
        {
            let _lock = InstanceLock::acquire(&pid_file).unwrap();
            assert!(pid_file.exists());
        }
        assert!(!pid_file.exists());
        let _ = InstanceLock::acquire(&pid_file).unwrap();
    }
}
