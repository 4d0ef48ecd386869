//! Advisory lock file
//!
//! Held for the lifetime of a writable storage so a second process cannot
//! open the same log for writing. The lock is released when the handle drops.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;

use crate::error::{Result, StoreError};

/// Exclusive advisory lock on `{log}.lock`
#[derive(Debug)]
pub struct AdvisoryLock {
    path: PathBuf,
    file: File,
}

impl AdvisoryLock {
    /// Acquire the lock without blocking; `Locked` if another holder exists
    pub fn acquire(path: &Path) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        if file.try_lock_exclusive().is_err() {
            return Err(StoreError::Locked(path.to_path_buf()));
        }

        // Record the holder for whoever inspects a stale lock file
        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;

        tracing::debug!("Acquired lock {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    /// Release explicitly (also happens on drop)
    pub fn release(self) -> Result<()> {
        self.file.unlock()?;
        tracing::debug!("Released lock {}", self.path.display());
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
