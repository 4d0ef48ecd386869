//! Reader file pool
//!
//! Readers check out their own handle so lookups never contend on a shared
//! seek position. Each checkout also holds a shared gate; pack takes the gate
//! exclusively while it swaps the log file, so no read straddles the swap.

use std::fs::File;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};

use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::Result;

/// Pool of read-only handles on the log
pub struct FilePool {
    path: PathBuf,
    gate: RwLock<()>,
    idle: Mutex<Vec<File>>,
}

impl FilePool {
    /// Idle handles kept around after use
    const MAX_IDLE: usize = 8;

    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            gate: RwLock::new(()),
            idle: Mutex::new(Vec::new()),
        }
    }

    /// Check out a handle (blocks while a file swap is in progress)
    pub fn get(&self) -> Result<PooledFile<'_>> {
        let gate = self.gate.read();
        let file = match self.idle.lock().pop() {
            Some(file) => file,
            None => File::open(&self.path)?,
        };
        Ok(PooledFile {
            pool: self,
            file: Some(file),
            _gate: gate,
        })
    }

    /// Wait for in-flight reads and block new ones
    pub fn exclusive(&self) -> RwLockWriteGuard<'_, ()> {
        self.gate.write()
    }

    /// Drop idle handles (they may point at a replaced file)
    pub fn flush(&self) {
        self.idle.lock().clear();
    }

    fn put_back(&self, file: File) {
        let mut idle = self.idle.lock();
        if idle.len() < Self::MAX_IDLE {
            idle.push(file);
        }
    }
}

/// A checked-out handle, returned to the pool on drop
pub struct PooledFile<'a> {
    pool: &'a FilePool,
    file: Option<File>,
    _gate: RwLockReadGuard<'a, ()>,
}

impl Deref for PooledFile<'_> {
    type Target = File;

    fn deref(&self) -> &File {
        // Only taken in drop
        self.file.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl DerefMut for PooledFile<'_> {
    fn deref_mut(&mut self) -> &mut File {
        self.file.as_mut().unwrap_or_else(|| unreachable!())
    }
}

impl Drop for PooledFile<'_> {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            self.pool.put_back(file);
        }
    }
}
