//! Configuration for filestore
//!
//! Centralized configuration with sensible defaults.

use std::path::{Path, PathBuf};

/// Main configuration for a FileStorage instance
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Log File Configuration
    // -------------------------------------------------------------------------
    /// Path of the log file. Sibling files are derived from it:
    ///   {path}            (the append-only log)
    ///   {path}.index      (index snapshot)
    ///   {path}.lock       (advisory lock)
    ///   {path}.pack       (pack output, renamed over the log)
    ///   {path}.old        (pre-pack backup)
    pub path: PathBuf,

    /// Start from an empty log, discarding any existing one
    pub create: bool,

    /// Open without taking the lock; all mutations fail with `ReadOnly`
    pub read_only: bool,

    /// Maximum log size in bytes (None = unlimited)
    pub quota: Option<u64>,

    // -------------------------------------------------------------------------
    // Durability Configuration
    // -------------------------------------------------------------------------
    /// How commits reach the disk
    pub sync_strategy: SyncStrategy,

    // -------------------------------------------------------------------------
    // Index Configuration
    // -------------------------------------------------------------------------
    /// Number of trailing transactions checked before trusting a snapshot
    pub sanity_check_depth: usize,

    /// Write the index snapshot on close
    pub save_index_on_close: bool,

    // -------------------------------------------------------------------------
    // Pack Configuration
    // -------------------------------------------------------------------------
    /// Keep the pre-pack log as {path}.old
    pub pack_keep_old: bool,
}

/// Commit sync strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStrategy {
    /// fsync the body at vote and again after the status flip (safest)
    EveryCommit,

    /// Leave flushing to the OS (tests, scratch stores)
    OsBuffered,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./Data.fs"),
            create: false,
            read_only: false,
            quota: None,
            sync_strategy: SyncStrategy::EveryCommit,
            sanity_check_depth: 5,
            save_index_on_close: true,
            pack_keep_old: true,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    pub fn index_path(&self) -> PathBuf {
        sibling(&self.path, "index")
    }

    pub fn lock_path(&self) -> PathBuf {
        sibling(&self.path, "lock")
    }

    pub fn pack_path(&self) -> PathBuf {
        sibling(&self.path, "pack")
    }

    pub fn old_path(&self) -> PathBuf {
        sibling(&self.path, "old")
    }

    pub(crate) fn index_tmp_path(&self) -> PathBuf {
        sibling(&self.path, "index_tmp")
    }
}

/// "{path}.{suffix}" without touching the original extension
fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the log file path
    pub fn path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.path = path.into();
        self
    }

    /// Discard any existing log and start empty
    pub fn create(mut self, create: bool) -> Self {
        self.config.create = create;
        self
    }

    /// Open read-only
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.config.read_only = read_only;
        self
    }

    /// Set the size quota (in bytes)
    pub fn quota(mut self, bytes: u64) -> Self {
        self.config.quota = Some(bytes);
        self
    }

    /// Set the commit sync strategy
    pub fn sync_strategy(mut self, strategy: SyncStrategy) -> Self {
        self.config.sync_strategy = strategy;
        self
    }

    /// Set how many trailing transactions verify a snapshot
    pub fn sanity_check_depth(mut self, depth: usize) -> Self {
        self.config.sanity_check_depth = depth;
        self
    }

    /// Save the index snapshot on close
    pub fn save_index_on_close(mut self, save: bool) -> Self {
        self.config.save_index_on_close = save;
        self
    }

    /// Keep the pre-pack backup
    pub fn pack_keep_old(mut self, keep: bool) -> Self {
        self.config.pack_keep_old = keep;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
