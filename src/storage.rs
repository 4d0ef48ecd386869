//! Storage Module
//!
//! The storage engine that coordinates all components.
//!
//! ## Responsibilities
//! - Recover the index at open (snapshot or full scan, tail truncation)
//! - Serve reads by oid, by serial and by time
//! - Drive the two-phase commit of the one in-flight transaction
//! - Run undo and pack against the log

use std::fs::{self, File, OpenOptions};
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};

use crate::commit::{self, CommitState, Phase, Transaction};
use crate::config::Config;
use crate::conflict::{ConflictContext, ConflictResolver, NoResolution};
use crate::error::{Result, StoreError};
use crate::format::{
    read_data_record_for, read_txn_header, resolve_payload, DataRecord, Payload, TxnHeader,
    TxnStatus,
};
use crate::index::{self, Index, IndexSnapshot};
use crate::iterator::TransactionIterator;
use crate::lock::AdvisoryLock;
use crate::pack::{self, PackReport};
use crate::pool::FilePool;
use crate::types::{Oid, Tid};
use crate::undo::{self, UndoDescription};

/// In-memory state guarded by the short critical section
#[derive(Debug)]
pub(crate) struct StorageState {
    pub index: Index,
    /// End of the last committed transaction
    pub pos: u64,
    pub last_tid: Tid,
    pub max_oid: Oid,
}

/// One entry of an object's revision history, newest first
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    pub tid: Tid,
    /// Commit time (unix seconds) decoded from the tid
    pub time: f64,
    pub user: Vec<u8>,
    pub description: Vec<u8>,
    pub extension: Vec<u8>,
    /// Inline payload size (0 for backpointers and tombstones)
    pub size: u64,
}

/// Single-file, append-only transactional object store
///
/// ## Concurrency Model: Single Writer / Multiple Readers
///
/// - **Commits**: serialized by the commit lock (`commit` + `commit_done`),
///   held from `tpc_begin` until `tpc_finish`/`tpc_abort`
/// - **State**: index/position/last tid behind `state`, locked only long
///   enough to copy an offset out or merge a finished transaction in
/// - **Reads**: checked-out pool handles; file I/O never holds `state`
/// - **Pack**: `packing` flag excludes undo; the final swap takes the commit
///   lock, the writer, the pool gate and `state`
///
/// Lock order: commit → writer → pool → state.
pub struct FileStorage {
    pub(crate) config: Config,
    pub(crate) resolver: Arc<dyn ConflictResolver>,
    lock: Option<AdvisoryLock>,
    pub(crate) state: Mutex<StorageState>,
    pub(crate) commit: Mutex<Option<CommitState>>,
    pub(crate) commit_done: Condvar,
    pub(crate) writer: Mutex<File>,
    pub(crate) pool: FilePool,
    pub(crate) packing: AtomicBool,
}

impl FileStorage {
    /// Open or create a storage; conflicts are never resolved
    pub fn open(config: Config) -> Result<Self> {
        Self::open_with_resolver(config, Arc::new(NoResolution))
    }

    /// Open or create a storage with a conflict resolver
    ///
    /// On startup:
    /// 1. Acquire the advisory lock (unless read-only)
    /// 2. Open/create the log, writing the magic if empty
    /// 3. Recover the index (snapshot + tail scan, or full scan)
    /// 4. Truncate any partial trailing transaction
    pub fn open_with_resolver(config: Config, resolver: Arc<dyn ConflictResolver>) -> Result<Self> {
        if config.read_only && config.create {
            return Err(StoreError::InvalidArgument(
                "cannot create a read-only storage".to_string(),
            ));
        }

        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() && !config.read_only {
                fs::create_dir_all(parent)?;
            }
        }

        let lock = if config.read_only {
            None
        } else {
            Some(AdvisoryLock::acquire(&config.lock_path())?)
        };

        if config.create {
            remove_if_exists(&config.index_path())?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(!config.read_only)
            .create(!config.read_only)
            .truncate(config.create)
            .open(&config.path)?;

        let recovered = index::recover(&mut file, &config)?;
        if let Some(pos) = recovered.truncated_at {
            tracing::warn!("Discarded incomplete transaction at {}", pos);
        }

        let pool = FilePool::new(&config.path);

        Ok(Self {
            resolver,
            lock,
            state: Mutex::new(StorageState {
                index: recovered.index,
                pos: recovered.position,
                last_tid: recovered.last_tid,
                max_oid: recovered.max_oid,
            }),
            commit: Mutex::new(None),
            commit_done: Condvar::new(),
            writer: Mutex::new(file),
            pool,
            packing: AtomicBool::new(false),
            config,
        })
    }

    /// Open with a path (convenience method)
    ///
    /// Uses default config with the specified log file
    pub fn open_path(path: &Path) -> Result<Self> {
        Self::open(Config::builder().path(path).build())
    }

    // =========================================================================
    // Reads
    // =========================================================================

    fn lookup(&self, oid: Oid) -> Result<u64> {
        self.state.lock().index.get(oid).ok_or(StoreError::NotFound(oid))
    }

    /// Current bytes and serial of an object
    pub fn load(&self, oid: Oid) -> Result<(Bytes, Tid)> {
        let mut file = self.pool.get()?;
        let pos = self.lookup(oid)?;
        let record = read_data_record_for(&mut *file, pos, oid)?;
        let data = resolve_payload(&mut *file, &record)?;
        Ok((data, record.tid))
    }

    /// Bytes of the revision written by `serial`
    pub fn load_serial(&self, oid: Oid, serial: Tid) -> Result<Bytes> {
        let mut file = self.pool.get()?;
        let pos = self.lookup(oid)?;
        load_serial_from(&mut file, oid, pos, serial)
    }

    /// Revision current just before `tid`: (bytes, its serial, serial of the
    /// next revision if any).
    ///
    /// `None` if the object did not exist just before `tid`: either it had no
    /// revision yet, or the revision then current was a tombstone.
    pub fn load_before(&self, oid: Oid, tid: Tid) -> Result<Option<(Bytes, Tid, Option<Tid>)>> {
        let mut file = self.pool.get()?;
        let mut pos = self.lookup(oid)?;
        let mut end_tid = None;

        let record = loop {
            let record = read_data_record_for(&mut *file, pos, oid)?;
            if record.tid < tid {
                break record;
            }
            end_tid = Some(record.tid);
            pos = record.prev;
            if pos == 0 {
                return Ok(None);
            }
        };

        match resolve_payload(&mut *file, &record) {
            Ok(data) => Ok(Some((data, record.tid, end_tid))),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Up to `size` revisions of an object, newest first
    pub fn history(&self, oid: Oid, size: usize) -> Result<Vec<HistoryEntry>> {
        let mut file = self.pool.get()?;
        let mut pos = self.lookup(oid)?;
        let mut entries = Vec::new();

        while entries.len() < size {
            let record = read_data_record_for(&mut *file, pos, oid)?;
            let header = read_txn_header(&mut *file, record.txn_offset)?;
            entries.push(HistoryEntry {
                tid: record.tid,
                time: record.tid.to_unix_time(),
                user: header.user,
                description: header.description,
                extension: header.extension,
                size: record.payload.data_len(),
            });
            if record.prev == 0 {
                break;
            }
            pos = record.prev;
        }
        Ok(entries)
    }

    /// Sequential walk of committed transactions with `start <= tid <= stop`
    pub fn iterator(&self, start: Option<Tid>, stop: Option<Tid>) -> Result<TransactionIterator> {
        let _gate = self.pool.get()?;
        let end = self.state.lock().pos;
        TransactionIterator::new(&self.config.path, end, start, stop)
    }

    // =========================================================================
    // Two-Phase Commit
    // =========================================================================

    /// Begin a transaction with a freshly minted tid
    ///
    /// Blocks while another transaction is in progress.
    pub fn tpc_begin(&self, txn: &Transaction) -> Result<Tid> {
        self.begin(txn, None)
    }

    /// Begin a transaction with an explicit tid (restore, replication)
    ///
    /// A tid that does not increase is logged and accepted.
    pub fn tpc_begin_at(&self, txn: &Transaction, tid: Tid) -> Result<Tid> {
        self.begin(txn, Some(tid))
    }

    fn begin(&self, txn: &Transaction, tid: Option<Tid>) -> Result<Tid> {
        if self.config.read_only {
            return Err(StoreError::ReadOnly);
        }
        TxnHeader::check_meta(txn.user(), txn.description(), txn.extension())?;

        let mut commit = self.commit.lock();
        while let Some(current) = commit.as_ref() {
            if current.txn_id == txn.id() {
                return Err(StoreError::InvalidArgument(
                    "transaction already begun".to_string(),
                ));
            }
            self.commit_done.wait(&mut commit);
        }

        let (pos, last_tid) = {
            let state = self.state.lock();
            (state.pos, state.last_tid)
        };
        let tid = match tid {
            Some(tid) => {
                if tid <= last_tid {
                    tracing::warn!("Explicit tid {} does not follow last tid {}", tid, last_tid);
                }
                tid
            }
            None => Tid::now().later_than(last_tid),
        };

        *commit = Some(CommitState::begin(txn, tid, pos)?);
        tracing::trace!("Began transaction {} at {}", tid, pos);
        Ok(tid)
    }

    /// Stage a new revision of `oid`, based on `old_serial`
    ///
    /// If `old_serial` is not the committed serial, the conflict resolver is
    /// consulted; when it declines, `Conflict` is returned and nothing is
    /// staged. Returns the serial the revision will carry.
    pub fn store(&self, oid: Oid, old_serial: Tid, data: &[u8], txn: &Transaction) -> Result<Tid> {
        if self.config.read_only {
            return Err(StoreError::ReadOnly);
        }
        if data.is_empty() {
            return Err(StoreError::InvalidArgument(format!(
                "empty payload for {}",
                oid
            )));
        }

        let mut commit = self.commit.lock();
        let pending = commit.as_mut().ok_or(StoreError::TransactionMismatch)?;
        pending.check_owner(txn)?;
        pending.check_begun()?;
        let tid = pending.tid();

        let mut file = self.pool.get()?;
        let committed_pos = self.state.lock().index.get(oid);

        let mut payload = Bytes::copy_from_slice(data);
        let mut resolved = false;
        if let Some(pos) = committed_pos {
            let committed = read_data_record_for(&mut *file, pos, oid)?;
            if committed.tid != old_serial {
                let committed_data = match resolve_payload(&mut *file, &committed) {
                    Ok(data) => data,
                    Err(StoreError::NotFound(_)) => Bytes::new(),
                    Err(e) => return Err(e),
                };
                let old_data = load_serial_from(&mut file, oid, pos, old_serial).ok();
                let conflict = ConflictContext {
                    oid,
                    committed_serial: committed.tid,
                    old_serial,
                    old_data,
                    committed_data,
                    new_data: data,
                };
                match self.resolver.resolve(&conflict) {
                    Some(merged) if !merged.is_empty() => {
                        tracing::debug!("Resolved conflict on {}", oid);
                        payload = Bytes::from(merged);
                        resolved = true;
                    }
                    _ => {
                        return Err(StoreError::Conflict {
                            oid,
                            committed: committed.tid,
                            expected: old_serial,
                        })
                    }
                }
            }
        }
        drop(file);

        let record = DataRecord::new(oid, tid, committed_pos.unwrap_or(0), 0, Payload::Inline(payload));
        if let Some(quota) = self.config.quota {
            let size = pending.projected_end() + record.record_len();
            if size > quota {
                return Err(StoreError::QuotaExceeded { quota, size });
            }
        }

        pending.stage(record);
        if resolved {
            pending.resolved.push(oid);
        }

        // Only staged writes move the oid counter
        let mut state = self.state.lock();
        if oid > state.max_oid {
            state.max_oid = oid;
        }
        Ok(tid)
    }

    /// Write the transaction (status InProgress) at the end of the log
    ///
    /// Returns the oids whose writes were merged by the conflict resolver.
    pub fn tpc_vote(&self, txn: &Transaction) -> Result<Vec<Oid>> {
        let mut commit = self.commit.lock();
        let pending = commit.as_mut().ok_or(StoreError::TransactionMismatch)?;
        pending.check_owner(txn)?;
        pending.check_begun()?;

        if pending.is_empty() {
            pending.phase = Phase::Voted {
                next_pos: pending.header.pos,
            };
            return Ok(pending.resolved.clone());
        }

        pending.check_quota(self.config.quota)?;
        let bytes = pending.encode_transaction();
        {
            let mut writer = self.writer.lock();
            commit::write_transaction(&mut writer, pending.header.pos, &bytes, self.config.sync_strategy)?;
        }

        pending.phase = Phase::Voted {
            next_pos: pending.header.pos + bytes.len() as u64,
        };
        tracing::trace!(
            "Voted transaction {} ({} bytes at {})",
            pending.tid(),
            bytes.len(),
            pending.header.pos
        );
        Ok(pending.resolved.clone())
    }

    /// Flip the status byte to Normal and publish the transaction
    pub fn tpc_finish(&self, txn: &Transaction) -> Result<Tid> {
        let mut commit = self.commit.lock();
        let pending = commit.as_ref().ok_or(StoreError::TransactionMismatch)?;
        pending.check_owner(txn)?;
        let next_pos = match pending.phase {
            Phase::Voted { next_pos } => next_pos,
            Phase::Begun => {
                return Err(StoreError::InvalidArgument(
                    "finish called before vote".to_string(),
                ))
            }
        };
        let tid = pending.tid();

        if !pending.is_empty() {
            let mut writer = self.writer.lock();
            commit::write_status(&mut writer, pending.header.pos, TxnStatus::Normal, self.config.sync_strategy)?;

            let mut state = self.state.lock();
            state.pos = next_pos;
            state.index.extend(pending.staged_entries());
            state.last_tid = tid;
        }

        *commit = None;
        self.commit_done.notify_all();
        tracing::debug!("Committed transaction {}", tid);
        Ok(tid)
    }

    /// Abandon the transaction, truncating anything vote wrote
    pub fn tpc_abort(&self, txn: &Transaction) -> Result<()> {
        let mut commit = self.commit.lock();
        let Some(pending) = commit.as_ref() else {
            return Ok(());
        };
        pending.check_owner(txn)?;

        if matches!(pending.phase, Phase::Voted { .. }) && !pending.is_empty() {
            let mut writer = self.writer.lock();
            commit::truncate_to(&mut writer, pending.header.pos)?;
        }

        tracing::debug!("Aborted transaction {}", pending.tid());
        *commit = None;
        self.commit_done.notify_all();
        Ok(())
    }

    // =========================================================================
    // Undo
    // =========================================================================

    /// Stage records reverting transaction `undo_tid` into `txn`
    ///
    /// Returns the tid the undo will commit as and the affected oids. If any
    /// object cannot be reverted nothing is staged.
    pub fn undo(&self, undo_tid: Tid, txn: &Transaction) -> Result<(Tid, Vec<Oid>)> {
        if self.config.read_only {
            return Err(StoreError::ReadOnly);
        }

        let mut commit = self.commit.lock();
        let pending = commit.as_mut().ok_or(StoreError::TransactionMismatch)?;
        pending.check_owner(txn)?;
        pending.check_begun()?;

        if self.packing.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(StoreError::Undo(
                "undo is disabled while a pack is in progress".to_string(),
            ));
        }

        let mut file = self.pool.get()?;
        let end = pending.header.pos;
        let header = undo::find_transaction(&mut *file, end, undo_tid)?;
        let plan = undo::plan_undo(
            &mut *file,
            &header,
            pending,
            |oid| self.state.lock().index.get(oid),
            self.resolver.as_ref(),
        )?;
        drop(file);

        if let Some(quota) = self.config.quota {
            let size = pending.projected_end() + plan.records.iter().map(|r| r.record_len()).sum::<u64>();
            if size > quota {
                return Err(StoreError::QuotaExceeded { quota, size });
            }
        }

        let tid = pending.tid();
        pending.stage_all(plan.records);
        tracing::debug!("Staged undo of {} ({} objects)", undo_tid, plan.oids.len());
        Ok((tid, plan.oids))
    }

    /// Undo `undo_tid` in a transaction of its own
    pub fn undo_transaction(&self, undo_tid: Tid, txn: &Transaction) -> Result<(Tid, Vec<Oid>)> {
        self.tpc_begin(txn)?;
        let oids = match self.undo(undo_tid, txn).and_then(|(_, oids)| {
            self.tpc_vote(txn)?;
            Ok(oids)
        }) {
            Ok(oids) => oids,
            Err(e) => {
                self.tpc_abort(txn)?;
                return Err(e);
            }
        };
        let tid = self.tpc_finish(txn)?;
        Ok((tid, oids))
    }

    /// Undoable transactions, newest first, positions `[first, last)`
    pub fn undo_log(&self, first: usize, last: usize) -> Result<Vec<UndoDescription>> {
        let mut file = self.pool.get()?;
        let end = self.state.lock().pos;
        undo::undo_log(&mut *file, end, first, last)
    }

    // =========================================================================
    // Pack
    // =========================================================================

    /// Drop revisions no longer needed as of `cutoff` (unix seconds)
    ///
    /// Returns `None` when no transaction precedes the cutoff.
    pub fn pack(&self, cutoff: f64) -> Result<Option<PackReport>> {
        if self.config.read_only {
            return Err(StoreError::ReadOnly);
        }
        pack::pack(self, cutoff)
    }

    // =========================================================================
    // Object Ids
    // =========================================================================

    /// Allocate an oid above every oid seen so far
    pub fn new_oid(&self) -> Result<Oid> {
        if self.config.read_only {
            return Err(StoreError::ReadOnly);
        }
        let mut state = self.state.lock();
        state.max_oid = Oid(state.max_oid.0 + 1);
        Ok(state.max_oid)
    }

    // =========================================================================
    // Index Snapshot
    // =========================================================================

    /// Write the index snapshot for fast reopen
    pub fn save_index(&self) -> Result<()> {
        if self.config.read_only {
            return Err(StoreError::ReadOnly);
        }
        let snapshot = {
            let state = self.state.lock();
            IndexSnapshot::new(&state.index, state.pos, state.last_tid, state.max_oid)
        };
        index::save_snapshot(&self.config.index_path(), &self.config.index_tmp_path(), &snapshot)
    }

    /// Close the storage
    ///
    /// Aborts nothing: an unfinished transaction is simply not committed.
    /// Saves the index snapshot when configured.
    pub fn close(mut self) -> Result<()> {
        if self.config.save_index_on_close && !self.config.read_only {
            self.save_index()?;
        }
        if let Some(lock) = self.lock.take() {
            lock.release()?;
        }
        tracing::info!("Closed {}", self.config.path.display());
        Ok(())
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Size of the committed log in bytes
    pub fn get_size(&self) -> u64 {
        self.state.lock().pos
    }

    /// Number of objects in the index
    pub fn len(&self) -> usize {
        self.state.lock().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().index.is_empty()
    }

    /// Tid of the last committed transaction
    pub fn last_transaction(&self) -> Tid {
        self.state.lock().last_tid
    }

    /// Copy of the in-memory index
    pub fn index(&self) -> Index {
        self.state.lock().index.clone()
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn is_read_only(&self) -> bool {
        self.config.read_only
    }
}

/// Walk the revision chain from `pos` to the record written by `serial`
fn load_serial_from(file: &mut File, oid: Oid, mut pos: u64, serial: Tid) -> Result<Bytes> {
    loop {
        let record = read_data_record_for(file, pos, oid)?;
        if record.tid == serial {
            return resolve_payload(file, &record);
        }
        if record.tid < serial || record.prev == 0 {
            return Err(StoreError::NotFound(oid));
        }
        pos = record.prev;
    }
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
