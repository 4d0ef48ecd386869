//! Pack Compactor
//!
//! Rewrites the log without revisions that are no longer needed as of a
//! cutoff time, while commits keep running.
//!
//! ## Phases
//! ```text
//! 1. snapshot   copy the index, committed end and last tid
//! 2. mark       live = current revisions, anything at/after the cutoff,
//!               and backpointer targets of live records
//! 3. copy       write live records to `{log}.pack`, translating offsets
//! 4. catch-up   under the commit lock: copy transactions committed since
//!               the snapshot, fsync, swap files, install the new index
//! ```
//!
//! Undone transactions are dropped. Every transaction before the cutoff is
//! rewritten as a pack boundary, so undo cannot reach past it.

mod copier;
mod sweep;

use copier::{Copier, CopyMode};
use sweep::{mark_live, Sweep};

use std::fs::{self, File, OpenOptions};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{Result, StoreError};
use crate::format::FIRST_TXN_POS;
use crate::storage::FileStorage;
use crate::types::Tid;

/// Summary of a completed pack
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackReport {
    pub pack_tid: Tid,
    pub old_size: u64,
    pub new_size: u64,
    pub transactions_kept: u64,
    pub transactions_dropped: u64,
    pub records_kept: u64,
    pub records_dropped: u64,
}

/// Clears the packing flag however the pack ends
struct PackingGuard<'a>(&'a AtomicBool);

impl<'a> PackingGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Result<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| StoreError::Pack("a pack is already in progress".to_string()))?;
        Ok(Self(flag))
    }
}

impl Drop for PackingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub(crate) fn pack(storage: &FileStorage, cutoff: f64) -> Result<Option<PackReport>> {
    let _packing = PackingGuard::acquire(&storage.packing)?;
    let config = &storage.config;

    let (index, end, last_tid) = {
        let state = storage.state.lock();
        (state.index.clone(), state.pos, state.last_tid)
    };
    // A cutoff in the future packs as of the last commit
    let pack_tid = Tid::from_unix_time(cutoff).min(Tid(last_tid.0.saturating_add(1)));

    let mut reader = File::open(&config.path)?;
    let sweep = mark_live(&mut reader, end, pack_tid, &index)?;
    if !sweep.any_before {
        tracing::info!("Nothing to pack before {}", pack_tid);
        return Ok(None);
    }

    let pack_path = config.pack_path();
    let result = copy_and_swap(storage, &mut reader, &sweep, pack_tid, end, &pack_path);
    if result.is_err() {
        if let Err(e) = fs::remove_file(&pack_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("Could not remove {}: {}", pack_path.display(), e);
            }
        }
    }
    let report = result?;

    storage.save_index()?;
    tracing::info!(
        "Packed {} → {} bytes ({} transactions, {} records kept)",
        report.old_size,
        report.new_size,
        report.transactions_kept,
        report.records_kept
    );
    Ok(Some(report))
}

fn copy_and_swap(
    storage: &FileStorage,
    reader: &mut File,
    sweep: &Sweep,
    pack_tid: Tid,
    end: u64,
    pack_path: &Path,
) -> Result<PackReport> {
    let config = &storage.config;
    let mut copier = Copier::create(pack_path)?;
    copier.copy_range(
        reader,
        FIRST_TXN_POS,
        end,
        &CopyMode::Sweep {
            live: &sweep.live,
            pack_tid,
        },
    )?;

    // No transaction may be in flight while the files change under it
    let mut commit = storage.commit.lock();
    while commit.is_some() {
        storage.commit_done.wait(&mut commit);
    }

    let tail_end = storage.state.lock().pos;
    if tail_end > end {
        tracing::debug!("Pack catching up {} bytes committed meanwhile", tail_end - end);
        copier.copy_range(reader, end, tail_end, &CopyMode::Tail)?;
    }
    let (new_index, new_size, stats) = copier.finish()?;

    // Opened before the rename so nothing can fail once the log is replaced
    let packed = OpenOptions::new().read(true).write(true).open(pack_path)?;

    let mut writer = storage.writer.lock();
    let _gate = storage.pool.exclusive();
    let mut state = storage.state.lock();

    if config.pack_keep_old {
        let old_path = config.old_path();
        if old_path.exists() {
            fs::remove_file(&old_path)?;
        }
        if fs::hard_link(&config.path, &old_path).is_err() {
            fs::copy(&config.path, &old_path)?;
        }
    }
    fs::rename(pack_path, &config.path)?;

    *writer = packed;
    storage.pool.flush();
    state.index = new_index;
    state.pos = new_size;

    Ok(PackReport {
        pack_tid,
        old_size: tail_end,
        new_size,
        transactions_kept: stats.transactions_kept,
        transactions_dropped: stats.transactions_dropped,
        records_kept: stats.records_kept,
        records_dropped: stats.records_dropped,
    })
}
