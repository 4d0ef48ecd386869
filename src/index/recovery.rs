//! Index recovery
//!
//! Three independent steps, composed by [`recover`]:
//! 1. [`load_snapshot`](super::load_snapshot) restores a saved index
//! 2. [`verify_tail`] checks the snapshot against the last K transactions
//! 3. [`scan_forward`] replays the log from an offset; with offset 4 and an
//!    empty index this is [`rebuild_from_scratch`]
//!
//! A trailing transaction that is still InProgress, that extends past EOF,
//! or whose header is cut off is the crash signal: the file is truncated back
//! to its start.

use std::collections::HashSet;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

use crate::config::Config;
use crate::error::{Result, StoreError};
use crate::format::{
    read_data_record, read_trailer, read_txn_header, stream_len, FixedTxnHeader, TxnStatus,
    FIRST_TXN_POS, MAGIC, TRAILER_LEN, TXN_HEADER_LEN,
};
use crate::types::{Oid, Tid};

use super::{load_snapshot, Index};

/// Result of a forward scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanOutcome {
    /// End of the last complete transaction
    pub position: u64,

    /// Tid of the last complete transaction
    pub last_tid: Tid,

    /// Number of transactions replayed
    pub transactions: u64,

    /// Offset the file was cut back to, if a partial tail was found
    pub truncated_at: Option<u64>,
}

/// Result of opening a log
#[derive(Debug)]
pub struct RecoveryResult {
    pub index: Index,

    /// End of the last committed transaction
    pub position: u64,

    pub max_oid: Oid,

    pub last_tid: Tid,

    /// Whether the index came from a verified snapshot
    pub used_snapshot: bool,

    /// Transactions replayed by the forward scan
    pub transactions_scanned: u64,

    /// Offset the file was cut back to, if a partial tail was found
    pub truncated_at: Option<u64>,
}

/// Open-time recovery: magic check, snapshot load + verification, forward scan
pub fn recover(file: &mut File, config: &Config) -> Result<RecoveryResult> {
    let file_len = stream_len(file)?;

    if file_len == 0 {
        if !config.read_only {
            file.seek(SeekFrom::Start(0))?;
            file.write_all(MAGIC)?;
            file.sync_all()?;
            tracing::info!("Created new log {}", config.path.display());
        }
        return Ok(RecoveryResult {
            index: Index::new(),
            position: FIRST_TXN_POS,
            max_oid: Oid::ZERO,
            last_tid: Tid::ZERO,
            used_snapshot: false,
            transactions_scanned: 0,
            truncated_at: None,
        });
    }

    check_magic(file, file_len)?;

    let mut snapshot_max_oid = Oid::ZERO;
    let (mut index, start, last_tid, used_snapshot) = match load_snapshot(&config.index_path())? {
        Some(snapshot) => {
            let index = snapshot.to_index();
            if verify_tail(file, &index, snapshot.position, snapshot.last_tid, config.sanity_check_depth)? {
                tracing::debug!(
                    "Index snapshot verified at position {} ({} entries)",
                    snapshot.position,
                    index.len()
                );
                snapshot_max_oid = snapshot.max_oid;
                (index, snapshot.position, snapshot.last_tid, true)
            } else {
                tracing::warn!(
                    "Index snapshot for {} failed verification, rebuilding",
                    config.path.display()
                );
                (Index::new(), FIRST_TXN_POS, Tid::ZERO, false)
            }
        }
        None => (Index::new(), FIRST_TXN_POS, Tid::ZERO, false),
    };

    let outcome = scan_forward(file, start, &mut index, last_tid, config.read_only)?;
    let max_oid = index.max_oid().unwrap_or(Oid::ZERO).max(snapshot_max_oid);

    tracing::info!(
        "Recovered {}: position={}, objects={}, replayed={}, snapshot={}",
        config.path.display(),
        outcome.position,
        index.len(),
        outcome.transactions,
        used_snapshot
    );

    Ok(RecoveryResult {
        index,
        position: outcome.position,
        max_oid,
        last_tid: outcome.last_tid,
        used_snapshot,
        transactions_scanned: outcome.transactions,
        truncated_at: outcome.truncated_at,
    })
}

fn check_magic<R: Read + Seek>(r: &mut R, file_len: u64) -> Result<()> {
    if file_len < FIRST_TXN_POS {
        return Err(StoreError::Format(format!(
            "file of {} bytes is too short for a log header",
            file_len
        )));
    }
    let mut magic = [0u8; 4];
    r.seek(SeekFrom::Start(0))?;
    r.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(StoreError::Format(format!(
            "invalid magic: expected {:?}, got {:?}",
            MAGIC, magic
        )));
    }
    Ok(())
}

/// Full replay from the first transaction into a fresh index
pub fn rebuild_from_scratch(file: &mut File, read_only: bool) -> Result<(Index, ScanOutcome)> {
    let file_len = stream_len(file)?;
    check_magic(file, file_len)?;
    let mut index = Index::new();
    let outcome = scan_forward(file, FIRST_TXN_POS, &mut index, Tid::ZERO, read_only)?;
    Ok((index, outcome))
}

/// Check a snapshot against the last `depth` non-undone transactions ending
/// at `position`. Any read failure counts as a failed check.
pub fn verify_tail<R: Read + Seek>(
    r: &mut R,
    index: &Index,
    position: u64,
    last_tid: Tid,
    depth: usize,
) -> Result<bool> {
    match check_tail(r, index, position, last_tid, depth) {
        Ok(sane) => Ok(sane),
        Err(StoreError::Io(e)) => Err(StoreError::Io(e)),
        Err(e) => {
            tracing::debug!("Tail check failed: {}", e);
            Ok(false)
        }
    }
}

fn check_tail<R: Read + Seek>(
    r: &mut R,
    index: &Index,
    position: u64,
    last_tid: Tid,
    depth: usize,
) -> Result<bool> {
    let file_len = stream_len(r)?;
    if position < FIRST_TXN_POS || position > file_len {
        return Ok(false);
    }
    if position == FIRST_TXN_POS {
        return Ok(index.is_empty() && last_tid == Tid::ZERO);
    }

    // oids written by transactions already checked (later in the log)
    let mut superseded: HashSet<Oid> = HashSet::new();
    let mut checked = 0;
    let mut end = position;
    let mut first = true;

    while checked < depth && end > FIRST_TXN_POS {
        if end < FIRST_TXN_POS + TRAILER_LEN {
            return Ok(false);
        }
        let tlen = read_trailer(r, end - TRAILER_LEN)?;
        let Some(tpos) = (end - TRAILER_LEN).checked_sub(tlen) else {
            return Ok(false);
        };
        if tpos < FIRST_TXN_POS {
            return Ok(false);
        }

        let header = read_txn_header(r, tpos)?;
        if header.tlen != tlen || header.status == TxnStatus::InProgress {
            return Ok(false);
        }
        if first {
            if header.tid != last_tid {
                return Ok(false);
            }
            first = false;
        }
        end = tpos;
        if header.status == TxnStatus::Undone {
            continue;
        }
        checked += 1;

        let mut pos = header.data_start();
        let data_end = header.data_end();
        let mut written = Vec::new();
        while pos < data_end {
            let record = read_data_record(r, pos)?;
            if pos + record.record_len() > data_end || record.txn_offset != tpos {
                return Ok(false);
            }
            if !superseded.contains(&record.oid) && index.get(record.oid) != Some(pos) {
                return Ok(false);
            }
            written.push(record.oid);
            pos += record.record_len();
        }
        if pos != data_end {
            return Ok(false);
        }
        superseded.extend(written);
    }

    Ok(true)
}

/// Replay transactions from `start` into `index`
///
/// Undone transactions are skipped. A tid that does not increase is logged
/// and accepted. A damaged tail is truncated (left alone when `read_only`).
pub fn scan_forward(
    file: &mut File,
    start: u64,
    index: &mut Index,
    last_tid: Tid,
    read_only: bool,
) -> Result<ScanOutcome> {
    let file_len = stream_len(file)?;
    let mut pos = start;
    let mut last_tid = last_tid;
    let mut transactions = 0;
    let mut truncated_at = None;

    while pos < file_len {
        if file_len - pos < TXN_HEADER_LEN {
            truncated_at = truncate_tail(file, pos, "partial transaction header", read_only)?;
            break;
        }

        let mut fixed_buf = [0u8; TXN_HEADER_LEN as usize];
        file.seek(SeekFrom::Start(pos))?;
        file.read_exact(&mut fixed_buf)?;
        let fixed = FixedTxnHeader::decode(&fixed_buf);

        let end = pos.checked_add(fixed.tlen).and_then(|e| e.checked_add(TRAILER_LEN));
        let past_eof = end.map_or(true, |e| e > file_len);
        if past_eof || fixed.status == TxnStatus::InProgress.as_byte() {
            let reason = if past_eof {
                "transaction extends past end of file"
            } else {
                "transaction still in progress"
            };
            truncated_at = truncate_tail(file, pos, reason, read_only)?;
            break;
        }
        let end = end.unwrap_or(file_len);

        if fixed.tlen < fixed.header_len() {
            // Garbage at the very end (crash mid-write) is recoverable;
            // a short header followed by a valid tail is not.
            let last_tlen = read_trailer(file, file_len - TRAILER_LEN)?;
            let last_start = file_len.checked_sub(last_tlen);
            if last_start.map_or(true, |start| start < pos) || last_tlen < TXN_HEADER_LEN {
                truncated_at = truncate_tail(file, pos, "invalid transaction header", read_only)?;
                break;
            }
            return Err(StoreError::corruption(pos, "invalid transaction header"));
        }

        let header = read_txn_header(file, pos)?;
        if header.tid <= last_tid {
            tracing::warn!(
                "Time-stamp reduction at {}: {} follows {}",
                pos,
                header.tid,
                last_tid
            );
        }

        if header.status != TxnStatus::Undone {
            let mut written = Vec::new();
            let mut dpos = header.data_start();
            let data_end = header.data_end();
            while dpos < data_end {
                let record = read_data_record(file, dpos)?;
                if dpos + record.record_len() > data_end || record.txn_offset != pos {
                    return Err(StoreError::corruption(
                        dpos,
                        "data record exceeds its transaction",
                    ));
                }
                if index.get(record.oid).unwrap_or(0) != record.prev {
                    tracing::warn!("Incorrect previous pointer for {} at {}", record.oid, dpos);
                }
                written.push((record.oid, dpos));
                dpos += record.record_len();
            }
            if dpos != data_end {
                return Err(StoreError::corruption(pos, "data records don't add up"));
            }
            if read_trailer(file, data_end)? != header.tlen {
                return Err(StoreError::corruption(pos, "redundant transaction length mismatch"));
            }
            index.extend(written);
        } else if read_trailer(file, header.data_end())? != header.tlen {
            return Err(StoreError::corruption(pos, "redundant transaction length mismatch"));
        }

        last_tid = header.tid;
        transactions += 1;
        pos = end;
    }

    Ok(ScanOutcome {
        position: pos,
        last_tid,
        transactions,
        truncated_at,
    })
}

fn truncate_tail(file: &mut File, pos: u64, reason: &str, read_only: bool) -> Result<Option<u64>> {
    if read_only {
        tracing::warn!("Ignoring damaged tail at {} ({}): storage is read-only", pos, reason);
        return Ok(None);
    }
    tracing::warn!("Truncating log at {}: {}", pos, reason);
    file.set_len(pos)?;
    file.sync_all()?;
    Ok(Some(pos))
}
