//! Undo Engine
//!
//! Undo never rewrites history. Reverting transaction T appends, in the
//! current transaction, one record per object T touched that makes the
//! revision before T current again:
//!
//! - if T created the object, a tombstone
//! - if the current bytes are still T's bytes, a backpointer to the revision
//!   before T
//! - otherwise a three-way merge through the conflict resolver, or a failure
//!
//! Every failure for T is collected before anything is staged, so an undo
//! either stages all its records or none.

use std::collections::BTreeMap;
use std::io::{Read, Seek};

use bytes::Bytes;

use crate::commit::CommitState;
use crate::conflict::{ConflictContext, ConflictResolver};
use crate::error::{Result, StoreError};
use crate::format::{
    load_back, read_data_record, read_data_record_for, read_trailer, read_txn_header,
    resolve_data_pos, resolve_payload, DataRecord, Payload, TxnHeader, TxnStatus, FIRST_TXN_POS,
    TRAILER_LEN,
};
use crate::types::{Oid, Tid};

/// An undoable transaction as listed by `undo_log`
#[derive(Debug, Clone, PartialEq)]
pub struct UndoDescription {
    pub id: Tid,
    /// Commit time (unix seconds) decoded from the tid
    pub time: f64,
    pub user: Vec<u8>,
    pub description: Vec<u8>,
    pub extension: Vec<u8>,
}

/// Records reverting one transaction, ready to stage
#[derive(Debug)]
pub(crate) struct UndoPlan {
    pub records: Vec<DataRecord>,
    pub oids: Vec<Oid>,
}

/// Header preceding the transaction that ends at `end`
fn previous_header<R: Read + Seek>(r: &mut R, end: u64) -> Result<TxnHeader> {
    let trailer_pos = end - TRAILER_LEN;
    let tlen = read_trailer(r, trailer_pos)?;
    let pos = trailer_pos
        .checked_sub(tlen)
        .filter(|pos| *pos >= FIRST_TXN_POS)
        .ok_or_else(|| StoreError::corruption(trailer_pos, format!("trailer length {} out of range", tlen)))?;
    let header = read_txn_header(r, pos)?;
    if header.tlen != tlen {
        return Err(StoreError::corruption(
            pos,
            format!("trailer {} disagrees with header length {}", tlen, header.tlen),
        ));
    }
    Ok(header)
}

/// Walk backward from `end` to the transaction with `tid`
///
/// The walk stops at the first pack boundary: history beyond it has been
/// rewritten and cannot be undone.
pub(crate) fn find_transaction<R: Read + Seek>(r: &mut R, end: u64, tid: Tid) -> Result<TxnHeader> {
    let mut pos = end;
    while pos > FIRST_TXN_POS {
        let header = previous_header(r, pos)?;
        if header.tid == tid {
            return Ok(header);
        }
        if header.status == TxnStatus::PackBoundary {
            break;
        }
        pos = header.pos;
    }
    Err(StoreError::Undo(format!("invalid transaction id {}", tid)))
}

/// Compute the records reverting the transaction at `header`
pub(crate) fn plan_undo<R, F>(
    r: &mut R,
    header: &TxnHeader,
    pending: &CommitState,
    committed: F,
    resolver: &dyn ConflictResolver,
) -> Result<UndoPlan>
where
    R: Read + Seek,
    F: Fn(Oid) -> Option<u64>,
{
    if header.status != TxnStatus::Normal {
        return Err(StoreError::Undo(format!(
            "transaction {} is not undoable",
            header.tid
        )));
    }

    let tid = pending.tid();
    let mut records = Vec::new();
    let mut oids = Vec::new();
    let mut failures: BTreeMap<Oid, String> = BTreeMap::new();

    let mut pos = header.data_start();
    while pos < header.data_end() {
        let record = read_data_record(r, pos)?;
        // A later record for the same oid gets a second chance
        failures.remove(&record.oid);

        match undo_record(r, &record, pending, &committed, resolver) {
            Ok((payload, prev)) => {
                records.push(DataRecord::new(record.oid, tid, prev, 0, payload));
                oids.push(record.oid);
            }
            Err(StoreError::Undo(reason)) => {
                failures.insert(record.oid, reason);
            }
            Err(e) => return Err(e),
        }
        pos += record.record_len();
    }

    if pos != header.data_end() {
        return Err(StoreError::corruption(
            header.pos,
            "data records overrun the transaction",
        ));
    }
    if !failures.is_empty() {
        return Err(StoreError::MultipleUndo(failures.into_iter().collect()));
    }

    Ok(UndoPlan { records, oids })
}

/// Payload and prev pointer for the record reverting `record`
///
/// Fails with `Undo` when the object changed in a way that cannot be reverted.
fn undo_record<R, F>(
    r: &mut R,
    record: &DataRecord,
    pending: &CommitState,
    committed: &F,
    resolver: &dyn ConflictResolver,
) -> Result<(Payload, u64)>
where
    R: Read + Seek,
    F: Fn(Oid) -> Option<u64>,
{
    let oid = record.oid;
    let pos = record.pos;
    let pre = record.prev;

    let staged = pending.staged_pos(oid);
    let ipos = committed(oid).unwrap_or(0);
    let tipos = staged.unwrap_or(ipos);

    let mut copy = true;
    let mut current = None;

    if tipos != pos {
        let cur = match staged {
            Some(spos) => pending.staged_record(spos)?,
            None => read_data_record_for(r, ipos, oid)
                .map_err(|_| StoreError::Undo(format!("no current record for {}", oid)))?,
        };
        let cdataptr = match &cur.payload {
            Payload::Inline(_) => cur.pos,
            Payload::BackPointer(back) => *back,
            Payload::Tombstone => 0,
        };

        if cdataptr != pos {
            // The current revision wrote new bytes, or points at different ones
            let changed = cdataptr == tipos || data_pos(r, oid, pos)? != data_pos(r, oid, cdataptr)?;
            if changed {
                if pre != 0 && staged.is_none() {
                    copy = false;
                } else {
                    return Err(StoreError::Undo("no previous record".to_string()));
                }
            }
        }
        current = Some(cur);
    }

    if pre == 0 {
        return Ok((Payload::Tombstone, ipos));
    }
    if copy {
        return Ok((Payload::BackPointer(pre), ipos));
    }

    let before = load_back(r, oid, pre)
        .map_err(|_| StoreError::Undo("previous revision is not loadable".to_string()))?;
    let Some(cur) = current else {
        return Err(StoreError::Undo("no previous record".to_string()));
    };
    let committed_data = match resolve_payload(r, &cur) {
        Ok(data) => data,
        Err(StoreError::NotFound(_)) => Bytes::new(),
        Err(e) => return Err(e),
    };
    let old_data = resolve_payload(r, record).ok();

    let conflict = ConflictContext {
        oid,
        committed_serial: cur.tid,
        old_serial: record.tid,
        old_data,
        committed_data,
        new_data: &before.data,
    };
    match resolver.resolve(&conflict) {
        Some(merged) if !merged.is_empty() => Ok((Payload::Inline(Bytes::from(merged)), ipos)),
        _ => Err(StoreError::Undo(
            "some data were modified by a later transaction".to_string(),
        )),
    }
}

/// Offset of the bytes reached from `pos`, as an undo failure if unreachable
fn data_pos<R: Read + Seek>(r: &mut R, oid: Oid, pos: u64) -> Result<u64> {
    match resolve_data_pos(r, oid, pos) {
        Ok(pos) => Ok(pos),
        Err(StoreError::NotFound(_)) => Err(StoreError::Undo(format!(
            "revision of {} at {} is not loadable",
            oid, pos
        ))),
        Err(e) => Err(e),
    }
}

/// Undoable transactions, newest first, skipping undone ones
///
/// Returns entries `[first, last)` of that sequence; the walk stops at the
/// first pack boundary.
pub(crate) fn undo_log<R: Read + Seek>(
    r: &mut R,
    end: u64,
    first: usize,
    last: usize,
) -> Result<Vec<UndoDescription>> {
    let mut entries = Vec::new();
    let mut seen = 0usize;
    let mut pos = end;

    while pos > FIRST_TXN_POS && seen < last {
        let header = previous_header(r, pos)?;
        pos = header.pos;
        match header.status {
            TxnStatus::PackBoundary => break,
            TxnStatus::Normal => {
                if seen >= first {
                    entries.push(UndoDescription {
                        id: header.tid,
                        time: header.tid.to_unix_time(),
                        user: header.user,
                        description: header.description,
                        extension: header.extension,
                    });
                }
                seen += 1;
            }
            TxnStatus::Undone | TxnStatus::InProgress => {}
        }
    }
    Ok(entries)
}
