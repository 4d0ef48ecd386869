//! Mark phase: which data records survive a pack

use std::collections::HashSet;
use std::io::{Read, Seek};

use crate::error::{Result, StoreError};
use crate::format::{read_data_record, read_txn_header, Payload, TxnStatus, FIRST_TXN_POS};
use crate::index::Index;
use crate::types::Tid;

/// Result of the mark phase
#[derive(Debug, Default)]
pub(crate) struct Sweep {
    /// Offsets of data records to copy
    pub live: HashSet<u64>,
    /// Whether any committed transaction precedes the cutoff
    pub any_before: bool,
    pub records_seen: u64,
}

/// Mark live records in `[FIRST_TXN_POS, end)`
///
/// Live means: the current revision of its oid, or written at/after
/// `pack_tid`, or the target of a live record's backpointer. Undone
/// transactions contribute nothing.
pub(crate) fn mark_live<R: Read + Seek>(r: &mut R, end: u64, pack_tid: Tid, index: &Index) -> Result<Sweep> {
    let mut sweep = Sweep::default();
    let mut pending_backs = Vec::new();

    let mut pos = FIRST_TXN_POS;
    while pos < end {
        let header = read_txn_header(r, pos)?;
        match header.status {
            TxnStatus::InProgress => {
                return Err(StoreError::corruption(pos, "unfinished transaction below the committed end"))
            }
            TxnStatus::Undone => {
                pos = header.next_pos();
                continue;
            }
            TxnStatus::Normal | TxnStatus::PackBoundary => {}
        }

        let before = header.tid < pack_tid;
        sweep.any_before |= before;

        let mut rpos = header.data_start();
        while rpos < header.data_end() {
            let record = read_data_record(r, rpos)?;
            sweep.records_seen += 1;
            if !before || index.get(record.oid) == Some(record.pos) {
                sweep.live.insert(record.pos);
                if let Payload::BackPointer(back) = record.payload {
                    pending_backs.push(back);
                }
            }
            rpos += record.record_len();
        }
        pos = header.next_pos();
    }

    // Chains may cross several undo layers
    while let Some(back) = pending_backs.pop() {
        if sweep.live.insert(back) {
            if let Payload::BackPointer(next) = read_data_record(r, back)?.payload {
                pending_backs.push(next);
            }
        }
    }

    tracing::debug!(
        "Pack mark phase: {} of {} records live",
        sweep.live.len(),
        sweep.records_seen
    );
    Ok(sweep)
}
