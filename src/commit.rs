//! Commit Coordinator
//!
//! State of the one in-flight transaction in the two-phase commit:
//!
//! ```text
//! Idle ──begin──▶ Begun ──store*──▶ Begun ──vote──▶ Voted ──finish──▶ Idle
//!                   │                                 │
//!                   └──────────────abort──────────────┴──────────────▶ Idle
//! ```
//!
//! Data records are staged in memory at their provisional final offsets.
//! Vote writes the whole transaction with status InProgress; finish flips
//! that single status byte to Normal, which is the commit point.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::{BufMut, Bytes, BytesMut};

use crate::config::SyncStrategy;
use crate::error::{Result, StoreError};
use crate::format::{DataRecord, TxnHeader, TxnStatus, STATUS_OFFSET, TRAILER_LEN};
use crate::types::{Oid, Tid};

static NEXT_TXN_ID: AtomicU64 = AtomicU64::new(1);

/// Caller-side transaction handle: identity plus commit metadata
#[derive(Debug)]
pub struct Transaction {
    id: u64,
    user: Vec<u8>,
    description: Vec<u8>,
    extension: Vec<u8>,
}

impl Transaction {
    pub fn new() -> Self {
        Self {
            id: NEXT_TXN_ID.fetch_add(1, Ordering::Relaxed),
            user: Vec::new(),
            description: Vec::new(),
            extension: Vec::new(),
        }
    }

    pub fn with_user(mut self, user: impl Into<Vec<u8>>) -> Self {
        self.user = user.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<Vec<u8>>) -> Self {
        self.description = description.into();
        self
    }

    /// Opaque extension bytes (serialized by the layer above)
    pub fn with_extension(mut self, extension: impl Into<Vec<u8>>) -> Self {
        self.extension = extension.into();
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn user(&self) -> &[u8] {
        &self.user
    }

    pub fn description(&self) -> &[u8] {
        &self.description
    }

    pub fn extension(&self) -> &[u8] {
        &self.extension
    }
}

impl Default for Transaction {
    fn default() -> Self {
        Self::new()
    }
}

/// Where the in-flight transaction is in the protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Begun,
    /// Bytes are on disk (InProgress); `next_pos` is the post-commit end
    Voted { next_pos: u64 },
}

/// The in-flight transaction
#[derive(Debug)]
pub(crate) struct CommitState {
    pub txn_id: u64,
    /// Header to write; `pos` is the committed end at begin time
    pub header: TxnHeader,
    buf: BytesMut,
    /// oid → provisional offset of its latest staged record
    staged: BTreeMap<Oid, u64>,
    pub resolved: Vec<Oid>,
    pub phase: Phase,
}

impl CommitState {
    pub fn begin(txn: &Transaction, tid: Tid, pos: u64) -> Result<Self> {
        TxnHeader::check_meta(txn.user(), txn.description(), txn.extension())?;
        let mut header = TxnHeader::new(
            tid,
            TxnStatus::InProgress,
            txn.user(),
            txn.description(),
            txn.extension(),
        );
        header.pos = pos;
        Ok(Self {
            txn_id: txn.id(),
            header,
            buf: BytesMut::new(),
            staged: BTreeMap::new(),
            resolved: Vec::new(),
            phase: Phase::Begun,
        })
    }

    pub fn tid(&self) -> Tid {
        self.header.tid
    }

    pub fn check_owner(&self, txn: &Transaction) -> Result<()> {
        if self.txn_id == txn.id() {
            Ok(())
        } else {
            Err(StoreError::TransactionMismatch)
        }
    }

    pub fn check_begun(&self) -> Result<()> {
        match self.phase {
            Phase::Begun => Ok(()),
            Phase::Voted { .. } => Err(StoreError::InvalidArgument(
                "transaction has already voted".to_string(),
            )),
        }
    }

    /// Offset the next staged record will occupy once written
    pub fn next_record_pos(&self) -> u64 {
        self.header.pos + self.header.header_len() + self.buf.len() as u64
    }

    /// Append a record; returns its provisional offset
    pub fn stage(&mut self, mut record: DataRecord) -> u64 {
        let pos = self.next_record_pos();
        record.pos = pos;
        record.txn_offset = self.header.pos;
        record.encode_into(&mut self.buf);
        self.staged.insert(record.oid, pos);
        pos
    }

    /// Append several records atomically (all or nothing is the caller's job)
    pub fn stage_all(&mut self, records: Vec<DataRecord>) -> Vec<(Oid, u64)> {
        records
            .into_iter()
            .map(|record| {
                let oid = record.oid;
                (oid, self.stage(record))
            })
            .collect()
    }

    /// Latest staged offset for an oid
    pub fn staged_pos(&self, oid: Oid) -> Option<u64> {
        self.staged.get(&oid).copied()
    }

    /// Decode a staged record by provisional offset
    pub fn staged_record(&self, pos: u64) -> Result<DataRecord> {
        let start = pos
            .checked_sub(self.header.pos + self.header.header_len())
            .ok_or_else(|| StoreError::corruption(pos, "offset precedes staged data"))?
            as usize;
        if start >= self.buf.len() {
            return Err(StoreError::corruption(pos, "offset beyond staged data"));
        }
        DataRecord::decode(&self.buf[start..], pos)
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn staged_entries(&self) -> impl Iterator<Item = (Oid, u64)> + '_ {
        self.staged.iter().map(|(oid, pos)| (*oid, *pos))
    }

    /// Log size once this transaction is written
    pub fn projected_end(&self) -> u64 {
        self.header.pos + self.header.header_len() + self.buf.len() as u64 + TRAILER_LEN
    }

    pub fn check_quota(&self, quota: Option<u64>) -> Result<()> {
        match quota {
            Some(quota) if self.projected_end() > quota => Err(StoreError::QuotaExceeded {
                quota,
                size: self.projected_end(),
            }),
            _ => Ok(()),
        }
    }

    /// Header (InProgress) + staged records + trailer
    pub fn encode_transaction(&mut self) -> Bytes {
        self.header.tlen = self.header.header_len() + self.buf.len() as u64;
        let mut out = BytesMut::with_capacity((self.header.tlen + TRAILER_LEN) as usize);
        self.header.encode_into(&mut out);
        out.put_slice(&self.buf);
        out.put_u64(self.header.tlen);
        out.freeze()
    }
}

// =============================================================================
// Disk Steps
// =============================================================================

/// Write a full transaction at `pos`; on failure cut the file back to `pos`
pub(crate) fn write_transaction(file: &mut File, pos: u64, bytes: &[u8], sync: SyncStrategy) -> Result<()> {
    let written = (|| -> Result<()> {
        file.seek(SeekFrom::Start(pos))?;
        file.write_all(bytes)?;
        file.flush()?;
        if sync == SyncStrategy::EveryCommit {
            file.sync_data()?;
        }
        Ok(())
    })();

    if let Err(e) = written {
        tracing::warn!("Transaction write at {} failed, truncating: {}", pos, e);
        file.set_len(pos)?;
        return Err(e);
    }
    Ok(())
}

/// Overwrite the status byte of the transaction at `pos`
pub(crate) fn write_status(file: &mut File, pos: u64, status: TxnStatus, sync: SyncStrategy) -> Result<()> {
    file.seek(SeekFrom::Start(pos + STATUS_OFFSET))?;
    file.write_all(&[status.as_byte()])?;
    file.flush()?;
    if sync == SyncStrategy::EveryCommit {
        file.sync_data()?;
    }
    Ok(())
}

/// Discard everything from `pos` on
pub(crate) fn truncate_to(file: &mut File, pos: u64) -> Result<()> {
    file.set_len(pos)?;
    file.sync_all()?;
    Ok(())
}
