//! Transaction Iterator
//!
//! Sequential walk over committed transactions, oldest first, for
//! replication, backup and inspection. The iterator owns its own file handle
//! and is bounded by the committed end at creation: later commits are not
//! visible, and a pack swapping the file does not disturb it.

use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::error::{Result, StoreError};
use crate::format::{
    load_back, read_data_record, read_trailer, read_txn_header, Payload, TxnHeader, TxnStatus,
    FIRST_TXN_POS,
};
use crate::types::{Oid, Tid};

/// Iterator over committed transactions with `start <= tid <= stop`
pub struct TransactionIterator {
    file: Arc<Mutex<File>>,
    pos: u64,
    end: u64,
    start: Option<Tid>,
    stop: Option<Tid>,
    done: bool,
}

impl TransactionIterator {
    pub(crate) fn new(path: &Path, end: u64, start: Option<Tid>, stop: Option<Tid>) -> Result<Self> {
        let file = File::open(path)?;
        Ok(Self {
            file: Arc::new(Mutex::new(file)),
            pos: FIRST_TXN_POS,
            end,
            start,
            stop,
            done: false,
        })
    }

    fn fail(&mut self, err: StoreError) -> Option<Result<TransactionView>> {
        self.done = true;
        Some(Err(err))
    }
}

impl Iterator for TransactionIterator {
    type Item = Result<TransactionView>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done && self.pos < self.end {
            let header = match next_header(&self.file, self.pos) {
                Ok(Some(header)) => header,
                Ok(None) => {
                    self.done = true;
                    return None;
                }
                Err(e) => return self.fail(e),
            };
            self.pos = header.next_pos();

            if header.status == TxnStatus::Undone {
                continue;
            }
            if self.start.is_some_and(|start| header.tid < start) {
                continue;
            }
            if self.stop.is_some_and(|stop| header.tid > stop) {
                self.done = true;
                return None;
            }
            return Some(Ok(TransactionView {
                header,
                file: Arc::clone(&self.file),
            }));
        }
        None
    }
}

/// Header at `pos` with its trailer checked; `None` for an unfinished one
fn next_header(file: &Mutex<File>, pos: u64) -> Result<Option<TxnHeader>> {
    let mut file = file.lock();
    let header = read_txn_header(&mut *file, pos)?;
    if header.status == TxnStatus::InProgress {
        return Ok(None);
    }
    if read_trailer(&mut *file, header.data_end())? != header.tlen {
        return Err(StoreError::corruption(pos, "transaction trailer mismatch"));
    }
    Ok(Some(header))
}

/// One committed transaction
pub struct TransactionView {
    header: TxnHeader,
    file: Arc<Mutex<File>>,
}

impl TransactionView {
    pub fn tid(&self) -> Tid {
        self.header.tid
    }

    pub fn status(&self) -> TxnStatus {
        self.header.status
    }

    pub fn user(&self) -> &[u8] {
        &self.header.user
    }

    pub fn description(&self) -> &[u8] {
        &self.header.description
    }

    pub fn extension(&self) -> &[u8] {
        &self.header.extension
    }

    /// Offset of the transaction header in the log
    pub fn offset(&self) -> u64 {
        self.header.pos
    }

    pub fn header(&self) -> &TxnHeader {
        &self.header
    }

    /// Data records of this transaction, read lazily
    pub fn records(&self) -> RecordIter {
        RecordIter {
            file: Arc::clone(&self.file),
            pos: self.header.data_start(),
            end: self.header.data_end(),
            done: false,
        }
    }
}

impl std::fmt::Debug for TransactionView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionView")
            .field("tid", &self.header.tid)
            .field("status", &self.header.status)
            .field("offset", &self.header.pos)
            .finish()
    }
}

/// A data record as seen by the iterator
#[derive(Debug, Clone, PartialEq)]
pub struct DataRecordView {
    pub pos: u64,
    pub oid: Oid,
    pub tid: Tid,
    pub txn_offset: u64,
    /// Legacy version name, empty for records written by this engine
    pub version: Vec<u8>,
    pub payload: Payload,
    /// Effective bytes; `None` for a tombstone
    pub data: Option<Bytes>,
    /// For a backpointer, the serial of the revision that holds the bytes
    pub data_txn: Option<Tid>,
}

/// Iterator over the data records of one transaction
pub struct RecordIter {
    file: Arc<Mutex<File>>,
    pos: u64,
    end: u64,
    done: bool,
}

impl Iterator for RecordIter {
    type Item = Result<DataRecordView>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.pos >= self.end {
            return None;
        }
        let mut file = self.file.lock();
        let record = match read_data_record(&mut *file, self.pos) {
            Ok(record) => record,
            Err(e) => {
                self.done = true;
                return Some(Err(e));
            }
        };
        self.pos += record.record_len();

        let (data, data_txn) = match &record.payload {
            Payload::Inline(data) => (Some(data.clone()), None),
            Payload::BackPointer(back) => match load_back(&mut *file, record.oid, *back) {
                Ok(target) => (Some(target.data), Some(target.tid)),
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            },
            Payload::Tombstone => (None, None),
        };

        Some(Ok(DataRecordView {
            pos: record.pos,
            oid: record.oid,
            tid: record.tid,
            txn_offset: record.txn_offset,
            version: record.version.map(|v| v.name).unwrap_or_default(),
            payload: record.payload,
            data,
            data_txn,
        }))
    }
}
