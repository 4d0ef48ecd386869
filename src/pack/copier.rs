//! Copy phase: rewrite surviving transactions into the pack file

use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Seek, Write};
use std::path::Path;

use bytes::{BufMut, BytesMut};

use crate::error::{Result, StoreError};
use crate::format::{
    load_back, read_data_record, read_trailer, read_txn_header, DataRecord, Payload, TxnHeader,
    TxnStatus, VersionInfo, FIRST_TXN_POS, MAGIC,
};
use crate::index::Index;
use crate::types::Tid;

/// Old offset → new offset of every copied data record
#[derive(Debug, Default)]
pub(crate) struct OffsetTable {
    map: HashMap<u64, u64>,
}

impl OffsetTable {
    pub fn insert(&mut self, old: u64, new: u64) {
        self.map.insert(old, new);
    }

    pub fn get(&self, old: u64) -> Option<u64> {
        self.map.get(&old).copied()
    }

    /// Translate a pointer; 0 stays 0, dropped targets become 0
    fn translate(&self, old: u64) -> u64 {
        if old == 0 {
            0
        } else {
            self.get(old).unwrap_or(0)
        }
    }
}

/// Which records of a range to copy
pub(crate) enum CopyMode<'a> {
    /// Initial copy of the snapshot range
    Sweep { live: &'a HashSet<u64>, pack_tid: Tid },
    /// Catch-up copy of transactions committed during the pack
    Tail,
}

#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct CopyStats {
    pub transactions_kept: u64,
    pub transactions_dropped: u64,
    pub records_kept: u64,
    pub records_dropped: u64,
}

/// Writer of the packed file
pub(crate) struct Copier {
    out: BufWriter<File>,
    pos: u64,
    table: OffsetTable,
    index: Index,
    stats: CopyStats,
}

impl Copier {
    /// Create the pack file (truncating a stale one) and write the magic
    pub fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        let mut out = BufWriter::new(file);
        out.write_all(MAGIC)?;
        Ok(Self {
            out,
            pos: FIRST_TXN_POS,
            table: OffsetTable::default(),
            index: Index::new(),
            stats: CopyStats::default(),
        })
    }

    /// Copy the transactions in `[start, end)` of the old log
    pub fn copy_range<R: Read + Seek>(&mut self, r: &mut R, start: u64, end: u64, mode: &CopyMode<'_>) -> Result<()> {
        let mut pos = start;
        while pos < end {
            let header = read_txn_header(r, pos)?;
            if read_trailer(r, header.data_end())? != header.tlen {
                return Err(StoreError::corruption(pos, "transaction trailer mismatch"));
            }
            match header.status {
                TxnStatus::InProgress => {
                    return Err(StoreError::corruption(pos, "unfinished transaction below the committed end"))
                }
                TxnStatus::Undone => self.stats.transactions_dropped += 1,
                TxnStatus::Normal | TxnStatus::PackBoundary => {
                    let (before, live) = match mode {
                        CopyMode::Sweep { live, pack_tid } => (header.tid < *pack_tid, Some(*live)),
                        CopyMode::Tail => (false, None),
                    };
                    self.copy_transaction(r, &header, before, |record| {
                        live.map_or(true, |live| live.contains(&record.pos))
                    })?;
                }
            }
            pos = header.next_pos();
        }
        Ok(())
    }

    /// Copy the kept records of one transaction; drop it if none are kept
    ///
    /// Transactions before the cutoff become pack boundaries. So does a later
    /// transaction one of whose records lost its previous revision.
    fn copy_transaction<R, F>(&mut self, r: &mut R, header: &TxnHeader, before: bool, keep: F) -> Result<()>
    where
        R: Read + Seek,
        F: Fn(&DataRecord) -> bool,
    {
        let mut kept = Vec::new();
        let mut rpos = header.data_start();
        while rpos < header.data_end() {
            let record = read_data_record(r, rpos)?;
            rpos += record.record_len();
            if keep(&record) {
                kept.push(record);
            } else {
                self.stats.records_dropped += 1;
            }
        }
        if kept.is_empty() {
            self.stats.transactions_dropped += 1;
            return Ok(());
        }

        let tpos = self.pos;
        let mut status = if before {
            TxnStatus::PackBoundary
        } else {
            header.status
        };

        let mut body = BytesMut::new();
        let mut updates = Vec::with_capacity(kept.len());
        for record in kept {
            let new_pos = tpos + header.header_len() + body.len() as u64;
            let prev = self.table.translate(record.prev);
            if record.prev != 0 && prev == 0 {
                status = TxnStatus::PackBoundary;
            }

            let payload = match record.payload {
                Payload::BackPointer(back) => match self.table.get(back) {
                    Some(new_back) => Payload::BackPointer(new_back),
                    // Target was dropped: carry the bytes instead
                    None => Payload::Inline(load_back(r, record.oid, back)?.data),
                },
                other => other,
            };
            let version = record.version.map(|v| VersionInfo {
                non_version_pos: self.table.translate(v.non_version_pos),
                prev_version_pos: self.table.translate(v.prev_version_pos),
                name: v.name,
            });

            let copied = DataRecord {
                pos: new_pos,
                oid: record.oid,
                tid: record.tid,
                prev,
                txn_offset: tpos,
                version,
                payload,
            };
            copied.encode_into(&mut body);
            self.table.insert(record.pos, new_pos);
            updates.push((record.oid, new_pos));
        }

        let mut out = TxnHeader::new(
            header.tid,
            status,
            &header.user,
            &header.description,
            &header.extension,
        );
        out.pos = tpos;
        out.tlen = out.header_len() + body.len() as u64;

        let mut buf = BytesMut::with_capacity(out.tlen as usize + 8);
        out.encode_into(&mut buf);
        buf.put_slice(&body);
        buf.put_u64(out.tlen);
        self.out.write_all(&buf)?;

        self.pos = out.next_pos();
        self.stats.transactions_kept += 1;
        self.stats.records_kept += updates.len() as u64;
        self.index.extend(updates);
        Ok(())
    }

    /// Flush and fsync; returns the new index, size and counters
    pub fn finish(self) -> Result<(Index, u64, CopyStats)> {
        let file = self
            .out
            .into_inner()
            .map_err(|e| StoreError::Io(e.into_error()))?;
        file.sync_all()?;
        Ok((self.index, self.pos, self.stats))
    }
}
