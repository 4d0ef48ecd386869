//! Positioned reads
//!
//! Every function seeks to an absolute offset first, so one handle can serve
//! interleaved lookups. A read that runs into EOF inside a record is reported
//! as corruption at that record's offset.

use std::io::{self, Read, Seek, SeekFrom};

use bytes::Bytes;

use crate::error::{Result, StoreError};
use crate::types::{Oid, Tid};

use super::header::{FixedDataHeader, FixedTxnHeader};
use super::{DataRecord, Payload, TxnHeader, DATA_HEADER_LEN, TXN_HEADER_LEN};

/// Current length of the underlying stream
pub fn stream_len<R: Seek>(r: &mut R) -> Result<u64> {
    Ok(r.seek(SeekFrom::End(0))?)
}

fn read_exact_at<R: Read + Seek>(r: &mut R, pos: u64, buf: &mut [u8]) -> Result<()> {
    r.seek(SeekFrom::Start(pos))?;
    r.read_exact(buf).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            StoreError::corruption(pos, "record extends past end of log")
        } else {
            StoreError::Io(e)
        }
    })
}

/// Read a transaction header (with metadata strings) at `pos`
pub fn read_txn_header<R: Read + Seek>(r: &mut R, pos: u64) -> Result<TxnHeader> {
    let mut fixed_buf = [0u8; TXN_HEADER_LEN as usize];
    read_exact_at(r, pos, &mut fixed_buf)?;
    let fixed = FixedTxnHeader::decode(&fixed_buf);

    let mut meta = vec![0u8; fixed.meta_len() as usize];
    if !meta.is_empty() {
        r.read_exact(&mut meta)
            .map_err(|_| StoreError::corruption(pos, "transaction metadata truncated"))?;
    }
    TxnHeader::from_fixed(pos, &fixed, &meta)
}

/// Read the data record at `pos`
///
/// The record's declared length is checked against the stream before any
/// buffer is sized from it.
pub fn read_data_record<R: Read + Seek>(r: &mut R, pos: u64) -> Result<DataRecord> {
    let len = stream_len(r)?;
    let mut fixed_buf = [0u8; DATA_HEADER_LEN as usize];
    read_exact_at(r, pos, &mut fixed_buf)?;
    let fixed = FixedDataHeader::decode(&fixed_buf);

    let available = len.saturating_sub(pos.saturating_add(DATA_HEADER_LEN));
    if fixed.tail_len() > available {
        return Err(StoreError::corruption(
            pos,
            format!("data record claims {} bytes, {} left in log", fixed.tail_len(), available),
        ));
    }

    let mut tail = vec![0u8; fixed.tail_len() as usize];
    r.read_exact(&mut tail)
        .map_err(|_| StoreError::corruption(pos, "data record truncated"))?;
    fixed.finish(pos, &tail)
}

/// Read the data record at `pos` and check it belongs to `oid`
pub fn read_data_record_for<R: Read + Seek>(r: &mut R, pos: u64, oid: Oid) -> Result<DataRecord> {
    let record = read_data_record(r, pos)?;
    if record.oid != oid {
        return Err(StoreError::corruption(
            pos,
            format!("expected record for {}, found {}", oid, record.oid),
        ));
    }
    Ok(record)
}

/// Read the redundant length stored at `pos` (the end of a transaction body)
pub fn read_trailer<R: Read + Seek>(r: &mut R, pos: u64) -> Result<u64> {
    let mut buf = [0u8; 8];
    read_exact_at(r, pos, &mut buf)?;
    Ok(u64::from_be_bytes(buf))
}

/// The record a backpointer chain ends at
#[derive(Debug, Clone)]
pub struct BackTarget {
    pub data: Bytes,
    /// Serial of the record holding the bytes
    pub tid: Tid,
    /// Offset of the record holding the bytes
    pub pos: u64,
    pub txn_offset: u64,
}

/// Follow backpointers from `back` to the record holding inline bytes.
/// A zero pointer anywhere in the chain means the object does not exist.
pub fn load_back<R: Read + Seek>(r: &mut R, oid: Oid, mut back: u64) -> Result<BackTarget> {
    loop {
        if back == 0 {
            return Err(StoreError::NotFound(oid));
        }
        let record = read_data_record_for(r, back, oid)?;
        match record.payload {
            Payload::Inline(data) => {
                return Ok(BackTarget {
                    data,
                    tid: record.tid,
                    pos: back,
                    txn_offset: record.txn_offset,
                })
            }
            Payload::BackPointer(next) => back = next,
            Payload::Tombstone => return Err(StoreError::NotFound(oid)),
        }
    }
}

/// Effective bytes of a record, following its backpointer if needed
pub fn resolve_payload<R: Read + Seek>(r: &mut R, record: &DataRecord) -> Result<Bytes> {
    match &record.payload {
        Payload::Inline(data) => Ok(data.clone()),
        Payload::BackPointer(back) => Ok(load_back(r, record.oid, *back)?.data),
        Payload::Tombstone => Err(StoreError::NotFound(record.oid)),
    }
}

/// Offset of the record actually holding the bytes reached from `back`
pub fn resolve_data_pos<R: Read + Seek>(r: &mut R, oid: Oid, back: u64) -> Result<u64> {
    Ok(load_back(r, oid, back)?.pos)
}
