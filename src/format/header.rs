//! Transaction and data record headers
//!
//! Encoding goes through `BufMut`, decoding through `Buf` over slices that the
//! caller has already length-checked.

use bytes::{Buf, BufMut, Bytes};

use crate::error::{Result, StoreError};
use crate::types::{Oid, Tid};

use super::{Payload, TxnStatus, DATA_HEADER_LEN, MAX_META_LEN, TXN_HEADER_LEN};

// =============================================================================
// Transaction Header
// =============================================================================

/// Header of a transaction record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxnHeader {
    /// Offset of the header in the log
    pub pos: u64,
    pub tid: Tid,
    /// Length excluding the trailer
    pub tlen: u64,
    pub status: TxnStatus,
    pub user: Vec<u8>,
    pub description: Vec<u8>,
    pub extension: Vec<u8>,
}

/// Fixed 23-byte part, before the metadata strings are read
#[derive(Debug, Clone, Copy)]
pub(crate) struct FixedTxnHeader {
    pub tid: Tid,
    pub tlen: u64,
    pub status: u8,
    pub user_len: u16,
    pub desc_len: u16,
    pub ext_len: u16,
}

impl FixedTxnHeader {
    pub fn decode(mut buf: &[u8]) -> Self {
        debug_assert!(buf.len() >= TXN_HEADER_LEN as usize);
        let tid = Tid(buf.get_u64());
        let tlen = buf.get_u64();
        let status = buf.get_u8();
        let user_len = buf.get_u16();
        let desc_len = buf.get_u16();
        let ext_len = buf.get_u16();
        Self {
            tid,
            tlen,
            status,
            user_len,
            desc_len,
            ext_len,
        }
    }

    pub fn meta_len(&self) -> u64 {
        self.user_len as u64 + self.desc_len as u64 + self.ext_len as u64
    }

    pub fn header_len(&self) -> u64 {
        TXN_HEADER_LEN + self.meta_len()
    }
}

impl TxnHeader {
    pub fn new(tid: Tid, status: TxnStatus, user: &[u8], description: &[u8], extension: &[u8]) -> Self {
        Self {
            pos: 0,
            tid,
            tlen: 0,
            status,
            user: user.to_vec(),
            description: description.to_vec(),
            extension: extension.to_vec(),
        }
    }

    /// Reject metadata that does not fit the 2-byte length fields
    pub fn check_meta(user: &[u8], description: &[u8], extension: &[u8]) -> Result<()> {
        for (name, value) in [("user", user), ("description", description), ("extension", extension)] {
            if value.len() >= MAX_META_LEN {
                return Err(StoreError::InvalidArgument(format!(
                    "{} is {} bytes (must be < {})",
                    name,
                    value.len(),
                    MAX_META_LEN
                )));
            }
        }
        Ok(())
    }

    /// Header plus metadata strings
    pub fn header_len(&self) -> u64 {
        TXN_HEADER_LEN
            + self.user.len() as u64
            + self.description.len() as u64
            + self.extension.len() as u64
    }

    /// Offset of the first data record
    pub fn data_start(&self) -> u64 {
        self.pos + self.header_len()
    }

    /// Offset of the trailer (end of the last data record)
    pub fn data_end(&self) -> u64 {
        self.pos + self.tlen
    }

    /// Offset of the next transaction
    pub fn next_pos(&self) -> u64 {
        self.pos + self.tlen + super::TRAILER_LEN
    }

    pub fn encode_into(&self, buf: &mut impl BufMut) {
        buf.put_u64(self.tid.0);
        buf.put_u64(self.tlen);
        buf.put_u8(self.status.as_byte());
        buf.put_u16(self.user.len() as u16);
        buf.put_u16(self.description.len() as u16);
        buf.put_u16(self.extension.len() as u16);
        buf.put_slice(&self.user);
        buf.put_slice(&self.description);
        buf.put_slice(&self.extension);
    }

    pub(crate) fn from_fixed(pos: u64, fixed: &FixedTxnHeader, meta: &[u8]) -> Result<Self> {
        let status = TxnStatus::from_byte(fixed.status).ok_or_else(|| {
            StoreError::corruption(pos, format!("invalid transaction status 0x{:02x}", fixed.status))
        })?;
        if fixed.tlen < fixed.header_len() {
            return Err(StoreError::corruption(
                pos,
                format!(
                    "transaction length {} shorter than header length {}",
                    fixed.tlen,
                    fixed.header_len()
                ),
            ));
        }
        let (user, rest) = meta.split_at(fixed.user_len as usize);
        let (description, extension) = rest.split_at(fixed.desc_len as usize);
        Ok(Self {
            pos,
            tid: fixed.tid,
            tlen: fixed.tlen,
            status,
            user: user.to_vec(),
            description: description.to_vec(),
            extension: extension.to_vec(),
        })
    }
}

// =============================================================================
// Data Record
// =============================================================================

/// Legacy version-branch fields, preserved but never written by store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionInfo {
    pub non_version_pos: u64,
    pub prev_version_pos: u64,
    pub name: Vec<u8>,
}

/// A data record: one revision of one object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataRecord {
    /// Offset of the record in the log
    pub pos: u64,
    pub oid: Oid,
    /// Serial: tid of the writing transaction
    pub tid: Tid,
    /// Previous revision of this oid (0 = none)
    pub prev: u64,
    /// Owning transaction header
    pub txn_offset: u64,
    pub version: Option<VersionInfo>,
    pub payload: Payload,
}

impl DataRecord {
    pub fn new(oid: Oid, tid: Tid, prev: u64, txn_offset: u64, payload: Payload) -> Self {
        Self {
            pos: 0,
            oid,
            tid,
            prev,
            txn_offset,
            version: None,
            payload,
        }
    }

    fn version_len(&self) -> u64 {
        self.version.as_ref().map_or(0, |v| 16 + v.name.len() as u64)
    }

    /// Total encoded size of the record
    pub fn record_len(&self) -> u64 {
        DATA_HEADER_LEN + self.version_len() + self.payload.encoded_len()
    }

    pub fn encode_into(&self, buf: &mut impl BufMut) {
        buf.put_u64(self.oid.0);
        buf.put_u64(self.tid.0);
        buf.put_u64(self.prev);
        buf.put_u64(self.txn_offset);
        buf.put_u16(self.version.as_ref().map_or(0, |v| v.name.len() as u16));
        buf.put_u64(self.payload.data_len());
        if let Some(version) = &self.version {
            buf.put_u64(version.non_version_pos);
            buf.put_u64(version.prev_version_pos);
            buf.put_slice(&version.name);
        }
        match &self.payload {
            Payload::Inline(data) => buf.put_slice(data),
            Payload::BackPointer(offset) => buf.put_u64(*offset),
            Payload::Tombstone => buf.put_u64(0),
        }
    }

    /// Decode a complete record from a byte slice (staged records)
    pub fn decode(buf: &[u8], pos: u64) -> Result<Self> {
        if (buf.len() as u64) < DATA_HEADER_LEN {
            return Err(StoreError::corruption(pos, "data header truncated"));
        }
        let fixed = FixedDataHeader::decode(&buf[..DATA_HEADER_LEN as usize]);
        let needed = fixed.record_len();
        if (buf.len() as u64) < needed {
            return Err(StoreError::corruption(
                pos,
                format!("data record needs {} bytes, {} available", needed, buf.len()),
            ));
        }
        fixed.finish(pos, &buf[DATA_HEADER_LEN as usize..needed as usize])
    }
}

/// Fixed 42-byte part of a data record
#[derive(Debug, Clone, Copy)]
pub(crate) struct FixedDataHeader {
    pub oid: Oid,
    pub tid: Tid,
    pub prev: u64,
    pub txn_offset: u64,
    pub version_len: u16,
    pub data_len: u64,
}

impl FixedDataHeader {
    pub fn decode(mut buf: &[u8]) -> Self {
        debug_assert!(buf.len() >= DATA_HEADER_LEN as usize);
        Self {
            oid: Oid(buf.get_u64()),
            tid: Tid(buf.get_u64()),
            prev: buf.get_u64(),
            txn_offset: buf.get_u64(),
            version_len: buf.get_u16(),
            data_len: buf.get_u64(),
        }
    }

    /// Bytes following the fixed header
    pub fn tail_len(&self) -> u64 {
        let version = if self.version_len > 0 {
            16 + self.version_len as u64
        } else {
            0
        };
        let payload = if self.data_len > 0 { self.data_len } else { 8 };
        version.saturating_add(payload)
    }

    /// Saturates on a damaged length; callers bound it before reading
    pub fn record_len(&self) -> u64 {
        DATA_HEADER_LEN.saturating_add(self.tail_len())
    }

    /// Build the record from the bytes following the fixed header
    pub fn finish(&self, pos: u64, mut tail: &[u8]) -> Result<DataRecord> {
        if (tail.len() as u64) < self.tail_len() {
            return Err(StoreError::corruption(pos, "data record truncated"));
        }
        let version = if self.version_len > 0 {
            let non_version_pos = tail.get_u64();
            let prev_version_pos = tail.get_u64();
            let name = tail[..self.version_len as usize].to_vec();
            tail.advance(self.version_len as usize);
            Some(VersionInfo {
                non_version_pos,
                prev_version_pos,
                name,
            })
        } else {
            None
        };
        let payload = if self.data_len > 0 {
            Payload::Inline(Bytes::copy_from_slice(&tail[..self.data_len as usize]))
        } else {
            let back = tail.get_u64();
            if back >= pos && back != 0 {
                return Err(StoreError::corruption(
                    pos,
                    format!("backpointer {} does not point backward", back),
                ));
            }
            Payload::from_pointer(back)
        };
        Ok(DataRecord {
            pos,
            oid: self.oid,
            tid: self.tid,
            prev: self.prev,
            txn_offset: self.txn_offset,
            version,
            payload,
        })
    }
}
