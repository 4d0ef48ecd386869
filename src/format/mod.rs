//! Record Codec Module
//!
//! Binary layout of the log file and positioned reads over it.
//!
//! ## File Format
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ Magic "FS21" (4)                                             │
//! ├──────────────────────────────────────────────────────────────┤
//! │ Transaction                                                  │
//! │ ┌─────────┬──────────┬──────────┬────────┬────────┬───────┐  │
//! │ │ Tid (8) │ TLen (8) │Status (1)│ULen (2)│DLen (2)│ELen(2)│  │
//! │ └─────────┴──────────┴──────────┴────────┴────────┴───────┘  │
//! │   User | Description | Extension                             │
//! │   Data record *                                              │
//! │   ┌─────────┬────────────┬──────────┬─────────┬─────────┐    │
//! │   │ Oid (8) │ Serial (8) │ Prev (8) │ Txn (8) │ VLen (2)│    │
//! │   └─────────┴────────────┴──────────┴─────────┴─────────┘    │
//! │   [NonVersion (8) | PrevVersion (8) | Version] if VLen > 0   │
//! │   DataLen (8) | Data if DataLen > 0, else BackPointer (8)    │
//! │   TLen (8)  (redundant trailer)                              │
//! ├──────────────────────────────────────────────────────────────┤
//! │ ... more transactions ...                                    │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! TLen counts the header, the metadata strings and every data record, but
//! not the trailer: the next transaction starts at `pos + TLen + 8`. The
//! trailer lets readers walk the log backward from any transaction end.
//!
//! All integers are big-endian.

mod header;
mod reader;

pub use header::{DataRecord, TxnHeader, VersionInfo};
pub(crate) use header::FixedTxnHeader;
pub use reader::{
    load_back, read_data_record, read_data_record_for, read_trailer, read_txn_header,
    resolve_data_pos, resolve_payload, stream_len, BackTarget,
};

use bytes::Bytes;

// =============================================================================
// Shared Constants
// =============================================================================

/// Magic bytes at the start of every log file
pub const MAGIC: &[u8; 4] = b"FS21";

/// Fixed part of a transaction header: Tid + TLen + Status + 3 lengths
pub const TXN_HEADER_LEN: u64 = 23;

/// Fixed part of a data record header: Oid + Serial + Prev + Txn + VLen + DataLen
pub const DATA_HEADER_LEN: u64 = 42;

/// Redundant transaction length at the end of every transaction
pub const TRAILER_LEN: u64 = 8;

/// User, description and extension must each be shorter than this
pub const MAX_META_LEN: usize = 65_535;

/// Offset of the first transaction
pub const FIRST_TXN_POS: u64 = MAGIC.len() as u64;

/// Offset of the status byte inside a transaction header
pub const STATUS_OFFSET: u64 = 16;

// =============================================================================
// Transaction Status
// =============================================================================

/// Status byte of a transaction record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TxnStatus {
    /// Committed
    Normal = b' ',
    /// Logically removed; skipped by index rebuild, iteration and pack
    Undone = b'u',
    /// Rewritten by pack; not undoable, and undo never walks past it
    PackBoundary = b'p',
    /// Written by vote but not yet finished; discarded on recovery
    InProgress = b'c',
}

impl TxnStatus {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            b' ' => Some(TxnStatus::Normal),
            b'u' => Some(TxnStatus::Undone),
            b'p' => Some(TxnStatus::PackBoundary),
            b'c' => Some(TxnStatus::InProgress),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

// =============================================================================
// Payload
// =============================================================================

/// Payload of a data record: inline bytes, or a pointer to an earlier record
/// holding identical bytes. A zero pointer marks a tombstone (creation undone).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Inline(Bytes),
    BackPointer(u64),
    Tombstone,
}

impl Payload {
    /// Build the pointer form; offset 0 is the tombstone
    pub fn from_pointer(offset: u64) -> Self {
        if offset == 0 {
            Payload::Tombstone
        } else {
            Payload::BackPointer(offset)
        }
    }

    /// Bytes this payload occupies after the DataLen field
    pub fn encoded_len(&self) -> u64 {
        match self {
            Payload::Inline(data) => data.len() as u64,
            Payload::BackPointer(_) | Payload::Tombstone => 8,
        }
    }

    /// Value of the DataLen field
    pub fn data_len(&self) -> u64 {
        match self {
            Payload::Inline(data) => data.len() as u64,
            Payload::BackPointer(_) | Payload::Tombstone => 0,
        }
    }

    pub fn inline(&self) -> Option<&Bytes> {
        match self {
            Payload::Inline(data) => Some(data),
            _ => None,
        }
    }
}
