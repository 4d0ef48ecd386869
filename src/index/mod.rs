//! Index Module
//!
//! Maps each oid to the offset of its latest committed data record.
//!
//! The index is a cache: it can always be rebuilt by replaying the log. At
//! open it is restored from a snapshot file when the snapshot survives a
//! tail check, and rebuilt by a full scan otherwise.
//!
//! ## Snapshot File Format
//! ```text
//! ┌──────────┬───────────┬──────────────────────────────┐
//! │Magic (4) │ CRC32 (4) │ bincode(IndexSnapshot)       │
//! └──────────┴───────────┴──────────────────────────────┘
//! ```

mod recovery;
mod snapshot;

use std::collections::btree_map;
use std::collections::BTreeMap;

use crate::types::Oid;

pub use recovery::{rebuild_from_scratch, recover, scan_forward, verify_tail, RecoveryResult, ScanOutcome};
pub use snapshot::{load_snapshot, save_snapshot, IndexSnapshot};

/// oid → offset of the latest data record
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Index {
    map: BTreeMap<Oid, u64>,
}

impl Index {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, oid: Oid) -> Option<u64> {
        self.map.get(&oid).copied()
    }

    pub fn insert(&mut self, oid: Oid, pos: u64) {
        self.map.insert(oid, pos);
    }

    pub fn contains(&self, oid: Oid) -> bool {
        self.map.contains_key(&oid)
    }

    pub fn extend<I: IntoIterator<Item = (Oid, u64)>>(&mut self, entries: I) {
        self.map.extend(entries);
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Largest oid present
    pub fn max_oid(&self) -> Option<Oid> {
        self.map.keys().next_back().copied()
    }

    pub fn iter(&self) -> btree_map::Iter<'_, Oid, u64> {
        self.map.iter()
    }
}

impl FromIterator<(Oid, u64)> for Index {
    fn from_iter<I: IntoIterator<Item = (Oid, u64)>>(iter: I) -> Self {
        Self {
            map: iter.into_iter().collect(),
        }
    }
}
