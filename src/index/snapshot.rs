//! Index snapshot file
//!
//! A snapshot that fails any check (magic, checksum, decode) is discarded
//! with a warning; the caller then rebuilds from the log.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::{Oid, Tid};

use super::Index;

/// Magic bytes identifying an index snapshot
const SNAPSHOT_MAGIC: &[u8; 4] = b"FSIX";

/// Magic (4) + CRC32 (4)
const SNAPSHOT_HEADER_LEN: usize = 8;

/// Saved index state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSnapshot {
    /// End of the last committed transaction when the snapshot was taken
    pub position: u64,
    pub last_tid: Tid,
    pub max_oid: Oid,
    pub entries: Vec<(Oid, u64)>,
}

impl IndexSnapshot {
    pub fn new(index: &Index, position: u64, last_tid: Tid, max_oid: Oid) -> Self {
        Self {
            position,
            last_tid,
            max_oid,
            entries: index.iter().map(|(oid, pos)| (*oid, *pos)).collect(),
        }
    }

    pub fn to_index(&self) -> Index {
        self.entries.iter().copied().collect()
    }
}

/// Load a snapshot; `Ok(None)` when it is missing or unusable
pub fn load_snapshot(path: &Path) -> Result<Option<IndexSnapshot>> {
    if !path.exists() {
        return Ok(None);
    }

    let mut bytes = Vec::new();
    File::open(path)?.read_to_end(&mut bytes)?;

    if bytes.len() < SNAPSHOT_HEADER_LEN || &bytes[0..4] != SNAPSHOT_MAGIC {
        tracing::warn!("Ignoring index snapshot {}: bad header", path.display());
        return Ok(None);
    }

    let stored_crc = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    let body = &bytes[SNAPSHOT_HEADER_LEN..];
    if crc32fast::hash(body) != stored_crc {
        tracing::warn!("Ignoring index snapshot {}: checksum mismatch", path.display());
        return Ok(None);
    }

    match bincode::deserialize::<IndexSnapshot>(body) {
        Ok(snapshot) => Ok(Some(snapshot)),
        Err(e) => {
            tracing::warn!("Ignoring index snapshot {}: {}", path.display(), e);
            Ok(None)
        }
    }
}

/// Write a snapshot atomically (temp file + rename)
pub fn save_snapshot(path: &Path, tmp_path: &Path, snapshot: &IndexSnapshot) -> Result<()> {
    let body = bincode::serialize(snapshot)?;
    let crc = crc32fast::hash(&body);

    {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(tmp_path)?;
        file.write_all(SNAPSHOT_MAGIC)?;
        file.write_all(&crc.to_le_bytes())?;
        file.write_all(&body)?;
        file.sync_all()?;
    }
    fs::rename(tmp_path, path)?;

    tracing::debug!(
        "Saved index snapshot: {} entries at position {}",
        snapshot.entries.len(),
        snapshot.position
    );
    Ok(())
}
