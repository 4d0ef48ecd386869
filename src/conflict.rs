//! Conflict resolution hook
//!
//! The engine decides when a write conflicts; merging the two states is the
//! job of a [`ConflictResolver`] supplied by the layer above.

use bytes::Bytes;

use crate::types::{Oid, Tid};

/// Everything a resolver gets to see about one conflicting write
#[derive(Debug, Clone)]
pub struct ConflictContext<'a> {
    pub oid: Oid,

    /// Serial currently committed for the object
    pub committed_serial: Tid,

    /// Serial the writer based its change on
    pub old_serial: Tid,

    /// State at `old_serial`, if still loadable
    pub old_data: Option<Bytes>,

    /// State at `committed_serial`
    pub committed_data: Bytes,

    /// State the writer wants to store
    pub new_data: &'a [u8],
}

/// Three-way merge of conflicting object states
pub trait ConflictResolver: Send + Sync {
    /// Merged bytes, or `None` if the states cannot be reconciled
    fn resolve(&self, conflict: &ConflictContext<'_>) -> Option<Vec<u8>>;
}

/// Resolver that never merges: every conflict surfaces to the caller
#[derive(Debug, Default, Clone, Copy)]
pub struct NoResolution;

impl ConflictResolver for NoResolution {
    fn resolve(&self, _conflict: &ConflictContext<'_>) -> Option<Vec<u8>> {
        None
    }
}

impl<F> ConflictResolver for F
where
    F: Fn(&ConflictContext<'_>) -> Option<Vec<u8>> + Send + Sync,
{
    fn resolve(&self, conflict: &ConflictContext<'_>) -> Option<Vec<u8>> {
        self(conflict)
    }
}
