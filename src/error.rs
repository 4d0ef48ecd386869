//! Error types for filestore
//!
//! Provides a unified error type for all storage operations.
//!
//! Every variant leaves the on-disk log exactly as it was before the failed
//! operation: writes are append-only and an aborted vote truncates back.

use std::path::PathBuf;

use thiserror::Error;

use crate::types::{Oid, Tid};

/// Result type alias using StoreError
pub type Result<T> = std::result::Result<T, StoreError>;

/// Unified error type for filestore operations
#[derive(Debug, Error)]
pub enum StoreError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // Log Format Errors
    // -------------------------------------------------------------------------
    /// Bad magic or a malformed header; fatal at open
    #[error("Format error: {0}")]
    Format(String),

    /// Length or trailer mismatch in the middle of the log
    #[error("Corruption at offset {pos}: {reason}")]
    Corruption { pos: u64, reason: String },

    // -------------------------------------------------------------------------
    // Lookup Errors
    // -------------------------------------------------------------------------
    /// Object does not exist, or its creation was undone
    #[error("Object {0} not found")]
    NotFound(Oid),

    // -------------------------------------------------------------------------
    // Transaction Errors
    // -------------------------------------------------------------------------
    #[error("Conflict on object {oid}: committed serial {committed}, expected {expected}")]
    Conflict {
        oid: Oid,
        committed: Tid,
        expected: Tid,
    },

    #[error("Storage quota of {quota} bytes exceeded (would reach {size} bytes)")]
    QuotaExceeded { quota: u64, size: u64 },

    #[error("Operation does not belong to the transaction in progress")]
    TransactionMismatch,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Storage is read-only")]
    ReadOnly,

    // -------------------------------------------------------------------------
    // Undo Errors
    // -------------------------------------------------------------------------
    #[error("Undo error: {0}")]
    Undo(String),

    /// Every object of the undone transaction that could not be reverted
    #[error("Undo failed for {} object(s): {}", .0.len(), format_failures(.0))]
    MultipleUndo(Vec<(Oid, String)>),

    // -------------------------------------------------------------------------
    // Pack Errors
    // -------------------------------------------------------------------------
    #[error("Pack error: {0}")]
    Pack(String),

    // -------------------------------------------------------------------------
    // Locking Errors
    // -------------------------------------------------------------------------
    #[error("Storage is locked by another process: {0}")]
    Locked(PathBuf),

    // -------------------------------------------------------------------------
    // Serialization Errors
    // -------------------------------------------------------------------------
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Build a corruption error at a log offset
    pub fn corruption(pos: u64, reason: impl Into<String>) -> Self {
        StoreError::Corruption {
            pos,
            reason: reason.into(),
        }
    }

    /// True for a write conflict the caller may retry
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

fn format_failures(failures: &[(Oid, String)]) -> String {
    failures
        .iter()
        .map(|(oid, reason)| format!("{}: {}", oid, reason))
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<bincode::Error> for StoreError {
    fn from(e: bincode::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}
