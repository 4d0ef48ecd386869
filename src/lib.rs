//! # FileStore
//!
//! A single-file, append-only transactional object store with:
//! - Two-phase commit with a single status-byte commit point
//! - Crash recovery that discards unfinished transactions
//! - Non-destructive undo of committed transactions
//! - Online pack that drops revisions nobody can reach
//! - Single-writer/multi-reader concurrency model
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        FileStorage                          │
//! │        load / store / tpc_* / undo / pack / iterator        │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//!     ┌─────────────────┼─────────────────┬──────────────────┐
//!     │                 │                 │                  │
//!     ▼                 ▼                 ▼                  ▼
//! ┌─────────┐    ┌────────────┐    ┌────────────┐    ┌─────────────┐
//! │ Commit  │    │   Index    │    │    Undo    │    │    Pack     │
//! │ (2PC)   │    │ (oid→pos)  │    │  (append)  │    │ (rewrite)   │
//! └────┬────┘    └─────┬──────┘    └─────┬──────┘    └──────┬──────┘
//!      │               │                 │                  │
//!      └───────────────┴────────┬────────┴──────────────────┘
//!                               ▼
//!                     ┌───────────────────┐
//!                     │   Record Codec    │
//!                     │  (log file, FS21) │
//!                     └───────────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;
pub mod types;

pub mod format;
pub mod index;
pub mod lock;
pub mod conflict;
pub mod pool;
pub mod commit;
pub mod undo;
pub mod pack;
pub mod iterator;
pub mod storage;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{Result, StoreError};
pub use config::{Config, SyncStrategy};
pub use types::{Oid, Tid};
pub use commit::Transaction;
pub use conflict::{ConflictContext, ConflictResolver, NoResolution};
pub use format::{Payload, TxnStatus};
pub use iterator::{DataRecordView, TransactionIterator, TransactionView};
pub use pack::PackReport;
pub use storage::{FileStorage, HistoryEntry};
pub use undo::UndoDescription;

// =============================================================================
// Version Info
// =============================================================================

/// Current version of FileStore
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
