//! Tests for the two-phase commit
//!
//! These tests verify:
//! - begin / store / vote / finish publishes a transaction atomically
//! - abort before and after vote leaves the log untouched
//! - Stale serials raise conflicts unless the resolver merges them
//! - Quota, metadata limits and protocol misuse are rejected
//! - Only one transaction is in flight at a time

#[path = "../common/mod.rs"]
mod common;

use std::fs;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use common::*;
use filestore::{
    Config, ConflictContext, ConflictResolver, FileStorage, Oid, StoreError, Tid, Transaction,
};

// =============================================================================
// Helper Functions
// =============================================================================

/// Resolver that appends the new bytes to the committed ones
fn appending_resolver() -> Arc<dyn ConflictResolver> {
    Arc::new(|conflict: &ConflictContext<'_>| -> Option<Vec<u8>> {
        let mut merged = conflict.committed_data.to_vec();
        merged.extend_from_slice(conflict.new_data);
        Some(merged)
    })
}

fn file_len(path: &std::path::Path) -> u64 {
    fs::metadata(path).unwrap().len()
}

// =============================================================================
// Commit Tests
// =============================================================================

#[test]
fn test_store_and_load() {
    let (_temp, path) = setup_temp_store();
    let store = open_store(&path);

    let tid = commit(&store, &[(1, Tid::ZERO, b"hello"), (2, Tid::ZERO, b"world")]);

    assert_eq!(store.load(Oid(1)).unwrap(), (bytes::Bytes::from_static(b"hello"), tid));
    assert_eq!(load_vec(&store, 2), b"world");
    assert_eq!(store.last_transaction(), tid);
    assert_eq!(store.len(), 2);
    assert_eq!(store.get_size(), file_len(&path));
}

#[test]
fn test_load_missing_object() {
    let (_temp, path) = setup_temp_store();
    let store = open_store(&path);

    assert!(matches!(store.load(Oid(42)), Err(StoreError::NotFound(Oid(42)))));
}

#[test]
fn test_serials_increase() {
    let (_temp, path) = setup_temp_store();
    let store = open_store(&path);

    let t1 = commit(&store, &[(1, Tid::ZERO, b"v1")]);
    let t2 = commit(&store, &[(1, t1, b"v2")]);
    let t3 = commit(&store, &[(1, t2, b"v3")]);

    assert!(t1 < t2 && t2 < t3);
    assert_eq!(serial(&store, 1), t3);
}

#[test]
fn test_begin_at_uses_given_tid() {
    let (_temp, path) = setup_temp_store();
    let store = open_store(&path);
    let tid = tid_at(1_234_567.0);

    let committed = commit_at(&store, tid, &[(1, Tid::ZERO, b"v1")]);

    assert_eq!(committed, tid);
    assert_eq!(serial(&store, 1), tid);
}

#[test]
fn test_store_same_oid_twice_in_one_transaction() {
    let (_temp, path) = setup_temp_store();
    let store = open_store(&path);

    let tid = commit(&store, &[(1, Tid::ZERO, b"first"), (1, Tid::ZERO, b"second")]);

    assert_eq!(load_vec(&store, 1), b"second");
    assert_eq!(serial(&store, 1), tid);
}

#[test]
fn test_metadata_is_recorded() {
    let (_temp, path) = setup_temp_store();
    let store = open_store(&path);
    let txn = Transaction::new()
        .with_user("alice")
        .with_description("initial import")
        .with_extension(b"{}".to_vec());

    store.tpc_begin(&txn).unwrap();
    store.store(Oid(1), Tid::ZERO, b"x", &txn).unwrap();
    store.tpc_vote(&txn).unwrap();
    store.tpc_finish(&txn).unwrap();

    let history = store.history(Oid(1), 10).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].user, b"alice");
    assert_eq!(history[0].description, b"initial import");
    assert_eq!(history[0].extension, b"{}");
}

// =============================================================================
// Empty Transaction Tests
// =============================================================================

#[test]
fn test_empty_transaction_writes_nothing() {
    let (_temp, path) = setup_temp_store();
    let store = open_store(&path);
    let t1 = commit(&store, &[(1, Tid::ZERO, b"v1")]);
    let size = store.get_size();

    let txn = Transaction::new();
    store.tpc_begin(&txn).unwrap();
    assert!(store.tpc_vote(&txn).unwrap().is_empty());
    store.tpc_finish(&txn).unwrap();

    assert_eq!(store.get_size(), size);
    assert_eq!(file_len(&path), size);
    assert_eq!(store.last_transaction(), t1);
}

// =============================================================================
// Abort Tests
// =============================================================================

#[test]
fn test_abort_before_vote() {
    let (_temp, path) = setup_temp_store();
    let store = open_store(&path);
    let size = store.get_size();

    let txn = Transaction::new();
    store.tpc_begin(&txn).unwrap();
    store.store(Oid(1), Tid::ZERO, b"never", &txn).unwrap();
    store.tpc_abort(&txn).unwrap();

    assert_eq!(store.get_size(), size);
    assert!(matches!(store.load(Oid(1)), Err(StoreError::NotFound(_))));
}

#[test]
fn test_abort_after_vote_truncates() {
    let (_temp, path) = setup_temp_store();
    let store = open_store(&path);
    commit(&store, &[(1, Tid::ZERO, b"kept")]);
    let size = store.get_size();

    let txn = Transaction::new();
    store.tpc_begin(&txn).unwrap();
    store.store(Oid(2), Tid::ZERO, b"never", &txn).unwrap();
    store.tpc_vote(&txn).unwrap();
    assert!(file_len(&path) > size);
    store.tpc_abort(&txn).unwrap();

    assert_eq!(file_len(&path), size);
    assert_eq!(store.get_size(), size);
    assert!(matches!(store.load(Oid(2)), Err(StoreError::NotFound(_))));

    // The next commit lands where the aborted one would have
    let t = commit(&store, &[(3, Tid::ZERO, b"next")]);
    assert_eq!(serial(&store, 3), t);
}

#[test]
fn test_abort_without_transaction_is_noop() {
    let (_temp, path) = setup_temp_store();
    let store = open_store(&path);

    assert!(store.tpc_abort(&Transaction::new()).is_ok());
}

// =============================================================================
// Protocol Misuse Tests
// =============================================================================

#[test]
fn test_store_without_begin() {
    let (_temp, path) = setup_temp_store();
    let store = open_store(&path);

    let result = store.store(Oid(1), Tid::ZERO, b"x", &Transaction::new());

    assert!(matches!(result, Err(StoreError::TransactionMismatch)));
}

#[test]
fn test_store_with_foreign_transaction() {
    let (_temp, path) = setup_temp_store();
    let store = open_store(&path);
    let txn = Transaction::new();
    store.tpc_begin(&txn).unwrap();

    let result = store.store(Oid(1), Tid::ZERO, b"x", &Transaction::new());

    assert!(matches!(result, Err(StoreError::TransactionMismatch)));
    store.tpc_abort(&txn).unwrap();
}

#[test]
fn test_store_empty_payload_rejected() {
    let (_temp, path) = setup_temp_store();
    let store = open_store(&path);
    let txn = Transaction::new();
    store.tpc_begin(&txn).unwrap();

    assert!(matches!(
        store.store(Oid(1), Tid::ZERO, b"", &txn),
        Err(StoreError::InvalidArgument(_))
    ));
}

#[test]
fn test_finish_before_vote_rejected() {
    let (_temp, path) = setup_temp_store();
    let store = open_store(&path);
    let txn = Transaction::new();
    store.tpc_begin(&txn).unwrap();
    store.store(Oid(1), Tid::ZERO, b"x", &txn).unwrap();

    assert!(matches!(store.tpc_finish(&txn), Err(StoreError::InvalidArgument(_))));
    store.tpc_abort(&txn).unwrap();
}

#[test]
fn test_store_after_vote_rejected() {
    let (_temp, path) = setup_temp_store();
    let store = open_store(&path);
    let txn = Transaction::new();
    store.tpc_begin(&txn).unwrap();
    store.store(Oid(1), Tid::ZERO, b"x", &txn).unwrap();
    store.tpc_vote(&txn).unwrap();

    assert!(matches!(
        store.store(Oid(2), Tid::ZERO, b"y", &txn),
        Err(StoreError::InvalidArgument(_))
    ));
    store.tpc_abort(&txn).unwrap();
}

#[test]
fn test_oversized_metadata_rejected() {
    let (_temp, path) = setup_temp_store();
    let store = open_store(&path);
    let txn = Transaction::new().with_description(vec![b'd'; 70_000]);

    assert!(matches!(store.tpc_begin(&txn), Err(StoreError::InvalidArgument(_))));
}

#[test]
fn test_begin_twice_rejected() {
    let (_temp, path) = setup_temp_store();
    let store = open_store(&path);
    let txn = Transaction::new();
    store.tpc_begin(&txn).unwrap();

    assert!(matches!(store.tpc_begin(&txn), Err(StoreError::InvalidArgument(_))));
}

// =============================================================================
// Conflict Tests
// =============================================================================

#[test]
fn test_stale_serial_conflicts() {
    let (_temp, path) = setup_temp_store();
    let store = open_store(&path);
    let t1 = commit(&store, &[(1, Tid::ZERO, b"v1")]);
    let t2 = commit(&store, &[(1, t1, b"v2")]);

    let txn = Transaction::new();
    store.tpc_begin(&txn).unwrap();
    let err = store.store(Oid(1), t1, b"stale", &txn).unwrap_err();

    assert!(err.is_conflict());
    match err {
        StoreError::Conflict { oid, committed, expected } => {
            assert_eq!(oid, Oid(1));
            assert_eq!(committed, t2);
            assert_eq!(expected, t1);
        }
        other => panic!("expected conflict, got {:?}", other),
    }
    store.tpc_abort(&txn).unwrap();
    assert_eq!(load_vec(&store, 1), b"v2");
}

#[test]
fn test_resolver_merges_conflict() {
    let (_temp, path) = setup_temp_store();
    let store = FileStorage::open_with_resolver(test_config(&path), appending_resolver()).unwrap();
    let t1 = commit(&store, &[(1, Tid::ZERO, b"base")]);
    commit(&store, &[(1, t1, b"base+a")]);

    let txn = Transaction::new();
    store.tpc_begin(&txn).unwrap();
    store.store(Oid(1), t1, b"+b", &txn).unwrap();
    let resolved = store.tpc_vote(&txn).unwrap();
    store.tpc_finish(&txn).unwrap();

    assert_eq!(resolved, vec![Oid(1)]);
    assert_eq!(load_vec(&store, 1), b"base+a+b");
}

#[test]
fn test_resolver_sees_old_state() {
    let (_temp, path) = setup_temp_store();
    let seen = Arc::new(parking_lot::Mutex::new(None));
    let captured = Arc::clone(&seen);
    let resolver: Arc<dyn ConflictResolver> =
        Arc::new(move |conflict: &ConflictContext<'_>| -> Option<Vec<u8>> {
            *captured.lock() = conflict.old_data.clone();
            None
        });
    let store = FileStorage::open_with_resolver(test_config(&path), resolver).unwrap();
    let t1 = commit(&store, &[(1, Tid::ZERO, b"original")]);
    commit(&store, &[(1, t1, b"changed")]);

    let txn = Transaction::new();
    store.tpc_begin(&txn).unwrap();
    let result = store.store(Oid(1), t1, b"mine", &txn);

    assert!(matches!(result, Err(StoreError::Conflict { .. })));
    assert_eq!(seen.lock().as_deref(), Some(&b"original"[..]));
}

#[test]
fn test_new_object_never_conflicts() {
    let (_temp, path) = setup_temp_store();
    let store = open_store(&path);

    // Any serial is accepted for an oid with no committed revision
    let tid = commit(&store, &[(9, Tid(12345), b"fresh")]);

    assert_eq!(serial(&store, 9), tid);
}

// =============================================================================
// Quota Tests
// =============================================================================

#[test]
fn test_quota_exceeded() {
    let (_temp, path) = setup_temp_store();
    let config = Config {
        quota: Some(200),
        ..test_config(&path)
    };
    let store = FileStorage::open(config).unwrap();

    let txn = Transaction::new();
    store.tpc_begin(&txn).unwrap();
    let err = store.store(Oid(1), Tid::ZERO, &[7u8; 500], &txn).unwrap_err();
    assert!(matches!(err, StoreError::QuotaExceeded { quota: 200, .. }));
    store.tpc_abort(&txn).unwrap();

    let tid = commit(&store, &[(1, Tid::ZERO, b"small")]);
    assert_eq!(serial(&store, 1), tid);
}

#[test]
fn test_rejected_store_does_not_advance_oids() {
    let (_temp, path) = setup_temp_store();
    let config = Config {
        quota: Some(200),
        ..test_config(&path)
    };
    let store = FileStorage::open(config).unwrap();
    commit(&store, &[(1, Tid::ZERO, b"small")]);

    let txn = Transaction::new();
    store.tpc_begin(&txn).unwrap();
    let err = store.store(Oid(500), Tid::ZERO, &[7u8; 500], &txn).unwrap_err();
    assert!(matches!(err, StoreError::QuotaExceeded { .. }));
    store.tpc_abort(&txn).unwrap();

    assert_eq!(store.new_oid().unwrap(), Oid(2));
}

#[test]
fn test_conflicting_store_does_not_advance_oids() {
    let (_temp, path) = setup_temp_store();
    let store = open_store(&path);
    let t1 = commit(&store, &[(1, Tid::ZERO, b"a")]);
    commit(&store, &[(1, t1, b"b")]);

    let txn = Transaction::new();
    store.tpc_begin(&txn).unwrap();
    store.store(Oid(1), t1, b"stale", &txn).unwrap_err();
    store.tpc_abort(&txn).unwrap();

    assert_eq!(store.new_oid().unwrap(), Oid(2));
}

// =============================================================================
// Concurrency Tests
// =============================================================================

#[test]
fn test_second_begin_waits_for_finish() {
    let (_temp, path) = setup_temp_store();
    let store = Arc::new(open_store(&path));

    let first = Transaction::new();
    let t1 = store.tpc_begin(&first).unwrap();
    store.store(Oid(1), Tid::ZERO, b"first", &first).unwrap();

    let (tx, rx) = mpsc::channel();
    let worker = {
        let store = Arc::clone(&store);
        thread::spawn(move || {
            let second = Transaction::new();
            let t2 = store.tpc_begin(&second).unwrap();
            tx.send(t2).unwrap();
            let serial = store.load(Oid(1)).unwrap().1;
            store.store(Oid(1), serial, b"second", &second).unwrap();
            store.tpc_vote(&second).unwrap();
            store.tpc_finish(&second).unwrap()
        })
    };

    // The worker cannot begin while the first transaction is open
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());

    store.tpc_vote(&first).unwrap();
    store.tpc_finish(&first).unwrap();

    let t2 = rx.recv_timeout(Duration::from_secs(10)).unwrap();
    let finished = worker.join().unwrap();
    assert!(t2 > t1);
    assert_eq!(finished, t2);
    assert_eq!(load_vec(&store, 1), b"second");
}

#[test]
fn test_readers_run_during_commit() {
    let (_temp, path) = setup_temp_store();
    let store = Arc::new(open_store(&path));
    let t1 = commit(&store, &[(1, Tid::ZERO, b"stable")]);

    let txn = Transaction::new();
    store.tpc_begin(&txn).unwrap();
    store.store(Oid(1), t1, b"pending", &txn).unwrap();
    store.tpc_vote(&txn).unwrap();

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let store = Arc::clone(&store);
            thread::spawn(move || store.load(Oid(1)).unwrap().0.to_vec())
        })
        .collect();
    for reader in readers {
        assert_eq!(reader.join().unwrap(), b"stable");
    }

    store.tpc_finish(&txn).unwrap();
    assert_eq!(load_vec(&store, 1), b"pending");
}
