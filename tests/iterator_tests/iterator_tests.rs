//! Tests for the transaction iterator
//!
//! These tests verify:
//! - Transactions come back oldest first with their metadata
//! - start/stop bounds are inclusive
//! - Undone transactions are skipped
//! - Backpointers are resolved and tombstones carry no data
//! - Commits after creation are not visible

#[path = "../common/mod.rs"]
mod common;

use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};

use common::*;
use filestore::format::STATUS_OFFSET;
use filestore::{Config, DataRecordView, FileStorage, Oid, Payload, Tid, Transaction};

// =============================================================================
// Helper Functions
// =============================================================================

fn records_of(store: &FileStorage) -> Vec<Vec<DataRecordView>> {
    store
        .iterator(None, None)
        .unwrap()
        .map(|txn| txn.unwrap().records().map(|r| r.unwrap()).collect())
        .collect()
}

fn tids(store: &FileStorage, start: Option<Tid>, stop: Option<Tid>) -> Vec<Tid> {
    store
        .iterator(start, stop)
        .unwrap()
        .map(|txn| txn.unwrap().tid())
        .collect()
}

// =============================================================================
// Iteration Tests
// =============================================================================

#[test]
fn test_iterate_empty_store() {
    let (_temp, path) = setup_temp_store();
    let store = open_store(&path);

    assert_eq!(store.iterator(None, None).unwrap().count(), 0);
}

#[test]
fn test_iterate_in_commit_order() {
    let (_temp, path) = setup_temp_store();
    let store = open_store(&path);
    let t1 = commit(&store, &[(1, Tid::ZERO, b"a")]);
    let t2 = commit(&store, &[(2, Tid::ZERO, b"b"), (3, Tid::ZERO, b"c")]);

    let txns: Vec<_> = store.iterator(None, None).unwrap().map(|t| t.unwrap()).collect();

    assert_eq!(txns.len(), 2);
    assert_eq!(txns[0].tid(), t1);
    assert_eq!(txns[1].tid(), t2);
    assert_eq!(txns[0].user(), b"tester");
    assert_eq!(txns[0].description(), b"commit");
    assert_eq!(txns[0].offset(), 4);

    let records: Vec<_> = txns[1].records().map(|r| r.unwrap()).collect();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].oid, Oid(2));
    assert_eq!(records[0].data.as_deref(), Some(&b"b"[..]));
    assert_eq!(records[1].oid, Oid(3));
    assert_eq!(records[1].tid, t2);
    assert_eq!(records[1].txn_offset, txns[1].offset());
    assert!(records[1].version.is_empty());
}

#[test]
fn test_iterate_with_bounds() {
    let (_temp, path) = setup_temp_store();
    let store = open_store(&path);
    let t1 = commit_at(&store, tid_at(1_000_000.0), &[(1, Tid::ZERO, b"a")]);
    let t2 = commit_at(&store, tid_at(2_000_000.0), &[(1, t1, b"b")]);
    let t3 = commit_at(&store, tid_at(3_000_000.0), &[(1, t2, b"c")]);

    assert_eq!(tids(&store, Some(t2), None), vec![t2, t3]);
    assert_eq!(tids(&store, None, Some(t2)), vec![t1, t2]);
    assert_eq!(tids(&store, Some(t2), Some(t2)), vec![t2]);
    assert_eq!(tids(&store, Some(tid_at(1_500_000.0)), Some(tid_at(2_500_000.0))), vec![t2]);
}

#[test]
fn test_iterator_skips_undone() {
    let (_temp, path) = setup_temp_store();
    let (t1, t3) = {
        let store = FileStorage::open(Config {
            save_index_on_close: false,
            ..test_config(&path)
        })
        .unwrap();
        let t1 = commit(&store, &[(1, Tid::ZERO, b"a")]);
        let t2_pos = store.get_size();
        commit(&store, &[(1, t1, b"b")]);
        let t3 = commit(&store, &[(2, Tid::ZERO, b"c")]);
        drop(store);

        let mut file = OpenOptions::new().write(true).open(&path).unwrap();
        file.seek(SeekFrom::Start(t2_pos + STATUS_OFFSET)).unwrap();
        file.write_all(b"u").unwrap();
        (t1, t3)
    };
    let store = open_store(&path);

    assert_eq!(tids(&store, None, None), vec![t1, t3]);
}

#[test]
fn test_iterator_resolves_backpointers_and_tombstones() {
    let (_temp, path) = setup_temp_store();
    let store = open_store(&path);
    let t1 = commit(&store, &[(1, Tid::ZERO, b"a")]);
    let t2 = commit(&store, &[(1, t1, b"b"), (2, Tid::ZERO, b"new")]);
    store.undo_transaction(t2, &Transaction::new()).unwrap();

    let all = records_of(&store);
    let undo_records = &all[2];

    let back = undo_records.iter().find(|r| r.oid == Oid(1)).unwrap();
    assert!(matches!(back.payload, Payload::BackPointer(_)));
    assert_eq!(back.data.as_deref(), Some(&b"a"[..]));
    assert_eq!(back.data_txn, Some(t1));

    let tomb = undo_records.iter().find(|r| r.oid == Oid(2)).unwrap();
    assert_eq!(tomb.payload, Payload::Tombstone);
    assert_eq!(tomb.data, None);
}

#[test]
fn test_iterator_bounded_at_creation() {
    let (_temp, path) = setup_temp_store();
    let store = open_store(&path);
    let t1 = commit(&store, &[(1, Tid::ZERO, b"a")]);

    let iter = store.iterator(None, None).unwrap();
    commit(&store, &[(1, t1, b"b")]);

    let seen: Vec<Tid> = iter.map(|t| t.unwrap().tid()).collect();
    assert_eq!(seen, vec![t1]);
}

#[test]
fn test_iterator_ignores_transaction_in_progress() {
    let (_temp, path) = setup_temp_store();
    let store = open_store(&path);
    let t1 = commit(&store, &[(1, Tid::ZERO, b"a")]);

    let txn = Transaction::new();
    store.tpc_begin(&txn).unwrap();
    store.store(Oid(2), Tid::ZERO, b"pending", &txn).unwrap();
    store.tpc_vote(&txn).unwrap();

    assert_eq!(tids(&store, None, None), vec![t1]);
    store.tpc_abort(&txn).unwrap();
}

#[test]
fn test_iterator_survives_pack() {
    let (_temp, path) = setup_temp_store();
    let store = open_store(&path);
    let t1 = commit_at(&store, tid_at(1_000_000.0), &[(1, Tid::ZERO, b"a")]);
    let t2 = commit_at(&store, tid_at(2_000_000.0), &[(1, t1, b"b")]);

    let iter = store.iterator(None, None).unwrap();
    store.pack(1_500_000.0).unwrap().unwrap();

    // Still reading the pre-pack file
    let seen: Vec<Tid> = iter.map(|t| t.unwrap().tid()).collect();
    assert_eq!(seen, vec![t1, t2]);
    assert_eq!(tids(&store, None, None), vec![t2]);
}
