//! Ordered iteration: scans and flush snapshots.

use crate::entry::Entry;
use crate::memtable::MemTable;

const ARENA: usize = 1024 * 1024;

fn populated() -> MemTable {
    let mem = MemTable::new(ARENA);
    // Inserted out of order on purpose.
    for key in ["delta", "alpha", "echo", "charlie", "bravo"] {
        mem.put(key.as_bytes(), &Entry::Value(key.to_uppercase().into_bytes()))
            .unwrap();
    }
    mem
}

#[test]
fn flush_snapshot_is_sorted() {
    let mem = populated();
    let records = mem.iter_for_flush().unwrap();
    let keys: Vec<_> = records.iter().map(|(k, _)| k.clone()).collect();
    assert_eq!(
        keys,
        ["alpha", "bravo", "charlie", "delta", "echo"]
            .iter()
            .map(|s| s.as_bytes().to_vec())
            .collect::<Vec<_>>()
    );
}

#[test]
fn scan_is_inclusive_on_both_ends() {
    let mem = populated();
    let records = mem.scan(b"bravo", b"delta").unwrap();
    let keys: Vec<_> = records.iter().map(|(k, _)| k.as_slice()).collect();
    assert_eq!(keys, [b"bravo".as_slice(), b"charlie", b"delta"]);
}

#[test]
fn scan_start_between_keys() {
    let mem = populated();
    let records = mem.scan(b"bzzz", b"dzzz").unwrap();
    let keys: Vec<_> = records.iter().map(|(k, _)| k.as_slice()).collect();
    assert_eq!(keys, [b"charlie".as_slice(), b"delta"]);
}

#[test]
fn reversed_range_is_empty() {
    let mem = populated();
    assert!(mem.scan(b"zz", b"aa").unwrap().is_empty());
}

#[test]
fn scan_includes_tombstones() {
    let mem = populated();
    mem.put(b"charlie", &Entry::Tombstone).unwrap();

    let records = mem.scan(b"alpha", b"echo").unwrap();
    let charlie = records
        .iter()
        .find(|(k, _)| k == b"charlie")
        .expect("tombstone surfaced in scan");
    assert!(charlie.1.is_tombstone());
}

#[test]
fn snapshot_does_not_track_later_writes() {
    let mem = populated();
    let before = mem.iter_for_flush().unwrap();
    mem.put(b"zulu", &Entry::Value(b"Z".to_vec())).unwrap();
    assert_eq!(before.len(), 5, "collected snapshot must not grow");
    assert_eq!(mem.iter_for_flush().unwrap().len(), 6);
}

#[test]
fn large_ordered_walk() {
    let mem = MemTable::new(4 * 1024 * 1024);
    for i in (0u32..1000).rev() {
        mem.put(
            format!("{i:08}").as_bytes(),
            &Entry::Value(i.to_le_bytes().to_vec()),
        )
        .unwrap();
    }

    let records = mem.iter_for_flush().unwrap();
    assert_eq!(records.len(), 1000);
    for window in records.windows(2) {
        assert!(window[0].0 < window[1].0, "keys must strictly ascend");
    }
}
