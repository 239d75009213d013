//! Put/get correctness — memtable-only and across the flush boundary.

use tempfile::TempDir;

use crate::engine::tests::helpers::*;
use crate::engine::{Db, DbError};

#[test]
fn put_get_single_key() {
    let tmp = TempDir::new().unwrap();
    let db = Db::open(tmp.path(), memtable_only_config()).unwrap();

    db.put(b"hello", b"world").unwrap();
    assert_eq!(db.get(b"hello").unwrap(), Some(b"world".to_vec()));
}

#[test]
fn get_missing_key_returns_none() {
    let tmp = TempDir::new().unwrap();
    let db = Db::open(tmp.path(), memtable_only_config()).unwrap();

    assert_eq!(db.get(b"nope").unwrap(), None);
}

#[test]
fn overwrite_returns_latest_value() {
    let tmp = TempDir::new().unwrap();
    let db = Db::open(tmp.path(), memtable_only_config()).unwrap();

    db.put(b"k", b"v1").unwrap();
    db.put(b"k", b"v2").unwrap();
    db.put(b"k", b"v3").unwrap();

    assert_eq!(db.get(b"k").unwrap(), Some(b"v3".to_vec()));
}

#[test]
fn empty_value_round_trips() {
    let tmp = TempDir::new().unwrap();
    let db = Db::open(tmp.path(), memtable_only_config()).unwrap();

    db.put(b"empty", b"").unwrap();
    assert_eq!(db.get(b"empty").unwrap(), Some(Vec::new()));
}

#[test]
fn reads_hit_sstables_after_flush() {
    let tmp = TempDir::new().unwrap();
    let db = db_with_one_table(tmp.path(), 500);

    assert_eq!(db.stats().unwrap().memtable_records, 0);
    for i in 0..500 {
        assert_eq!(
            db.get(key(i).as_bytes()).unwrap(),
            Some(value(i).into_bytes()),
            "key {i} after flush"
        );
    }
}

#[test]
fn memtable_shadows_flushed_value() {
    // Shadowing across memtable and disk: the freshest write wins.
    let tmp = TempDir::new().unwrap();
    let db = Db::open(tmp.path(), memtable_only_config()).unwrap();

    db.put(b"k", b"v1").unwrap();
    db.flush().unwrap();
    db.put(b"k", b"v2").unwrap();

    assert_eq!(db.get(b"k").unwrap(), Some(b"v2".to_vec()));
}

#[test]
fn newer_l0_table_shadows_older() {
    let tmp = TempDir::new().unwrap();
    let db = Db::open(tmp.path(), memtable_only_config()).unwrap();

    db.put(b"k", b"v1").unwrap();
    db.flush().unwrap();
    db.put(b"k", b"v2").unwrap();
    db.flush().unwrap();

    assert_eq!(level_table_counts(&db)[0], 2);
    assert_eq!(db.get(b"k").unwrap(), Some(b"v2".to_vec()));
}

#[test]
fn binary_keys_and_values() {
    let tmp = TempDir::new().unwrap();
    let db = Db::open(tmp.path(), memtable_only_config()).unwrap();

    let key: Vec<u8> = (0..=255u8).collect();
    let value = vec![0x00, 0xFF, 0x80, 0x7F];
    db.put(&key, &value).unwrap();
    db.flush().unwrap();

    assert_eq!(db.get(&key).unwrap(), Some(value));
}

#[test]
fn empty_key_is_invalid() {
    let tmp = TempDir::new().unwrap();
    let db = Db::open(tmp.path(), memtable_only_config()).unwrap();

    assert!(matches!(
        db.put(b"", b"v"),
        Err(DbError::InvalidArgument(_))
    ));
    assert!(matches!(db.get(b""), Err(DbError::InvalidArgument(_))));
    assert!(matches!(db.delete(b""), Err(DbError::InvalidArgument(_))));
}

#[test]
fn oversized_records_are_invalid() {
    let tmp = TempDir::new().unwrap();
    let db = Db::open(tmp.path(), tiny_config()).unwrap();

    let big_key = vec![b'k'; 2048]; // max_key_size is 1024
    assert!(matches!(
        db.put(&big_key, b"v"),
        Err(DbError::InvalidArgument(_))
    ));

    let big_value = vec![0xAB; 8192]; // max_value_size is 4096
    assert!(matches!(
        db.put(b"k", &big_value),
        Err(DbError::InvalidArgument(_))
    ));
}

#[test]
fn operations_after_close_fail() {
    let tmp = TempDir::new().unwrap();
    let db = Db::open(tmp.path(), memtable_only_config()).unwrap();
    db.put(b"k", b"v").unwrap();
    db.close().unwrap();

    assert!(matches!(db.put(b"k", b"v2"), Err(DbError::Closed)));
    assert!(matches!(db.get(b"k"), Err(DbError::Closed)));
    // Closing again is a no-op.
    db.close().unwrap();
}
