//! Writer behavior: ordering contract, block framing, summaries.

use tempfile::TempDir;

use crate::entry::Entry;
use crate::sstable::tests::helpers::*;
use crate::sstable::{SstWriter, TableError};

#[test]
fn summary_reflects_written_stream() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("t.sst");

    let mut writer = SstWriter::create(&path, BLOCK_SIZE).unwrap();
    writer.add(b"aaa", &Entry::Value(b"1".to_vec())).unwrap();
    writer.add(b"mmm", &Entry::Tombstone).unwrap();
    writer.add(b"zzz", &Entry::Value(b"3".to_vec())).unwrap();
    let summary = writer.finish().unwrap();

    assert_eq!(summary.first_key, b"aaa");
    assert_eq!(summary.last_key, b"zzz");
    assert_eq!(summary.record_count, 3);
    assert_eq!(
        summary.file_size,
        std::fs::metadata(&path).unwrap().len(),
        "summary size must match the file on disk"
    );
}

#[test]
fn rejects_unsorted_keys() {
    let dir = TempDir::new().unwrap();
    let mut writer = SstWriter::create(dir.path().join("t.sst"), BLOCK_SIZE).unwrap();

    writer.add(b"bbb", &Entry::Value(b"1".to_vec())).unwrap();
    match writer.add(b"aaa", &Entry::Value(b"2".to_vec())) {
        Err(TableError::InvalidArgument(_)) => {}
        other => panic!("expected InvalidArgument, got {other:?}"),
    }
}

#[test]
fn rejects_duplicate_keys() {
    let dir = TempDir::new().unwrap();
    let mut writer = SstWriter::create(dir.path().join("t.sst"), BLOCK_SIZE).unwrap();

    writer.add(b"same", &Entry::Value(b"1".to_vec())).unwrap();
    assert!(matches!(
        writer.add(b"same", &Entry::Value(b"2".to_vec())),
        Err(TableError::InvalidArgument(_))
    ));
}

#[test]
fn rejects_empty_key() {
    let dir = TempDir::new().unwrap();
    let mut writer = SstWriter::create(dir.path().join("t.sst"), BLOCK_SIZE).unwrap();
    assert!(matches!(
        writer.add(b"", &Entry::Value(b"v".to_vec())),
        Err(TableError::InvalidArgument(_))
    ));
}

#[test]
fn rejects_empty_finish() {
    let dir = TempDir::new().unwrap();
    let writer = SstWriter::create(dir.path().join("t.sst"), BLOCK_SIZE).unwrap();
    assert!(matches!(
        writer.finish(),
        Err(TableError::InvalidArgument(_))
    ));
}

#[test]
fn abort_removes_the_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("t.sst");
    let mut writer = SstWriter::create(&path, BLOCK_SIZE).unwrap();
    writer.add(b"k", &Entry::Value(b"v".to_vec())).unwrap();

    writer.abort().unwrap();
    assert!(!path.exists());
}

#[test]
fn small_block_size_produces_many_blocks() {
    let dir = TempDir::new().unwrap();
    let records: Vec<_> = sequential_records(200);

    let path = dir.path().join("t.sst");
    let mut writer = SstWriter::create(&path, 256).unwrap();
    for (key, entry) in &records {
        writer.add(key, entry).unwrap();
    }
    let summary = writer.finish().unwrap();
    let table = open_table(dir.path(), "t.sst", &summary);

    assert!(
        table.block_count() > 10,
        "200 records with 256-byte blocks must span many blocks, got {}",
        table.block_count()
    );
}

#[test]
fn round_trip_preserves_stream_order() {
    // Writing a stream and iterating the file yields exactly that stream.
    let dir = TempDir::new().unwrap();
    let records = sequential_records(500);
    let table = build_table(dir.path(), "t.sst", &records);

    let scanned: Vec<_> = crate::sstable::SstIterator::new(table).unwrap().collect();
    assert_eq!(scanned.len(), records.len());
    for (got, want) in scanned.iter().zip(records.iter()) {
        assert_eq!(got.0, want.0);
        assert_eq!(got.1, want.1);
    }
}
