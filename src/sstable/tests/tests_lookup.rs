//! Point lookups: sparse-index selection, cache interaction, filters.

use tempfile::TempDir;

use crate::entry::Entry;
use crate::sstable::tests::helpers::*;

#[test]
fn finds_every_written_key() {
    let dir = TempDir::new().unwrap();
    let records = sequential_records(300);
    let table = build_table(dir.path(), "t.sst", &records);
    let cache = cache();

    for (key, entry) in &records {
        assert_eq!(
            table.lookup(key, &cache).unwrap().as_ref(),
            Some(entry),
            "key {:?}",
            String::from_utf8_lossy(key)
        );
    }
}

#[test]
fn absent_keys_return_none() {
    let dir = TempDir::new().unwrap();
    let table = build_table(
        dir.path(),
        "t.sst",
        &[
            (b"bbb", Entry::Value(b"2".to_vec())),
            (b"ddd", Entry::Value(b"4".to_vec())),
        ],
    );
    let cache = cache();

    // Before the first key: every index key is greater than the target.
    assert_eq!(table.lookup(b"aaa", &cache).unwrap(), None);
    // Between keys within the candidate block.
    assert_eq!(table.lookup(b"ccc", &cache).unwrap(), None);
    // After the last key.
    assert_eq!(table.lookup(b"zzz", &cache).unwrap(), None);
}

#[test]
fn tombstone_lookup_is_definitive() {
    let dir = TempDir::new().unwrap();
    let table = build_table(
        dir.path(),
        "t.sst",
        &[
            (b"alive".as_slice(), Entry::Value(b"v".to_vec())),
            (b"dead".as_slice(), Entry::Tombstone),
        ],
    );
    let cache = cache();

    assert_eq!(
        table.lookup(b"dead", &cache).unwrap(),
        Some(Entry::Tombstone)
    );
}

#[test]
fn empty_value_round_trips() {
    let dir = TempDir::new().unwrap();
    let table = build_table(dir.path(), "t.sst", &[(b"empty", Entry::Value(Vec::new()))]);
    let cache = cache();

    assert_eq!(
        table.lookup(b"empty", &cache).unwrap(),
        Some(Entry::Value(Vec::new()))
    );
}

#[test]
fn repeated_lookup_hits_the_cache() {
    let dir = TempDir::new().unwrap();
    let records = sequential_records(10);
    let table = build_table(dir.path(), "t.sst", &records);
    let cache = cache();

    table.lookup(b"key_00000003", &cache).unwrap();
    let misses_after_first = cache.misses();

    table.lookup(b"key_00000004", &cache).unwrap();
    assert_eq!(
        cache.misses(),
        misses_after_first,
        "second lookup in the same block must be served from cache"
    );
    assert!(cache.hits() > 0);
}

#[test]
fn filter_has_no_false_negatives_for_table_keys() {
    let dir = TempDir::new().unwrap();
    let records = sequential_records(1000);
    let table = build_table(dir.path(), "t.sst", &records);

    for (key, _) in &records {
        assert!(table.may_contain(key), "filter false negative");
    }
}

#[test]
fn missing_filter_degrades_to_full_lookup() {
    let dir = TempDir::new().unwrap();
    let records = sequential_records(20);
    let table = build_table(dir.path(), "t.sst", &records);

    // Delete the sibling filter and reopen.
    std::fs::remove_file(dir.path().join("t.filter")).unwrap();
    let reopened = crate::sstable::SSTable::open(dir.path(), table.meta.clone()).unwrap();
    let cache = cache();

    // may_contain must fail open, and lookups still work.
    assert!(reopened.may_contain(b"anything"));
    assert_eq!(
        reopened.lookup(b"key_00000007", &cache).unwrap(),
        Some(Entry::Value(b"value_00000007".to_vec()))
    );
}

#[test]
fn range_predicates_are_inclusive() {
    let dir = TempDir::new().unwrap();
    let table = build_table(
        dir.path(),
        "t.sst",
        &[
            (b"b", Entry::Value(b"1".to_vec())),
            (b"m", Entry::Value(b"2".to_vec())),
        ],
    );

    assert!(table.contains_key_range(b"b"));
    assert!(table.contains_key_range(b"m"));
    assert!(!table.contains_key_range(b"a"));
    assert!(!table.contains_key_range(b"z"));

    // Overlap is endpoint-inclusive on both sides.
    assert!(table.overlaps(b"a", b"b"));
    assert!(table.overlaps(b"m", b"z"));
    assert!(!table.overlaps(b"n", b"z"));
    assert!(!table.overlaps(b"a", b"aa"));
}
