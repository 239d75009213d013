//! End-to-end compaction: leveling, shadowing, tombstone collection.

use tempfile::TempDir;

use crate::engine::Db;
use crate::engine::tests::helpers::*;

/// Tiny config with an L0 trigger of one: every flush beyond the first
/// makes a compaction due, letting tests march data down the levels.
fn eager_config() -> crate::config::DbConfig {
    crate::config::DbConfig {
        l0_compaction_trigger: 1,
        ..tiny_config()
    }
}

fn drain(db: &Db) {
    while db.compact().unwrap() {}
}

#[test]
fn compact_moves_l0_into_l1() {
    let tmp = TempDir::new().unwrap();
    let db = Db::open(tmp.path(), eager_config()).unwrap();

    for round in 0u32..3 {
        for i in 0..10 {
            db.put(key(round * 10 + i).as_bytes(), value(i).as_bytes())
                .unwrap();
        }
        db.flush().unwrap();
    }
    assert_eq!(level_table_counts(&db)[0], 3);

    drain(&db);

    let counts = level_table_counts(&db);
    assert!(counts[0] <= 1, "L0 drained to the trigger level");
    assert!(counts[1] >= 1, "L1 received the merged tables");
    assert_level_invariants(&db);

    for round in 0u32..3 {
        for i in 0..10 {
            assert_eq!(
                db.get(key(round * 10 + i).as_bytes()).unwrap(),
                Some(value(i).into_bytes())
            );
        }
    }
}

#[test]
fn compaction_preserves_newest_version() {
    let tmp = TempDir::new().unwrap();
    let db = Db::open(tmp.path(), eager_config()).unwrap();

    db.put(b"k", b"v1").unwrap();
    db.flush().unwrap();
    db.put(b"k", b"v2").unwrap();
    db.flush().unwrap();
    db.put(b"k", b"v3").unwrap();
    db.flush().unwrap();

    drain(&db);

    assert_eq!(db.get(b"k").unwrap(), Some(b"v3".to_vec()));
    let counts = level_table_counts(&db);
    assert!(
        counts[1] <= 1,
        "one merged table at most covers the key range in L1"
    );
    assert_level_invariants(&db);
}

#[test]
fn tombstone_is_dropped_at_the_bottom() {
    let tmp = TempDir::new().unwrap();
    let db = Db::open(tmp.path(), eager_config()).unwrap();

    db.put(b"k", b"v").unwrap();
    db.flush().unwrap();
    db.delete(b"k").unwrap();
    db.flush().unwrap();
    assert_eq!(db.get(b"k").unwrap(), None);

    // March the value, then the tombstone, down through compaction.
    drain(&db);
    db.put(b"filler", b"x").unwrap();
    db.flush().unwrap();
    drain(&db);

    assert_eq!(db.get(b"k").unwrap(), None);

    // No physical record for the key may remain in any table: with
    // nothing below the target level, the tombstone annihilates the
    // value instead of being carried along.
    let state = db.shared.state.lock().unwrap();
    for level in &state.levels {
        for table in level {
            assert_eq!(
                table.lookup(b"k", &db.shared.cache).unwrap(),
                None,
                "table {} still holds the key",
                table.meta.filename
            );
        }
    }
}

#[test]
fn tombstone_survives_while_deeper_data_exists() {
    let tmp = TempDir::new().unwrap();
    let db = Db::open(tmp.path(), eager_config()).unwrap();

    // Sink a value to a deeper level.
    db.put(b"k", b"old").unwrap();
    db.flush().unwrap();
    db.put(b"filler_a", b"x").unwrap();
    db.flush().unwrap();
    drain(&db); // value now in L1

    // Push the L1 table further down by overflowing L1.
    for i in 0..40 {
        db.put(key(i).as_bytes(), &[0xEE; 128]).unwrap();
    }
    db.flush().unwrap();
    drain(&db);

    let has_deep_value = {
        let state = db.shared.state.lock().unwrap();
        state.levels[2..]
            .iter()
            .flatten()
            .any(|t| t.contains_key_range(b"k"))
    };

    if has_deep_value {
        // Now delete; the tombstone compacted into L1 must survive
        // because the old value lives deeper.
        db.delete(b"k").unwrap();
        db.flush().unwrap();
        db.put(b"filler_b", b"y").unwrap();
        db.flush().unwrap();
        drain(&db);

        assert_eq!(db.get(b"k").unwrap(), None, "delete visible throughout");
    }
}

#[test]
fn overflow_cascades_into_deeper_levels() {
    let tmp = TempDir::new().unwrap();
    let db = Db::open(tmp.path(), eager_config()).unwrap();

    // ~30 KiB of records against a 4 KiB L1 limit.
    for i in 0..300 {
        db.put(key(i).as_bytes(), &[0x77; 80]).unwrap();
    }
    db.flush().unwrap();
    drain(&db);

    let counts = level_table_counts(&db);
    let deep_tables: usize = counts[2..].iter().sum();
    assert!(
        deep_tables > 0,
        "L1 overflow must push tables deeper, got {counts:?}"
    );
    assert_level_invariants(&db);

    for i in 0..300 {
        assert_eq!(
            db.get(key(i).as_bytes()).unwrap(),
            Some(vec![0x77; 80]),
            "key {i} after cascade"
        );
    }
}

#[test]
fn compaction_deletes_input_files() {
    let tmp = TempDir::new().unwrap();
    let db = Db::open(tmp.path(), eager_config()).unwrap();

    for round in 0u32..4 {
        db.put(key(round).as_bytes(), value(round).as_bytes()).unwrap();
        db.flush().unwrap();
    }
    drain(&db);

    // Every on-disk table is referenced by the manifest, and vice versa.
    let manifest = crate::manifest::Manifest::new(tmp.path());
    let referenced: std::collections::HashSet<String> = manifest
        .load()
        .unwrap()
        .unwrap()
        .into_iter()
        .map(|m| m.filename)
        .collect();

    let on_disk: std::collections::HashSet<String> = std::fs::read_dir(tmp.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter_map(|e| e.file_name().into_string().ok())
        .filter(|n| n.ends_with(".sst"))
        .collect();

    assert_eq!(referenced, on_disk, "manifest and directory must agree");
    assert!(!tmp.path().join("compacted.tmp").exists());
}

#[test]
fn background_worker_compacts_without_manual_triggers() {
    let tmp = TempDir::new().unwrap();
    // Short tick so the worker acts on its own.
    let config = crate::config::DbConfig {
        compaction_tick: std::time::Duration::from_millis(20),
        l0_compaction_trigger: 1,
        ..tiny_config()
    };
    let db = Db::open(tmp.path(), config).unwrap();

    for round in 0u32..4 {
        for i in 0..5 {
            db.put(key(round * 5 + i).as_bytes(), value(i).as_bytes())
                .unwrap();
        }
        db.flush().unwrap();
    }

    // Give the worker a few ticks.
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    loop {
        if level_table_counts(&db)[0] <= 1 {
            break;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "worker never drained L0: {:?}",
            level_table_counts(&db)
        );
        std::thread::sleep(std::time::Duration::from_millis(20));
    }

    assert_level_invariants(&db);
    for round in 0u32..4 {
        for i in 0..5 {
            assert_eq!(
                db.get(key(round * 5 + i).as_bytes()).unwrap(),
                Some(value(i).into_bytes())
            );
        }
    }
}
