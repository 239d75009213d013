use std::path::Path;
use std::time::Duration;

use tracing_subscriber::EnvFilter;

use crate::config::DbConfig;
use crate::engine::Db;

/// Initialize tracing controlled by `RUST_LOG`. Safe to call from every
/// test — only the first call takes effect.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Large write buffer — nothing is flushed unless a test asks for it.
pub fn memtable_only_config() -> DbConfig {
    init_tracing();
    DbConfig {
        write_buffer_size: 8 * 1024 * 1024,
        arena_capacity: 16 * 1024 * 1024,
        // Long tick so the background worker stays out of the way.
        compaction_tick: Duration::from_secs(3600),
        ..DbConfig::default()
    }
}

/// Small buffers and low triggers: flushes and compactions happen with
/// little data. The tick is still long — tests drive compaction
/// explicitly via `Db::compact` for determinism.
pub fn tiny_config() -> DbConfig {
    init_tracing();
    DbConfig {
        write_buffer_size: 1024,
        arena_capacity: 64 * 1024,
        block_size: 256,
        block_cache_size: 64 * 1024,
        max_level: 4,
        bloom_fp_rate: 0.01,
        l0_compaction_trigger: 2,
        level_base_size: 4 * 1024,
        compaction_tick: Duration::from_secs(3600),
        max_key_size: 1024,
        max_value_size: 4096,
    }
}

/// Opens a database, writes `count` keyed records, and flushes them to
/// one L0 table.
pub fn db_with_one_table(path: &Path, count: u32) -> Db {
    let db = Db::open(path, memtable_only_config()).expect("open");
    for i in 0..count {
        db.put(key(i).as_bytes(), value(i).as_bytes()).expect("put");
    }
    db.flush().expect("flush");
    db
}

pub fn key(i: u32) -> String {
    format!("key_{i:06}")
}

pub fn value(i: u32) -> String {
    format!("value_{i:06}")
}

/// Number of tables per level, straight from the engine state.
pub fn level_table_counts(db: &Db) -> Vec<usize> {
    let state = db.shared.state.lock().unwrap();
    state.levels.iter().map(Vec::len).collect()
}

/// Asserts the structural level invariants: L0 newest-first by
/// sequence; L1+ sorted by first key with pairwise-disjoint ranges.
pub fn assert_level_invariants(db: &Db) {
    let state = db.shared.state.lock().unwrap();

    for window in state.levels[0].windows(2) {
        assert!(
            window[0].meta.sequence > window[1].meta.sequence,
            "L0 must be ordered newest-first"
        );
    }

    for (depth, level) in state.levels.iter().enumerate().skip(1) {
        for window in level.windows(2) {
            assert!(
                window[0].meta.first_key < window[1].meta.first_key,
                "L{depth} must be sorted by first key"
            );
            assert!(
                window[0].meta.last_key < window[1].meta.first_key,
                "L{depth} ranges must be disjoint"
            );
        }
    }
}
