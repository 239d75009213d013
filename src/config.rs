//! Engine configuration.
//!
//! All tunables live in one immutable [`DbConfig`] value passed to
//! [`Db::open`](crate::Db::open). Defaults match the engine's on-disk
//! design targets; changing them never changes wire formats.

use std::time::Duration;

/// Configuration for a [`Db`](crate::Db) instance.
///
/// Passed by value to `Db::open` and held immutably for the lifetime of
/// the engine. Validated once at open.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Memtable size (bytes) at which a flush to L0 is triggered.
    pub write_buffer_size: usize,

    /// Memtable arena capacity (bytes). Must leave headroom above
    /// `write_buffer_size` so the write that crosses the threshold still
    /// fits before the flush runs.
    pub arena_capacity: usize,

    /// Target uncompressed size (bytes) of one SSTable data block.
    pub block_size: usize,

    /// Byte budget of the shared block cache.
    pub block_cache_size: usize,

    /// Number of levels, L0 included.
    pub max_level: usize,

    /// Target false-positive rate for per-table bloom filters.
    pub bloom_fp_rate: f64,

    /// Number of L0 tables above which an L0 → L1 compaction is scheduled.
    pub l0_compaction_trigger: usize,

    /// Size limit of L1 in bytes; each deeper level is ten times larger.
    pub level_base_size: u64,

    /// Fallback wake interval of the compaction worker.
    pub compaction_tick: Duration,

    /// Largest accepted key, in bytes.
    pub max_key_size: usize,

    /// Largest accepted value, in bytes.
    pub max_value_size: usize,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            write_buffer_size: 4 * 1024 * 1024,
            arena_capacity: 6 * 1024 * 1024,
            block_size: 4 * 1024,
            block_cache_size: 4 * 1024 * 1024,
            max_level: 12,
            bloom_fp_rate: 0.01,
            l0_compaction_trigger: 4,
            level_base_size: 10 * 1024 * 1024,
            compaction_tick: Duration::from_secs(1),
            max_key_size: 64 * 1024,
            max_value_size: 1024 * 1024,
        }
    }
}

impl DbConfig {
    /// Checks the configuration for internal consistency.
    ///
    /// Returns a human-readable description of the first violated
    /// constraint, or `Ok(())`.
    pub fn validate(&self) -> Result<(), String> {
        if self.write_buffer_size == 0 {
            return Err("write_buffer_size must be non-zero".into());
        }
        if self.arena_capacity < self.write_buffer_size {
            return Err("arena_capacity must be at least write_buffer_size".into());
        }
        if self.block_size == 0 {
            return Err("block_size must be non-zero".into());
        }
        if self.max_level < 2 {
            return Err("max_level must be at least 2".into());
        }
        if !(self.bloom_fp_rate > 0.0 && self.bloom_fp_rate < 1.0) {
            return Err("bloom_fp_rate must lie in (0, 1)".into());
        }
        if self.l0_compaction_trigger == 0 {
            return Err("l0_compaction_trigger must be non-zero".into());
        }
        if self.level_base_size == 0 {
            return Err("level_base_size must be non-zero".into());
        }
        if self.max_key_size == 0 || self.max_value_size == 0 {
            return Err("max_key_size and max_value_size must be non-zero".into());
        }
        // The threshold-crossing write must fit into the arena headroom.
        if self.arena_capacity - self.write_buffer_size < self.max_key_size + self.max_value_size {
            return Err(
                "arena_capacity must exceed write_buffer_size by at least one maximum record"
                    .into(),
            );
        }
        Ok(())
    }

    /// Size limit in bytes for level `level` (1-based levels; L0 is
    /// count-triggered, not size-triggered).
    pub fn level_size_limit(&self, level: usize) -> u64 {
        debug_assert!(level >= 1);
        self.level_base_size
            .saturating_mul(10u64.saturating_pow(level as u32 - 1))
    }
}
