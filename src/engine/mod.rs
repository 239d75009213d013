//! # Storage engine
//!
//! Wires the memtable, WAL, SSTables, block cache, bloom filters, and
//! manifest into the public [`Db`] handle, and owns the background
//! compaction worker.
//!
//! ## Data flow
//!
//! A write is appended to the WAL, then inserted into the memtable; when
//! the memtable crosses its size threshold it is flushed into a new L0
//! table, the manifest is rewritten, the WAL rotated, and a fresh
//! memtable swapped in. Reads consult the memtable, then L0 newest-first,
//! then each deeper level by key range. A background worker merges
//! overlapping tables from adjacent levels.
//!
//! ## Concurrency model
//!
//! Two locks partition the engine:
//!
//! - `state` (mutex) — the level vector, the memtable pointer, and the
//!   sequence counter. Held only for snapshots and publications, never
//!   across table I/O.
//! - `writer` (mutex) — the WAL handle and the flush path. Exactly one
//!   writer mutates at a time; the lock makes the single-writer rule
//!   structural rather than conventional.
//!
//! Readers snapshot `(memtable, levels)` under the state mutex and then
//! work lock-free against immutable tables. A flush or compaction
//! publication swaps the snapshot sources atomically, so a reader sees
//! either the pre-publication world or the post-publication one — never
//! a half-published mix, and a `get` issued after `put` returns always
//! sees the written value.
//!
//! ## Durability
//!
//! `put` returns only after the WAL fsync. The manifest is replaced
//! atomically, so after any crash the trusted file set is the last
//! fully-written one; unreferenced files are deleted on open.

mod merge;

#[cfg(test)]
mod tests;

pub use merge::MergedIterator;
pub(crate) use merge::{RawMergeIterator, RecordStream};

use std::{
    collections::HashSet,
    fs::{self, File},
    io,
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicBool, Ordering},
    },
    thread::JoinHandle,
    time::{SystemTime, UNIX_EPOCH},
};

use crossbeam::channel::{self, Sender};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::cache::BlockCache;
use crate::compaction;
use crate::config::DbConfig;
use crate::entry::Entry;
use crate::filter::{BloomFilter, FilterError};
use crate::manifest::{Manifest, ManifestError, TableMeta};
use crate::memtable::{MemTable, MemTableError};
use crate::sstable::{SSTable, SstIterator, SstWriter, TableError, filter_path};
use crate::wal::{WAL_FILENAME, Wal, WalError};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors surfaced by the public [`Db`] API.
#[derive(Debug, Error)]
pub enum DbError {
    /// Caller misuse: empty key, oversized record, bad configuration.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The handle was closed.
    #[error("database is closed")]
    Closed,

    /// Underlying filesystem error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Error originating in the memtable.
    #[error("memtable error: {0}")]
    MemTable(#[from] MemTableError),

    /// Error originating in the write-ahead log.
    #[error("WAL error: {0}")]
    Wal(#[from] WalError),

    /// Error originating in an SSTable.
    #[error("table error: {0}")]
    Table(#[from] TableError),

    /// Error originating in a filter file.
    #[error("filter error: {0}")]
    Filter(#[from] FilterError),

    /// Error originating in the manifest.
    #[error("manifest error: {0}")]
    Manifest(#[from] ManifestError),

    /// Error from a manually triggered compaction.
    #[error("compaction error: {0}")]
    Compaction(#[from] crate::compaction::CompactionError),

    /// Poisoned lock or violated internal invariant.
    #[error("internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Shared state
// ------------------------------------------------------------------------------------------------

/// The level vector: index 0 is L0 (newest-first by sequence), deeper
/// levels are sorted by first key with pairwise-disjoint ranges.
pub(crate) type Levels = Vec<Vec<Arc<SSTable>>>;

/// State guarded by the engine's state mutex.
pub(crate) struct LsmState {
    pub(crate) memtable: Arc<MemTable>,
    pub(crate) levels: Levels,
    /// Next table sequence number; persisted via the manifest so L0
    /// recency survives restarts.
    pub(crate) next_sequence: u64,
}

struct WriterHalf {
    wal: Wal,
}

/// Engine internals shared between the public handle and the compaction
/// worker.
pub(crate) struct Shared {
    pub(crate) dir: PathBuf,
    pub(crate) config: DbConfig,
    pub(crate) cache: BlockCache,
    pub(crate) manifest: Manifest,
    pub(crate) state: Mutex<LsmState>,
    writer: Mutex<WriterHalf>,
    /// Serializes compactions: the background worker and any manual
    /// trigger, at most one merge at a time.
    pub(crate) compaction_lock: Mutex<()>,
    pub(crate) shutdown: AtomicBool,
}

impl Shared {
    pub(crate) fn lock_state(&self) -> Result<MutexGuard<'_, LsmState>, DbError> {
        self.state.lock().map_err(|_| {
            error!("engine state lock poisoned");
            DbError::Internal("engine state lock poisoned".into())
        })
    }

    /// Atomic snapshot of the read sources.
    fn snapshot(&self) -> Result<(Arc<MemTable>, Levels), DbError> {
        let state = self.lock_state()?;
        Ok((Arc::clone(&state.memtable), state.levels.clone()))
    }
}

// ------------------------------------------------------------------------------------------------
// Stats
// ------------------------------------------------------------------------------------------------

/// Point-in-time engine statistics.
#[derive(Debug)]
pub struct DbStats {
    /// Approximate bytes buffered in the memtable.
    pub memtable_bytes: usize,

    /// Records (tombstones included) in the memtable.
    pub memtable_records: usize,

    /// Per-level table counts and byte totals, L0 first.
    pub levels: Vec<LevelStats>,

    /// Block-cache hits since open.
    pub cache_hits: u64,

    /// Block-cache misses since open.
    pub cache_misses: u64,
}

/// Statistics for one level.
#[derive(Debug)]
pub struct LevelStats {
    /// Number of live tables.
    pub tables: usize,

    /// Sum of table file sizes in bytes.
    pub bytes: u64,
}

// ------------------------------------------------------------------------------------------------
// Db
// ------------------------------------------------------------------------------------------------

/// The public storage engine handle.
///
/// Safe to share across threads behind an `Arc`; the engine supports
/// concurrent readers with a single writer at a time (writes from
/// multiple threads serialize on an internal lock).
pub struct Db {
    shared: Arc<Shared>,
    wake_tx: Sender<()>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Db {
    /// Opens (or creates) an engine rooted at `path`.
    ///
    /// Replays the manifest and deletes unreferenced files, opens every
    /// live table with its filter, replays the WAL into a fresh
    /// memtable, and starts the compaction worker.
    ///
    /// A corrupt manifest, or a table file the manifest references but
    /// the directory lacks, fails the open.
    pub fn open(path: impl AsRef<Path>, config: DbConfig) -> Result<Self, DbError> {
        config.validate().map_err(DbError::InvalidArgument)?;

        let dir = path.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        // 1. Manifest: the sole authority on which files are live.
        let manifest = Manifest::new(&dir);
        let metas = manifest.load()?.unwrap_or_default();

        // 2. Delete files the manifest does not reference. They are
        //    leftovers of unpublished flushes/compactions or torn saves.
        remove_orphans(&dir, &metas)?;

        // 3. Open tables and group them into levels.
        let mut levels: Levels = vec![Vec::new(); config.max_level];
        let mut next_sequence: u64 = 1;
        for meta in metas {
            if meta.level as usize >= config.max_level {
                return Err(DbError::Manifest(ManifestError::Corrupt(format!(
                    "table {} at level {} exceeds max_level {}",
                    meta.filename, meta.level, config.max_level
                ))));
            }
            next_sequence = next_sequence.max(meta.sequence + 1);
            let level = meta.level as usize;
            let table = Arc::new(SSTable::open(&dir, meta)?);
            levels[level].push(table);
        }
        levels[0].sort_by(|a, b| b.meta.sequence.cmp(&a.meta.sequence));
        for level in levels.iter_mut().skip(1) {
            level.sort_by(|a, b| a.meta.first_key.cmp(&b.meta.first_key));
        }

        // 4. WAL replay into a fresh memtable.
        let memtable = Arc::new(MemTable::new(config.arena_capacity));
        let max_record = (config.max_key_size + config.max_value_size) as u32;
        let mut wal = Wal::open(dir.join(WAL_FILENAME), max_record)?;
        let replayed = wal.replay_into(&memtable)?;

        let table_count: usize = levels.iter().map(Vec::len).sum();
        info!(
            dir = %dir.display(),
            tables = table_count,
            wal_records = replayed,
            "engine opened"
        );

        // 5. Background compaction worker with an explicit wake signal.
        let (wake_tx, wake_rx) = channel::bounded::<()>(1);
        let cache = BlockCache::new(config.block_cache_size);
        let shared = Arc::new(Shared {
            dir,
            config,
            cache,
            manifest,
            state: Mutex::new(LsmState {
                memtable,
                levels,
                next_sequence,
            }),
            writer: Mutex::new(WriterHalf { wal }),
            compaction_lock: Mutex::new(()),
            shutdown: AtomicBool::new(false),
        });

        let worker = compaction::spawn(Arc::clone(&shared), wake_rx)?;

        Ok(Self {
            shared,
            wake_tx,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Inserts or overwrites `key` with `value`.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<(), DbError> {
        self.ensure_open()?;
        self.validate_key(key)?;
        if value.len() > self.shared.config.max_value_size {
            return Err(DbError::InvalidArgument(format!(
                "value of {} bytes exceeds maximum {}",
                value.len(),
                self.shared.config.max_value_size
            )));
        }
        self.write(key, Entry::Value(value.to_vec()))
    }

    /// Deletes `key` by writing a tombstone. Deleting an absent key is
    /// not an error; the tombstone still shadows older layers.
    pub fn delete(&self, key: &[u8]) -> Result<(), DbError> {
        self.ensure_open()?;
        self.validate_key(key)?;
        self.write(key, Entry::Tombstone)
    }

    /// Point lookup.
    ///
    /// Search order: memtable, then L0 newest-first, then each deeper
    /// level's single candidate table. The first definitive entry wins;
    /// a tombstone reads as absent.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, DbError> {
        self.ensure_open()?;
        self.validate_key(key)?;

        let (memtable, levels) = self.shared.snapshot()?;

        if let Some(entry) = memtable.get(key)? {
            return Ok(entry.into_value());
        }

        for table in &levels[0] {
            if !table.contains_key_range(key) || !table.may_contain(key) {
                continue;
            }
            if let Some(entry) = table.lookup(key, &self.shared.cache)? {
                return Ok(entry.into_value());
            }
        }

        for level in levels.iter().skip(1) {
            let Some(table) = table_for_key(level, key) else {
                continue;
            };
            if !table.may_contain(key) {
                continue;
            }
            if let Some(entry) = table.lookup(key, &self.shared.cache)? {
                return Ok(entry.into_value());
            }
        }

        Ok(None)
    }

    /// Ordered scan of all live pairs with `start <= key <= end`.
    ///
    /// `start > end` yields an empty iterator. The iterator owns
    /// snapshots/handles of everything it reads, so it stays consistent
    /// while flushes and compactions proceed.
    pub fn scan(&self, start: &[u8], end: &[u8]) -> Result<MergedIterator, DbError> {
        self.ensure_open()?;
        if start > end {
            return Ok(MergedIterator::empty());
        }

        let (memtable, levels) = self.shared.snapshot()?;

        let mut sources: Vec<RecordStream> = Vec::new();
        sources.push(Box::new(memtable.scan(start, end)?.into_iter()));

        for table in &levels[0] {
            if table.overlaps(start, end) {
                sources.push(Box::new(SstIterator::with_range(
                    Arc::clone(table),
                    start,
                    end,
                )?));
            }
        }
        for level in levels.iter().skip(1) {
            for table in level {
                if table.overlaps(start, end) {
                    sources.push(Box::new(SstIterator::with_range(
                        Arc::clone(table),
                        start,
                        end,
                    )?));
                }
            }
        }

        Ok(MergedIterator::new(sources))
    }

    /// Flushes the memtable to a new L0 table, if it holds anything.
    ///
    /// Writes normally trigger this automatically at the configured
    /// threshold; the manual trigger exists for tests and shutdown.
    pub fn flush(&self) -> Result<(), DbError> {
        self.ensure_open()?;
        let mut writer = self.lock_writer()?;
        if flush_memtable(&self.shared, &mut writer)? {
            let _ = self.wake_tx.try_send(());
        }
        Ok(())
    }

    /// Runs at most one compaction round synchronously, returning
    /// whether one was performed.
    ///
    /// The background worker normally handles this; the manual trigger
    /// exists for tests and offline maintenance.
    pub fn compact(&self) -> Result<bool, DbError> {
        self.ensure_open()?;
        Ok(compaction::run_once(&self.shared)?)
    }

    /// Point-in-time statistics.
    pub fn stats(&self) -> Result<DbStats, DbError> {
        self.ensure_open()?;
        let (memtable, levels) = self.shared.snapshot()?;
        Ok(DbStats {
            memtable_bytes: memtable.approximate_size(),
            memtable_records: memtable.len(),
            levels: levels
                .iter()
                .map(|level| LevelStats {
                    tables: level.len(),
                    bytes: level.iter().map(|t| t.meta.file_size).sum(),
                })
                .collect(),
            cache_hits: self.shared.cache.hits(),
            cache_misses: self.shared.cache.misses(),
        })
    }

    /// Gracefully shuts down: flushes the memtable, stops the worker,
    /// and fsyncs the directory. Idempotent.
    pub fn close(&self) -> Result<(), DbError> {
        if self.shared.shutdown.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let flush_result = {
            let mut writer = self.lock_writer()?;
            flush_memtable(&self.shared, &mut writer)
        };

        // Stop the worker regardless of the flush outcome.
        let _ = self.wake_tx.try_send(());
        if let Some(handle) = self
            .worker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            let _ = handle.join();
        }

        flush_result?;

        let dir = File::open(&self.shared.dir)?;
        dir.sync_all()?;

        info!(dir = %self.shared.dir.display(), "engine closed");
        Ok(())
    }

    // --------------------------------------------------------------------
    // Write path
    // --------------------------------------------------------------------

    fn write(&self, key: &[u8], entry: Entry) -> Result<(), DbError> {
        let mut writer = self.lock_writer()?;

        // WAL first; a failed append means the write never happened.
        writer.wal.append(key, &entry)?;

        let memtable = {
            let state = self.shared.lock_state()?;
            Arc::clone(&state.memtable)
        };
        memtable.put(key, &entry)?;

        if memtable.approximate_size() >= self.shared.config.write_buffer_size {
            flush_memtable(&self.shared, &mut writer)?;
            let _ = self.wake_tx.try_send(());
        }
        Ok(())
    }

    // --------------------------------------------------------------------
    // Helpers
    // --------------------------------------------------------------------

    fn ensure_open(&self) -> Result<(), DbError> {
        if self.shared.shutdown.load(Ordering::SeqCst) {
            return Err(DbError::Closed);
        }
        Ok(())
    }

    fn validate_key(&self, key: &[u8]) -> Result<(), DbError> {
        if key.is_empty() {
            return Err(DbError::InvalidArgument("empty key".into()));
        }
        if key.len() > self.shared.config.max_key_size {
            return Err(DbError::InvalidArgument(format!(
                "key of {} bytes exceeds maximum {}",
                key.len(),
                self.shared.config.max_key_size
            )));
        }
        Ok(())
    }

    fn lock_writer(&self) -> Result<MutexGuard<'_, WriterHalf>, DbError> {
        self.shared.writer.lock().map_err(|_| {
            error!("engine writer lock poisoned");
            DbError::Internal("engine writer lock poisoned".into())
        })
    }
}

impl Drop for Db {
    /// Stops the background worker. Deliberately does **not** flush —
    /// durability of unflushed writes rests on the WAL, and `close()`
    /// is the graceful path.
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        let _ = self.wake_tx.try_send(());
        if let Ok(mut worker) = self.worker.lock()
            && let Some(handle) = worker.take()
        {
            let _ = handle.join();
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Flush
// ------------------------------------------------------------------------------------------------

/// Flushes the live memtable into a new L0 table and publishes it.
///
/// Returns `Ok(false)` for an empty memtable (no-op). On any failure the
/// memtable, WAL, and published state are left untouched; at worst an
/// unreferenced table file remains on disk for the next open to collect.
fn flush_memtable(shared: &Shared, writer: &mut WriterHalf) -> Result<bool, DbError> {
    let memtable = {
        let state = shared.lock_state()?;
        Arc::clone(&state.memtable)
    };

    let records = memtable.iter_for_flush()?;
    if records.is_empty() {
        return Ok(false);
    }

    // Heavy I/O outside the state mutex: build the table and filter.
    let filename = new_table_filename();
    let sst_path = shared.dir.join(&filename);

    let mut table_writer = SstWriter::create(&sst_path, shared.config.block_size)?;
    let mut filter = BloomFilter::new(records.len(), shared.config.bloom_fp_rate);
    for (key, entry) in &records {
        table_writer.add(key, entry)?;
        filter.insert(key);
    }
    let summary = table_writer.finish()?;
    filter.write_to(&filter_path(&sst_path))?;

    // Publication: short critical section, manifest save included.
    {
        let mut state = shared.lock_state()?;
        let sequence = state.next_sequence;
        let meta = TableMeta {
            level: 0,
            sequence,
            filename: filename.clone(),
            first_key: summary.first_key,
            last_key: summary.last_key,
            file_size: summary.file_size,
        };
        let table = Arc::new(SSTable::open(&shared.dir, meta)?);

        let mut levels = state.levels.clone();
        levels[0].insert(0, table);

        if let Err(e) = shared.manifest.save(&flatten_levels(&levels)) {
            // The new table is orphaned garbage; nothing was published.
            warn!(error = %e, table = %filename, "manifest save failed, flush aborted");
            return Err(e.into());
        }

        state.levels = levels;
        state.next_sequence = sequence + 1;
        state.memtable = Arc::new(MemTable::new(shared.config.arena_capacity));
    }

    // The flushed records are durable in the new table; the WAL epoch
    // that held them can go.
    writer.wal.rotate()?;

    info!(
        table = %filename,
        records = records.len(),
        bytes = summary.file_size,
        "memtable flushed to L0"
    );
    Ok(true)
}

// ------------------------------------------------------------------------------------------------
// Shared helpers (also used by compaction)
// ------------------------------------------------------------------------------------------------

/// Flattens the level vector into manifest records.
pub(crate) fn flatten_levels(levels: &Levels) -> Vec<TableMeta> {
    levels
        .iter()
        .flat_map(|level| level.iter().map(|table| table.meta.clone()))
        .collect()
}

/// Allocates a fresh `<nanos>.sst` filename. Uniqueness across restarts
/// comes from the clock; ordering comes from sequence numbers, never
/// from these names.
pub(crate) fn new_table_filename() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!("{nanos}.sst")
}

/// Binary-searches a disjoint, firstkey-sorted level for the table whose
/// range contains `key`.
pub(crate) fn table_for_key<'a>(level: &'a [Arc<SSTable>], key: &[u8]) -> Option<&'a Arc<SSTable>> {
    let idx = level.partition_point(|table| table.meta.first_key.as_slice() <= key);
    let candidate = level.get(idx.checked_sub(1)?)?;
    candidate.contains_key_range(key).then_some(candidate)
}

/// Deletes `.sst`/`.filter` files the manifest does not reference, plus
/// transient `.tmp` leftovers.
fn remove_orphans(dir: &Path, metas: &[TableMeta]) -> Result<(), DbError> {
    let referenced: HashSet<&str> = metas.iter().map(|m| m.filename.as_str()).collect();

    for dir_entry in fs::read_dir(dir)? {
        let dir_entry = dir_entry?;
        let path = dir_entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };

        let orphan = match path.extension().and_then(|e| e.to_str()) {
            Some("sst") => !referenced.contains(name),
            Some("filter") => {
                let sibling = Path::new(name).with_extension("sst");
                !referenced.contains(sibling.to_string_lossy().as_ref())
            }
            Some("tmp") => true,
            _ => false,
        };

        if orphan {
            debug!(file = name, "removing unreferenced file");
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}
