//! # Leveled compaction
//!
//! A single long-lived background worker keeps read amplification
//! bounded by merging tables from adjacent levels:
//!
//! - **L0 → L1** when L0 holds more than the configured trigger count.
//!   The *oldest* L0 table is the victim; its key range selects the
//!   overlap set in L1.
//! - **Li → L(i+1)** (i ≥ 1) when the level's total bytes exceed
//!   `level_base_size · 10^(i-1)`. The first table by first-key is the
//!   victim.
//!
//! The victim plus its overlap set run through a k-way merge (victim has
//! top priority — it is the newer data) streamed into a single output
//! table written as `compacted.tmp` and renamed into place. Publication
//! is one short critical section: remove the inputs, insert the output
//! sorted by first key, save the manifest. If the save fails the new
//! file is orphaned garbage and the in-memory state is untouched — the
//! next open collects the orphan, the next tick retries the compaction.
//!
//! ## Tombstone policy
//!
//! A tombstone may be dropped only when no level deeper than the target
//! contains a table whose key range covers the tombstone's key —
//! otherwise dropping it would resurrect an older version living below.
//! Everything shallower is by construction newer and cannot be shadowed
//! by this tombstone.
//!
//! ## Scheduling
//!
//! The worker sleeps on a wake channel with a fallback tick. Flushes
//! signal the channel; shutdown is a flag checked between merges. Errors
//! on the heavy-I/O path are logged and swallowed — the file set is
//! never mutated by a failed compaction. At most one compaction runs at
//! a time.


use std::{
    fs, io,
    sync::{Arc, atomic::Ordering},
    thread::{self, JoinHandle},
};

use crossbeam::channel::{Receiver, RecvTimeoutError};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::DbConfig;
use crate::engine::{
    Levels, LsmState, RawMergeIterator, RecordStream, Shared, flatten_levels, new_table_filename,
    table_for_key,
};
use crate::filter::{BloomFilter, FilterError};
use crate::manifest::{ManifestError, TableMeta};
use crate::sstable::{SSTable, SstIterator, SstWriter, TableError, TableSummary, filter_path};

/// Transient output name; renamed to `<nanos>.sst` on success.
pub(crate) const COMPACTION_TMP_FILENAME: &str = "compacted.tmp";

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors internal to the compaction worker. Never surfaced to clients;
/// logged and retried on the next tick.
#[derive(Debug, Error)]
pub enum CompactionError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Error reading or writing a table.
    #[error("table error: {0}")]
    Table(#[from] TableError),

    /// Error writing the output filter.
    #[error("filter error: {0}")]
    Filter(#[from] FilterError),

    /// Manifest save failure during publication.
    #[error("manifest error: {0}")]
    Manifest(#[from] ManifestError),

    /// Poisoned lock or violated invariant.
    #[error("internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Worker
// ------------------------------------------------------------------------------------------------

/// Starts the background worker. It wakes on `wake_rx` or every
/// `compaction_tick`, and exits once the shared shutdown flag is set.
pub(crate) fn spawn(shared: Arc<Shared>, wake_rx: Receiver<()>) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("strata-compact".into())
        .spawn(move || worker_loop(shared, wake_rx))
}

fn worker_loop(shared: Arc<Shared>, wake_rx: Receiver<()>) {
    info!("compaction worker started");

    loop {
        match wake_rx.recv_timeout(shared.config.compaction_tick) {
            Ok(()) | Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        if shared.shutdown.load(Ordering::SeqCst) {
            break;
        }

        // Drain every due compaction; one failed merge waits for the
        // next tick rather than spinning.
        while !shared.shutdown.load(Ordering::SeqCst) {
            match run_once(&shared) {
                Ok(true) => continue,
                Ok(false) => break,
                Err(e) => {
                    warn!(error = %e, "compaction failed, retrying next tick");
                    break;
                }
            }
        }
        if shared.shutdown.load(Ordering::SeqCst) {
            break;
        }
    }

    info!("compaction worker stopped");
}

/// Runs at most one compaction. Returns `Ok(true)` if one was performed.
pub(crate) fn run_once(shared: &Shared) -> Result<bool, CompactionError> {
    // One merge at a time, whether the worker or a manual trigger asks.
    let _serialized = shared
        .compaction_lock
        .lock()
        .map_err(|_| CompactionError::Internal("compaction lock poisoned".into()))?;

    let job = {
        let state = shared
            .lock_state()
            .map_err(|e| CompactionError::Internal(e.to_string()))?;
        pick_job(&state, &shared.config)
    };

    match job {
        Some(job) => {
            execute(shared, job)?;
            Ok(true)
        }
        None => Ok(false),
    }
}

// ------------------------------------------------------------------------------------------------
// Job selection
// ------------------------------------------------------------------------------------------------

/// One planned merge: the victim, its overlap set in the target level,
/// and a snapshot of every level deeper than the target (for the
/// tombstone-drop test).
pub(crate) struct CompactionJob {
    pub(crate) victim: Arc<SSTable>,
    pub(crate) overlaps: Vec<Arc<SSTable>>,
    pub(crate) source_level: usize,
    pub(crate) target_level: usize,
    deeper: Levels,
}

/// Applies the level triggers in order and plans the first due merge.
pub(crate) fn pick_job(state: &LsmState, config: &DbConfig) -> Option<CompactionJob> {
    // L0: count-triggered. Victim is the oldest table (lowest sequence,
    // i.e. the tail of the newest-first vector).
    if state.levels[0].len() > config.l0_compaction_trigger {
        let victim = Arc::clone(state.levels[0].last()?);
        return Some(plan(state, victim, 0));
    }

    // L1 and deeper: size-triggered, never out of the last level.
    for level in 1..config.max_level - 1 {
        let bytes: u64 = state.levels[level].iter().map(|t| t.meta.file_size).sum();
        if bytes > config.level_size_limit(level) {
            let victim = Arc::clone(state.levels[level].first()?);
            return Some(plan(state, victim, level));
        }
    }

    None
}

fn plan(state: &LsmState, victim: Arc<SSTable>, source_level: usize) -> CompactionJob {
    let target_level = source_level + 1;
    let overlaps = overlap_set(
        &state.levels[target_level],
        &victim.meta.first_key,
        &victim.meta.last_key,
    );
    let deeper = state.levels[target_level + 1..].to_vec();

    CompactionJob {
        victim,
        overlaps,
        source_level,
        target_level,
        deeper,
    }
}

/// Tables in `level` whose key range intersects `[first, last]`,
/// endpoints included.
pub(crate) fn overlap_set(
    level: &[Arc<SSTable>],
    first: &[u8],
    last: &[u8],
) -> Vec<Arc<SSTable>> {
    level
        .iter()
        .filter(|table| table.overlaps(first, last))
        .cloned()
        .collect()
}

/// Whether dropping a tombstone for `key` is safe: true iff no level in
/// the deeper snapshot holds a table whose range covers the key.
fn tombstone_droppable(deeper: &Levels, key: &[u8]) -> bool {
    deeper
        .iter()
        .all(|level| table_for_key(level, key).is_none())
}

// ------------------------------------------------------------------------------------------------
// Execution
// ------------------------------------------------------------------------------------------------

fn execute(shared: &Shared, job: CompactionJob) -> Result<(), CompactionError> {
    info!(
        source_level = job.source_level,
        target_level = job.target_level,
        victim = %job.victim.meta.filename,
        overlaps = job.overlaps.len(),
        "compaction started"
    );

    // Victim first: it is the newer data and must win key collisions.
    let mut sources: Vec<RecordStream> = Vec::new();
    sources.push(Box::new(SstIterator::new(Arc::clone(&job.victim))?));
    for table in &job.overlaps {
        sources.push(Box::new(SstIterator::new(Arc::clone(table))?));
    }
    let merge = RawMergeIterator::new(sources);

    let fp_rate = shared.config.bloom_fp_rate;
    let estimated: usize = job.victim.estimated_entries(fp_rate)
        + job
            .overlaps
            .iter()
            .map(|t| t.estimated_entries(fp_rate))
            .sum::<usize>();

    let tmp_path = shared.dir.join(COMPACTION_TMP_FILENAME);
    let mut writer = SstWriter::create(&tmp_path, shared.config.block_size)?;
    let mut filter = BloomFilter::new(estimated, fp_rate);

    let mut dropped: u64 = 0;
    for (key, entry) in merge {
        if entry.is_tombstone() && tombstone_droppable(&job.deeper, &key) {
            dropped += 1;
            continue;
        }
        writer.add(&key, &entry)?;
        filter.insert(&key);
    }

    // Everything merged away (e.g. tombstones over tombstoned data):
    // publish a pure removal.
    if writer.record_count() == 0 {
        writer.abort()?;
        publish(shared, &job, None)?;
        remove_input_files(shared, &job);
        info!(dropped, "compaction eliminated every record");
        return Ok(());
    }

    let summary = writer.finish()?;
    let filename = new_table_filename();
    let final_path = shared.dir.join(&filename);
    fs::rename(&tmp_path, &final_path)?;
    filter.write_to(&filter_path(&final_path))?;

    let records = summary.record_count;
    publish(shared, &job, Some((filename.clone(), summary)))?;
    remove_input_files(shared, &job);

    info!(
        output = %filename,
        records,
        dropped,
        target_level = job.target_level,
        "compaction published"
    );
    Ok(())
}

/// Publication critical section: swap inputs for the output and save
/// the manifest. In-memory state changes only after the save returns.
fn publish(
    shared: &Shared,
    job: &CompactionJob,
    output: Option<(String, TableSummary)>,
) -> Result<(), CompactionError> {
    let mut state = shared
        .lock_state()
        .map_err(|e| CompactionError::Internal(e.to_string()))?;

    // Compactions are serialized and flushes only prepend to L0, but a
    // vanished input would corrupt the level invariants — re-validate.
    let live = |table: &Arc<SSTable>, level: usize| {
        state.levels[level]
            .iter()
            .any(|t| t.meta.sequence == table.meta.sequence)
    };
    if !live(&job.victim, job.source_level)
        || !job.overlaps.iter().all(|t| live(t, job.target_level))
    {
        return Err(CompactionError::Internal(
            "compaction input vanished before publication".into(),
        ));
    }

    let mut levels = state.levels.clone();
    levels[job.source_level].retain(|t| t.meta.sequence != job.victim.meta.sequence);
    let overlap_seqs: Vec<u64> = job.overlaps.iter().map(|t| t.meta.sequence).collect();
    levels[job.target_level].retain(|t| !overlap_seqs.contains(&t.meta.sequence));

    let sequence = state.next_sequence;
    if let Some((filename, summary)) = output {
        let meta = TableMeta {
            level: job.target_level as u32,
            sequence,
            filename,
            first_key: summary.first_key,
            last_key: summary.last_key,
            file_size: summary.file_size,
        };
        let table = Arc::new(SSTable::open(&shared.dir, meta)?);
        let at = levels[job.target_level]
            .partition_point(|t| t.meta.first_key < table.meta.first_key);
        levels[job.target_level].insert(at, table);
    }

    shared.manifest.save(&flatten_levels(&levels))?;

    state.levels = levels;
    state.next_sequence = sequence + 1;
    Ok(())
}

/// Deletes consumed `.sst` files and their filter siblings. Readers that
/// still hold the tables keep them alive through their mmaps; on this
/// platform unlinking an open file is safe.
fn remove_input_files(shared: &Shared, job: &CompactionJob) {
    for table in std::iter::once(&job.victim).chain(job.overlaps.iter()) {
        let sst = shared.dir.join(&table.meta.filename);
        if let Err(e) = fs::remove_file(&sst) {
            warn!(file = %table.meta.filename, error = %e, "failed to delete compacted table");
        }
        let filter = filter_path(&sst);
        if let Err(e) = fs::remove_file(&filter) {
            debug!(file = %filter.display(), error = %e, "failed to delete filter sibling");
        }
    }
}
