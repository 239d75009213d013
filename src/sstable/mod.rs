//! Sorted String Tables.
//!
//! An SSTable is an immutable, sorted, block-framed file produced by a
//! memtable flush or a compaction. Once written it is never modified;
//! readers share it freely via mmap.
//!
//! # On-disk layout
//!
//! All integers little-endian. Bottom to top:
//!
//! ```text
//! [block_len u64][block bytes][crc32 u32]      ─┐ data section,
//! [block_len u64][block bytes][crc32 u32]       │ one frame per block
//! ...                                          ─┘
//! [key_len u64][key][block_offset u64]         ─┐ sparse index,
//! ...                                          ─┘ one entry per block
//! [index_offset u64]                             footer (8 bytes)
//! ```
//!
//! Within a block, records are packed as
//! `[key_len u64][key][value_len u64][value]`, where a `value_len` of
//! `u64::MAX` marks a tombstone and no value bytes follow.
//!
//! A sibling `<stem>.filter` file carries the table's bloom filter (see
//! [`crate::filter`]); it is deleted together with the table.
//!
//! # Sub-modules
//!
//! - [`builder`] — [`SstWriter`], builds a table from ascending records.
//! - [`iterator`] — [`SstIterator`], sequential scan over one table.
//!
//! # Concurrency
//!
//! Tables are immutable, so reads are lock-free; the only shared mutable
//! state touched on the read path is the block cache.

pub mod builder;
pub mod iterator;

#[cfg(test)]
mod tests;

pub use builder::{SstWriter, TableSummary};
pub use iterator::SstIterator;

use std::{
    fs::File,
    io,
    path::{Path, PathBuf},
    sync::Arc,
};

use crc32fast::Hasher as Crc32;
use memmap2::Mmap;
use thiserror::Error;
use tracing::{debug, warn};

use crate::cache::{BlockCache, BlockKey};
use crate::entry::Entry;
use crate::filter::BloomFilter;
use crate::manifest::TableMeta;

/// Footer: one `u64` holding the sparse-index offset.
pub(crate) const FOOTER_SIZE: usize = 8;

/// Per-frame prefix: `u64` block length.
pub(crate) const BLOCK_HEADER_SIZE: usize = 8;

/// Per-frame suffix: `u32` CRC32 of the block bytes.
pub(crate) const BLOCK_TRAILER_SIZE: usize = 4;

/// Sentinel value-length marking a tombstone record inside a block.
pub(crate) const TOMBSTONE_SENTINEL: u64 = u64::MAX;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by SSTable operations.
#[derive(Debug, Error)]
pub enum TableError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A data block failed CRC verification.
    #[error("block checksum mismatch")]
    ChecksumMismatch,

    /// Framing or index decoding failure.
    #[error("corrupt table: {0}")]
    Corrupt(String),

    /// Caller misuse: unsorted or empty keys fed to the writer.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

// ------------------------------------------------------------------------------------------------
// Sparse index
// ------------------------------------------------------------------------------------------------

/// One sparse-index entry: the first key of a data block and the file
/// offset of that block's frame.
#[derive(Debug, Clone)]
pub(crate) struct IndexEntry {
    pub(crate) first_key: Vec<u8>,
    pub(crate) offset: u64,
}

// ------------------------------------------------------------------------------------------------
// Record codec — shared by reader, iterator and writer tests
// ------------------------------------------------------------------------------------------------

/// Decodes the record starting at `*pos` in a verified block.
///
/// Returns `Ok(None)` exactly at the end of the block. The value is
/// `None` for a tombstone. Any partial record is corruption — the block
/// already passed its CRC, so a bad length field means a writer bug or a
/// decoding bug, never a torn write.
pub(crate) fn decode_record<'a>(
    block: &'a [u8],
    pos: &mut usize,
) -> Result<Option<(&'a [u8], Option<&'a [u8]>)>, TableError> {
    if *pos == block.len() {
        return Ok(None);
    }

    let key_len = read_u64(block, pos)? as usize;
    let key = read_bytes(block, pos, key_len)?;

    let value_len = read_u64(block, pos)?;
    let value = if value_len == TOMBSTONE_SENTINEL {
        None
    } else {
        Some(read_bytes(block, pos, value_len as usize)?)
    };

    Ok(Some((key, value)))
}

fn read_u64(block: &[u8], pos: &mut usize) -> Result<u64, TableError> {
    let end = *pos + 8;
    if end > block.len() {
        return Err(TableError::Corrupt("truncated length field".into()));
    }
    let value = u64::from_le_bytes(block[*pos..end].try_into().expect("8-byte slice"));
    *pos = end;
    Ok(value)
}

fn read_bytes<'a>(block: &'a [u8], pos: &mut usize, len: usize) -> Result<&'a [u8], TableError> {
    let end = pos
        .checked_add(len)
        .ok_or_else(|| TableError::Corrupt("record length overflow".into()))?;
    if end > block.len() {
        return Err(TableError::Corrupt("truncated record payload".into()));
    }
    let bytes = &block[*pos..end];
    *pos = end;
    Ok(bytes)
}

// ------------------------------------------------------------------------------------------------
// SSTable — immutable reader
// ------------------------------------------------------------------------------------------------

/// An open, memory-mapped, immutable sorted table.
pub struct SSTable {
    /// Durable metadata, as recorded in the manifest.
    pub meta: TableMeta,

    /// Filename as an `Arc<str>`, reused for cache keys.
    cache_file: Arc<str>,

    mmap: Mmap,

    /// Sparse index, one entry per data block, ascending by first key.
    pub(crate) index: Vec<IndexEntry>,

    /// Sibling bloom filter; `None` when the filter file was missing or
    /// unreadable (lookups then fall through to the data blocks).
    pub(crate) filter: Option<BloomFilter>,
}

impl SSTable {
    /// Opens the table file named by `meta` inside `dir`, parses its
    /// footer and sparse index, and loads the sibling filter.
    ///
    /// A missing table file is an error; a missing filter is only a
    /// degraded lookup path.
    pub fn open(dir: &Path, meta: TableMeta) -> Result<Self, TableError> {
        let path = dir.join(&meta.filename);
        let file = File::open(&path)?;

        // Safety: table files are immutable once published; the map is
        // read-only and every block boundary is validated before slicing.
        let mmap = unsafe { Mmap::map(&file)? };

        if mmap.len() < FOOTER_SIZE {
            return Err(TableError::Corrupt("file shorter than footer".into()));
        }

        let footer_start = mmap.len() - FOOTER_SIZE;
        let index_offset = u64::from_le_bytes(
            mmap[footer_start..].try_into().expect("8-byte footer"),
        );
        if index_offset as usize > footer_start {
            return Err(TableError::Corrupt("index offset beyond footer".into()));
        }

        let index = parse_index(&mmap[index_offset as usize..footer_start])?;

        let filter = match BloomFilter::read_from(&filter_path(&path)) {
            Ok(filter) => Some(filter),
            Err(e) => {
                warn!(
                    table = %meta.filename,
                    error = %e,
                    "filter unavailable, lookups fall through to data blocks"
                );
                None
            }
        };

        debug!(
            table = %meta.filename,
            level = meta.level,
            blocks = index.len(),
            has_filter = filter.is_some(),
            "SSTable opened"
        );

        let cache_file = Arc::from(meta.filename.as_str());
        Ok(Self {
            meta,
            cache_file,
            mmap,
            index,
            filter,
        })
    }

    /// Quick negative test: `false` means the key is definitely absent.
    pub fn may_contain(&self, key: &[u8]) -> bool {
        self.filter.as_ref().is_none_or(|f| f.contains(key))
    }

    /// Whether `key` falls inside this table's `[first_key, last_key]`.
    pub fn contains_key_range(&self, key: &[u8]) -> bool {
        self.meta.first_key.as_slice() <= key && key <= self.meta.last_key.as_slice()
    }

    /// Whether this table's range intersects `[start, end]`, endpoints
    /// included on both sides.
    pub fn overlaps(&self, start: &[u8], end: &[u8]) -> bool {
        self.meta.first_key.as_slice() <= end && start <= self.meta.last_key.as_slice()
    }

    /// Point lookup.
    ///
    /// Returns `Ok(None)` when the key is not in this table. A returned
    /// tombstone is a **definitive** answer — the key was deleted as of
    /// this table's epoch.
    pub fn lookup(&self, key: &[u8], cache: &BlockCache) -> Result<Option<Entry>, TableError> {
        let Some(block_idx) = self.find_block(key) else {
            // All index keys are greater than the target.
            return Ok(None);
        };

        let block = self.read_block(self.index[block_idx].offset, Some(cache))?;

        let mut pos = 0;
        while let Some((record_key, value)) = decode_record(&block, &mut pos)? {
            if record_key == key {
                return Ok(Some(match value {
                    Some(v) => Entry::Value(v.to_vec()),
                    None => Entry::Tombstone,
                }));
            }
            if record_key > key {
                break;
            }
        }
        // The sparse index guaranteed this was the only candidate block.
        Ok(None)
    }

    /// Greatest index entry whose first key is `<= key`, or `None` when
    /// every block starts beyond the target.
    pub(crate) fn find_block(&self, key: &[u8]) -> Option<usize> {
        let idx = self
            .index
            .partition_point(|entry| entry.first_key.as_slice() <= key);
        idx.checked_sub(1)
    }

    /// Reads and verifies the block frame at `offset`, consulting the
    /// cache when one is supplied.
    pub(crate) fn read_block(
        &self,
        offset: u64,
        cache: Option<&BlockCache>,
    ) -> Result<Arc<[u8]>, TableError> {
        let cache_key = BlockKey {
            file: Arc::clone(&self.cache_file),
            offset,
        };
        if let Some(cache) = cache
            && let Some(block) = cache.get(&cache_key)
        {
            return Ok(block);
        }

        let start = offset as usize;
        let header_end = start + BLOCK_HEADER_SIZE;
        if header_end > self.mmap.len() {
            return Err(TableError::Corrupt("block header out of range".into()));
        }
        let block_len =
            u64::from_le_bytes(self.mmap[start..header_end].try_into().expect("8-byte slice"))
                as usize;

        let body_end = header_end + block_len;
        let frame_end = body_end + BLOCK_TRAILER_SIZE;
        if frame_end > self.mmap.len() {
            return Err(TableError::Corrupt("block frame out of range".into()));
        }

        let body = &self.mmap[header_end..body_end];
        let stored_crc = u32::from_le_bytes(
            self.mmap[body_end..frame_end]
                .try_into()
                .expect("4-byte slice"),
        );

        let mut hasher = Crc32::new();
        hasher.update(body);
        if hasher.finalize() != stored_crc {
            return Err(TableError::ChecksumMismatch);
        }

        let block: Arc<[u8]> = Arc::from(body.to_vec().into_boxed_slice());
        if let Some(cache) = cache {
            cache.insert(cache_key, Arc::clone(&block));
        }
        Ok(block)
    }

    /// Number of data blocks.
    pub(crate) fn block_count(&self) -> usize {
        self.index.len()
    }

    /// Best-effort count of the records this table holds, derived from
    /// the sibling filter's sizing. Used to size compaction output
    /// filters; falls back to a file-size heuristic without a filter.
    pub fn estimated_entries(&self, fp_rate: f64) -> usize {
        match &self.filter {
            Some(filter) => filter.estimated_entries(fp_rate),
            None => (self.meta.file_size / 64).max(1) as usize,
        }
    }
}

/// Path of the sibling filter file for a table path.
pub(crate) fn filter_path(table_path: &Path) -> PathBuf {
    table_path.with_extension("filter")
}

/// Parses the sparse-index section.
fn parse_index(mut section: &[u8]) -> Result<Vec<IndexEntry>, TableError> {
    let mut entries = Vec::new();
    while !section.is_empty() {
        let mut pos = 0;
        let key_len = read_u64(section, &mut pos)? as usize;
        let first_key = read_bytes(section, &mut pos, key_len)?.to_vec();
        let offset = read_u64(section, &mut pos)?;
        entries.push(IndexEntry { first_key, offset });
        section = &section[pos..];
    }

    for window in entries.windows(2) {
        if window[0].first_key >= window[1].first_key {
            return Err(TableError::Corrupt("index keys not ascending".into()));
        }
    }
    Ok(entries)
}
