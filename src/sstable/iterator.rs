//! Sequential scan over one SSTable.
//!
//! [`SstIterator`] walks a table's data section block by block, exposing
//! the classic cursor surface (`valid` / `key` / `value` /
//! `is_tombstone` / `advance`) plus a plain [`Iterator`] adapter that
//! yields owned `(key, Entry)` pairs for the merge layers.
//!
//! The iterator holds an `Arc` on its table, so it stays valid even
//! after the engine drops the table from the live set (compaction
//! deletes the file only after publication; an open mmap keeps the data
//! readable). Blocks are loaded one at a time and read directly from the
//! mmap — sequential scans deliberately bypass the block cache so a long
//! scan cannot evict the hot set.

use std::sync::Arc;

use tracing::warn;

use crate::entry::Entry;

use super::{SSTable, TableError, decode_record};

/// Forward cursor over the records of one table.
pub struct SstIterator {
    table: Arc<SSTable>,

    /// Index of the current block within the sparse index.
    block_idx: usize,

    /// Verified bytes of the current block.
    block: Arc<[u8]>,

    /// Decode position of the **next** record within `block`.
    pos: usize,

    /// Current record; meaningful only while `valid`.
    key: Vec<u8>,
    value: Vec<u8>,
    tombstone: bool,
    valid: bool,

    /// Inclusive upper bound; records beyond it invalidate the cursor.
    end_bound: Option<Vec<u8>>,
}

impl SstIterator {
    /// Opens a cursor positioned at the table's first record.
    pub fn new(table: Arc<SSTable>) -> Result<Self, TableError> {
        if table.block_count() == 0 {
            return Err(TableError::Corrupt("table has no data blocks".into()));
        }
        let block = table.read_block(table.index[0].offset, None)?;
        let mut iter = Self {
            table,
            block_idx: 0,
            block,
            pos: 0,
            key: Vec::new(),
            value: Vec::new(),
            tombstone: false,
            valid: true,
            end_bound: None,
        };
        iter.advance()?;
        Ok(iter)
    }

    /// Opens a cursor positioned at the first record with key ≥ `start`,
    /// bounded inclusively by `end`.
    pub fn with_range(table: Arc<SSTable>, start: &[u8], end: &[u8]) -> Result<Self, TableError> {
        // Start in the greatest block whose first key ≤ start; earlier
        // blocks cannot contain the range.
        let start_block = table.find_block(start).unwrap_or(0);
        if table.block_count() == 0 {
            return Err(TableError::Corrupt("table has no data blocks".into()));
        }
        let block = table.read_block(table.index[start_block].offset, None)?;
        let mut iter = Self {
            table,
            block_idx: start_block,
            block,
            pos: 0,
            key: Vec::new(),
            value: Vec::new(),
            tombstone: false,
            valid: true,
            end_bound: Some(end.to_vec()),
        };
        iter.advance()?;
        while iter.valid && iter.key.as_slice() < start {
            iter.advance()?;
        }
        Ok(iter)
    }

    /// Whether the cursor currently points at a record.
    pub fn valid(&self) -> bool {
        self.valid
    }

    /// Current key. Owned by the iterator; invalidated by `advance`.
    pub fn key(&self) -> &[u8] {
        debug_assert!(self.valid);
        &self.key
    }

    /// Current value bytes (empty for a tombstone).
    pub fn value(&self) -> &[u8] {
        debug_assert!(self.valid);
        &self.value
    }

    /// Whether the current record is a tombstone.
    pub fn is_tombstone(&self) -> bool {
        debug_assert!(self.valid);
        self.tombstone
    }

    /// Moves to the next record, crossing block boundaries as needed.
    /// Marks the cursor invalid at the end of the data section or past
    /// the end bound.
    pub fn advance(&mut self) -> Result<(), TableError> {
        loop {
            match decode_record(&self.block, &mut self.pos)? {
                Some((key, value)) => {
                    if let Some(end) = &self.end_bound
                        && key > end.as_slice()
                    {
                        self.valid = false;
                        return Ok(());
                    }
                    self.key.clear();
                    self.key.extend_from_slice(key);
                    match value {
                        Some(v) => {
                            self.value.clear();
                            self.value.extend_from_slice(v);
                            self.tombstone = false;
                        }
                        None => {
                            self.value.clear();
                            self.tombstone = true;
                        }
                    }
                    return Ok(());
                }
                None => {
                    // Block exhausted — load the next one or finish.
                    self.block_idx += 1;
                    if self.block_idx >= self.table.block_count() {
                        self.valid = false;
                        return Ok(());
                    }
                    self.block = self
                        .table
                        .read_block(self.table.index[self.block_idx].offset, None)?;
                    self.pos = 0;
                }
            }
        }
    }

    /// Takes the current record as an owned pair.
    fn current(&self) -> (Vec<u8>, Entry) {
        let entry = if self.tombstone {
            Entry::Tombstone
        } else {
            Entry::Value(self.value.clone())
        };
        (self.key.clone(), entry)
    }
}

impl Iterator for SstIterator {
    type Item = (Vec<u8>, Entry);

    fn next(&mut self) -> Option<Self::Item> {
        if !self.valid {
            return None;
        }
        let record = self.current();
        if let Err(e) = self.advance() {
            // A corrupt block mid-scan ends the stream; point lookups on
            // the same table will surface the error to callers.
            warn!(table = %self.table.meta.filename, error = %e, "scan stopped by table error");
            self.valid = false;
        }
        Some(record)
    }
}
