//! SSTable writer.
//!
//! [`SstWriter`] accepts records in **strictly ascending key order** and
//! produces the block-framed file described in the
//! [module documentation](super). The caller feeds it from a memtable
//! snapshot (flush) or a merge stream (compaction) and receives a
//! [`TableSummary`] with the metadata the manifest needs.
//!
//! Blocks are buffered in memory and frame-written (`len`, body, CRC32)
//! once the unframed body crosses the target block size; the sparse
//! index records each block's first key and file offset. `finish` flushes
//! the partial block, writes the index and footer, and fsyncs.

use std::{
    fs::{File, OpenOptions},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use crc32fast::Hasher as Crc32;
use tracing::debug;

use crate::entry::Entry;

use super::{IndexEntry, TOMBSTONE_SENTINEL, TableError};

/// Metadata describing a finished table, consumed by the engine when
/// publishing to the manifest.
#[derive(Debug, Clone)]
pub struct TableSummary {
    /// Smallest key in the table.
    pub first_key: Vec<u8>,

    /// Largest key in the table.
    pub last_key: Vec<u8>,

    /// Number of records written (tombstones included).
    pub record_count: u64,

    /// Total file size in bytes, footer included.
    pub file_size: u64,
}

/// Streaming writer for one immutable table.
pub struct SstWriter {
    file: BufWriter<File>,
    path: PathBuf,

    /// Bytes written so far — the offset at which the next frame lands.
    offset: u64,

    /// Unframed body of the open block.
    block: Vec<u8>,

    /// First key of the open block, captured when the block opens.
    block_first_key: Option<Vec<u8>>,

    /// Completed sparse-index entries.
    index: Vec<IndexEntry>,

    first_key: Option<Vec<u8>>,
    last_key: Option<Vec<u8>>,
    record_count: u64,
    block_size: usize,
}

impl SstWriter {
    /// Creates a writer targeting `path`, truncating any existing file.
    pub fn create(path: impl AsRef<Path>, block_size: usize) -> Result<Self, TableError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;

        Ok(Self {
            file: BufWriter::new(file),
            path,
            offset: 0,
            block: Vec::with_capacity(block_size + 512),
            block_first_key: None,
            index: Vec::new(),
            first_key: None,
            last_key: None,
            record_count: 0,
            block_size,
        })
    }

    /// Appends one record.
    ///
    /// Keys must be non-empty and strictly greater than the previously
    /// added key; violations are caller bugs and surface as
    /// [`TableError::InvalidArgument`].
    pub fn add(&mut self, key: &[u8], entry: &Entry) -> Result<(), TableError> {
        if key.is_empty() {
            return Err(TableError::InvalidArgument("empty key".into()));
        }
        if let Some(last) = &self.last_key
            && last.as_slice() >= key
        {
            return Err(TableError::InvalidArgument(
                "keys must be added in strictly ascending order".into(),
            ));
        }

        if self.block.is_empty() {
            self.block_first_key = Some(key.to_vec());
        }

        self.block
            .extend_from_slice(&(key.len() as u64).to_le_bytes());
        self.block.extend_from_slice(key);
        match entry {
            Entry::Value(v) => {
                self.block
                    .extend_from_slice(&(v.len() as u64).to_le_bytes());
                self.block.extend_from_slice(v);
            }
            Entry::Tombstone => {
                self.block.extend_from_slice(&TOMBSTONE_SENTINEL.to_le_bytes());
            }
        }

        if self.first_key.is_none() {
            self.first_key = Some(key.to_vec());
        }
        self.last_key = Some(key.to_vec());
        self.record_count += 1;

        if self.block.len() >= self.block_size {
            self.flush_block()?;
        }
        Ok(())
    }

    /// Finalizes the table: flushes the partial block, writes the sparse
    /// index and footer, and fsyncs the file.
    pub fn finish(mut self) -> Result<TableSummary, TableError> {
        if self.record_count == 0 {
            return Err(TableError::InvalidArgument(
                "cannot finish a table with no records".into(),
            ));
        }

        if !self.block.is_empty() {
            self.flush_block()?;
        }

        let index_offset = self.offset;
        for entry in &self.index {
            let mut encoded = Vec::with_capacity(16 + entry.first_key.len());
            encoded.extend_from_slice(&(entry.first_key.len() as u64).to_le_bytes());
            encoded.extend_from_slice(&entry.first_key);
            encoded.extend_from_slice(&entry.offset.to_le_bytes());
            self.file.write_all(&encoded)?;
            self.offset += encoded.len() as u64;
        }

        self.file.write_all(&index_offset.to_le_bytes())?;
        self.offset += super::FOOTER_SIZE as u64;

        self.file.flush()?;
        let file = self
            .file
            .into_inner()
            .map_err(|e| TableError::Io(e.into_error()))?;
        file.sync_all()?;

        debug!(
            path = %self.path.display(),
            records = self.record_count,
            blocks = self.index.len(),
            bytes = self.offset,
            "SSTable written"
        );

        Ok(TableSummary {
            first_key: self.first_key.expect("record_count > 0 implies a first key"),
            last_key: self.last_key.expect("record_count > 0 implies a last key"),
            record_count: self.record_count,
            file_size: self.offset,
        })
    }

    /// Abandons the table, removing the partial file.
    ///
    /// Used by compaction when every input record was dropped.
    pub fn abort(self) -> Result<(), TableError> {
        let path = self.path.clone();
        drop(self);
        std::fs::remove_file(&path)?;
        Ok(())
    }

    /// Number of records added so far.
    pub fn record_count(&self) -> u64 {
        self.record_count
    }

    /// Frame-writes the open block: `[len u64][body][crc32 u32]`.
    fn flush_block(&mut self) -> Result<(), TableError> {
        let body = std::mem::take(&mut self.block);

        let mut hasher = Crc32::new();
        hasher.update(&body);
        let crc = hasher.finalize();

        self.file.write_all(&(body.len() as u64).to_le_bytes())?;
        self.file.write_all(&body)?;
        self.file.write_all(&crc.to_le_bytes())?;

        self.index.push(IndexEntry {
            first_key: self
                .block_first_key
                .take()
                .expect("non-empty block has a first key"),
            offset: self.offset,
        });

        self.offset +=
            (super::BLOCK_HEADER_SIZE + body.len() + super::BLOCK_TRAILER_SIZE) as u64;
        Ok(())
    }
}
