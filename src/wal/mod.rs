//! Write-Ahead Log.
//!
//! An append-only redo log for the live memtable. Every mutation is
//! written here and fsynced **before** it is applied in memory, so an
//! acknowledged write survives any crash.
//!
//! # On-disk layout
//!
//! The log is a bare sequence of records, all integers little-endian:
//!
//! ```text
//! [key_len u32][value_len u32][key bytes][value bytes]
//! [key_len u32][value_len u32][key bytes][value bytes]
//! ...
//! ```
//!
//! `value_len == u32::MAX` is the **tombstone sentinel**: the record is a
//! delete and no value bytes follow. A `value_len` of `0` is an ordinary
//! empty value — empty-value puts and deletes are unambiguous during
//! recovery.
//!
//! # Recovery
//!
//! [`Wal::replay_into`] reads records from offset zero and applies each
//! to a memtable. A short read **at a record boundary** is the clean end
//! of the log. A short read **mid-record** is a torn tail from a crash:
//! the remainder is discarded with a warning and the file is truncated
//! back to the last good boundary.
//!
//! # Lifecycle
//!
//! The log lives at `wal.log` in the data directory. It is created with
//! its memtable, appended on every write, and rotated (deleted and
//! recreated empty) only after the flush that drained its memtable has
//! been published to the manifest.

#[cfg(test)]
mod tests;

use std::{
    fs::{File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::entry::Entry;
use crate::memtable::{MemTable, MemTableError};

/// Filename of the live write-ahead log inside the data directory.
pub const WAL_FILENAME: &str = "wal.log";

/// Sentinel value-length marking a tombstone record.
const TOMBSTONE_LEN: u32 = u32::MAX;

const HEADER_SIZE: usize = 8; // key_len + value_len

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by WAL operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WalError {
    /// Underlying I/O error. Fatal to the affected write.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A replayed record failed to apply to the memtable.
    #[error("memtable error during replay: {0}")]
    MemTable(#[from] MemTableError),

    /// A decoded length field exceeds the configured record bound,
    /// indicating corruption.
    #[error("record length {0} exceeds limit")]
    RecordTooLarge(usize),
}

// ------------------------------------------------------------------------------------------------
// Wal
// ------------------------------------------------------------------------------------------------

/// The live write-ahead log.
///
/// Owned by the engine's writer half; all methods take `&mut self` — the
/// single-writer discipline is structural, not conventional.
#[derive(Debug)]
pub struct Wal {
    file: File,
    path: PathBuf,
    /// Upper bound for a decoded key or value length during replay, to
    /// reject allocation bombs from corrupt length fields.
    max_record_size: u32,
}

impl Wal {
    /// Opens (or creates) the log at `path`.
    ///
    /// The cursor is positioned at end-of-log; [`Wal::replay_into`] seeks
    /// back to the start itself.
    pub fn open(path: impl AsRef<Path>, max_record_size: u32) -> Result<Self, WalError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;

        info!(path = %path.display(), "WAL opened");

        Ok(Self {
            file,
            path,
            max_record_size,
        })
    }

    /// Appends one record and forces it to storage.
    ///
    /// Returns only after the kernel has acknowledged the flush; an error
    /// here means the write is **not** durable and must not be applied to
    /// the memtable.
    pub fn append(&mut self, key: &[u8], entry: &Entry) -> Result<(), WalError> {
        if key.len() > self.max_record_size as usize
            || entry.value_len() > self.max_record_size as usize
        {
            return Err(WalError::RecordTooLarge(key.len() + entry.value_len()));
        }

        let key_len = key.len() as u32;
        let value_len = match entry {
            Entry::Value(v) => v.len() as u32,
            Entry::Tombstone => TOMBSTONE_LEN,
        };

        let mut frame = Vec::with_capacity(HEADER_SIZE + key.len() + entry.value_len());
        frame.extend_from_slice(&key_len.to_le_bytes());
        frame.extend_from_slice(&value_len.to_le_bytes());
        frame.extend_from_slice(key);
        if let Entry::Value(v) = entry {
            frame.extend_from_slice(v);
        }

        self.file.write_all(&frame)?;
        self.file.sync_data()?;

        trace!(key_len, value_len, "WAL record appended");
        Ok(())
    }

    /// Replays every record into `mem`, in log order.
    ///
    /// Returns the number of records applied. A torn tail is truncated
    /// away with a warning; after return the file cursor is at
    /// end-of-log, ready for appends.
    pub fn replay_into(&mut self, mem: &MemTable) -> Result<u64, WalError> {
        debug!(path = %self.path.display(), "WAL replay started");

        self.file.seek(SeekFrom::Start(0))?;

        let mut applied: u64 = 0;
        let mut good_offset: u64 = 0;

        loop {
            match self.read_record(good_offset)? {
                ReadOutcome::Record {
                    key,
                    entry,
                    next_offset,
                } => {
                    mem.put(&key, &entry)?;
                    applied += 1;
                    good_offset = next_offset;
                }
                ReadOutcome::CleanEof => break,
                ReadOutcome::TornTail => {
                    warn!(
                        path = %self.path.display(),
                        offset = good_offset,
                        "torn WAL tail discarded"
                    );
                    self.file.set_len(good_offset)?;
                    self.file.sync_data()?;
                    break;
                }
            }
        }

        self.file.seek(SeekFrom::End(0))?;

        info!(
            path = %self.path.display(),
            records = applied,
            "WAL replay finished"
        );
        Ok(applied)
    }

    /// Deletes the current log and starts a fresh, empty one.
    ///
    /// Called only after the flush that drained this log's memtable has
    /// been published.
    pub fn rotate(&mut self) -> Result<(), WalError> {
        self.file.sync_all()?;

        std::fs::remove_file(&self.path)?;
        self.file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)?;

        info!(path = %self.path.display(), "WAL rotated");
        Ok(())
    }

    /// Path of the underlying log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current on-disk size in bytes.
    pub fn file_size(&self) -> Result<u64, WalError> {
        Ok(self.file.metadata()?.len())
    }

    // --------------------------------------------------------------------
    // Record decoding
    // --------------------------------------------------------------------

    /// Reads one record starting at `offset`.
    fn read_record(&mut self, offset: u64) -> Result<ReadOutcome, WalError> {
        self.file.seek(SeekFrom::Start(offset))?;

        let mut header = [0u8; HEADER_SIZE];
        match read_exact_or_eof(&mut self.file, &mut header)? {
            ReadExact::Full => {}
            ReadExact::Empty => return Ok(ReadOutcome::CleanEof),
            ReadExact::Partial => return Ok(ReadOutcome::TornTail),
        }

        let key_len = u32::from_le_bytes(header[..4].try_into().expect("4-byte slice"));
        let value_len = u32::from_le_bytes(header[4..].try_into().expect("4-byte slice"));

        if key_len == 0 || key_len > self.max_record_size {
            // A zero or absurd key length can only come from a torn or
            // corrupt tail; everything from here on is unusable.
            return Ok(ReadOutcome::TornTail);
        }
        if value_len != TOMBSTONE_LEN && value_len > self.max_record_size {
            return Ok(ReadOutcome::TornTail);
        }

        let mut key = vec![0u8; key_len as usize];
        match read_exact_or_eof(&mut self.file, &mut key)? {
            ReadExact::Full => {}
            ReadExact::Empty | ReadExact::Partial => return Ok(ReadOutcome::TornTail),
        }

        let entry = if value_len == TOMBSTONE_LEN {
            Entry::Tombstone
        } else {
            let mut value = vec![0u8; value_len as usize];
            if value_len > 0 {
                match read_exact_or_eof(&mut self.file, &mut value)? {
                    ReadExact::Full => {}
                    ReadExact::Empty | ReadExact::Partial => return Ok(ReadOutcome::TornTail),
                }
            }
            Entry::Value(value)
        };

        let next_offset = offset
            + HEADER_SIZE as u64
            + key_len as u64
            + if value_len == TOMBSTONE_LEN {
                0
            } else {
                value_len as u64
            };

        Ok(ReadOutcome::Record {
            key,
            entry,
            next_offset,
        })
    }
}

enum ReadOutcome {
    Record {
        key: Vec<u8>,
        entry: Entry,
        next_offset: u64,
    },
    CleanEof,
    TornTail,
}

enum ReadExact {
    Full,
    Empty,
    Partial,
}

/// Reads exactly `buf.len()` bytes, distinguishing a clean EOF (zero
/// bytes read) from a partial record (some but not all bytes read).
fn read_exact_or_eof(file: &mut File, buf: &mut [u8]) -> Result<ReadExact, WalError> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]) {
            Ok(0) => {
                return Ok(if filled == 0 {
                    ReadExact::Empty
                } else {
                    ReadExact::Partial
                });
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(WalError::Io(e)),
        }
    }
    Ok(ReadExact::Full)
}
