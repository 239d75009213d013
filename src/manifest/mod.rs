//! # Manifest
//!
//! The durable record of the engine's structural state: which table
//! files exist, at which level, with which key ranges and sequence
//! numbers. After any crash, the on-disk file set the engine trusts is
//! exactly the set described by the last fully-written manifest;
//! anything else in the directory is garbage to collect on open.
//!
//! # On-disk layout
//!
//! A single file named `manifest`, holding a flat stream of records —
//! one per live table, all integers little-endian:
//!
//! ```text
//! [level u32][sequence u64]
//! [name_len u32][name bytes]
//! [first_len u32][first_key bytes]
//! [last_len u32][last_key bytes]
//! [file_size u64]
//! ```
//!
//! # Atomicity
//!
//! Saves write `manifest.tmp` in full, fsync it, rename it over
//! `manifest`, then fsync the directory. A reader therefore sees either
//! the old manifest or the new one, never a blend.
//!
//! # Load tolerance
//!
//! End-of-file at a record boundary is a clean end (a torn *save* cannot
//! produce it thanks to the rename, but an interrupted legacy copy can).
//! A short read **mid-record** means the file itself is damaged and
//! surfaces as [`ManifestError::Corrupt`] — opening the engine then
//! fails rather than guessing at the file set.

#[cfg(test)]
mod tests;

use std::{
    fs::{self, File, OpenOptions},
    io::{self, Read, Write},
    path::{Path, PathBuf},
};

use thiserror::Error;
use tracing::{debug, info};

/// Filename of the manifest inside the data directory.
pub const MANIFEST_FILENAME: &str = "manifest";

const MANIFEST_TMP_FILENAME: &str = "manifest.tmp";

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by manifest operations.
#[derive(Debug, Error)]
pub enum ManifestError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The manifest does not decode to a consistent record stream.
    #[error("corrupt manifest: {0}")]
    Corrupt(String),
}

// ------------------------------------------------------------------------------------------------
// TableMeta
// ------------------------------------------------------------------------------------------------

/// Durable metadata for one live table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableMeta {
    /// Level the table belongs to (0-based).
    pub level: u32,

    /// Creation order across the whole engine; higher is newer. L0 is
    /// ordered by this, not by filename timestamps.
    pub sequence: u64,

    /// Filename inside the data directory (`<nanos>.sst`).
    pub filename: String,

    /// Smallest key in the table.
    pub first_key: Vec<u8>,

    /// Largest key in the table.
    pub last_key: Vec<u8>,

    /// File size in bytes.
    pub file_size: u64,
}

// ------------------------------------------------------------------------------------------------
// Manifest
// ------------------------------------------------------------------------------------------------

/// Saver/loader for the manifest file of one data directory.
///
/// The in-memory copy of the file set lives in the engine state (under
/// its mutex); this type only owns the durable encoding.
#[derive(Debug)]
pub struct Manifest {
    dir: PathBuf,
}

impl Manifest {
    /// Creates a handle for the manifest inside `dir`.
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    /// Whether a manifest file exists yet.
    pub fn exists(&self) -> bool {
        self.dir.join(MANIFEST_FILENAME).exists()
    }

    /// Atomically replaces the manifest with the given table set.
    pub fn save(&self, tables: &[TableMeta]) -> Result<(), ManifestError> {
        let mut encoded = Vec::new();
        for meta in tables {
            encode_record(&mut encoded, meta);
        }

        let tmp_path = self.dir.join(MANIFEST_TMP_FILENAME);
        {
            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp_path)?;
            file.write_all(&encoded)?;
            file.sync_all()?;
        }

        let final_path = self.dir.join(MANIFEST_FILENAME);
        fs::rename(&tmp_path, &final_path)?;
        fsync_dir(&self.dir)?;

        debug!(tables = tables.len(), "manifest saved");
        Ok(())
    }

    /// Loads the current table set.
    ///
    /// Returns `Ok(None)` when no manifest exists (fresh directory).
    pub fn load(&self) -> Result<Option<Vec<TableMeta>>, ManifestError> {
        let path = self.dir.join(MANIFEST_FILENAME);
        let mut file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(ManifestError::Io(e)),
        };

        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;

        let mut tables = Vec::new();
        let mut pos = 0;
        while pos < bytes.len() {
            let meta = decode_record(&bytes, &mut pos)?;
            tables.push(meta);
        }

        info!(tables = tables.len(), "manifest loaded");
        Ok(Some(tables))
    }
}

fn fsync_dir(dir: &Path) -> Result<(), ManifestError> {
    let handle = File::open(dir)?;
    handle.sync_all()?;
    Ok(())
}

// ------------------------------------------------------------------------------------------------
// Record codec
// ------------------------------------------------------------------------------------------------

fn encode_record(out: &mut Vec<u8>, meta: &TableMeta) {
    out.extend_from_slice(&meta.level.to_le_bytes());
    out.extend_from_slice(&meta.sequence.to_le_bytes());
    out.extend_from_slice(&(meta.filename.len() as u32).to_le_bytes());
    out.extend_from_slice(meta.filename.as_bytes());
    out.extend_from_slice(&(meta.first_key.len() as u32).to_le_bytes());
    out.extend_from_slice(&meta.first_key);
    out.extend_from_slice(&(meta.last_key.len() as u32).to_le_bytes());
    out.extend_from_slice(&meta.last_key);
    out.extend_from_slice(&meta.file_size.to_le_bytes());
}

fn decode_record(bytes: &[u8], pos: &mut usize) -> Result<TableMeta, ManifestError> {
    let level = read_u32(bytes, pos)?;
    let sequence = read_u64(bytes, pos)?;

    let name_len = read_u32(bytes, pos)? as usize;
    let name_bytes = read_bytes(bytes, pos, name_len)?;
    let filename = String::from_utf8(name_bytes.to_vec())
        .map_err(|_| ManifestError::Corrupt("table filename is not UTF-8".into()))?;

    let first_len = read_u32(bytes, pos)? as usize;
    let first_key = read_bytes(bytes, pos, first_len)?.to_vec();

    let last_len = read_u32(bytes, pos)? as usize;
    let last_key = read_bytes(bytes, pos, last_len)?.to_vec();

    let file_size = read_u64(bytes, pos)?;

    Ok(TableMeta {
        level,
        sequence,
        filename,
        first_key,
        last_key,
        file_size,
    })
}

fn read_u32(bytes: &[u8], pos: &mut usize) -> Result<u32, ManifestError> {
    let end = *pos + 4;
    if end > bytes.len() {
        return Err(ManifestError::Corrupt("mid-record short read".into()));
    }
    let value = u32::from_le_bytes(bytes[*pos..end].try_into().expect("4-byte slice"));
    *pos = end;
    Ok(value)
}

fn read_u64(bytes: &[u8], pos: &mut usize) -> Result<u64, ManifestError> {
    let end = *pos + 8;
    if end > bytes.len() {
        return Err(ManifestError::Corrupt("mid-record short read".into()));
    }
    let value = u64::from_le_bytes(bytes[*pos..end].try_into().expect("8-byte slice"));
    *pos = end;
    Ok(value)
}

fn read_bytes<'a>(
    bytes: &'a [u8],
    pos: &mut usize,
    len: usize,
) -> Result<&'a [u8], ManifestError> {
    let end = pos
        .checked_add(len)
        .ok_or_else(|| ManifestError::Corrupt("record length overflow".into()))?;
    if end > bytes.len() {
        return Err(ManifestError::Corrupt("mid-record short read".into()));
    }
    let slice = &bytes[*pos..end];
    *pos = end;
    Ok(slice)
}
