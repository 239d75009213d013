//! Per-table bloom filters.
//!
//! Every SSTable is accompanied by a sibling `.filter` file holding a
//! bloom filter over the table's keys. A filter answers "definitely not
//! present" with certainty and "maybe present" with a configurable
//! false-positive rate — it can never produce a false negative.
//!
//! # Sizing
//!
//! For an expected cardinality `n` and target false-positive rate `p`:
//!
//! ```text
//! m_bits   = round(-(n · ln p) / (ln 2)²)
//! k_hashes = max(1, round((m_bits / n) · ln 2))
//! ```
//!
//! # Hashing
//!
//! Two seeded 64-bit FNV-1a hashes combined with the Kirsch–Mitzenmacher
//! scheme: `bit_i = (h1 + i · h2) mod m_bits` for `i ∈ [0, k)`. The
//! secondary hash is forced odd so the probe sequence never collapses.
//!
//! # On-disk layout
//!
//! ```text
//! [m_bits u64 LE][k_hashes u64 LE][bit bytes = ceil(m_bits / 8)]
//! ```
//!
//! A missing or unreadable filter file is never fatal to the engine — the
//! read path simply falls through to a full table lookup.


use std::{
    fs::File,
    io::{self, Read, Write},
    path::Path,
};

use thiserror::Error;
use tracing::trace;

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Seed perturbation for the secondary hash.
const H2_SEED: u64 = 0x9e37_79b9_7f4a_7c15;

/// Upper bound on a plausible hash count; anything larger marks a
/// corrupt filter file.
const MAX_HASHES: u64 = 64;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned when reading or writing a filter file.
#[derive(Debug, Error)]
pub enum FilterError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The filter file does not decode to a consistent filter.
    #[error("corrupt filter file: {0}")]
    Corrupt(String),
}

// ------------------------------------------------------------------------------------------------
// BloomFilter
// ------------------------------------------------------------------------------------------------

/// A bloom filter over byte-string keys.
#[derive(Debug, Clone)]
pub struct BloomFilter {
    bits: Vec<u8>,
    m_bits: u64,
    k_hashes: u64,
}

impl BloomFilter {
    /// Creates an empty filter sized for `expected_items` keys at the
    /// given target false-positive rate.
    pub fn new(expected_items: usize, fp_rate: f64) -> Self {
        debug_assert!(fp_rate > 0.0 && fp_rate < 1.0);
        let n = expected_items.max(1) as f64;

        let m_bits = ((-(n * fp_rate.ln())) / std::f64::consts::LN_2.powi(2)).round() as u64;
        let m_bits = m_bits.max(8);

        let k_hashes = ((m_bits as f64 / n) * std::f64::consts::LN_2).round() as u64;
        let k_hashes = k_hashes.max(1);

        let byte_len = m_bits.div_ceil(8) as usize;

        Self {
            bits: vec![0u8; byte_len],
            m_bits,
            k_hashes,
        }
    }

    /// Inserts a key.
    pub fn insert(&mut self, key: &[u8]) {
        let (h1, h2) = hash_pair(key);
        for i in 0..self.k_hashes {
            let bit = probe(h1, h2, i, self.m_bits);
            self.bits[(bit / 8) as usize] |= 1 << (bit % 8);
        }
    }

    /// Returns `false` only when the key is **definitely not** present.
    pub fn contains(&self, key: &[u8]) -> bool {
        let (h1, h2) = hash_pair(key);
        for i in 0..self.k_hashes {
            let bit = probe(h1, h2, i, self.m_bits);
            if self.bits[(bit / 8) as usize] & (1 << (bit % 8)) == 0 {
                return false;
            }
        }
        true
    }

    /// Number of bits in the filter.
    pub fn m_bits(&self) -> u64 {
        self.m_bits
    }

    /// Number of hash probes per key.
    pub fn k_hashes(&self) -> u64 {
        self.k_hashes
    }

    /// Inverts the sizing formula: the cardinality this filter was built
    /// for, assuming it was sized at `fp_rate`.
    ///
    /// Compaction uses this to size an output filter from its inputs
    /// without re-counting records.
    pub fn estimated_entries(&self, fp_rate: f64) -> usize {
        let n = (self.m_bits as f64) * std::f64::consts::LN_2.powi(2) / (-fp_rate.ln());
        n.round().max(1.0) as usize
    }

    // --------------------------------------------------------------------
    // File I/O
    // --------------------------------------------------------------------

    /// Writes the filter to `path` in the sibling-file format and syncs.
    pub fn write_to(&self, path: &Path) -> Result<(), FilterError> {
        let mut file = File::create(path)?;
        file.write_all(&self.m_bits.to_le_bytes())?;
        file.write_all(&self.k_hashes.to_le_bytes())?;
        file.write_all(&self.bits)?;
        file.sync_all()?;
        trace!(path = %path.display(), m_bits = self.m_bits, k = self.k_hashes, "filter written");
        Ok(())
    }

    /// Reads a filter from `path`, validating the header against the bit
    /// array length.
    pub fn read_from(path: &Path) -> Result<Self, FilterError> {
        let mut file = File::open(path)?;

        let mut header = [0u8; 16];
        file.read_exact(&mut header)
            .map_err(|_| FilterError::Corrupt("short filter header".into()))?;

        let m_bits = u64::from_le_bytes(header[..8].try_into().expect("8-byte slice"));
        let k_hashes = u64::from_le_bytes(header[8..].try_into().expect("8-byte slice"));

        if m_bits == 0 || k_hashes == 0 || k_hashes > MAX_HASHES {
            return Err(FilterError::Corrupt(format!(
                "implausible filter header: m_bits={m_bits} k_hashes={k_hashes}"
            )));
        }

        let byte_len = m_bits.div_ceil(8) as usize;
        let mut bits = vec![0u8; byte_len];
        file.read_exact(&mut bits)
            .map_err(|_| FilterError::Corrupt("short filter bit array".into()))?;

        Ok(Self {
            bits,
            m_bits,
            k_hashes,
        })
    }
}

// ------------------------------------------------------------------------------------------------
// Hashing
// ------------------------------------------------------------------------------------------------

/// 64-bit FNV-1a with an explicit seed.
fn fnv1a(seed: u64, data: &[u8]) -> u64 {
    let mut hash = seed;
    for &byte in data {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Derives the two-hash family for a key. The secondary hash is made odd
/// so that `h1 + i·h2` walks distinct residues.
fn hash_pair(key: &[u8]) -> (u64, u64) {
    let h1 = fnv1a(FNV_OFFSET_BASIS, key);
    let h2 = fnv1a(FNV_OFFSET_BASIS ^ H2_SEED, key) | 1;
    (h1, h2)
}

/// The i-th probe position for a key with hash pair `(h1, h2)`.
fn probe(h1: u64, h2: u64, i: u64, m_bits: u64) -> u64 {
    h1.wrapping_add(i.wrapping_mul(h2)) % m_bits
}
