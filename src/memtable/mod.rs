//! # MemTable
//!
//! The mutable, in-memory write buffer of the storage engine: a
//! skip-list over a bump arena.
//!
//! ## Design Invariants
//!
//! - Key/value bytes are **copied into the arena** at put time; callers
//!   retain no ownership of stored bytes.
//! - Overwriting an existing key rewrites its value slot without
//!   re-linking the node; old value bytes stay in the arena until the
//!   wholesale reset (bump arenas never free individually).
//! - Deletes are tombstone entries, not removals — a tombstone must
//!   shadow older on-disk versions until compaction drops it.
//! - At most one memtable is mutable; a memtable being flushed is
//!   immutable-by-convention and still served to readers until the
//!   engine swaps in a fresh one.
//!
//! ## Structure
//!
//! A skip-list with fixed maximum height 12. Node heights are sampled
//! with `P[h ≥ k] = 2^-(k-1)`, keeping the expected search depth
//! logarithmic. A sentinel head node of full height removes edge cases
//! at the left boundary. Nodes live in a slab and reference key/value
//! bytes by arena offset; freeing the whole table is one reset.
//!
//! ## Concurrency
//!
//! Interior `RwLock`: the single writer takes the write lock, readers
//! proceed concurrently under read locks. Scans return collected
//! snapshots, so no lock is held while a caller iterates.

#[cfg(test)]
mod tests;

use std::sync::RwLock;

use rand::Rng;
use thiserror::Error;
use tracing::trace;

use crate::entry::Entry;

/// Fixed maximum skip-list height.
const MAX_HEIGHT: usize = 12;

/// Sentinel link index meaning "no successor".
const NIL: u32 = u32::MAX;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by [`MemTable`] operations.
#[derive(Debug, Error)]
pub enum MemTableError {
    /// The arena has no room for the requested allocation. Callers must
    /// flush before the buffer fills; hitting this is an engine fault.
    #[error("arena exhausted: {needed} bytes requested, {remaining} remaining")]
    ArenaExhausted {
        /// Bytes the allocation needed.
        needed: usize,
        /// Bytes left in the arena.
        remaining: usize,
    },

    /// Poisoned lock or violated internal invariant.
    #[error("internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Arena
// ------------------------------------------------------------------------------------------------

/// Bump allocator backing all key/value bytes of one memtable.
///
/// Allocation appends to a single contiguous buffer; there is no
/// per-allocation free. `reset` drops everything at once while keeping
/// the buffer's capacity for the next epoch.
struct Arena {
    buf: Vec<u8>,
    capacity: usize,
}

impl Arena {
    fn new(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
            capacity,
        }
    }

    fn alloc(&mut self, bytes: &[u8]) -> Result<u32, MemTableError> {
        let remaining = self.capacity - self.buf.len();
        if bytes.len() > remaining {
            return Err(MemTableError::ArenaExhausted {
                needed: bytes.len(),
                remaining,
            });
        }
        let offset = self.buf.len() as u32;
        self.buf.extend_from_slice(bytes);
        Ok(offset)
    }

    fn slice(&self, offset: u32, len: u32) -> &[u8] {
        &self.buf[offset as usize..offset as usize + len as usize]
    }

    fn reset(&mut self) {
        self.buf.clear();
    }
}

// ------------------------------------------------------------------------------------------------
// Skip-list core
// ------------------------------------------------------------------------------------------------

/// Where a node's value lives: arena bytes or a tombstone marker.
#[derive(Debug, Clone, Copy)]
enum ValueSlot {
    Inline { offset: u32, len: u32 },
    Tombstone,
}

struct Node {
    key_offset: u32,
    key_len: u32,
    value: ValueSlot,
    next: [u32; MAX_HEIGHT],
}

struct Core {
    arena: Arena,
    /// Node slab; index 0 is the sentinel head (never compared).
    nodes: Vec<Node>,
    approximate_size: usize,
    record_count: usize,
}

impl Core {
    fn new(arena_capacity: usize) -> Self {
        Self {
            arena: Arena::new(arena_capacity),
            nodes: vec![head_node()],
            approximate_size: 0,
            record_count: 0,
        }
    }

    fn key(&self, idx: u32) -> &[u8] {
        let node = &self.nodes[idx as usize];
        self.arena.slice(node.key_offset, node.key_len)
    }

    fn entry(&self, idx: u32) -> Entry {
        match self.nodes[idx as usize].value {
            ValueSlot::Inline { offset, len } => {
                Entry::Value(self.arena.slice(offset, len).to_vec())
            }
            ValueSlot::Tombstone => Entry::Tombstone,
        }
    }

    /// Standard skip-list descent: records the rightmost strictly-smaller
    /// predecessor at each level and returns the bottom-level successor.
    fn find_predecessors(&self, key: &[u8]) -> ([u32; MAX_HEIGHT], u32) {
        let mut preds = [0u32; MAX_HEIGHT];
        let mut node = 0u32; // head

        for level in (0..MAX_HEIGHT).rev() {
            loop {
                let next = self.nodes[node as usize].next[level];
                if next != NIL && self.key(next) < key {
                    node = next;
                } else {
                    break;
                }
            }
            preds[level] = node;
        }

        (preds, self.nodes[preds[0] as usize].next[0])
    }

    fn alloc_value(&mut self, entry: &Entry) -> Result<ValueSlot, MemTableError> {
        match entry {
            Entry::Value(v) => {
                let offset = self.arena.alloc(v)?;
                Ok(ValueSlot::Inline {
                    offset,
                    len: v.len() as u32,
                })
            }
            Entry::Tombstone => Ok(ValueSlot::Tombstone),
        }
    }
}

fn head_node() -> Node {
    Node {
        key_offset: 0,
        key_len: 0,
        value: ValueSlot::Tombstone,
        next: [NIL; MAX_HEIGHT],
    }
}

/// Samples a node height with `P[h ≥ k] = 2^-(k-1)`.
fn sample_height() -> usize {
    let mut rng = rand::rng();
    let mut height = 1;
    while height < MAX_HEIGHT && rng.random::<bool>() {
        height += 1;
    }
    height
}

// ------------------------------------------------------------------------------------------------
// MemTable
// ------------------------------------------------------------------------------------------------

/// In-memory sorted write buffer.
pub struct MemTable {
    inner: RwLock<Core>,
}

impl MemTable {
    /// Creates an empty memtable whose arena holds at most
    /// `arena_capacity` bytes of key/value payload.
    pub fn new(arena_capacity: usize) -> Self {
        Self {
            inner: RwLock::new(Core::new(arena_capacity)),
        }
    }

    /// Inserts or overwrites `key` with the given entry.
    ///
    /// An existing key keeps its node and height; only the value slot is
    /// rewritten. Fails only when the arena is exhausted.
    pub fn put(&self, key: &[u8], entry: &Entry) -> Result<(), MemTableError> {
        debug_assert!(!key.is_empty());

        let mut core = self
            .inner
            .write()
            .map_err(|_| MemTableError::Internal("memtable lock poisoned".into()))?;

        let (preds, candidate) = core.find_predecessors(key);

        if candidate != NIL && core.key(candidate) == key {
            let slot = core.alloc_value(entry)?;
            core.nodes[candidate as usize].value = slot;
            core.approximate_size += entry.value_len();
            trace!(key_len = key.len(), "memtable overwrite");
            return Ok(());
        }

        let height = sample_height();
        let key_offset = core.arena.alloc(key)?;
        let value = core.alloc_value(entry)?;

        let idx = core.nodes.len() as u32;
        let mut node = Node {
            key_offset,
            key_len: key.len() as u32,
            value,
            next: [NIL; MAX_HEIGHT],
        };
        for level in 0..height {
            node.next[level] = core.nodes[preds[level] as usize].next[level];
        }
        core.nodes.push(node);
        for level in 0..height {
            core.nodes[preds[level] as usize].next[level] = idx;
        }

        core.record_count += 1;
        core.approximate_size += std::mem::size_of::<Node>() + key.len() + entry.value_len();

        trace!(key_len = key.len(), height, "memtable insert");
        Ok(())
    }

    /// Looks up `key`.
    ///
    /// `Ok(Some(Entry::Tombstone))` means the key was deleted *here* —
    /// the engine must not consult older layers.
    pub fn get(&self, key: &[u8]) -> Result<Option<Entry>, MemTableError> {
        let core = self
            .inner
            .read()
            .map_err(|_| MemTableError::Internal("memtable lock poisoned".into()))?;

        let (_, candidate) = core.find_predecessors(key);
        if candidate != NIL && core.key(candidate) == key {
            Ok(Some(core.entry(candidate)))
        } else {
            Ok(None)
        }
    }

    /// Collects all records with `start <= key <= end`, in ascending key
    /// order. Tombstones are included — the merge layer resolves them.
    pub fn scan(&self, start: &[u8], end: &[u8]) -> Result<Vec<(Vec<u8>, Entry)>, MemTableError> {
        if start > end {
            return Ok(Vec::new());
        }

        let core = self
            .inner
            .read()
            .map_err(|_| MemTableError::Internal("memtable lock poisoned".into()))?;

        let (_, mut node) = core.find_predecessors(start);
        let mut records = Vec::new();
        while node != NIL {
            let key = core.key(node);
            if key > end {
                break;
            }
            records.push((key.to_vec(), core.entry(node)));
            node = core.nodes[node as usize].next[0];
        }
        Ok(records)
    }

    /// Snapshot of every record in ascending key order, for flushing.
    pub fn iter_for_flush(&self) -> Result<Vec<(Vec<u8>, Entry)>, MemTableError> {
        let core = self
            .inner
            .read()
            .map_err(|_| MemTableError::Internal("memtable lock poisoned".into()))?;

        let mut records = Vec::with_capacity(core.record_count);
        let mut node = core.nodes[0].next[0];
        while node != NIL {
            records.push((core.key(node).to_vec(), core.entry(node)));
            node = core.nodes[node as usize].next[0];
        }
        Ok(records)
    }

    /// Resets the memtable to empty: one bump-reset of the arena plus a
    /// fresh sentinel head. Buffer capacity is retained.
    pub fn clear(&self) -> Result<(), MemTableError> {
        let mut core = self
            .inner
            .write()
            .map_err(|_| MemTableError::Internal("memtable lock poisoned".into()))?;

        core.arena.reset();
        core.nodes.clear();
        core.nodes.push(head_node());
        core.approximate_size = 0;
        core.record_count = 0;
        Ok(())
    }

    /// Accumulated byte-size estimate (keys + values + node overhead).
    pub fn approximate_size(&self) -> usize {
        match self.inner.read() {
            Ok(core) => core.approximate_size,
            Err(poisoned) => poisoned.into_inner().approximate_size,
        }
    }

    /// Number of distinct keys currently stored (tombstones included).
    pub fn len(&self) -> usize {
        match self.inner.read() {
            Ok(core) => core.record_count,
            Err(poisoned) => poisoned.into_inner().record_count,
        }
    }

    /// Returns `true` when no records are stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
