//! K-way merge over sorted record streams.
//!
//! Both read paths that cross layers run through here:
//!
//! - [`RawMergeIterator`] merges N ascending `(key, Entry)` streams into
//!   one ascending stream with **exactly one record per key** — the one
//!   from the highest-priority source. Tombstones pass through; this is
//!   the stream compaction consumes.
//! - [`MergedIterator`] wraps the raw merge for user scans: tombstones
//!   are suppressed, values unwrapped.
//!
//! Source priority is positional: index 0 is the newest layer (the
//! memtable), followed by L0 tables newest-first, then deeper levels.
//! This must match the ordering the point-lookup path walks, or scans
//! and gets would disagree about which version of a key wins.
//!
//! The merge is a binary heap ordered `(key ASC, priority ASC)`, so the
//! first pop for any key is its winner; remaining sources holding the
//! same key are popped and advanced before the winner is yielded,
//! keeping every stream aligned.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::entry::Entry;

/// A sorted source of records, boxed for uniformity across memtable
/// snapshots and table iterators.
pub type RecordStream = Box<dyn Iterator<Item = (Vec<u8>, Entry)> + Send>;

struct HeapEntry {
    key: Vec<u8>,
    entry: Entry,
    /// Source index; lower = newer layer = wins on key collisions.
    source: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.source == other.source
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; reverse for (key ASC, source ASC).
        self.key
            .cmp(&other.key)
            .then_with(|| self.source.cmp(&other.source))
            .reverse()
    }
}

// ------------------------------------------------------------------------------------------------
// RawMergeIterator
// ------------------------------------------------------------------------------------------------

/// Merges N ascending streams, yielding one winning record per key.
pub struct RawMergeIterator {
    sources: Vec<RecordStream>,
    heap: BinaryHeap<HeapEntry>,
}

impl RawMergeIterator {
    /// Builds a merge over `sources`, ordered newest (index 0) to oldest.
    pub fn new(mut sources: Vec<RecordStream>) -> Self {
        let mut heap = BinaryHeap::with_capacity(sources.len());
        for (source, stream) in sources.iter_mut().enumerate() {
            if let Some((key, entry)) = stream.next() {
                heap.push(HeapEntry { key, entry, source });
            }
        }
        Self { sources, heap }
    }

    fn refill(&mut self, source: usize) {
        if let Some((key, entry)) = self.sources[source].next() {
            self.heap.push(HeapEntry { key, entry, source });
        }
    }
}

impl Iterator for RawMergeIterator {
    type Item = (Vec<u8>, Entry);

    fn next(&mut self) -> Option<Self::Item> {
        let winner = self.heap.pop()?;
        self.refill(winner.source);

        // Advance every source still positioned on the winner's key, so
        // shadowed versions never resurface.
        while let Some(top) = self.heap.peek() {
            if top.key != winner.key {
                break;
            }
            let shadowed = self.heap.pop().expect("peek guaranteed an entry");
            self.refill(shadowed.source);
        }

        Some((winner.key, winner.entry))
    }
}

// ------------------------------------------------------------------------------------------------
// MergedIterator
// ------------------------------------------------------------------------------------------------

/// The public scan cursor: live `(key, value)` pairs in ascending key
/// order, deduplicated and tombstone-free.
pub struct MergedIterator {
    raw: RawMergeIterator,
}

impl MergedIterator {
    pub(crate) fn new(sources: Vec<RecordStream>) -> Self {
        Self {
            raw: RawMergeIterator::new(sources),
        }
    }

    /// An iterator that yields nothing, for degenerate scan ranges.
    pub(crate) fn empty() -> Self {
        Self {
            raw: RawMergeIterator::new(Vec::new()),
        }
    }
}

impl Iterator for MergedIterator {
    type Item = (Vec<u8>, Vec<u8>);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (key, entry) = self.raw.next()?;
            match entry {
                Entry::Value(value) => return Some((key, value)),
                Entry::Tombstone => continue,
            }
        }
    }
}
