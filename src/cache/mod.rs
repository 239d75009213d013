//! Shared block cache.
//!
//! A bounded, least-recently-used cache of SSTable data blocks, keyed by
//! `(filename, block_offset)` and holding the raw block bytes exactly as
//! they were after CRC verification. Capacity is a byte budget, not an
//! entry count — a handful of hot 4 KiB blocks should never be evicted by
//! one oversized block.
//!
//! The cache is shared by every table reader; all access goes through a
//! single internal mutex with short critical sections. Blocks are handed
//! out as `Arc<[u8]>`, so an evicted block stays alive for readers that
//! already hold it.


use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

use tracing::trace;

/// Sentinel slot index for "no neighbour".
const NIL: usize = usize::MAX;

/// Cache key: the owning table's filename plus the block's file offset.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlockKey {
    /// Filename of the table the block belongs to (`<nanos>.sst`).
    pub file: Arc<str>,

    /// Byte offset of the block frame within the table file.
    pub offset: u64,
}

struct Slot {
    key: BlockKey,
    block: Arc<[u8]>,
    prev: usize,
    next: usize,
}

struct LruInner {
    map: HashMap<BlockKey, usize>,
    slots: Vec<Slot>,
    free: Vec<usize>,
    head: usize,
    tail: usize,
    used_bytes: usize,
}

/// Bounded LRU cache of verified data blocks.
pub struct BlockCache {
    inner: Mutex<LruInner>,
    capacity: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl BlockCache {
    /// Creates a cache with the given byte budget.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(LruInner {
                map: HashMap::new(),
                slots: Vec::new(),
                free: Vec::new(),
                head: NIL,
                tail: NIL,
                used_bytes: 0,
            }),
            capacity,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Looks up a block, refreshing its recency on a hit.
    pub fn get(&self, key: &BlockKey) -> Option<Arc<[u8]>> {
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        match inner.map.get(key).copied() {
            Some(slot) => {
                inner.unlink(slot);
                inner.push_front(slot);
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(Arc::clone(&inner.slots[slot].block))
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Inserts a block, evicting least-recently-used entries until the
    /// byte budget holds. A block larger than the whole budget is not
    /// cached at all.
    pub fn insert(&self, key: BlockKey, block: Arc<[u8]>) {
        if block.len() > self.capacity {
            trace!(
                file = %key.file,
                offset = key.offset,
                len = block.len(),
                "block exceeds cache budget, not cached"
            );
            return;
        }

        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        // Replace an existing entry for the same block.
        if let Some(slot) = inner.map.get(&key).copied() {
            let old_len = inner.slots[slot].block.len();
            let new_len = block.len();
            inner.slots[slot].block = block;
            inner.used_bytes = inner.used_bytes - old_len + new_len;
            inner.unlink(slot);
            inner.push_front(slot);
        } else {
            let len = block.len();
            let slot = inner.alloc_slot(key.clone(), block);
            inner.map.insert(key, slot);
            inner.push_front(slot);
            inner.used_bytes += len;
        }

        while inner.used_bytes > self.capacity {
            let victim = inner.tail;
            debug_assert_ne!(victim, NIL);
            inner.evict(victim);
        }
    }

    /// Number of cache hits since open.
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Number of cache misses since open.
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Bytes currently resident.
    pub fn used_bytes(&self) -> usize {
        match self.inner.lock() {
            Ok(guard) => guard.used_bytes,
            Err(poisoned) => poisoned.into_inner().used_bytes,
        }
    }
}

impl LruInner {
    fn alloc_slot(&mut self, key: BlockKey, block: Arc<[u8]>) -> usize {
        let slot = Slot {
            key,
            block,
            prev: NIL,
            next: NIL,
        };
        match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = slot;
                idx
            }
            None => {
                self.slots.push(slot);
                self.slots.len() - 1
            }
        }
    }

    fn unlink(&mut self, slot: usize) {
        let (prev, next) = (self.slots[slot].prev, self.slots[slot].next);
        if prev != NIL {
            self.slots[prev].next = next;
        } else {
            self.head = next;
        }
        if next != NIL {
            self.slots[next].prev = prev;
        } else {
            self.tail = prev;
        }
        self.slots[slot].prev = NIL;
        self.slots[slot].next = NIL;
    }

    fn push_front(&mut self, slot: usize) {
        self.slots[slot].prev = NIL;
        self.slots[slot].next = self.head;
        if self.head != NIL {
            self.slots[self.head].prev = slot;
        }
        self.head = slot;
        if self.tail == NIL {
            self.tail = slot;
        }
    }

    fn evict(&mut self, slot: usize) {
        self.unlink(slot);
        self.used_bytes -= self.slots[slot].block.len();
        let key = self.slots[slot].key.clone();
        self.map.remove(&key);
        self.free.push(slot);
    }
}
