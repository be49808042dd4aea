//! Recency list driving eviction order.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::cache::entry::{CacheEntry, NO_LRU_SLOT};

struct Node {
    entry: Option<Arc<CacheEntry>>,
    /// Toward the head (more recently used).
    prev: usize,
    /// Toward the tail (less recently used).
    next: usize,
}

struct LruInner {
    nodes: Vec<Node>,
    free: Vec<usize>,
    head: usize,
    tail: usize,
}

/// Doubly linked recency list over cache entries.
///
/// Nodes live in an arena indexed by slot number; every linked entry stores
/// its slot on itself, so touch and unlink are O(1) with no hash lookup.
/// One mutex guards all list structure; the entries' own lifecycle state is
/// never read or written under it except for the non-blocking `freeze` CAS
/// during victim selection.
///
/// Head is most recently used, tail is the eviction end.
pub(crate) struct LruList {
    inner: Mutex<LruInner>,
}

impl LruList {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(LruInner {
                nodes: Vec::new(),
                free: Vec::new(),
                head: NO_LRU_SLOT,
                tail: NO_LRU_SLOT,
            }),
        }
    }

    /// Insert a newly admitted entry at the head.
    pub fn push_front(&self, entry: &Arc<CacheEntry>) {
        let mut inner = self.inner.lock();
        debug_assert_eq!(entry.lru_slot(), NO_LRU_SLOT);

        let slot = match inner.free.pop() {
            Some(slot) => {
                inner.nodes[slot].entry = Some(Arc::clone(entry));
                slot
            }
            None => {
                inner.nodes.push(Node {
                    entry: Some(Arc::clone(entry)),
                    prev: NO_LRU_SLOT,
                    next: NO_LRU_SLOT,
                });
                inner.nodes.len() - 1
            }
        };

        inner.link_front(slot);
        entry.set_lru_slot(slot);
    }

    /// Refresh an entry's recency after a cache hit. A no-op when the entry
    /// has already been unlinked by a concurrent retirement.
    pub fn touch(&self, entry: &CacheEntry) {
        let mut inner = self.inner.lock();
        let slot = entry.lru_slot();
        if slot == NO_LRU_SLOT || inner.head == slot {
            return;
        }

        inner.unlink_node(slot);
        inner.link_front(slot);
    }

    /// Remove an entry from the list (teardown path).
    pub fn unlink(&self, entry: &CacheEntry) {
        let mut inner = self.inner.lock();
        let slot = entry.lru_slot();
        if slot == NO_LRU_SLOT {
            return;
        }

        inner.unlink_node(slot);
        inner.nodes[slot].entry = None;
        inner.free.push(slot);
        entry.set_lru_slot(NO_LRU_SLOT);
    }

    /// Walk from the tail and freeze the first entry with no outstanding
    /// reference. The frozen entry is unlinked and returned for retirement;
    /// pinned entries are skipped silently.
    pub fn claim_victim(&self) -> Option<Arc<CacheEntry>> {
        let mut inner = self.inner.lock();
        let mut slot = inner.tail;

        while slot != NO_LRU_SLOT {
            let next_older = inner.nodes[slot].prev;
            let entry = match &inner.nodes[slot].entry {
                Some(entry) => Arc::clone(entry),
                None => unreachable!("linked lru node without an entry"),
            };

            if entry.freeze() {
                inner.unlink_node(slot);
                inner.nodes[slot].entry = None;
                inner.free.push(slot);
                entry.set_lru_slot(NO_LRU_SLOT);
                return Some(entry);
            }

            slot = next_older;
        }

        None
    }

    /// Number of linked entries.
    #[cfg(test)]
    pub fn len(&self) -> usize {
        let inner = self.inner.lock();
        inner.nodes.len() - inner.free.len()
    }
}

impl LruInner {
    fn link_front(&mut self, slot: usize) {
        self.nodes[slot].prev = NO_LRU_SLOT;
        self.nodes[slot].next = self.head;

        if self.head != NO_LRU_SLOT {
            self.nodes[self.head].prev = slot;
        }
        self.head = slot;

        if self.tail == NO_LRU_SLOT {
            self.tail = slot;
        }
    }

    fn unlink_node(&mut self, slot: usize) {
        let (prev, next) = (self.nodes[slot].prev, self.nodes[slot].next);

        if prev != NO_LRU_SLOT {
            self.nodes[prev].next = next;
        } else {
            self.head = next;
        }

        if next != NO_LRU_SLOT {
            self.nodes[next].prev = prev;
        } else {
            self.tail = prev;
        }

        self.nodes[slot].prev = NO_LRU_SLOT;
        self.nodes[slot].next = NO_LRU_SLOT;
    }
}
