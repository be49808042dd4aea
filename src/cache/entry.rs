//! CacheEntry - one slot of the page cache and its lifecycle state machine.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::cache::pointer::CachePointer;
use crate::common::{Lsn, PageKey};

const FROZEN: i32 = -1;
const DEAD: i32 = -2;

/// Sentinel for "not linked into the recency list".
pub(crate) const NO_LRU_SLOT: usize = usize::MAX;

/// A page cache slot: one page buffer plus the lock-free state that decides
/// whether the slot may be handed out or torn down.
///
/// # State machine
///
/// The `state` word is both a reference count and a lifecycle gate:
///
/// ```text
///   state >= 0   alive; value = number of successful acquisitions
///   state == -1  frozen; reachable only from exactly 0, acquisition fails
///   state == -2  dead; terminal, buffer has been reclaimed
/// ```
///
/// All transitions are CAS loops; nothing ever blocks on this word. A failed
/// [`acquire_entry`](Self::acquire_entry) means the entry lost a race with
/// eviction and the caller re-resolves the page key. Freezing requires the
/// count to be exactly zero, which is what makes "no pinned page is ever
/// evicted" a structural guarantee rather than a scheduling one.
pub struct CacheEntry {
    key: PageKey,
    pointer: CachePointer,
    state: AtomicI32,
    /// Diagnostic pin-depth counter, independent of the CAS state.
    usages: AtomicI64,
    dirty: AtomicBool,
    newly_allocated: AtomicBool,
    /// False only for transient probe entries that were never published to
    /// the cache map; their buffer is reclaimed on release instead of by
    /// eviction.
    inside_cache: bool,
    /// `start_lsn` of the most recent write load, promoted into the
    /// pointer's `end_lsn` when the write is released as changed.
    pending_lsn: Mutex<Option<Lsn>>,
    /// Arena slot in the recency list; mutated only under the list's lock.
    lru_slot: AtomicUsize,
}

impl CacheEntry {
    pub(crate) fn new(key: PageKey, pointer: CachePointer, inside_cache: bool) -> Self {
        Self {
            key,
            pointer,
            state: AtomicI32::new(0),
            usages: AtomicI64::new(0),
            dirty: AtomicBool::new(false),
            newly_allocated: AtomicBool::new(false),
            inside_cache,
            pending_lsn: Mutex::new(None),
            lru_slot: AtomicUsize::new(NO_LRU_SLOT),
        }
    }

    #[inline]
    pub fn page_key(&self) -> PageKey {
        self.key
    }

    /// The entry's buffer slot. Page content is only reachable through
    /// guards, but the pointer's durability watermarks are public so the
    /// WAL layer can read and advance them while it holds a write guard.
    #[inline]
    pub fn pointer(&self) -> &CachePointer {
        &self.pointer
    }

    #[inline]
    pub(crate) fn inside_cache(&self) -> bool {
        self.inside_cache
    }

    // ========================================================================
    // Lifecycle state machine
    // ========================================================================

    /// Take a reference on the entry. Fails when the entry is frozen or
    /// dead; the caller then re-resolves the page key against the cache.
    pub fn acquire_entry(&self) -> bool {
        let mut state = self.state.load(Ordering::Acquire);
        loop {
            if state < 0 {
                return false;
            }
            match self.state.compare_exchange_weak(
                state,
                state + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => state = actual,
            }
        }
    }

    /// Drop a reference taken by [`acquire_entry`](Self::acquire_entry).
    ///
    /// # Panics
    /// Panics when the entry holds no reference (double release) or is
    /// frozen/dead; both are caller bugs, never a condition to retry.
    pub fn release_entry(&self) {
        let mut state = self.state.load(Ordering::Acquire);
        loop {
            assert!(
                state > 0,
                "release of cache entry {} which is not acquired",
                self.key
            );
            match self.state.compare_exchange_weak(
                state,
                state - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => state = actual,
            }
        }
    }

    /// Bar all future acquisition. Succeeds only while no reference is
    /// outstanding; eviction and teardown use this as their admission check.
    pub fn freeze(&self) -> bool {
        self.state
            .compare_exchange(0, FROZEN, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Retire a frozen entry for good.
    ///
    /// # Panics
    /// Panics unless the entry is frozen; the freeze step is what proves no
    /// reference can appear concurrently.
    pub fn make_dead(&self) {
        let result = self
            .state
            .compare_exchange(FROZEN, DEAD, Ordering::AcqRel, Ordering::Acquire);
        assert!(
            result.is_ok(),
            "cache entry {} must be frozen before it dies",
            self.key
        );
    }

    #[inline]
    pub fn is_alive(&self) -> bool {
        self.state.load(Ordering::Acquire) >= 0
    }

    /// Alive with no outstanding reference.
    #[inline]
    pub fn is_released(&self) -> bool {
        self.state.load(Ordering::Acquire) == 0
    }

    #[inline]
    pub fn is_frozen(&self) -> bool {
        self.state.load(Ordering::Acquire) == FROZEN
    }

    #[inline]
    pub fn is_dead(&self) -> bool {
        self.state.load(Ordering::Acquire) == DEAD
    }

    // ========================================================================
    // Diagnostic usage counter
    // ========================================================================

    #[inline]
    pub fn increment_usages(&self) {
        self.usages.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn decrement_usages(&self) {
        self.usages.fetch_sub(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn usages_count(&self) -> i64 {
        self.usages.load(Ordering::Relaxed)
    }

    // ========================================================================
    // Dirty / allocation flags
    // ========================================================================

    #[inline]
    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Clear the dirty flag, returning whether it was set.
    #[inline]
    pub(crate) fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::AcqRel)
    }

    /// Mark the page as freshly allocated and not yet written back, so
    /// recovery can tell a brand-new page from a pre-existing one.
    #[inline]
    pub fn mark_allocated(&self) {
        self.newly_allocated.store(true, Ordering::Release);
    }

    #[inline]
    pub fn clear_allocation_flag(&self) {
        self.newly_allocated.store(false, Ordering::Release);
    }

    #[inline]
    pub fn is_newly_allocated(&self) -> bool {
        self.newly_allocated.load(Ordering::Acquire)
    }

    // ========================================================================
    // Write watermark hand-off
    // ========================================================================

    pub(crate) fn set_pending_lsn(&self, lsn: Option<Lsn>) {
        *self.pending_lsn.lock() = lsn;
    }

    pub(crate) fn take_pending_lsn(&self) -> Option<Lsn> {
        self.pending_lsn.lock().take()
    }

    // ========================================================================
    // Recency-list linkage
    // ========================================================================

    #[inline]
    pub(crate) fn lru_slot(&self) -> usize {
        self.lru_slot.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn set_lru_slot(&self, slot: usize) {
        self.lru_slot.store(slot, Ordering::Relaxed);
    }
}

impl PartialEq for CacheEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for CacheEntry {}

impl Hash for CacheEntry {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

impl fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheEntry")
            .field("key", &self.key)
            .field("state", &self.state.load(Ordering::Relaxed))
            .field("usages", &self.usages_count())
            .field("dirty", &self.is_dirty())
            .finish()
    }
}
