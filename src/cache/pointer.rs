//! CachePointer - the lockable page buffer of one cache entry.

use std::cell::UnsafeCell;

use parking_lot::lock_api::RawRwLock as _;
use parking_lot::{Mutex, RawRwLock};

use crate::common::Lsn;
use crate::storage::Page;

/// Owns the raw page buffer of one cache entry, together with the page's
/// shared/exclusive lock and its durability watermarks.
///
/// The lock is a raw rwlock rather than `RwLock<Page>` because acquisition
/// and release happen on different code paths (load vs. release), so guard
/// lifetimes cannot express the critical section. The safety rules are:
///
/// - [`buffer`](Self::buffer) requires the shared or exclusive lock,
/// - [`buffer_mut`](Self::buffer_mut) requires the exclusive lock,
/// - reading without any lock is allowed once the owning entry is frozen,
///   since freezing proves no acquirer (and hence no lock holder) exists
///   and blocks all future acquisition,
/// - [`detach_buffer`](Self::detach_buffer) additionally requires that no
///   further access can follow (the entry is being retired).
///
/// Watermarks: `end_lsn` is the WAL position the buffer's content is covered
/// by (content is never ahead of it); `initial_lsn` is the position at which
/// the resident copy was first dirtied, cleared again once the copy is clean.
pub struct CachePointer {
    lock: RawRwLock,
    buffer: UnsafeCell<Option<Box<Page>>>,
    end_lsn: Mutex<Option<Lsn>>,
    initial_lsn: Mutex<Option<Lsn>>,
    #[cfg(debug_assertions)]
    exclusive_owner: Mutex<Option<std::thread::ThreadId>>,
}

// Buffer access is guarded by the raw lock and the entry lifecycle, per the
// rules above.
unsafe impl Send for CachePointer {}
unsafe impl Sync for CachePointer {}

impl CachePointer {
    pub(crate) fn new(buffer: Box<Page>) -> Self {
        Self {
            lock: RawRwLock::INIT,
            buffer: UnsafeCell::new(Some(buffer)),
            end_lsn: Mutex::new(None),
            initial_lsn: Mutex::new(None),
            #[cfg(debug_assertions)]
            exclusive_owner: Mutex::new(None),
        }
    }

    // ========================================================================
    // Page lock
    // ========================================================================

    pub(crate) fn acquire_shared_lock(&self) {
        self.lock.lock_shared();
    }

    pub(crate) fn release_shared_lock(&self) {
        // Caller holds the shared lock; guards guarantee this.
        unsafe { self.lock.unlock_shared() }
    }

    pub(crate) fn acquire_exclusive_lock(&self) {
        #[cfg(debug_assertions)]
        {
            let current = std::thread::current().id();
            assert_ne!(
                *self.exclusive_owner.lock(),
                Some(current),
                "reentrant exclusive page lock would self-deadlock"
            );
        }

        self.lock.lock_exclusive();

        #[cfg(debug_assertions)]
        {
            *self.exclusive_owner.lock() = Some(std::thread::current().id());
        }
    }

    pub(crate) fn release_exclusive_lock(&self) {
        #[cfg(debug_assertions)]
        {
            let mut owner = self.exclusive_owner.lock();
            assert_eq!(
                *owner,
                Some(std::thread::current().id()),
                "exclusive page lock released by a thread that does not own it"
            );
            *owner = None;
        }

        // Caller holds the exclusive lock; guards guarantee this.
        unsafe { self.lock.unlock_exclusive() }
    }

    // ========================================================================
    // Buffer access
    // ========================================================================

    /// # Safety
    /// The caller must hold the shared or exclusive lock, or the owning
    /// entry must be frozen.
    pub(crate) unsafe fn buffer(&self) -> &Page {
        match (*self.buffer.get()).as_deref() {
            Some(page) => page,
            None => unreachable!("page buffer accessed after retirement"),
        }
    }

    /// # Safety
    /// The caller must hold the exclusive lock.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn buffer_mut(&self) -> &mut Page {
        match (*self.buffer.get()).as_deref_mut() {
            Some(page) => page,
            None => unreachable!("page buffer accessed after retirement"),
        }
    }

    /// Take the buffer out for reuse.
    ///
    /// # Safety
    /// The owning entry must be dead; no access can follow.
    pub(crate) unsafe fn detach_buffer(&self) -> Option<Box<Page>> {
        (*self.buffer.get()).take()
    }

    // ========================================================================
    // Durability watermarks
    // ========================================================================

    pub fn end_lsn(&self) -> Option<Lsn> {
        *self.end_lsn.lock()
    }

    pub fn set_end_lsn(&self, lsn: Option<Lsn>) {
        *self.end_lsn.lock() = lsn;
    }

    /// Move `end_lsn` forward to `lsn` if it is currently behind.
    pub fn advance_end_lsn(&self, lsn: Lsn) {
        let mut end = self.end_lsn.lock();
        match *end {
            Some(current) if current >= lsn => {}
            _ => *end = Some(lsn),
        }
    }

    pub fn initial_lsn(&self) -> Option<Lsn> {
        *self.initial_lsn.lock()
    }

    pub fn set_initial_lsn(&self, lsn: Option<Lsn>) {
        *self.initial_lsn.lock() = lsn;
    }
}
