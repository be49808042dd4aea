//! ReadCache - the page cache manager.
//!
//! Maps `(file, page index)` to pinned, lockable in-memory buffers and keeps
//! resident memory inside a configurable budget.
//!
//! # Architecture
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                          ReadCache                             │
//! │  ┌───────────────────────────┐  ┌──────────────────────────┐   │
//! │  │ entries                   │  │ lru (arena linked list)  │   │
//! │  │ PageKey → Arc<CacheEntry> │  │ head = hot, tail = cold  │   │
//! │  └───────────────────────────┘  └──────────────────────────┘   │
//! │  ┌───────────────┐  ┌──────────────┐  ┌───────────────────┐    │
//! │  │ fault_locks   │  │ page pool    │  │ stats / budget    │    │
//! │  │ (striped)     │  │ free buffers │  │ atomics           │    │
//! │  └───────────────┘  └──────────────┘  └───────────────────┘    │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Concurrency
//! Two independent synchronization layers:
//! - the per-page shared/exclusive lock on each entry's `CachePointer`,
//! - the lock-free CAS lifecycle on each `CacheEntry`.
//!
//! The map's read path never blocks on I/O: faults take a striped fault
//! mutex keyed by page hash, so only same-stripe misses serialize and an
//! already-resident lookup proceeds concurrently. An entry is published
//! only after it is fully constructed, and a frozen dirty entry stays
//! published until its flush completes, so concurrent lookups can never
//! fault in stale bytes from the write cache.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, trace, warn};

use crate::cache::entry::CacheEntry;
use crate::cache::page_guard::{PageReadGuard, PageWriteGuard};
use crate::cache::page_pool::PagePool;
use crate::cache::pointer::CachePointer;
use crate::cache::stats::CacheStats;
use crate::cache::LruList;
use crate::common::config::PAGE_SIZE;
use crate::common::{CacheConfig, Error, FileId, Lsn, PageKey, Result};
use crate::storage::WriteCache;

const FAULT_STRIPES: usize = 32;

/// The buffer pool of one storage.
///
/// Construct one per storage and pass it around explicitly; nothing here is
/// process-global, so independent storages (and tests) never share state.
///
/// ```no_run
/// use pagepool::{CacheConfig, FileWriteCache, ReadCache};
///
/// let cache = ReadCache::new(CacheConfig::default());
/// let write_cache = FileWriteCache::open("/var/lib/mydb").unwrap();
///
/// let file_id = cache.add_file("users.pcl", &write_cache).unwrap();
/// let mut guard = cache.allocate_new_page(file_id, &write_cache, None).unwrap();
/// guard.as_mut_slice()[100] = 7;
/// guard.mark_changed();
/// drop(guard);
/// ```
pub struct ReadCache {
    /// Resident entries. Values are fully constructed before insertion.
    entries: RwLock<HashMap<PageKey, Arc<CacheEntry>>>,

    /// Eviction order.
    lru: LruList,

    /// Recycled page buffers.
    pool: PagePool,

    /// Striped fault-in locks; same-key misses serialize here so exactly
    /// one write-cache load happens per concurrent fault.
    fault_locks: Vec<Mutex<()>>,

    /// Memory budget in bytes, live-adjustable.
    max_memory: AtomicU64,

    /// Resident page count (published entries only).
    resident_pages: AtomicU64,

    stats: CacheStats,
}

impl ReadCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            lru: LruList::new(),
            pool: PagePool::new(),
            fault_locks: (0..FAULT_STRIPES).map(|_| Mutex::new(())).collect(),
            max_memory: AtomicU64::new(config.max_memory_bytes()),
            resident_pages: AtomicU64::new(0),
            stats: CacheStats::new(),
        }
    }

    // ========================================================================
    // File registration
    // ========================================================================

    /// Register a backing file; physical creation is the write cache's job.
    pub fn add_file(&self, name: &str, write_cache: &dyn WriteCache) -> Result<FileId> {
        write_cache.add_file(name)
    }

    /// Register a backing file under an explicit id (restore paths).
    pub fn add_file_with_id(
        &self,
        name: &str,
        file_id: FileId,
        write_cache: &dyn WriteCache,
    ) -> Result<FileId> {
        write_cache.add_file_with_id(name, file_id)
    }

    // ========================================================================
    // Page loads
    // ========================================================================

    /// Pin a page for shared reading.
    ///
    /// Resident pages are acquired lock-free; a miss faults the bytes in
    /// from the write cache, optionally verifying the on-disk checksum.
    pub fn load_for_read(
        &self,
        file_id: FileId,
        page_index: u64,
        write_cache: &dyn WriteCache,
        verify_checksums: bool,
    ) -> Result<PageReadGuard<'_>> {
        let (entry, admitted) = self.do_load(file_id, page_index, write_cache, verify_checksums)?;

        entry.pointer().acquire_shared_lock();
        entry.increment_usages();
        let guard = PageReadGuard::new(self, entry);

        if admitted {
            self.enforce_memory_budget(write_cache)?;
        }
        Ok(guard)
    }

    /// Pin a page for exclusive writing.
    ///
    /// `start_lsn` is the WAL position the caller is writing under; it
    /// becomes the page's durability watermark when the guard is released
    /// as changed, and recovery uses it to validate redo against the
    /// loaded content.
    pub fn load_for_write(
        &self,
        file_id: FileId,
        page_index: u64,
        write_cache: &dyn WriteCache,
        verify_checksums: bool,
        start_lsn: Option<Lsn>,
    ) -> Result<PageWriteGuard<'_>> {
        let (entry, admitted) = self.do_load(file_id, page_index, write_cache, verify_checksums)?;

        entry.pointer().acquire_exclusive_lock();
        entry.set_pending_lsn(start_lsn);
        if entry.pointer().initial_lsn().is_none() {
            entry.pointer().set_initial_lsn(start_lsn);
        }
        entry.increment_usages();
        let guard = PageWriteGuard::new(self, entry);

        if admitted {
            self.enforce_memory_budget(write_cache)?;
        }
        Ok(guard)
    }

    /// Best-effort probe variant of [`load_for_read`](Self::load_for_read):
    /// returns `Ok(None)` instead of failing when the page does not exist.
    ///
    /// A probe that misses does not admit the page into the cache; the
    /// transient entry's buffer is reclaimed as soon as the guard drops.
    pub fn silent_load_for_read(
        &self,
        file_id: FileId,
        page_index: u64,
        write_cache: &dyn WriteCache,
        verify_checksums: bool,
    ) -> Result<Option<PageReadGuard<'_>>> {
        let key = PageKey::new(file_id, page_index);

        loop {
            let existing = self.entries.read().get(&key).cloned();
            if let Some(entry) = existing {
                if entry.acquire_entry() {
                    self.lru.touch(&entry);
                    self.stats.cache_hits.fetch_add(1, Ordering::Relaxed);

                    entry.pointer().acquire_shared_lock();
                    entry.increment_usages();
                    return Ok(Some(PageReadGuard::new(self, entry)));
                }
                std::thread::yield_now();
                continue;
            }

            let stripe = self.fault_lock(&key).lock();
            if self.entries.read().contains_key(&key) {
                drop(stripe);
                continue;
            }

            self.stats.cache_misses.fetch_add(1, Ordering::Relaxed);
            let Some(buffer) = write_cache.load_page(file_id, page_index, verify_checksums)?
            else {
                return Ok(None);
            };
            self.stats.pages_read.fetch_add(1, Ordering::Relaxed);

            let entry = Arc::new(CacheEntry::new(key, CachePointer::new(buffer), false));
            let acquired = entry.acquire_entry();
            debug_assert!(acquired);
            drop(stripe);

            entry.pointer().acquire_shared_lock();
            entry.increment_usages();
            return Ok(Some(PageReadGuard::new(self, entry)));
        }
    }

    /// Extend the file by one page and pin the zeroed page for writing.
    ///
    /// The entry carries the newly-allocated marker until its first
    /// write-back, which lets recovery distinguish a brand-new page from a
    /// pre-existing one.
    pub fn allocate_new_page(
        &self,
        file_id: FileId,
        write_cache: &dyn WriteCache,
        start_lsn: Option<Lsn>,
    ) -> Result<PageWriteGuard<'_>> {
        let page_index = write_cache.allocate_new_page(file_id)?;
        let key = PageKey::new(file_id, page_index);

        let entry = Arc::new(CacheEntry::new(
            key,
            CachePointer::new(self.pool.acquire()),
            true,
        ));
        let acquired = entry.acquire_entry();
        debug_assert!(acquired);
        entry.mark_allocated();

        {
            let mut entries = self.entries.write();
            let previous = entries.insert(key, Arc::clone(&entry));
            assert!(
                previous.is_none(),
                "page {key} was allocated in another thread"
            );
        }
        self.resident_pages.fetch_add(1, Ordering::Relaxed);
        self.lru.push_front(&entry);

        entry.pointer().acquire_exclusive_lock();
        entry.set_pending_lsn(start_lsn);
        entry.pointer().set_initial_lsn(start_lsn);
        entry.increment_usages();
        let guard = PageWriteGuard::new(self, entry);

        self.enforce_memory_budget(write_cache)?;
        Ok(guard)
    }

    fn do_load(
        &self,
        file_id: FileId,
        page_index: u64,
        write_cache: &dyn WriteCache,
        verify_checksums: bool,
    ) -> Result<(Arc<CacheEntry>, bool)> {
        let key = PageKey::new(file_id, page_index);

        loop {
            let existing = self.entries.read().get(&key).cloned();
            if let Some(entry) = existing {
                if entry.acquire_entry() {
                    self.lru.touch(&entry);
                    self.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
                    return Ok((entry, false));
                }
                // Lost the race against retirement; the key resolves again
                // once the frozen entry is gone.
                std::thread::yield_now();
                continue;
            }

            let stripe = self.fault_lock(&key).lock();
            if self.entries.read().contains_key(&key) {
                drop(stripe);
                continue;
            }

            self.stats.cache_misses.fetch_add(1, Ordering::Relaxed);
            let buffer = write_cache
                .load_page(file_id, page_index, verify_checksums)?
                .ok_or(Error::PageNotFound {
                    file_id,
                    page_index,
                })?;
            self.stats.pages_read.fetch_add(1, Ordering::Relaxed);

            let entry = Arc::new(CacheEntry::new(key, CachePointer::new(buffer), true));
            let acquired = entry.acquire_entry();
            debug_assert!(acquired);

            self.entries.write().insert(key, Arc::clone(&entry));
            self.resident_pages.fetch_add(1, Ordering::Relaxed);
            self.lru.push_front(&entry);
            return Ok((entry, true));
        }
    }

    fn fault_lock(&self, key: &PageKey) -> &Mutex<()> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.fault_locks[hasher.finish() as usize % FAULT_STRIPES]
    }

    // ========================================================================
    // Releases (invoked by guard drop)
    // ========================================================================

    pub(crate) fn release_from_read(&self, entry: &Arc<CacheEntry>) {
        entry.decrement_usages();
        entry.pointer().release_shared_lock();
        entry.release_entry();

        if !entry.inside_cache() {
            // Transient probe entry: it was never published, so retire it
            // here and recycle its buffer.
            if entry.freeze() {
                entry.make_dead();
                if let Some(buffer) = unsafe { entry.pointer().detach_buffer() } {
                    self.pool.release(buffer);
                }
            }
        }
    }

    pub(crate) fn release_from_write(&self, entry: &Arc<CacheEntry>, changed: bool) {
        entry.decrement_usages();

        if changed || entry.is_newly_allocated() {
            entry.clear_allocation_flag();
            entry.mark_dirty();
            if changed {
                if let Some(lsn) = entry.take_pending_lsn() {
                    entry.pointer().advance_end_lsn(lsn);
                }
            }
        }

        entry.pointer().release_exclusive_lock();
        entry.release_entry();
    }

    // ========================================================================
    // Memory budget and eviction
    // ========================================================================

    /// Bytes held by resident pages.
    pub fn used_memory(&self) -> u64 {
        self.resident_pages.load(Ordering::Relaxed) * PAGE_SIZE as u64
    }

    /// Adjust the memory budget. Shrinking takes effect at the next page
    /// admission, which is the first moment a write cache is available for
    /// flushing whatever the shrink displaces.
    pub fn set_maximum_memory(&self, bytes: u64) {
        debug!(bytes, "cache memory budget changed");
        self.max_memory.store(bytes, Ordering::Relaxed);
    }

    fn enforce_memory_budget(&self, write_cache: &dyn WriteCache) -> Result<()> {
        let max = self.max_memory.load(Ordering::Relaxed);

        while self.used_memory() > max {
            let Some(victim) = self.lru.claim_victim() else {
                // Every resident page is pinned; eviction is delayed, not
                // skipped - the next admission tries again.
                trace!(
                    used = self.used_memory(),
                    budget = max,
                    "memory budget exceeded but all resident pages are pinned"
                );
                break;
            };

            trace!(key = %victim.page_key(), "evicting page");
            self.retire_entry(&victim, write_cache, true)?;
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
        }

        Ok(())
    }

    /// Retire a frozen, unlinked entry: flush it if dirty (unless content
    /// is being discarded), kill it, unpublish it, recycle its buffer.
    ///
    /// The entry stays in the map until the flush is done so a concurrent
    /// fault-in of the same key cannot read pre-flush bytes from the write
    /// cache.
    fn retire_entry(
        &self,
        entry: &Arc<CacheEntry>,
        write_cache: &dyn WriteCache,
        flush_dirty: bool,
    ) -> Result<()> {
        debug_assert!(entry.is_frozen());
        let key = entry.page_key();

        let mut flush_result = Ok(());
        if entry.take_dirty() && flush_dirty {
            // Frozen means no acquirer and no lock holder; reading the
            // buffer without the page lock is safe.
            let page = unsafe { entry.pointer().buffer() };
            let lsn = entry.pointer().end_lsn();

            match write_cache.flush_page(key.file_id, key.page_index, page, lsn) {
                Ok(()) => {
                    self.stats.pages_written.fetch_add(1, Ordering::Relaxed);
                    entry.pointer().set_initial_lsn(None);
                }
                Err(e) => {
                    // The content is lost from memory but remains
                    // recoverable from the write-ahead log up to end_lsn.
                    error!(key = %key, error = %e, "failed to flush page during retirement");
                    flush_result = Err(e);
                }
            }
        }

        entry.make_dead();
        self.entries.write().remove(&key);
        self.resident_pages.fetch_sub(1, Ordering::Relaxed);

        if let Some(buffer) = unsafe { entry.pointer().detach_buffer() } {
            self.pool.release(buffer);
        }

        flush_result
    }

    // ========================================================================
    // File lifecycle
    // ========================================================================

    /// Drop all pages of the file, then truncate it on disk. Dirty resident
    /// content is discarded together with the file content.
    pub fn truncate_file(&self, file_id: FileId, write_cache: &dyn WriteCache) -> Result<()> {
        self.clear_file(file_id, write_cache, false)?;
        write_cache.truncate_file(file_id)
    }

    /// Evict all pages of the file and close it, flushing dirty pages first
    /// when `flush` is set.
    pub fn close_file(
        &self,
        file_id: FileId,
        flush: bool,
        write_cache: &dyn WriteCache,
    ) -> Result<()> {
        self.clear_file(file_id, write_cache, flush)?;
        write_cache.close_file(file_id, flush)
    }

    /// Drop all pages of the file and delete it on disk.
    pub fn delete_file(&self, file_id: FileId, write_cache: &dyn WriteCache) -> Result<()> {
        self.clear_file(file_id, write_cache, false)?;
        write_cache.delete_file(file_id)
    }

    /// Flush and evict everything, then close the storage.
    pub fn close_storage(&self, write_cache: &dyn WriteCache) -> Result<()> {
        for file_id in write_cache.files() {
            self.clear_file(file_id, write_cache, true)?;
        }
        write_cache.close()
    }

    /// Drop everything without flushing, then delete the storage.
    pub fn delete_storage(&self, write_cache: &dyn WriteCache) -> Result<()> {
        for file_id in write_cache.files() {
            self.clear_file(file_id, write_cache, false)?;
        }
        write_cache.delete()
    }

    /// Retire every resident page of one file. Fails with
    /// [`Error::PageIsUsed`] when a page is still pinned, leaving already
    /// retired pages gone; stale buffers must never outlive their file id.
    fn clear_file(
        &self,
        file_id: FileId,
        write_cache: &dyn WriteCache,
        flush: bool,
    ) -> Result<()> {
        let page_count = write_cache.file_page_count(file_id)?;
        debug!(%file_id, page_count, flush, "clearing resident pages of file");

        for page_index in 0..page_count {
            let key = PageKey::new(file_id, page_index);
            let Some(entry) = self.entries.read().get(&key).cloned() else {
                continue;
            };

            if entry.freeze() {
                self.lru.unlink(&entry);
                self.retire_entry(&entry, write_cache, flush)?;
            } else if entry.is_alive() {
                warn!(key = %key, "file teardown hit a pinned page");
                return Err(Error::PageIsUsed {
                    file_id,
                    page_index,
                });
            } else {
                // A concurrent eviction won the freeze race; wait until it
                // unpublishes the entry before moving on.
                while self
                    .entries
                    .read()
                    .get(&key)
                    .is_some_and(|e| Arc::ptr_eq(e, &entry))
                {
                    std::thread::yield_now();
                }
            }
        }

        Ok(())
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Number of published resident pages.
    pub fn resident_page_count(&self) -> u64 {
        self.resident_pages.load(Ordering::Relaxed)
    }

    /// Buffers currently waiting for reuse in the shared pool.
    pub fn free_buffer_count(&self) -> usize {
        self.pool.free_count()
    }
}
