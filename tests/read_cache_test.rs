//! Read cache contract tests.
//!
//! Exercises the cache against the file-backed write cache: pin lifecycle,
//! eviction under memory pressure, durability of changed releases, and
//! checksum verification.

use std::io::{Seek, SeekFrom, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use pagepool::storage::page_header::PAGE_OFFSET_TO_CHECKSUM_FROM;
use pagepool::{
    CacheConfig, Error, FileId, FileWriteCache, Lsn, Page, ReadCache, WriteCache, PAGE_SIZE,
};
use tempfile::tempdir;

/// First byte usable by tests; everything below is the on-disk header.
const PAYLOAD: usize = PAGE_OFFSET_TO_CHECKSUM_FROM;

fn create_cache(budget_pages: u64) -> (ReadCache, FileWriteCache, tempfile::TempDir) {
    let dir = tempdir().unwrap();
    let write_cache = FileWriteCache::open(dir.path()).unwrap();
    let cache = ReadCache::new(
        CacheConfig::default().max_memory(budget_pages * PAGE_SIZE as u64),
    );
    (cache, write_cache, dir)
}

#[test]
fn test_allocate_write_read_round_trip() {
    let (cache, wc, _dir) = create_cache(8);
    let file_id = cache.add_file("data.pcl", &wc).unwrap();

    {
        let mut guard = cache.allocate_new_page(file_id, &wc, Some(Lsn(1))).unwrap();
        assert_eq!(guard.page_key().page_index, 0);
        guard.as_mut_slice()[PAYLOAD..PAYLOAD + 3].copy_from_slice(&[1, 2, 3]);
        guard.mark_changed();
    }

    {
        let mut guard = cache
            .load_for_write(file_id, 0, &wc, true, Some(Lsn(2)))
            .unwrap();
        assert_eq!(&guard.as_slice()[PAYLOAD..PAYLOAD + 3], &[1, 2, 3]);
        guard.as_mut_slice()[PAYLOAD + 3] = 4;
        guard.mark_changed();
    }

    let guard = cache.load_for_read(file_id, 0, &wc, true).unwrap();
    assert_eq!(&guard.as_slice()[PAYLOAD..PAYLOAD + 4], &[1, 2, 3, 4]);
}

#[test]
fn test_read_sees_latest_changed_release() {
    let (cache, wc, _dir) = create_cache(8);
    let file_id = cache.add_file("data.pcl", &wc).unwrap();
    cache
        .allocate_new_page(file_id, &wc, None)
        .unwrap()
        .mark_changed();

    for value in 1..=5u8 {
        let mut guard = cache.load_for_write(file_id, 0, &wc, false, None).unwrap();
        guard.as_mut_slice()[PAYLOAD] = value;
        guard.mark_changed();
        drop(guard);

        let guard = cache.load_for_read(file_id, 0, &wc, false).unwrap();
        assert_eq!(guard.as_slice()[PAYLOAD], value);
    }
}

#[test]
fn test_unchanged_write_release_is_not_persisted() {
    let (cache, wc, _dir) = create_cache(8);
    let file_id = cache.add_file("data.pcl", &wc).unwrap();

    {
        let mut guard = cache.allocate_new_page(file_id, &wc, None).unwrap();
        guard.as_mut_slice()[PAYLOAD] = 0x42;
        guard.mark_changed();
    }
    cache.close_storage(&wc).unwrap();

    // Mutate without mark_changed: the release must not advance anything.
    let wc = FileWriteCache::open(_dir.path()).unwrap();
    let file_id = cache.add_file("data.pcl", &wc).unwrap();
    {
        let mut guard = cache.load_for_write(file_id, 0, &wc, false, None).unwrap();
        guard.as_mut_slice()[PAYLOAD] = 0x99;
    }
    cache.close_storage(&wc).unwrap();

    let wc = FileWriteCache::open(_dir.path()).unwrap();
    let file_id = cache.add_file("data.pcl", &wc).unwrap();
    let guard = cache.load_for_read(file_id, 0, &wc, true).unwrap();
    assert_eq!(guard.as_slice()[PAYLOAD], 0x42);
}

#[test]
fn test_pinned_pages_survive_memory_pressure() {
    let (cache, wc, _dir) = create_cache(2);
    let file_id = cache.add_file("data.pcl", &wc).unwrap();

    for i in 0..6u8 {
        let mut guard = cache.allocate_new_page(file_id, &wc, None).unwrap();
        guard.as_mut_slice()[PAYLOAD] = i;
        guard.mark_changed();
    }

    // Pin two pages, then churn through the rest to force eviction.
    let pinned0 = cache.load_for_read(file_id, 0, &wc, false).unwrap();
    let pinned1 = cache.load_for_read(file_id, 1, &wc, false).unwrap();

    for round in 0..3 {
        for i in 2..6u64 {
            let guard = cache.load_for_read(file_id, i, &wc, false).unwrap();
            assert_eq!(guard.as_slice()[PAYLOAD], i as u8, "round {round}");
        }
    }

    assert!(cache.stats().snapshot().evictions > 0);

    // The pinned entries were never frozen and still serve their content.
    assert!(pinned0.entry().is_alive());
    assert!(pinned1.entry().is_alive());
    assert_eq!(pinned0.as_slice()[PAYLOAD], 0);
    assert_eq!(pinned1.as_slice()[PAYLOAD], 1);
}

#[test]
fn test_memory_budget_bounds_resident_pages() {
    let budget_pages = 4u64;
    let (cache, wc, _dir) = create_cache(budget_pages);
    let file_id = cache.add_file("data.pcl", &wc).unwrap();

    for _ in 0..12 {
        cache
            .allocate_new_page(file_id, &wc, None)
            .unwrap()
            .mark_changed();
    }

    for i in 0..12u64 {
        let guard = cache.load_for_read(file_id, i, &wc, false).unwrap();
        drop(guard);

        // Steady state stays within the budget plus the page being admitted.
        assert!(cache.resident_page_count() <= budget_pages + 1);
        assert!(cache.used_memory() <= (budget_pages + 1) * PAGE_SIZE as u64);
    }
}

#[test]
fn test_eviction_flushes_dirty_page() {
    let (cache, wc, _dir) = create_cache(1);
    let file_id = cache.add_file("data.pcl", &wc).unwrap();

    {
        let mut guard = cache.allocate_new_page(file_id, &wc, Some(Lsn(1))).unwrap();
        guard.as_mut_slice()[PAYLOAD] = 0x42;
        guard.mark_changed();
    }

    // Admitting a second page evicts the first, which must flush.
    cache
        .allocate_new_page(file_id, &wc, Some(Lsn(2)))
        .unwrap()
        .mark_changed();

    let snapshot = cache.stats().snapshot();
    assert!(snapshot.evictions >= 1);
    assert!(snapshot.pages_written >= 1);

    let guard = cache.load_for_read(file_id, 0, &wc, true).unwrap();
    assert_eq!(guard.as_slice()[PAYLOAD], 0x42);
}

/// Write cache wrapper that counts page loads.
struct CountingWriteCache {
    inner: FileWriteCache,
    loads: AtomicU64,
}

impl WriteCache for CountingWriteCache {
    fn add_file(&self, name: &str) -> pagepool::Result<FileId> {
        self.inner.add_file(name)
    }
    fn add_file_with_id(&self, name: &str, file_id: FileId) -> pagepool::Result<FileId> {
        self.inner.add_file_with_id(name, file_id)
    }
    fn load_page(
        &self,
        file_id: FileId,
        page_index: u64,
        verify_checksum: bool,
    ) -> pagepool::Result<Option<Box<Page>>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        self.inner.load_page(file_id, page_index, verify_checksum)
    }
    fn flush_page(
        &self,
        file_id: FileId,
        page_index: u64,
        page: &Page,
        lsn: Option<Lsn>,
    ) -> pagepool::Result<()> {
        self.inner.flush_page(file_id, page_index, page, lsn)
    }
    fn allocate_new_page(&self, file_id: FileId) -> pagepool::Result<u64> {
        self.inner.allocate_new_page(file_id)
    }
    fn file_page_count(&self, file_id: FileId) -> pagepool::Result<u64> {
        self.inner.file_page_count(file_id)
    }
    fn file_name(&self, file_id: FileId) -> Option<String> {
        self.inner.file_name(file_id)
    }
    fn files(&self) -> Vec<FileId> {
        self.inner.files()
    }
    fn truncate_file(&self, file_id: FileId) -> pagepool::Result<()> {
        self.inner.truncate_file(file_id)
    }
    fn delete_file(&self, file_id: FileId) -> pagepool::Result<()> {
        self.inner.delete_file(file_id)
    }
    fn close_file(&self, file_id: FileId, flush: bool) -> pagepool::Result<()> {
        self.inner.close_file(file_id, flush)
    }
    fn close(&self) -> pagepool::Result<()> {
        self.inner.close()
    }
    fn delete(&self) -> pagepool::Result<()> {
        self.inner.delete()
    }
}

#[test]
fn test_concurrent_fault_loads_page_once() {
    let dir = tempdir().unwrap();
    let wc = Arc::new(CountingWriteCache {
        inner: FileWriteCache::open(dir.path()).unwrap(),
        loads: AtomicU64::new(0),
    });
    let cache = Arc::new(ReadCache::new(CacheConfig::default()));

    let file_id = cache.add_file("data.pcl", wc.as_ref()).unwrap();
    cache
        .allocate_new_page(file_id, wc.as_ref(), None)
        .unwrap()
        .mark_changed();
    cache.close_storage(wc.as_ref()).unwrap();

    // Reopen so page 0 is not resident, then race two readers at it.
    let wc = Arc::new(CountingWriteCache {
        inner: FileWriteCache::open(dir.path()).unwrap(),
        loads: AtomicU64::new(0),
    });
    let file_id = cache.add_file("data.pcl", wc.as_ref()).unwrap();

    let barrier = Arc::new(Barrier::new(2));
    let mut handles = vec![];
    for _ in 0..2 {
        let cache = Arc::clone(&cache);
        let wc = Arc::clone(&wc);
        let barrier = Arc::clone(&barrier);
        handles.push(thread::spawn(move || {
            barrier.wait();
            let guard = cache
                .load_for_read(file_id, 0, wc.as_ref(), false)
                .unwrap();
            let entry_ptr = Arc::as_ptr(guard.entry()) as usize;
            barrier.wait(); // both guards alive at this point
            entry_ptr
        }));
    }

    let pointers: Vec<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(pointers[0], pointers[1], "both readers share one entry");
    assert_eq!(wc.loads.load(Ordering::SeqCst), 1);
}

#[test]
fn test_load_never_allocated_page_fails() {
    let (cache, wc, _dir) = create_cache(8);
    let file_id = cache.add_file("data.pcl", &wc).unwrap();

    assert!(matches!(
        cache.load_for_read(file_id, 0, &wc, false),
        Err(Error::PageNotFound { .. })
    ));
    assert!(matches!(
        cache.load_for_write(file_id, 7, &wc, false, None),
        Err(Error::PageNotFound { .. })
    ));
}

#[test]
fn test_silent_load_missing_page_returns_none() {
    let (cache, wc, _dir) = create_cache(8);
    let file_id = cache.add_file("data.pcl", &wc).unwrap();

    assert!(cache
        .silent_load_for_read(file_id, 0, &wc, false)
        .unwrap()
        .is_none());
}

#[test]
fn test_silent_load_does_not_admit_transient_pages() {
    let (cache, wc, _dir) = create_cache(8);
    let file_id = cache.add_file("data.pcl", &wc).unwrap();
    {
        let mut guard = cache.allocate_new_page(file_id, &wc, None).unwrap();
        guard.as_mut_slice()[PAYLOAD] = 0x7A;
        guard.mark_changed();
    }
    cache.close_storage(&wc).unwrap();

    let wc = FileWriteCache::open(_dir.path()).unwrap();
    let file_id = cache.add_file("data.pcl", &wc).unwrap();
    assert_eq!(cache.resident_page_count(), 0);

    let free_before = cache.free_buffer_count();
    {
        let guard = cache
            .silent_load_for_read(file_id, 0, &wc, true)
            .unwrap()
            .unwrap();
        assert_eq!(guard.as_slice()[PAYLOAD], 0x7A);
        assert_eq!(cache.resident_page_count(), 0);
    }

    // The transient buffer went back to the shared pool on release.
    assert_eq!(cache.free_buffer_count(), free_before + 1);
}

#[test]
fn test_checksum_mismatch_fails_verified_load_only() {
    let (cache, wc, dir) = create_cache(8);
    let file_id = cache.add_file("data.pcl", &wc).unwrap();
    {
        let mut guard = cache.allocate_new_page(file_id, &wc, None).unwrap();
        guard.as_mut_slice()[PAYLOAD] = 0x10;
        guard.mark_changed();
    }
    cache.close_storage(&wc).unwrap();

    // Flip a payload byte directly on disk.
    {
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .open(dir.path().join("data.pcl"))
            .unwrap();
        file.seek(SeekFrom::Start(PAYLOAD as u64)).unwrap();
        file.write_all(&[0x11]).unwrap();
        file.sync_data().unwrap();
    }

    let wc = FileWriteCache::open(dir.path()).unwrap();
    let file_id = cache.add_file("data.pcl", &wc).unwrap();

    assert!(matches!(
        cache.load_for_read(file_id, 0, &wc, true),
        Err(Error::ChecksumMismatch { .. })
    ));

    // The corrupted page never entered the working set.
    assert_eq!(cache.resident_page_count(), 0);

    // A verification scan reports the same page as a finding instead.
    let errors = wc.check_stored_pages().unwrap();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].incorrect_checksum);
    assert!(!errors[0].incorrect_magic_number);
    assert_eq!(errors[0].page_index, 0);

    // An unverified load still trusts the resident bytes.
    let guard = cache.load_for_read(file_id, 0, &wc, false).unwrap();
    assert_eq!(guard.as_slice()[PAYLOAD], 0x11);
}

#[test]
fn test_truncate_discards_resident_content() {
    let (cache, wc, _dir) = create_cache(8);
    let file_id = cache.add_file("data.pcl", &wc).unwrap();
    {
        let mut guard = cache.allocate_new_page(file_id, &wc, None).unwrap();
        guard.as_mut_slice()[PAYLOAD] = 0xEE;
        guard.mark_changed();
    }

    cache.truncate_file(file_id, &wc).unwrap();

    assert_eq!(cache.resident_page_count(), 0);
    assert_eq!(wc.file_page_count(file_id).unwrap(), 0);
    assert!(matches!(
        cache.load_for_read(file_id, 0, &wc, false),
        Err(Error::PageNotFound { .. })
    ));
}

#[test]
fn test_close_file_flushes_dirty_pages() {
    let (cache, wc, _dir) = create_cache(8);
    let file_id = cache.add_file("data.pcl", &wc).unwrap();
    {
        let mut guard = cache.allocate_new_page(file_id, &wc, None).unwrap();
        guard.as_mut_slice()[PAYLOAD] = 0x55;
        guard.mark_changed();
    }

    cache.close_file(file_id, true, &wc).unwrap();
    assert_eq!(cache.resident_page_count(), 0);

    let file_id = cache.add_file("data.pcl", &wc).unwrap();
    let guard = cache.load_for_read(file_id, 0, &wc, true).unwrap();
    assert_eq!(guard.as_slice()[PAYLOAD], 0x55);
}

#[test]
fn test_teardown_with_pinned_page_fails() {
    let (cache, wc, _dir) = create_cache(8);
    let file_id = cache.add_file("data.pcl", &wc).unwrap();
    cache
        .allocate_new_page(file_id, &wc, None)
        .unwrap()
        .mark_changed();

    let _pin = cache.load_for_read(file_id, 0, &wc, false).unwrap();

    assert!(matches!(
        cache.close_file(file_id, true, &wc),
        Err(Error::PageIsUsed { .. })
    ));
    assert!(matches!(
        cache.truncate_file(file_id, &wc),
        Err(Error::PageIsUsed { .. })
    ));
}

#[test]
fn test_file_id_reuse_sees_no_stale_buffers() {
    let (cache, wc, _dir) = create_cache(8);
    let file_id = cache.add_file("a.pcl", &wc).unwrap();
    {
        let mut guard = cache.allocate_new_page(file_id, &wc, None).unwrap();
        guard.as_mut_slice()[PAYLOAD] = 0xAA;
        guard.mark_changed();
    }

    cache.delete_file(file_id, &wc).unwrap();

    // Recycle the same id for a different file: the old resident page must
    // not resurface.
    let reused = cache.add_file_with_id("b.pcl", file_id, &wc).unwrap();
    assert_eq!(reused, file_id);
    assert!(matches!(
        cache.load_for_read(file_id, 0, &wc, false),
        Err(Error::PageNotFound { .. })
    ));
}

#[test]
fn test_delete_storage_removes_everything() {
    let (cache, wc, dir) = create_cache(8);
    let a = cache.add_file("a.pcl", &wc).unwrap();
    let b = cache.add_file("b.pcl", &wc).unwrap();
    cache.allocate_new_page(a, &wc, None).unwrap().mark_changed();
    cache.allocate_new_page(b, &wc, None).unwrap().mark_changed();

    cache.delete_storage(&wc).unwrap();

    assert_eq!(cache.resident_page_count(), 0);
    assert!(wc.files().is_empty());
    assert!(!dir.path().join("a.pcl").exists());
    assert!(!dir.path().join("b.pcl").exists());
}

#[test]
fn test_shrinking_budget_evicts_on_next_admission() {
    let (cache, wc, _dir) = create_cache(8);
    let file_id = cache.add_file("data.pcl", &wc).unwrap();
    for _ in 0..6 {
        cache
            .allocate_new_page(file_id, &wc, None)
            .unwrap()
            .mark_changed();
    }
    assert_eq!(cache.resident_page_count(), 6);

    // Shrinking alone changes nothing; the next admission enforces it.
    cache.set_maximum_memory(2 * PAGE_SIZE as u64);
    assert_eq!(cache.resident_page_count(), 6);

    cache
        .allocate_new_page(file_id, &wc, None)
        .unwrap()
        .mark_changed();

    assert!(cache.used_memory() <= 3 * PAGE_SIZE as u64);
}

#[test]
fn test_usage_counter_tracks_guard_nesting() {
    let (cache, wc, _dir) = create_cache(8);
    let file_id = cache.add_file("data.pcl", &wc).unwrap();
    cache
        .allocate_new_page(file_id, &wc, None)
        .unwrap()
        .mark_changed();

    let g1 = cache.load_for_read(file_id, 0, &wc, false).unwrap();
    assert_eq!(g1.entry().usages_count(), 1);

    let g2 = cache.load_for_read(file_id, 0, &wc, false).unwrap();
    assert_eq!(g1.entry().usages_count(), 2);

    drop(g2);
    assert_eq!(g1.entry().usages_count(), 1);
    drop(g1);
}

#[test]
fn test_stats_track_hits_and_misses() {
    let (cache, wc, _dir) = create_cache(8);
    let file_id = cache.add_file("data.pcl", &wc).unwrap();
    cache
        .allocate_new_page(file_id, &wc, None)
        .unwrap()
        .mark_changed();
    cache.close_storage(&wc).unwrap();

    let wc = FileWriteCache::open(_dir.path()).unwrap();
    let file_id = cache.add_file("data.pcl", &wc).unwrap();

    let before = cache.stats().snapshot();
    drop(cache.load_for_read(file_id, 0, &wc, false).unwrap());
    drop(cache.load_for_read(file_id, 0, &wc, false).unwrap());
    drop(cache.load_for_read(file_id, 0, &wc, false).unwrap());
    let after = cache.stats().snapshot();

    assert_eq!(after.cache_misses - before.cache_misses, 1);
    assert_eq!(after.cache_hits - before.cache_hits, 2);
}
