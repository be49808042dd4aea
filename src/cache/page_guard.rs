//! RAII guards for page access.
//!
//! A guard witnesses three things at once: the entry is acquired (pinned),
//! the matching page lock is held, and exactly one release will happen, on
//! every exit path, when the guard drops. This is what makes a leaked pin
//! impossible through the public API.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use crate::cache::entry::CacheEntry;
use crate::cache::read_cache::ReadCache;
use crate::common::PageKey;
use crate::storage::Page;

/// Shared read access to one cached page.
///
/// Multiple read guards for the same page may exist at once. Dropping the
/// guard releases the shared lock and the entry reference.
pub struct PageReadGuard<'a> {
    cache: &'a ReadCache,
    entry: Arc<CacheEntry>,
}

impl<'a> PageReadGuard<'a> {
    /// Called with the entry acquired and its shared lock held.
    pub(crate) fn new(cache: &'a ReadCache, entry: Arc<CacheEntry>) -> Self {
        Self { cache, entry }
    }

    #[inline]
    pub fn page_key(&self) -> PageKey {
        self.entry.page_key()
    }

    /// The underlying cache entry, mainly for diagnostics and tests.
    #[inline]
    pub fn entry(&self) -> &Arc<CacheEntry> {
        &self.entry
    }
}

impl Deref for PageReadGuard<'_> {
    type Target = Page;

    #[inline]
    fn deref(&self) -> &Page {
        // The guard holds the shared lock for its whole lifetime.
        unsafe { self.entry.pointer().buffer() }
    }
}

impl Drop for PageReadGuard<'_> {
    fn drop(&mut self) {
        self.cache.release_from_read(&self.entry);
    }
}

/// Exclusive write access to one cached page.
///
/// Call [`mark_changed`](Self::mark_changed) after mutating the content;
/// only a changed release marks the page dirty and advances its durability
/// watermark. Releasing unchanged is how speculative write loads back off
/// without forcing a write-back (a freshly allocated page is written back
/// regardless, so it reaches disk at least once).
pub struct PageWriteGuard<'a> {
    cache: &'a ReadCache,
    entry: Arc<CacheEntry>,
    changed: bool,
}

impl<'a> PageWriteGuard<'a> {
    /// Called with the entry acquired and its exclusive lock held.
    pub(crate) fn new(cache: &'a ReadCache, entry: Arc<CacheEntry>) -> Self {
        Self {
            cache,
            entry,
            changed: false,
        }
    }

    #[inline]
    pub fn page_key(&self) -> PageKey {
        self.entry.page_key()
    }

    /// The underlying cache entry, mainly for diagnostics and tests.
    #[inline]
    pub fn entry(&self) -> &Arc<CacheEntry> {
        &self.entry
    }

    /// Record that the page content was modified under this guard.
    #[inline]
    pub fn mark_changed(&mut self) {
        self.changed = true;
    }
}

impl Deref for PageWriteGuard<'_> {
    type Target = Page;

    #[inline]
    fn deref(&self) -> &Page {
        // The guard holds the exclusive lock for its whole lifetime.
        unsafe { self.entry.pointer().buffer() }
    }
}

impl DerefMut for PageWriteGuard<'_> {
    #[inline]
    fn deref_mut(&mut self) -> &mut Page {
        // The guard holds the exclusive lock for its whole lifetime.
        unsafe { self.entry.pointer().buffer_mut() }
    }
}

impl Drop for PageWriteGuard<'_> {
    fn drop(&mut self) {
        self.cache.release_from_write(&self.entry, self.changed);
    }
}
