//! Page - the fundamental 4KB unit of storage.
//!
//! A [`Page`] is a raw 4KB byte array, the unit of I/O between disk and
//! memory and the unit of caching in the page pool.

use crate::common::config::PAGE_SIZE;

/// A page of data (4KB, 4KB-aligned).
///
/// The cache hands out pages through lock-holding guards; the write cache
/// reads and writes them wholesale. Content is opaque to both except for the
/// on-disk header stamped at flush time (see [`crate::storage::page_header`]).
///
/// # Memory Layout
/// - Size: 4096 bytes
/// - Alignment: 4096 bytes (for efficient Direct I/O with O_DIRECT)
///
/// `Page` does not implement `Clone` outside tests; copying 4KB should be
/// explicit.
#[repr(align(4096))]
pub struct Page {
    data: [u8; PAGE_SIZE],
}

impl Page {
    /// Create a new zeroed page.
    #[inline]
    pub fn new() -> Self {
        Self {
            data: [0u8; PAGE_SIZE],
        }
    }

    /// Create a new zeroed page on the heap.
    ///
    /// Cache buffers live behind `Box` so they can move between the free
    /// pool and cache entries without copying.
    #[inline]
    pub fn boxed() -> Box<Self> {
        Box::new(Self::new())
    }

    /// Get immutable slice of page data.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Get mutable slice of page data.
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Zero out the entire page.
    pub fn reset(&mut self) {
        self.data.fill(0);
    }

    /// Get the size of a page.
    #[inline]
    pub const fn size() -> usize {
        PAGE_SIZE
    }

    /// Copy the full content of another page into this one.
    pub fn copy_from(&mut self, other: &Page) {
        self.data.copy_from_slice(&other.data);
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
impl Clone for Page {
    fn clone(&self) -> Self {
        let mut page = Page::new();
        page.data.copy_from_slice(&self.data);
        page
    }
}
