//! The write cache contract consumed by the page cache.

use crate::common::{FileId, Lsn, Result};
use crate::storage::Page;

/// Physical page I/O behind the read cache.
///
/// The read cache treats this as its only route to disk: bytes come in
/// through [`load_page`](WriteCache::load_page) on a fault and go out through
/// [`flush_page`](WriteCache::flush_page) when a dirty page is evicted or a
/// file is flushed on close. Implementations own file registration, the
/// on-disk layout, and durability of individual writes; the read cache owns
/// which pages are resident and when they get written back.
///
/// All methods take `&self`; implementations synchronize internally.
pub trait WriteCache: Send + Sync {
    /// Register a file under the given name, creating it if needed.
    /// Registering an already-registered name returns its existing id.
    fn add_file(&self, name: &str) -> Result<FileId>;

    /// Register a file under a caller-chosen id (used by restore paths that
    /// must reproduce historical ids). Fails if the id is taken.
    fn add_file_with_id(&self, name: &str, file_id: FileId) -> Result<FileId>;

    /// Read one page. Returns `Ok(None)` when the index lies beyond the end
    /// of the file. With `verify_checksum`, a failed magic-number or
    /// checksum check fails the load.
    fn load_page(
        &self,
        file_id: FileId,
        page_index: u64,
        verify_checksum: bool,
    ) -> Result<Option<Box<Page>>>;

    /// Write one page durably. `lsn` is the page's durability watermark; the
    /// caller guarantees the WAL is persisted up to it before flushing.
    fn flush_page(
        &self,
        file_id: FileId,
        page_index: u64,
        page: &Page,
        lsn: Option<Lsn>,
    ) -> Result<()>;

    /// Extend the file by one zeroed page, returning the new page index.
    fn allocate_new_page(&self, file_id: FileId) -> Result<u64>;

    /// Number of pages currently in the file.
    fn file_page_count(&self, file_id: FileId) -> Result<u64>;

    /// Name the file was registered under, if it is registered.
    fn file_name(&self, file_id: FileId) -> Option<String>;

    /// Ids of all registered files.
    fn files(&self) -> Vec<FileId>;

    /// Drop all pages of the file, keeping it registered.
    fn truncate_file(&self, file_id: FileId) -> Result<()>;

    /// Unregister the file and remove it from disk.
    fn delete_file(&self, file_id: FileId) -> Result<()>;

    /// Unregister the file, optionally syncing it to disk first.
    fn close_file(&self, file_id: FileId, flush: bool) -> Result<()>;

    /// Sync and unregister every file.
    fn close(&self) -> Result<()>;

    /// Remove every registered file from disk.
    fn delete(&self) -> Result<()>;
}
