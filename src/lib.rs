//! pagepool - a concurrent disk page cache for database storage engines.
//!
//! # Architecture
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │              record / transaction / SQL layers             │
//! └──────────────────────────────┬─────────────────────────────┘
//!                                │ load_for_read / load_for_write
//! ┌──────────────────────────────▼─────────────────────────────┐
//! │                   ReadCache   (cache/)                     │
//! │   PageKey → CacheEntry  [pin refcount + page lock + LRU]   │
//! │   memory budget · eviction · checksum-verified fault-in    │
//! └──────────────────────────────┬─────────────────────────────┘
//!                                │ load_page / flush_page
//! ┌──────────────────────────────▼─────────────────────────────┐
//! │              WriteCache trait   (storage/)                 │
//! │        FileWriteCache: one OS file per database file       │
//! │        magic + CRC32 page header stamped on flush          │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//! - [`common`] - shared primitives (`PageKey`, `Lsn`, errors, config)
//! - [`cache`] - the buffer pool: entries, guards, eviction, stats
//! - [`storage`] - physical page I/O and the on-disk page header
//!
//! # Quick Start
//! ```no_run
//! use pagepool::{CacheConfig, FileWriteCache, ReadCache};
//!
//! let write_cache = FileWriteCache::open("mydb").unwrap();
//! let cache = ReadCache::new(CacheConfig::default());
//!
//! let file_id = cache.add_file("users.pcl", &write_cache).unwrap();
//! let mut page = cache.allocate_new_page(file_id, &write_cache, None).unwrap();
//! page.as_mut_slice()[0] = 0xAB;
//! page.mark_changed();
//! drop(page);
//!
//! cache.close_storage(&write_cache).unwrap();
//! ```

pub mod cache;
pub mod common;
pub mod storage;

// Re-export the primary API at the crate root.
pub use common::config::PAGE_SIZE;
pub use common::{CacheConfig, Error, FileId, Lsn, PageKey, Result};

pub use cache::{
    CacheEntry, CachePointer, CacheStats, PagePool, PageReadGuard, PageWriteGuard, ReadCache,
    StatsSnapshot,
};
pub use storage::{FileWriteCache, Page, PageDataVerificationError, WriteCache};
