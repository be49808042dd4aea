//! File-backed write cache - physical page I/O for registered database files.
//!
//! [`FileWriteCache`] keeps one OS file per registered database file under a
//! common root directory, with pages laid out sequentially:
//!
//! ```text
//! ┌─────────┬─────────┬─────────┬─────────┐
//! │ Page 0  │ Page 1  │ Page 2  │  ...    │
//! │ (4KB)   │ (4KB)   │ (4KB)   │         │
//! └─────────┴─────────┴─────────┴─────────┘
//! Offset:  0      4096     8192
//! ```
//!
//! Every flush stamps the on-disk page header (magic number + CRC32) and
//! syncs the file, so a page that reaches disk is always verifiable.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::common::config::PAGE_SIZE;
use crate::common::{Error, FileId, Lsn, Result};
use crate::storage::page_header::{stamp_page, verify_page};
use crate::storage::{Page, PageDataVerificationError, WriteCache};

struct FileState {
    file: File,
    name: String,
    page_count: u64,
}

struct Registry {
    by_id: HashMap<FileId, Arc<Mutex<FileState>>>,
    by_name: HashMap<String, FileId>,
    next_file_id: u64,
}

/// Synchronous, multi-file write cache.
///
/// # Thread Safety
/// The registry is behind a `RwLock` so lookups stay cheap; each file has
/// its own mutex so I/O on different files proceeds in parallel while the
/// registry lock is already released.
pub struct FileWriteCache {
    root: PathBuf,
    registry: RwLock<Registry>,
}

impl FileWriteCache {
    /// Open a write cache rooted at the given directory, creating it if
    /// needed. Files registered later live directly under this root.
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;

        Ok(Self {
            root,
            registry: RwLock::new(Registry {
                by_id: HashMap::new(),
                by_name: HashMap::new(),
                next_file_id: 1,
            }),
        })
    }

    fn open_backing_file(&self, name: &str) -> Result<(File, u64)> {
        let path = self.root.join(name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let page_count = file.metadata()?.len() / PAGE_SIZE as u64;
        Ok((file, page_count))
    }

    fn state(&self, file_id: FileId) -> Result<Arc<Mutex<FileState>>> {
        self.registry
            .read()
            .by_id
            .get(&file_id)
            .cloned()
            .ok_or(Error::FileNotRegistered(file_id))
    }

    /// Verify every page of every registered file, collecting one finding
    /// per corrupted page instead of failing on the first.
    pub fn check_stored_pages(&self) -> Result<Vec<PageDataVerificationError>> {
        let states: Vec<Arc<Mutex<FileState>>> =
            self.registry.read().by_id.values().cloned().collect();

        let mut errors = Vec::new();
        for state in states {
            let mut state = state.lock();
            let (name, page_count) = (state.name.clone(), state.page_count);

            for page_index in 0..page_count {
                let mut page = Page::boxed();
                read_page_at(&mut state.file, page_index, &mut page)?;

                let check = verify_page(&page);
                if !check.is_ok() {
                    warn!(
                        file = %name,
                        page_index,
                        magic_ok = check.magic_ok,
                        checksum_ok = check.checksum_ok,
                        "page failed verification"
                    );
                    errors.push(PageDataVerificationError {
                        file_name: name.clone(),
                        page_index,
                        incorrect_magic_number: !check.magic_ok,
                        incorrect_checksum: !check.checksum_ok,
                    });
                }
            }
        }

        Ok(errors)
    }
}

fn read_page_at(file: &mut File, page_index: u64, page: &mut Page) -> Result<()> {
    file.seek(SeekFrom::Start(page_index * PAGE_SIZE as u64))?;
    file.read_exact(page.as_mut_slice())?;
    Ok(())
}

fn write_page_at(file: &mut File, page_index: u64, page: &Page) -> Result<()> {
    file.seek(SeekFrom::Start(page_index * PAGE_SIZE as u64))?;
    file.write_all(page.as_slice())?;
    file.sync_data()?;
    Ok(())
}

impl WriteCache for FileWriteCache {
    fn add_file(&self, name: &str) -> Result<FileId> {
        let mut registry = self.registry.write();

        if let Some(&file_id) = registry.by_name.get(name) {
            return Ok(file_id);
        }

        let (file, page_count) = self.open_backing_file(name)?;
        let file_id = FileId(registry.next_file_id);
        registry.next_file_id += 1;

        debug!(file = name, %file_id, page_count, "registered file");
        registry.by_name.insert(name.to_string(), file_id);
        registry.by_id.insert(
            file_id,
            Arc::new(Mutex::new(FileState {
                file,
                name: name.to_string(),
                page_count,
            })),
        );

        Ok(file_id)
    }

    fn add_file_with_id(&self, name: &str, file_id: FileId) -> Result<FileId> {
        let mut registry = self.registry.write();

        if registry.by_id.contains_key(&file_id) {
            return Err(Error::FileIdInUse(file_id));
        }
        if let Some(&existing) = registry.by_name.get(name) {
            return Err(Error::FileIdInUse(existing));
        }

        let (file, page_count) = self.open_backing_file(name)?;
        registry.next_file_id = registry.next_file_id.max(file_id.0 + 1);

        debug!(file = name, %file_id, page_count, "registered file with explicit id");
        registry.by_name.insert(name.to_string(), file_id);
        registry.by_id.insert(
            file_id,
            Arc::new(Mutex::new(FileState {
                file,
                name: name.to_string(),
                page_count,
            })),
        );

        Ok(file_id)
    }

    fn load_page(
        &self,
        file_id: FileId,
        page_index: u64,
        verify_checksum: bool,
    ) -> Result<Option<Box<Page>>> {
        let state = self.state(file_id)?;
        let mut state = state.lock();

        if page_index >= state.page_count {
            return Ok(None);
        }

        let mut page = Page::boxed();
        read_page_at(&mut state.file, page_index, &mut page)?;

        if verify_checksum {
            let check = verify_page(&page);
            if !check.is_ok() {
                warn!(
                    file = %state.name,
                    page_index,
                    magic_ok = check.magic_ok,
                    checksum_ok = check.checksum_ok,
                    "refusing to load corrupted page"
                );
                return Err(Error::ChecksumMismatch {
                    file_name: state.name.clone(),
                    page_index,
                });
            }
        }

        Ok(Some(page))
    }

    fn flush_page(
        &self,
        file_id: FileId,
        page_index: u64,
        page: &Page,
        lsn: Option<Lsn>,
    ) -> Result<()> {
        let state = self.state(file_id)?;
        let mut state = state.lock();

        if page_index >= state.page_count {
            return Err(Error::PageNotFound {
                file_id,
                page_index,
            });
        }

        // Stamp a copy so the in-memory buffer keeps its payload-only view.
        let mut stamped = Page::boxed();
        stamped.copy_from(page);
        stamp_page(&mut stamped);

        write_page_at(&mut state.file, page_index, &stamped)?;
        debug!(file = %state.name, page_index, ?lsn, "flushed page");
        Ok(())
    }

    fn allocate_new_page(&self, file_id: FileId) -> Result<u64> {
        let state = self.state(file_id)?;
        let mut state = state.lock();

        let page_index = state.page_count;

        // Stamp even the initial zeroed image so verified loads of a page
        // that was allocated but never written back still pass.
        let mut page = Page::boxed();
        stamp_page(&mut page);
        write_page_at(&mut state.file, page_index, &page)?;

        state.page_count += 1;
        Ok(page_index)
    }

    fn file_page_count(&self, file_id: FileId) -> Result<u64> {
        Ok(self.state(file_id)?.lock().page_count)
    }

    fn file_name(&self, file_id: FileId) -> Option<String> {
        let registry = self.registry.read();
        registry.by_id.get(&file_id).map(|s| s.lock().name.clone())
    }

    fn files(&self) -> Vec<FileId> {
        self.registry.read().by_id.keys().copied().collect()
    }

    fn truncate_file(&self, file_id: FileId) -> Result<()> {
        let state = self.state(file_id)?;
        let mut state = state.lock();

        state.file.set_len(0)?;
        state.file.sync_data()?;
        state.page_count = 0;
        debug!(file = %state.name, "truncated file");
        Ok(())
    }

    fn delete_file(&self, file_id: FileId) -> Result<()> {
        let name = {
            let mut registry = self.registry.write();
            let state = registry
                .by_id
                .remove(&file_id)
                .ok_or(Error::FileNotRegistered(file_id))?;
            let name = state.lock().name.clone();
            registry.by_name.remove(&name);
            name
        };

        fs::remove_file(self.root.join(&name))?;
        debug!(file = %name, %file_id, "deleted file");
        Ok(())
    }

    fn close_file(&self, file_id: FileId, flush: bool) -> Result<()> {
        let state = {
            let mut registry = self.registry.write();
            let state = registry
                .by_id
                .remove(&file_id)
                .ok_or(Error::FileNotRegistered(file_id))?;
            let name = state.lock().name.clone();
            registry.by_name.remove(&name);
            state
        };

        if flush {
            state.lock().file.sync_all()?;
        }
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let mut registry = self.registry.write();

        for state in registry.by_id.values() {
            state.lock().file.sync_all()?;
        }
        registry.by_id.clear();
        registry.by_name.clear();
        Ok(())
    }

    fn delete(&self) -> Result<()> {
        let mut registry = self.registry.write();

        let names: Vec<String> = registry
            .by_id
            .values()
            .map(|s| s.lock().name.clone())
            .collect();
        registry.by_id.clear();
        registry.by_name.clear();
        drop(registry);

        for name in names {
            fs::remove_file(self.root.join(&name))?;
        }
        Ok(())
    }
}
