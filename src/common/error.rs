//! Error types for pagepool.

use thiserror::Error;

use crate::common::FileId;

/// Convenient Result type alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// All recoverable failures of the page cache and its physical backend.
///
/// Lifecycle misuse (double release, killing a live entry, publishing the
/// same page twice) is not represented here; those are bugs in the caller
/// and panic instead.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from the underlying file operations.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The requested page lies beyond the end of the file.
    #[error("page {page_index} not found in file {file_id}")]
    PageNotFound { file_id: FileId, page_index: u64 },

    /// The file id is not registered in the write cache.
    #[error("{0} is not registered in the write cache")]
    FileNotRegistered(FileId),

    /// An explicit file id registration collided with an existing one.
    #[error("{0} is already registered in the write cache")]
    FileIdInUse(FileId),

    /// Page content failed magic-number or checksum verification on load.
    #[error("page {page_index} of file '{file_name}' failed verification")]
    ChecksumMismatch { file_name: String, page_index: u64 },

    /// A file teardown found a page that is still pinned by a caller.
    #[error("page {page_index} of file {file_id} is in use and cannot be removed")]
    PageIsUsed { file_id: FileId, page_index: u64 },

    /// The cache configuration could not be parsed.
    #[error("invalid cache configuration: {0}")]
    Config(String),
}
