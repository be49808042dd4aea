//! Configuration for pagepool.

use byte_unit::Byte;
use serde::{Deserialize, Serialize};

use crate::common::{Error, Result};

/// Size of a page in bytes (4KB).
///
/// Matches the OS page size on most systems; pages are aligned to this value
/// so buffers stay compatible with Direct I/O (O_DIRECT).
pub const PAGE_SIZE: usize = 4096;

const DEFAULT_MAX_MEMORY: u64 = 32 * 1024 * 1024;

/// Cache tuning knobs, loadable from TOML.
///
/// Only the memory budget lives here; the page size is a storage-wide
/// constant because on-disk layout depends on it.
///
/// ```
/// use pagepool::CacheConfig;
///
/// let config = CacheConfig::from_toml("max_memory = \"8 MiB\"").unwrap();
/// assert_eq!(config.max_memory_bytes(), 8 * 1024 * 1024);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Upper bound for resident page memory. The cache may briefly overshoot
    /// by one page while admitting a new one.
    max_memory: Byte,
}

impl Default for CacheConfig {
    #[inline]
    fn default() -> Self {
        CacheConfig {
            max_memory: Byte::from_u64(DEFAULT_MAX_MEMORY),
        }
    }
}

impl CacheConfig {
    /// Parse a configuration from a TOML document.
    pub fn from_toml(input: &str) -> Result<Self> {
        toml::from_str(input).map_err(|e| Error::Config(e.to_string()))
    }

    #[inline]
    pub fn max_memory<T>(mut self, max_memory: T) -> Self
    where
        Byte: From<T>,
    {
        self.max_memory = Byte::from(max_memory);
        self
    }

    #[inline]
    pub fn max_memory_bytes(&self) -> u64 {
        self.max_memory.as_u64()
    }
}
