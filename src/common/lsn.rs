//! Log sequence number.

use std::fmt;

/// Position in the write-ahead log, used by the cache purely as an ordered
/// watermark versioning page content. The cache never interprets its value;
/// it only compares and forwards it to the write cache on flush.
///
/// "No position" is modeled as `Option<Lsn>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Lsn(pub u64);

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lsn({})", self.0)
    }
}
