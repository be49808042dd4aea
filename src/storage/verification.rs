//! Corruption findings reported by the storage verification scan.

/// One corrupted page found by a full-file verification scan.
///
/// Scans collect these as data instead of failing on the first bad page, so
/// a consistency-check command can report every finding in one pass.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PageDataVerificationError {
    pub file_name: String,
    pub page_index: u64,
    pub incorrect_magic_number: bool,
    pub incorrect_checksum: bool,
}
