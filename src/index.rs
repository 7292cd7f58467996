//! The in-memory index: key -> location of its most recent live record.

use std::collections::HashMap;

/// Where a key's most recent non-tombstone record lives.
///
/// `value_pos` is the offset of the *start of the record* (not just the
/// value), so a `read_record` call positioned there can decode it directly.
/// `value_size` is the encoded length of the value portion alone, used only
/// as a live-size estimator by `compaction_stats`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub file_id: u32,
    pub value_size: u32,
    pub value_pos: u64,
    pub timestamp: u64,
}

/// Key -> location. At most one entry per key; the entry always names the
/// most recent non-tombstone record.
pub type Index = HashMap<Vec<u8>, IndexEntry>;
