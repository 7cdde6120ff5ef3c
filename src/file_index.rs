//! An ordered map from a data file's `headId` to its [`FileInfo`], giving
//! O(log n) lookup of "which file holds item `id`" (spec §3, §4.C).

use std::{collections::BTreeMap, path::PathBuf};

/// Metadata about one data file containing a contiguous range of item IDs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileInfo {
    pub path: PathBuf,
    /// Smallest item ID in the file.
    pub head_id: u64,
    /// Largest item ID in the file. For a freshly-rotated, still-empty
    /// active file this is `head_id - 1`.
    pub tail_id: u64,
    pub items: u64,
    pub bytes: u64,
}

impl FileInfo {
    pub fn is_empty(&self) -> bool {
        self.items == 0
    }
}

/// Invariants upheld by every mutation: keys strictly increasing; adjacent
/// entries `(h1, f1)`, `(h2, f2)` satisfy `f1.tail_id < h2` and
/// `h2 == f1.tail_id + 1` (no gaps, no overlap), except that the very last
/// entry may be a transiently-empty just-rotated file.
#[derive(Clone, Debug, Default)]
pub struct FileIndex {
    files: BTreeMap<u64, FileInfo>,
}

impl FileIndex {
    pub fn new() -> Self {
        Self {
            files: BTreeMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// The file whose `[head_id, tail_id]` range contains `id`, found as the
    /// entry with the largest key `<= id`.
    pub fn file_info_for_id(&self, id: u64) -> Option<&FileInfo> {
        self.files.range(..=id).next_back().map(|(_, info)| info)
    }

    /// All entries with `head_id >= id`, in key order.
    pub fn file_infos_after(&self, id: u64) -> impl Iterator<Item = &FileInfo> {
        self.files.range(id..).map(|(_, info)| info)
    }

    /// Smallest `head_id` in the index, or 0 if empty.
    pub fn earliest_head(&self) -> u64 {
        self.files.keys().next().copied().unwrap_or(0)
    }

    /// The entry with the largest key, if any — the active writer file.
    pub fn last(&self) -> Option<&FileInfo> {
        self.files.values().next_back()
    }

    pub fn insert(&mut self, info: FileInfo) {
        self.files.insert(info.head_id, info);
    }

    pub fn remove(&mut self, head_id: u64) -> Option<FileInfo> {
        self.files.remove(&head_id)
    }

    /// Replaces the entry with the largest key with `info` (keyed by
    /// `info.head_id`), used to keep the active file's counters current as
    /// writes land, and during rotation.
    pub fn replace_last(&mut self, info: FileInfo) {
        if let Some((&last_key, _)) = self.files.iter().next_back() {
            self.files.remove(&last_key);
        }
        self.files.insert(info.head_id, info);
    }

    /// All entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = &FileInfo> {
        self.files.values()
    }

    /// The longest prefix of entries whose `head_id <= max_head`, excluding
    /// the very last matching entry (used by `checkOldFiles`, which never
    /// removes the file adjacent to live data).
    pub fn gc_candidates(&self, max_head: u64) -> Vec<FileInfo> {
        let matching: Vec<&FileInfo> = self
            .files
            .values()
            .take_while(|info| info.head_id <= max_head)
            .collect();

        if matching.len() <= 1 {
            return Vec::new();
        }

        matching[..matching.len() - 1]
            .iter()
            .map(|&info| info.clone())
            .collect()
    }
}
