//! Journal configuration: where it lives on disk, how big files get, and
//! how aggressively it fsyncs. This is construction plumbing only — parsing
//! these values out of a config file or CLI flags is explicitly out of
//! scope for this crate.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

// Arbitrary but generous default; callers writing a real queue almost
// always override this.
pub const DEFAULT_MAX_FILE_SIZE: u64 = 16 * 1024 * 1024;
pub const DEFAULT_MAX_ITEM_SIZE: usize = 1024 * 1024;

/// Journal configuration, as produced by [`JournalConfigBuilder`].
#[derive(Clone, Debug)]
pub struct JournalConfig {
    pub(crate) queue_dir: PathBuf,
    pub(crate) queue_name: String,
    pub(crate) max_file_size: u64,
    pub(crate) max_item_size: usize,
    pub(crate) sync_journal: SyncPolicy,
    pub(crate) archive_dir: Option<PathBuf>,
}

impl JournalConfig {
    pub fn builder<P>(queue_dir: P, queue_name: impl Into<String>) -> JournalConfigBuilder
    where
        P: AsRef<Path>,
    {
        JournalConfigBuilder {
            queue_dir: queue_dir.as_ref().to_path_buf(),
            queue_name: queue_name.into(),
            max_file_size: None,
            max_item_size: None,
            sync_journal: None,
            archive_dir: None,
        }
    }

    pub fn queue_dir(&self) -> &Path {
        &self.queue_dir
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// The configured ceiling on an item's `data` payload. Enforcing it is
    /// the caller's responsibility — the journal itself accepts whatever it
    /// is given (spec §7); this is exposed so the layer above can read back
    /// the limit it configured.
    pub fn max_item_size(&self) -> usize {
        self.max_item_size
    }
}

/// Fsync policy for a journal's data and reader files (spec §4.B).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncPolicy {
    /// Fsync after every write.
    Immediate,
    /// Coalesce: schedule one fsync this long after the first unsynced
    /// write; all writes pending at that point share its durability future.
    Coalesced(Duration),
    /// Never fsync explicitly; rely on the OS to flush eventually.
    Never,
}

impl SyncPolicy {
    pub fn from_duration(d: Option<Duration>) -> Self {
        match d {
            Some(d) if d.is_zero() => SyncPolicy::Immediate,
            Some(d) => SyncPolicy::Coalesced(d),
            None => SyncPolicy::Never,
        }
    }
}

impl Default for SyncPolicy {
    fn default() -> Self {
        SyncPolicy::Coalesced(Duration::from_millis(500))
    }
}

/// Builder for [`JournalConfig`].
pub struct JournalConfigBuilder {
    queue_dir: PathBuf,
    queue_name: String,
    max_file_size: Option<u64>,
    max_item_size: Option<usize>,
    sync_journal: Option<SyncPolicy>,
    archive_dir: Option<PathBuf>,
}

impl JournalConfigBuilder {
    /// Sets the maximum size, in bytes, to target for each data file.
    ///
    /// Not strictly obeyed: a `put` that crosses this threshold still lands
    /// in the current file, and rotation happens afterwards.
    #[must_use]
    pub fn max_file_size(mut self, amount: u64) -> Self {
        self.max_file_size = Some(amount);
        self
    }

    /// Sets the maximum size, in bytes, of an item's `data` payload.
    #[must_use]
    pub fn max_item_size(mut self, amount: usize) -> Self {
        self.max_item_size = Some(amount);
        self
    }

    /// Sets the fsync coalescing policy.
    #[must_use]
    pub fn sync_journal(mut self, policy: SyncPolicy) -> Self {
        self.sync_journal = Some(policy);
        self
    }

    /// Sets a directory to move fully-consumed data files into, instead of
    /// deleting them outright.
    #[must_use]
    pub fn archive_dir<P>(mut self, dir: P) -> Self
    where
        P: AsRef<Path>,
    {
        self.archive_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    #[must_use]
    pub fn build(self) -> JournalConfig {
        JournalConfig {
            queue_dir: self.queue_dir,
            queue_name: self.queue_name,
            max_file_size: self.max_file_size.unwrap_or(DEFAULT_MAX_FILE_SIZE),
            max_item_size: self.max_item_size.unwrap_or(DEFAULT_MAX_ITEM_SIZE),
            sync_journal: self.sync_journal.unwrap_or_default(),
            archive_dir: self.archive_dir,
        }
    }
}
