//! The public `Journal` type: lifecycle of the file set for one queue,
//! fronting the serialized actor in [`crate::actor`] and owning the set of
//! [`Reader`]s created against it (spec §4.D).

use std::{collections::HashMap, path::Path, sync::Arc};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::instrument;

use crate::{
    actor::{self, JournalHandle},
    config::JournalConfig,
    error::JournalError,
    journal_file::DurabilityFuture,
    reader::Reader,
    record::QueueItem,
};

/// A durable, multi-reader journal for one queue: the file set plus the
/// in-memory state coordinating it. Not `Clone` itself — callers that need
/// to share one `Journal` across tasks wrap it in an `Arc`, same as they
/// would any other service handle; its internal actor handle is already
/// cheaply cloneable for that purpose.
pub struct Journal {
    handle: JournalHandle,
    readers: Mutex<HashMap<String, Arc<Reader>>>,
}

impl Journal {
    /// Opens (or creates) the journal rooted at `config.queue_dir()`,
    /// running the full scan/recovery sequence from spec §4.D before
    /// returning.
    #[instrument(level = "info", skip(config), fields(queue_name = config.queue_name()))]
    pub async fn open(config: JournalConfig) -> Result<Self, JournalError> {
        let handle = actor::spawn(config).await?;
        Ok(Self {
            handle,
            readers: Mutex::new(HashMap::new()),
        })
    }

    pub(crate) fn handle(&self) -> &JournalHandle {
        &self.handle
    }

    /// Appends `data`, returning the assigned [`QueueItem`] and a future that
    /// resolves once the record is durable per the configured sync policy.
    pub async fn put(
        &self,
        data: Bytes,
        add_time: i64,
        expire_time: Option<i64>,
    ) -> Result<(QueueItem, DurabilityFuture), JournalError> {
        self.handle.put(data, add_time, expire_time).await
    }

    /// Returns the named reader, creating it (or promoting the default
    /// unnamed reader) on first use. Repeated calls with the same name
    /// return the same `Reader` instance.
    pub async fn reader(&self, name: &str) -> Result<Arc<Reader>, JournalError> {
        if let Some(existing) = self.readers.lock().get(name) {
            return Ok(Arc::clone(existing));
        }

        let init = self.handle.get_or_create_reader(name.to_string()).await?;
        let reader = Reader::new(name.to_string(), init.path, init.head, self.handle.clone())
            .await
            .map_err(|source| JournalError::Reader {
                source: Box::new(source),
            })?;

        let mut readers = self.readers.lock();
        // Another caller may have raced us to create the same reader; keep
        // whichever instance won so callers always see one canonical Reader.
        let winner = Arc::clone(readers.entry(name.to_string()).or_insert(reader));
        Ok(winner)
    }

    /// The largest item ID ever appended.
    pub async fn tail(&self) -> Result<u64, JournalError> {
        self.handle.tail_id().await
    }

    /// Sum of the on-disk lengths of this journal's data files.
    pub async fn journal_size(&self) -> Result<u64, JournalError> {
        self.handle.journal_size().await
    }

    /// Flushes any coalesced writer fsync and checkpoints every reader that
    /// has been created against this journal, concurrently.
    pub async fn checkpoint(&self) -> Result<(), JournalError> {
        self.handle.checkpoint().await?;
        let readers: Vec<Arc<Reader>> = self.readers.lock().values().cloned().collect();
        futures::future::try_join_all(readers.iter().map(|reader| reader.checkpoint()))
            .await
            .map_err(|source| JournalError::Reader {
                source: Box::new(source),
            })?;
        Ok(())
    }

    /// Stops accepting new `put`s, waits for the active file's in-flight
    /// durability futures, flushes and closes it, and checkpoints every
    /// reader. Does not delete any file — see [`Journal::erase`] for that.
    pub async fn close(&self) -> Result<(), JournalError> {
        self.checkpoint().await?;
        self.handle.close().await
    }

    /// Deletes every writer file, reader file, and `~~` temporary under the
    /// queue directory, and closes the journal.
    pub async fn erase(&self) -> Result<(), JournalError> {
        self.readers.lock().clear();
        self.handle.erase().await
    }
}

/// Convenience constructor mirroring [`JournalConfig::builder`]'s common
/// case: open a journal at `queue_dir` under `queue_name` with defaults.
pub async fn open<P: AsRef<Path>>(queue_dir: P, queue_name: &str) -> Result<Journal, JournalError> {
    Journal::open(JournalConfig::builder(queue_dir, queue_name).build()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncPolicy;

    #[tokio::test]
    async fn id_monotonicity() {
        let dir = temp_dir::TempDir::new().unwrap();
        let config = JournalConfig::builder(dir.path(), "test")
            .sync_journal(SyncPolicy::Never)
            .build();
        let journal = Journal::open(config).await.unwrap();

        let mut previous = 0;
        for _ in 0..10 {
            let (item, _) = journal.put(Bytes::from_static(b"x"), 0, None).await.unwrap();
            assert_eq!(item.id, previous + 1);
            previous = item.id;
        }
        assert_eq!(journal.tail().await.unwrap(), 10);
    }

    #[tokio::test]
    async fn reader_returns_same_instance_for_same_name() {
        let dir = temp_dir::TempDir::new().unwrap();
        let config = JournalConfig::builder(dir.path(), "test")
            .sync_journal(SyncPolicy::Never)
            .build();
        let journal = Journal::open(config).await.unwrap();

        let a = journal.reader("client1").await.unwrap();
        let b = journal.reader("client1").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn named_reader_supersedes_default() {
        let dir = temp_dir::TempDir::new().unwrap();
        let config = JournalConfig::builder(dir.path(), "test")
            .sync_journal(SyncPolicy::Never)
            .build();
        let journal = Journal::open(config).await.unwrap();
        journal.put(Bytes::from_static(b"x"), 0, None).await.unwrap();

        let reader = journal.reader("client1").await.unwrap();
        assert_eq!(reader.head(), 1);

        let default_path = dir.path().join("test.read.");
        assert!(!default_path.exists());
    }

    #[tokio::test]
    async fn round_trip_after_reopen() {
        let dir = temp_dir::TempDir::new().unwrap();
        let payloads: Vec<Bytes> = (0..20).map(|i| Bytes::from(format!("item-{i}"))).collect();

        {
            let config = JournalConfig::builder(dir.path(), "test")
                .sync_journal(SyncPolicy::Immediate)
                .max_file_size(256)
                .build();
            let journal = Journal::open(config).await.unwrap();
            for payload in &payloads {
                journal.put(payload.clone(), 0, None).await.unwrap();
            }
            journal.close().await.unwrap();
        }

        let config = JournalConfig::builder(dir.path(), "test")
            .sync_journal(SyncPolicy::Immediate)
            .max_file_size(256)
            .build();
        let journal = Journal::open(config).await.unwrap();
        assert_eq!(journal.tail().await.unwrap(), payloads.len() as u64);

        let mut scanner = crate::scanner::Scanner::start(journal.handle().clone(), 1)
            .await
            .unwrap();
        let mut replayed = Vec::new();
        while let Some(item) = scanner.next().await.unwrap() {
            replayed.push(item.data);
        }
        pretty_assertions::assert_eq!(replayed, payloads);
    }
}
