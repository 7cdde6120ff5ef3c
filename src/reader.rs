//! Per-consumer durable cursor: `head` plus an out-of-order `doneSet`,
//! checkpointed atomically via a `~~`-staged rename (spec §4.E).

use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
    sync::Arc,
};

use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::{
    fs::{self, OpenOptions},
    io::AsyncWriteExt,
    sync::Mutex as AsyncMutex,
};
use tracing::instrument;

use crate::{
    actor::{now_millis, JournalHandle},
    error::ReaderError,
    journal_file::JournalFileReader,
    naming,
    record::{encode_record, DecodedRecord, QueueItem, Record},
    scanner::Scanner,
};

struct ReaderState {
    head: u64,
    done_set: BTreeSet<u64>,
}

/// A named consumer's durable progress cursor over a journal.
///
/// `head`/`doneSet` are guarded by a plain (non-async) mutex, since mutation
/// only ever touches those two fields and never needs to hold the lock
/// across an `.await`; the optional read-behind [`Scanner`] gets its own
/// async mutex because advancing it does I/O.
pub struct Reader {
    name: String,
    path: PathBuf,
    handle: JournalHandle,
    state: Mutex<ReaderState>,
    scanner: AsyncMutex<Option<Scanner>>,
}

impl Reader {
    pub(crate) async fn new(
        name: String,
        path: PathBuf,
        fallback_head: u64,
        handle: JournalHandle,
    ) -> Result<Arc<Self>, ReaderError> {
        let tail_id = handle.tail_id().await?;
        let (mut head, mut done_set) = match read_state(&path, tail_id).await {
            Ok(state) => state,
            Err(_) => (fallback_head, BTreeSet::new()),
        };

        // Head-clamp-on-recovery (spec §4.E, §9 Open Question): an operator
        // deleting data files ahead of `head`, or fast-forwarding the
        // queue, is recovered from by clamping into the surviving range
        // rather than treated as corruption.
        let earliest_floor = handle.earliest_head().await?.saturating_sub(1);
        head = head.clamp(earliest_floor, tail_id);
        done_set.retain(|&id| id > head);

        handle.update_reader_head(name.clone(), head).await?;

        Ok(Arc::new(Self {
            name,
            path,
            handle,
            state: Mutex::new(ReaderState { head, done_set }),
            scanner: AsyncMutex::new(None),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn head(&self) -> u64 {
        self.state.lock().head
    }

    pub fn done_set(&self) -> BTreeSet<u64> {
        self.state.lock().done_set.clone()
    }

    /// Sets `head` directly, dropping every `doneSet` entry `<= v`.
    pub async fn set_head(&self, v: u64) -> Result<(), ReaderError> {
        {
            let mut state = self.state.lock();
            state.head = v;
            state.done_set.retain(|&id| id > v);
        }
        self.handle.update_reader_head(self.name.clone(), v).await?;
        Ok(())
    }

    /// Marks `id` consumed. If it's the immediate successor of `head`,
    /// advances `head` past it and any contiguous run already in `doneSet`;
    /// otherwise it's recorded in `doneSet` for later convergence.
    #[instrument(level = "trace", skip(self))]
    pub async fn commit(&self, id: u64) -> Result<(), ReaderError> {
        let new_head = {
            let mut state = self.state.lock();
            if id == state.head + 1 {
                state.head += 1;
                while state.done_set.remove(&(state.head + 1)) {
                    state.head += 1;
                }
            } else {
                state.done_set.insert(id);
            }
            state.head
        };
        self.handle.update_reader_head(self.name.clone(), new_head).await?;
        Ok(())
    }

    /// Jumps `head` to the current tail, discarding `doneSet`, and ends any
    /// in-progress read-behind session.
    pub async fn flush(&self) -> Result<(), ReaderError> {
        let tail_id = self.handle.tail_id().await?;
        {
            let mut state = self.state.lock();
            state.head = tail_id;
            state.done_set.clear();
        }
        self.handle.update_reader_head(self.name.clone(), tail_id).await?;
        self.end_read_behind().await;
        Ok(())
    }

    /// Atomically rewrites this reader's checkpoint file: snapshot
    /// `head`/`doneSet`, write to a `~~`-staged sibling, then rename over
    /// the canonical path. Snapshotting before the write means concurrent
    /// `commit`s can't tear a checkpoint in progress.
    #[instrument(level = "debug", skip(self))]
    pub async fn checkpoint(&self) -> Result<(), ReaderError> {
        let (head, done_set) = {
            let state = self.state.lock();
            (state.head, state.done_set.clone())
        };

        let staging = naming::reader_checkpoint_staging_path(&self.path, now_millis());
        write_checkpoint_file(&staging, head, &done_set).await?;
        fs::rename(&staging, &self.path).await?;
        Ok(())
    }

    /// Begins a read-behind session positioned at `id`, for consuming items
    /// that have fallen outside the in-memory window above this crate.
    pub async fn start_read_behind(&self, id: u64) -> Result<(), ReaderError> {
        let scanner = Scanner::start(self.handle.clone(), id).await?;
        *self.scanner.lock().await = Some(scanner);
        Ok(())
    }

    /// Returns the next item from the active read-behind session, or `None`
    /// if no session is active or the scanner has caught up to the tail.
    pub async fn next_read_behind(&self) -> Result<Option<QueueItem>, ReaderError> {
        let mut guard = self.scanner.lock().await;
        match guard.as_mut() {
            Some(scanner) => Ok(scanner.next().await?),
            None => Ok(None),
        }
    }

    pub async fn end_read_behind(&self) {
        *self.scanner.lock().await = None;
    }
}

/// Writes `ReadHead(head)` then `ReadDone(doneSet sorted)` to `path`,
/// fsyncing before returning — used both for fresh reader files and as the
/// staging step of [`Reader::checkpoint`].
pub(crate) async fn write_checkpoint_file(
    path: &Path,
    head: u64,
    done_set: &BTreeSet<u64>,
) -> std::io::Result<()> {
    let mut buf = BytesMut::new();
    encode_record(&Record::ReadHead(head), &mut buf);
    encode_record(&Record::ReadDone(done_set.iter().copied().collect()), &mut buf);

    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .await?;
    file.write_all(&buf).await?;
    file.sync_all().await?;
    Ok(())
}

/// Replays a reader file's `ReadHead`/`ReadDone` records (spec §4.E
/// `readState`), filtering `doneSet` to ids that are still `<= tailId`.
async fn read_state(path: &Path, tail_id: u64) -> Result<(u64, BTreeSet<u64>), ReaderError> {
    let mut reader = JournalFileReader::open(path.to_path_buf()).await?;
    let mut head = 0u64;
    let mut done_set = BTreeSet::new();

    loop {
        match reader.next().await? {
            DecodedRecord::Record {
                record: Record::ReadHead(h),
                ..
            } => head = h,
            DecodedRecord::Record {
                record: Record::ReadDone(ids),
                ..
            } => done_set = ids.into_iter().filter(|&id| id <= tail_id).collect(),
            DecodedRecord::Record { .. } => continue,
            DecodedRecord::Eof => break,
            DecodedRecord::Corrupted | DecodedRecord::UnknownTag(_) => return Err(ReaderError::CorruptState),
        }
    }

    Ok((head, done_set))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn checkpoint_write_scenario() {
        let dir = temp_dir::TempDir::new().unwrap();
        let path = dir.path().join("test.read.client1");

        let done: BTreeSet<u64> = [125, 130].into_iter().collect();
        write_checkpoint_file(&path, 123, &done).await.unwrap();

        let (head, done_set) = read_state(&path, 1_000).await.unwrap();
        assert_eq!(head, 123);
        assert_eq!(done_set, done);
    }

    #[tokio::test]
    async fn checkpoint_read_scenario() {
        let dir = temp_dir::TempDir::new().unwrap();
        let path = dir.path().join("test.read.client1");

        let done: BTreeSet<u64> = [902, 903].into_iter().collect();
        write_checkpoint_file(&path, 900, &done).await.unwrap();

        let (head, done_set) = read_state(&path, 903).await.unwrap();
        assert_eq!(head, 900);
        assert_eq!(done_set, done);
    }

    #[tokio::test]
    async fn checkpoint_idempotence() {
        let dir = temp_dir::TempDir::new().unwrap();
        let path = dir.path().join("test.read.client1");
        let done: BTreeSet<u64> = [5, 6].into_iter().collect();

        write_checkpoint_file(&path, 4, &done).await.unwrap();
        let first = tokio::fs::read(&path).await.unwrap();
        write_checkpoint_file(&path, 4, &done).await.unwrap();
        let second = tokio::fs::read(&path).await.unwrap();

        assert_eq!(first, second);
    }
}
