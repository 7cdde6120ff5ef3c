//! The journal's serialized mutator: a single task owning the active
//! [`JournalFileWriter`], the [`FileIndex`], and the tail counter, driven by
//! an `mpsc` command queue (spec §4.D, §9 Open Question 1).
//!
//! Every mutating Journal operation becomes a [`Command`] sent to this task;
//! because the task processes one command at a time, `put`, `rotate`, and
//! `checkOldFiles` are trivially serialized without a coarse lock.

use std::{
    collections::{BTreeSet, HashMap},
    io,
    path::PathBuf,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use bytes::Bytes;
use tokio::{
    sync::{mpsc, oneshot},
    time::sleep,
};
use tracing::{debug, info, instrument, warn};

use crate::{
    config::JournalConfig,
    error::JournalError,
    file_index::{FileIndex, FileInfo},
    journal_file::{truncate_tail, DurabilityFuture, JournalFileReader, JournalFileWriter},
    naming,
    reader::write_checkpoint_file,
    record::{DecodedRecord, QueueItem, Record},
};

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the Unix epoch")
        .as_millis() as u64
}

/// A freshly-registered reader's starting point on disk, handed back to the
/// [`crate::reader::Reader`] constructor.
pub struct ReaderInit {
    pub path: PathBuf,
    pub head: u64,
}

enum Command {
    Put {
        data: Bytes,
        add_time: i64,
        expire_time: Option<i64>,
        reply: oneshot::Sender<Result<(QueueItem, DurabilityFuture), JournalError>>,
    },
    TailId(oneshot::Sender<u64>),
    EarliestHead(oneshot::Sender<u64>),
    FileInfoForId(u64, oneshot::Sender<Option<FileInfo>>),
    JournalSize(oneshot::Sender<u64>),
    UpdateReaderHead {
        name: String,
        head: u64,
        reply: oneshot::Sender<()>,
    },
    GetOrCreateReader {
        name: String,
        reply: oneshot::Sender<Result<ReaderInit, JournalError>>,
    },
    Checkpoint(oneshot::Sender<Result<(), JournalError>>),
    Erase(oneshot::Sender<Result<(), JournalError>>),
    Close(oneshot::Sender<Result<(), JournalError>>),
}

/// A cheap, cloneable handle to a running journal actor.
#[derive(Clone)]
pub struct JournalHandle {
    tx: mpsc::Sender<Command>,
}

impl JournalHandle {
    async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, JournalError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(make(tx))
            .await
            .map_err(|_| JournalError::ActorGone)?;
        rx.await.map_err(|_| JournalError::ActorGone)
    }

    pub async fn put(
        &self,
        data: Bytes,
        add_time: i64,
        expire_time: Option<i64>,
    ) -> Result<(QueueItem, DurabilityFuture), JournalError> {
        self.call(|reply| Command::Put {
            data,
            add_time,
            expire_time,
            reply,
        })
        .await?
    }

    pub async fn tail_id(&self) -> Result<u64, JournalError> {
        self.call(Command::TailId).await
    }

    pub async fn earliest_head(&self) -> Result<u64, JournalError> {
        self.call(Command::EarliestHead).await
    }

    pub async fn file_info_for_id(&self, id: u64) -> Result<Option<FileInfo>, JournalError> {
        self.call(|reply| Command::FileInfoForId(id, reply)).await
    }

    pub async fn journal_size(&self) -> Result<u64, JournalError> {
        self.call(Command::JournalSize).await
    }

    pub async fn update_reader_head(&self, name: String, head: u64) -> Result<(), JournalError> {
        self.call(|reply| Command::UpdateReaderHead { name, head, reply }).await
    }

    pub async fn get_or_create_reader(&self, name: String) -> Result<ReaderInit, JournalError> {
        self.call(|reply| Command::GetOrCreateReader { name, reply }).await?
    }

    pub async fn checkpoint(&self) -> Result<(), JournalError> {
        self.call(Command::Checkpoint).await?
    }

    pub async fn erase(&self) -> Result<(), JournalError> {
        self.call(Command::Erase).await?
    }

    pub async fn close(&self) -> Result<(), JournalError> {
        self.call(Command::Close).await?
    }
}

/// Per-reader state the actor needs in order to compute `minHead` in
/// `checkOldFiles` and to promote a default reader to a named one without
/// losing progress. The authoritative, continuously-updated `doneSet` lives
/// only in each [`crate::reader::Reader`]; this copy is just the one read
/// back from disk at `open()`, carried along for that promotion path.
struct ReaderRecord {
    head: u64,
    done_set: BTreeSet<u64>,
}

pub(crate) struct Actor {
    queue_dir: PathBuf,
    config: JournalConfig,
    file_index: FileIndex,
    active_writer: Option<JournalFileWriter>,
    tail_id: u64,
    current_items: u64,
    current_bytes: u64,
    readers: HashMap<String, ReaderRecord>,
    /// Set once an I/O error is observed on the active file; per spec §5,
    /// the journal then rejects all further `put`s until the process
    /// restarts rather than risking further inconsistency.
    unhealthy: bool,
}

/// Spawns the actor task and returns a handle to it, after running the full
/// `open()` construction sequence from spec §4.D.
pub(crate) async fn spawn(config: JournalConfig) -> Result<JournalHandle, JournalError> {
    let queue_dir = config.queue_dir().to_path_buf();
    tokio::fs::create_dir_all(&queue_dir).await?;

    let mut actor = Actor {
        queue_dir,
        config,
        file_index: FileIndex::new(),
        active_writer: None,
        tail_id: 0,
        current_items: 0,
        current_bytes: 0,
        readers: HashMap::new(),
        unhealthy: false,
    };

    actor.open().await?;

    let (tx, rx) = mpsc::channel(256);
    tokio::spawn(actor.run(rx));
    Ok(JournalHandle { tx })
}

struct FileScan {
    head_id: u64,
    tail_id: u64,
    items: u64,
    bytes: u64,
}

impl Actor {
    #[instrument(level = "info", skip(self))]
    async fn open(&mut self) -> Result<(), JournalError> {
        // Step 1: delete stale checkpoint staging files.
        let mut entries = tokio::fs::read_dir(&self.queue_dir).await?;
        let mut writer_paths = Vec::new();
        let mut reader_paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if naming::is_temporary(&path) {
                tokio::fs::remove_file(&path).await?;
                continue;
            }
            if naming::parse_data_file_name(file_name, &self.config.queue_name).is_some() {
                writer_paths.push(path);
            } else if naming::parse_reader_file_name(file_name, &self.config.queue_name).is_some() {
                reader_paths.push(path);
            }
        }
        writer_paths.sort();

        // Step 3-4: scan each writer file, building the FileIndex.
        for path in writer_paths {
            match self.scan_journal_file(&path).await? {
                Some(scan) => {
                    self.file_index.insert(FileInfo {
                        path: path.clone(),
                        head_id: scan.head_id,
                        tail_id: scan.tail_id,
                        items: scan.items,
                        bytes: scan.bytes,
                    });
                }
                None => {
                    debug!(?path, "data file had no surviving records, deleting");
                    tokio::fs::remove_file(&path).await?;
                }
            }
        }

        // Step 5: reopen the last file for append, or rotate a fresh one.
        if let Some(last) = self.file_index.last().cloned() {
            self.tail_id = last.tail_id;
            self.current_items = last.items;
            self.current_bytes = last.bytes;
            let position = reopen_position(&last).await?;
            let writer =
                JournalFileWriter::reopen(last.path.clone(), position, self.config.sync_journal).await?;
            self.active_writer = Some(writer);
        } else {
            self.rotate().await?;
        }

        // Step 6: build the reader map, skipping corrupt reader files.
        let mut default_reader: Option<PathBuf> = None;
        for path in reader_paths {
            let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
            let Some(name) = naming::parse_reader_file_name(file_name, &self.config.queue_name) else {
                continue;
            };
            match read_reader_checkpoint(&path, self.tail_id).await {
                Ok((head, done_set)) => {
                    if name.is_empty() {
                        default_reader = Some(path.clone());
                    }
                    self.readers.insert(name.to_string(), ReaderRecord { head, done_set });
                }
                Err(error) => {
                    warn!(?path, %error, "skipping corrupt reader file");
                }
            }
        }

        // Step 7: create a default reader if none survived.
        if self.readers.is_empty() {
            let path = naming::reader_file_path(&self.queue_dir, &self.config.queue_name, "");
            write_checkpoint_file(&path, self.tail_id, &BTreeSet::new()).await?;
            self.readers.insert(
                String::new(),
                ReaderRecord {
                    head: self.tail_id,
                    done_set: BTreeSet::new(),
                },
            );
            default_reader = Some(path);
        }

        // Step 8: a named reader supersedes a leftover default one.
        if self.readers.len() >= 2 {
            if let Some(default_path) = default_reader {
                self.readers.remove("");
                tokio::fs::remove_file(&default_path).await?;
            }
        }

        Ok(())
    }

    /// Scans one writer file, repairing tail corruption by truncating once.
    /// Returns `None` if the file had no surviving `Put` records.
    #[instrument(level = "debug", skip(self))]
    async fn scan_journal_file(&self, path: &PathBuf) -> Result<Option<FileScan>, JournalError> {
        let mut attempt = 0;
        loop {
            let mut reader = JournalFileReader::open(path.clone()).await?;
            let mut scan: Option<FileScan> = None;

            loop {
                let pos_before = reader.position();
                match reader.next().await? {
                    DecodedRecord::Record {
                        record: Record::Put(item),
                        ..
                    } => {
                        let entry = scan.get_or_insert(FileScan {
                            head_id: item.id,
                            tail_id: item.id,
                            items: 0,
                            bytes: 0,
                        });
                        entry.tail_id = item.id;
                        entry.items += 1;
                        entry.bytes += item.data.len() as u64;
                    }
                    DecodedRecord::Record { .. } => continue,
                    DecodedRecord::Eof => return Ok(scan),
                    DecodedRecord::Corrupted | DecodedRecord::UnknownTag(_) => {
                        if attempt > 0 {
                            return Err(JournalError::UnrecoverableCorruption {
                                path: path.clone(),
                                position: pos_before,
                            });
                        }
                        drop(reader);
                        truncate_tail(path, pos_before).await?;
                        attempt += 1;
                        break;
                    }
                }
            }
        }
    }

    #[instrument(level = "debug", skip(self))]
    async fn rotate(&mut self) -> Result<(), JournalError> {
        if let Some(writer) = self.active_writer.take() {
            writer.close().await?;
        }

        loop {
            let suffix = now_millis();
            let path = naming::data_file_path(&self.queue_dir, &self.config.queue_name, suffix);
            match JournalFileWriter::create_new(path.clone(), self.config.sync_journal).await {
                Ok(writer) => {
                    self.active_writer = Some(writer);
                    self.current_items = 0;
                    self.current_bytes = 0;
                    self.file_index.insert(FileInfo {
                        path,
                        head_id: self.tail_id + 1,
                        tail_id: self.tail_id,
                        items: 0,
                        bytes: 0,
                    });
                    break;
                }
                Err(crate::error::JournalFileError::Io { source }) if source.kind() == io::ErrorKind::AlreadyExists => {
                    sleep(Duration::from_millis(1)).await;
                }
                Err(other) => return Err(other.into()),
            }
        }

        self.check_old_files().await
    }

    #[instrument(level = "debug", skip(self))]
    async fn check_old_files(&mut self) -> Result<(), JournalError> {
        let min_reader_head = self
            .readers
            .values()
            .map(|r| r.head.saturating_add(1))
            .min()
            .unwrap_or(self.tail_id);
        let min_head = self.tail_id.min(min_reader_head);

        for old in self.file_index.gc_candidates(min_head) {
            self.file_index.remove(old.head_id);
            if let Some(archive_dir) = self.config.archive_dir.clone() {
                tokio::fs::create_dir_all(&archive_dir).await?;
                let dest = naming::archive_path(&archive_dir, &old.path);
                tokio::fs::rename(&old.path, &dest).await?;
                info!(path = ?old.path, dest = ?dest, "archived journal file");
            } else {
                tokio::fs::remove_file(&old.path).await?;
                info!(path = ?old.path, "removed journal file");
            }
        }
        Ok(())
    }

    async fn handle_put(
        &mut self,
        data: Bytes,
        add_time: i64,
        expire_time: Option<i64>,
    ) -> Result<(QueueItem, DurabilityFuture), JournalError> {
        if self.unhealthy || self.active_writer.is_none() {
            return Err(JournalError::Unhealthy);
        }

        self.tail_id += 1;
        let item = QueueItem {
            id: self.tail_id,
            add_time,
            expire_time,
            data,
        };

        let writer = self.active_writer.as_mut().expect("checked above");
        let (_, durability) = match writer.put(&Record::Put(item.clone())).await {
            Ok(result) => result,
            Err(error) => {
                // The write may have landed partially; a later `open()` scan
                // truncates any corrupted tail it left behind. What matters
                // here is that this id is never counted as committed: roll
                // it back and stop accepting puts so no later `put` papers
                // over the gap in `file_index`.
                self.unhealthy = true;
                self.tail_id -= 1;
                return Err(error.into());
            }
        };

        self.current_items += 1;
        self.current_bytes += item.data.len() as u64;
        if let Some(mut last) = self.file_index.last().cloned() {
            last.tail_id = self.tail_id;
            last.items = self.current_items;
            last.bytes = self.current_bytes;
            self.file_index.replace_last(last);
        }

        let position = self.active_writer.as_ref().map(|w| w.position()).unwrap_or(0);
        if position >= self.config.max_file_size {
            self.rotate().await?;
        }

        Ok((item, durability))
    }

    #[instrument(level = "debug", skip(self))]
    async fn handle_get_or_create_reader(&mut self, name: String) -> Result<ReaderInit, JournalError> {
        if let Some(record) = self.readers.get(&name) {
            return Ok(ReaderInit {
                path: naming::reader_file_path(&self.queue_dir, &self.config.queue_name, &name),
                head: record.head,
            });
        }

        if let Some(default) = self.readers.remove("") {
            let old_path = naming::reader_file_path(&self.queue_dir, &self.config.queue_name, "");
            let new_path = naming::reader_file_path(&self.queue_dir, &self.config.queue_name, &name);
            write_checkpoint_file(&new_path, default.head, &default.done_set).await?;
            tokio::fs::remove_file(&old_path).await?;
            let head = default.head;
            self.readers.insert(name.clone(), ReaderRecord { head, done_set: default.done_set });
            return Ok(ReaderInit {
                path: new_path,
                head,
            });
        }

        let path = naming::reader_file_path(&self.queue_dir, &self.config.queue_name, &name);
        write_checkpoint_file(&path, self.tail_id, &BTreeSet::new()).await?;
        self.readers.insert(
            name.clone(),
            ReaderRecord {
                head: self.tail_id,
                done_set: BTreeSet::new(),
            },
        );
        Ok(ReaderInit {
            path,
            head: self.tail_id,
        })
    }

    #[instrument(level = "debug", skip(self))]
    async fn erase(&mut self) -> Result<(), JournalError> {
        if let Some(writer) = self.active_writer.take() {
            writer.close().await?;
        }
        let mut entries = tokio::fs::read_dir(&self.queue_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let keep = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| !n.starts_with(&self.config.queue_name))
                .unwrap_or(true);
            if !keep {
                tokio::fs::remove_file(&path).await?;
            }
        }
        self.file_index = FileIndex::new();
        self.readers.clear();
        self.tail_id = 0;
        Ok(())
    }

    async fn journal_size(&self) -> u64 {
        let mut total = 0;
        for info in self.file_index.iter() {
            if let Ok(metadata) = tokio::fs::metadata(&info.path).await {
                total += metadata.len();
            }
        }
        total
    }

    pub(crate) async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        loop {
            let deadline = self.active_writer.as_ref().and_then(|w| w.coalesced_deadline());

            let command = match deadline {
                Some(deadline) => {
                    tokio::select! {
                        command = rx.recv() => command,
                        _ = sleep(deadline.saturating_duration_since(tokio::time::Instant::now())) => {
                            if let Some(writer) = self.active_writer.as_mut() {
                                if let Err(error) = writer.flush_pending().await {
                                    warn!(%error, "coalesced fsync failed");
                                }
                            }
                            continue;
                        }
                    }
                }
                None => rx.recv().await,
            };

            let Some(command) = command else {
                break;
            };

            match command {
                Command::Put {
                    data,
                    add_time,
                    expire_time,
                    reply,
                } => {
                    let result = self.handle_put(data, add_time, expire_time).await;
                    let _ = reply.send(result);
                }
                Command::TailId(reply) => {
                    let _ = reply.send(self.tail_id);
                }
                Command::EarliestHead(reply) => {
                    let _ = reply.send(self.file_index.earliest_head());
                }
                Command::FileInfoForId(id, reply) => {
                    let _ = reply.send(self.file_index.file_info_for_id(id).cloned());
                }
                Command::JournalSize(reply) => {
                    let _ = reply.send(self.journal_size().await);
                }
                Command::UpdateReaderHead { name, head, reply } => {
                    self.readers
                        .entry(name)
                        .or_insert(ReaderRecord {
                            head,
                            done_set: BTreeSet::new(),
                        })
                        .head = head;
                    let _ = reply.send(());
                }
                Command::GetOrCreateReader { name, reply } => {
                    let result = self.handle_get_or_create_reader(name).await;
                    let _ = reply.send(result);
                }
                Command::Checkpoint(reply) => {
                    let result = async {
                        if let Some(writer) = self.active_writer.as_mut() {
                            writer.flush_pending().await?;
                        }
                        Ok(())
                    }
                    .await;
                    let _ = reply.send(result);
                }
                Command::Erase(reply) => {
                    let result = self.erase().await;
                    let _ = reply.send(result);
                }
                Command::Close(reply) => {
                    let result = if let Some(writer) = self.active_writer.take() {
                        writer.close().await.map_err(JournalError::from)
                    } else {
                        Ok(())
                    };
                    let _ = reply.send(result);
                    break;
                }
            }
        }
    }
}

async fn reopen_position(info: &FileInfo) -> Result<u64, JournalError> {
    let metadata = tokio::fs::metadata(&info.path).await?;
    Ok(metadata.len())
}

async fn read_reader_checkpoint(path: &PathBuf, tail_id: u64) -> Result<(u64, BTreeSet<u64>), JournalError> {
    let mut reader = JournalFileReader::open(path.clone()).await?;
    let mut head = 0;
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
            } => {
                for id in ids {
                    if id <= tail_id {
                        done_set.insert(id);
                    }
                }
            }
            DecodedRecord::Record { .. } => continue,
            DecodedRecord::Eof => break,
            DecodedRecord::Corrupted | DecodedRecord::UnknownTag(_) => {
                warn!(?path, "corrupt reader file, skipping it entirely");
                return Err(JournalError::UnrecoverableCorruption {
                    path: path.clone(),
                    position: reader.position(),
                });
            }
        }
    }
    Ok((head, done_set))
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use temp_dir::TempDir;

    use super::*;
    use crate::config::{JournalConfig, SyncPolicy};

    async fn actor_for_test(dir: &TempDir) -> Actor {
        let config = JournalConfig::builder(dir.path(), "test")
            .sync_journal(SyncPolicy::Never)
            .build();
        let queue_dir = config.queue_dir().to_path_buf();
        tokio::fs::create_dir_all(&queue_dir).await.unwrap();
        let mut actor = Actor {
            queue_dir,
            config,
            file_index: FileIndex::new(),
            active_writer: None,
            tail_id: 0,
            current_items: 0,
            current_bytes: 0,
            readers: HashMap::new(),
            unhealthy: false,
        };
        actor.open().await.unwrap();
        actor
    }

    #[tokio::test]
    async fn unhealthy_journal_rejects_puts_without_advancing_tail() {
        let dir = TempDir::new().unwrap();
        let mut actor = actor_for_test(&dir).await;

        actor
            .handle_put(Bytes::from_static(b"one"), 0, None)
            .await
            .unwrap();
        assert_eq!(actor.tail_id, 1);

        actor.unhealthy = true;
        let result = actor.handle_put(Bytes::from_static(b"two"), 0, None).await;
        assert!(matches!(result, Err(JournalError::Unhealthy)));
        assert_eq!(actor.tail_id, 1, "a rejected put must not advance tail_id");
    }

    #[tokio::test]
    async fn put_without_an_active_writer_is_rejected_without_advancing_tail() {
        let dir = TempDir::new().unwrap();
        let mut actor = actor_for_test(&dir).await;

        actor
            .handle_put(Bytes::from_static(b"one"), 0, None)
            .await
            .unwrap();
        assert_eq!(actor.tail_id, 1);

        // No active writer (the file rotated out from under it, say) is the
        // same "can't actually write this" situation a failed write leaves
        // the actor in; the id must never be counted as committed.
        actor.active_writer = None;
        let result = actor.handle_put(Bytes::from_static(b"two"), 0, None).await;
        assert!(matches!(result, Err(JournalError::Unhealthy)));
        assert_eq!(
            actor.tail_id, 1,
            "a rejected put must not advance tail_id"
        );
    }
}
