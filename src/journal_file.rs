//! A single data/reader file on disk, in either *writer* (append-only) or
//! *reader* (sequential scan) mode (spec §4.B).

use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
    time::Instant,
};

use bytes::BytesMut;
use tokio::{
    fs::{File, OpenOptions},
    io::{AsyncWriteExt, BufReader, BufWriter},
};
use tracing::{debug, instrument};

use crate::{
    config::SyncPolicy,
    error::JournalFileError,
    record::{encode_record, read_record, DecodedRecord, Record},
};

/// Resolves once the write(s) pending at the time it was issued are durable
/// on disk per the journal's [`SyncPolicy`].
pub type DurabilityFuture = tokio::sync::oneshot::Receiver<Result<(), Arc<io::Error>>>;

/// An append-only handle to one data file.
///
/// Not `Clone`/`Send`-shared: a `JournalFileWriter` is meant to be owned by
/// a single serialized mutator (the journal actor), matching the spec's
/// requirement that writes land in file-position order.
pub struct JournalFileWriter {
    path: PathBuf,
    writer: BufWriter<File>,
    position: u64,
    sync_policy: SyncPolicy,
    pending: Vec<tokio::sync::oneshot::Sender<Result<(), Arc<io::Error>>>>,
    /// When the oldest unsynced write arrived, under `SyncPolicy::Coalesced`.
    pending_since: Option<Instant>,
}

impl JournalFileWriter {
    /// Opens `path` for append, creating it if absent. Per spec §4.D step 3
    /// of `rotate()`, the caller is responsible for retrying on a unique
    /// path if this returns `AlreadyExists` and a fresh file is required;
    /// this constructor itself only opens what it's given.
    #[instrument(level = "debug", skip(sync_policy))]
    pub async fn create_new(path: PathBuf, sync_policy: SyncPolicy) -> Result<Self, JournalFileError> {
        let file = OpenOptions::new()
            .append(true)
            .read(true)
            .create_new(true)
            .open(&path)
            .await?;
        file.sync_all().await?;
        Ok(Self::from_file(path, file, 0, sync_policy))
    }

    /// Reopens an existing file for append, continuing from `position`
    /// (the byte offset the last session's scan left off at).
    #[instrument(level = "debug", skip(sync_policy))]
    pub async fn reopen(path: PathBuf, position: u64, sync_policy: SyncPolicy) -> Result<Self, JournalFileError> {
        let file = OpenOptions::new().append(true).read(true).open(&path).await?;
        Ok(Self::from_file(path, file, position, sync_policy))
    }

    fn from_file(path: PathBuf, file: File, position: u64, sync_policy: SyncPolicy) -> Self {
        Self {
            path,
            writer: BufWriter::new(file),
            position,
            sync_policy,
            pending: Vec::new(),
            pending_since: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    /// Encodes and appends `record`, returning a future that resolves once
    /// it (and anything else pending at the next fsync) is durable.
    #[instrument(level = "trace", skip(self, record))]
    pub async fn put(&mut self, record: &Record) -> Result<(u64, DurabilityFuture), JournalFileError> {
        let mut buf = BytesMut::new();
        encode_record(record, &mut buf);
        let encoded_len = buf.len() as u64;

        self.writer.write_all(&buf).await?;
        self.position += encoded_len;

        let (tx, rx) = tokio::sync::oneshot::channel();

        match self.sync_policy {
            SyncPolicy::Immediate => {
                let result = self.sync_to_disk().await;
                let _ = tx.send(result.as_ref().map(|_| ()).map_err(|e| Arc::new(clone_io_error(e))));
                result?;
            }
            SyncPolicy::Never => {
                self.writer.flush().await?;
                let _ = tx.send(Ok(()));
            }
            SyncPolicy::Coalesced(_) => {
                if self.pending.is_empty() {
                    self.pending_since = Some(Instant::now());
                }
                self.pending.push(tx);
            }
        }

        Ok((encoded_len, rx))
    }

    /// The instant by which a pending coalesced fsync is due, if any writes
    /// are unsynced. The journal actor races `tokio::time::sleep_until` this
    /// deadline against incoming commands, calling [`flush_pending`] when it
    /// elapses — this keeps the actor the sole owner of the file handle
    /// instead of spawning a detached flusher task.
    ///
    /// [`flush_pending`]: JournalFileWriter::flush_pending
    pub fn coalesced_deadline(&self) -> Option<Instant> {
        match self.sync_policy {
            SyncPolicy::Coalesced(delay) => self.pending_since.map(|since| since + delay),
            _ => None,
        }
    }

    /// Completes any pending coalesced fsync immediately.
    #[instrument(level = "trace", skip(self))]
    pub async fn flush_pending(&mut self) -> Result<(), JournalFileError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let result = self.sync_to_disk().await;
        self.pending_since = None;
        let waiters = std::mem::take(&mut self.pending);
        let reply = result.as_ref().map(|_| ()).map_err(|e| Arc::new(clone_io_error(e)));
        for waiter in waiters {
            let _ = waiter.send(reply.clone());
        }
        result
    }

    pub fn has_pending_sync(&self) -> bool {
        !self.pending.is_empty()
    }

    async fn sync_to_disk(&mut self) -> Result<(), JournalFileError> {
        self.writer.flush().await?;
        self.writer.get_mut().sync_all().await?;
        Ok(())
    }

    /// Flushes the OS buffer (not necessarily fsync) and returns the current
    /// file length, used by `rotate()`'s size check.
    #[instrument(level = "debug", skip(self))]
    pub async fn flush(&mut self) -> Result<(), JournalFileError> {
        self.writer.flush().await?;
        Ok(())
    }

    #[instrument(level = "debug", skip(self))]
    pub async fn close(mut self) -> Result<(), JournalFileError> {
        self.flush_pending().await?;
        self.writer.flush().await?;
        Ok(())
    }
}

fn clone_io_error(e: &io::Error) -> io::Error {
    io::Error::new(e.kind(), e.to_string())
}

/// Truncates the file at `path` to `len` bytes, used to repair tail
/// corruption found during the initial scan (spec §4.D step 3).
#[instrument(level = "debug")]
pub async fn truncate_tail(path: &Path, len: u64) -> io::Result<()> {
    let file = OpenOptions::new().write(true).open(path).await?;
    file.set_len(len).await?;
    file.sync_all().await?;
    Ok(())
}

/// A sequential read handle over one file, used both for the initial scan at
/// `open()` and for reader-file replay.
pub struct JournalFileReader {
    path: PathBuf,
    reader: BufReader<File>,
    position: u64,
}

impl JournalFileReader {
    #[instrument(level = "debug")]
    pub async fn open(path: PathBuf) -> Result<Self, JournalFileError> {
        let file = File::open(&path).await?;
        Ok(Self {
            path,
            reader: BufReader::new(file),
            position: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    /// Reads the next record, tracking position for corruption reporting.
    #[instrument(level = "trace", skip(self))]
    pub async fn next(&mut self) -> Result<DecodedRecord, JournalFileError> {
        let start = self.position;
        let decoded = read_record(&mut self.reader).await?;
        if let DecodedRecord::Record { encoded_len, .. } = &decoded {
            self.position += encoded_len;
        }
        debug!(start, position = self.position, "read record");
        Ok(decoded)
    }
}
