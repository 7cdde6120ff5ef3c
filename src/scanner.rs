//! Forward-only read-behind cursor across data-file boundaries (spec §4.F).
//!
//! A `Scanner` never touches the active writer handle; it opens each data
//! file it visits with its own independent handle, so it can keep reading
//! even if the journal archives (renames) the file out from under it.

use tracing::instrument;

use crate::{
    actor::JournalHandle,
    error::{JournalFileError, ScannerError},
    journal_file::JournalFileReader,
    record::{DecodedRecord, QueueItem, Record},
};

/// A forward cursor reading [`QueueItem`]s from disk, used when a reader has
/// fallen outside the in-memory window the layer above this crate keeps.
pub struct Scanner {
    handle: JournalHandle,
    current: Option<JournalFileReader>,
    /// The id of the last item yielded, or (before the first `next()`) the
    /// position positioning left off at.
    id: u64,
    /// A record already read during positioning, buffered so the first
    /// `next()` call can hand it back instead of re-reading it.
    pending: Option<QueueItem>,
}

impl Scanner {
    /// Positions a new scanner at `start_id`: finds the file covering it (or
    /// the earliest file, if none does), then reads forward until seeing a
    /// `Put` with `id >= start_id`.
    #[instrument(level = "debug", skip(handle))]
    pub(crate) async fn start(handle: JournalHandle, start_id: u64) -> Result<Self, ScannerError> {
        let tail_id = handle.tail_id().await?;

        let info = match handle.file_info_for_id(start_id).await? {
            Some(info) => Some(info),
            None => {
                let earliest = handle.earliest_head().await?;
                handle.file_info_for_id(earliest).await?
            }
        };

        let Some(info) = info else {
            // Empty journal: nothing to scan yet.
            return Ok(Self {
                handle,
                current: None,
                id: tail_id,
                pending: None,
            });
        };

        let mut reader = JournalFileReader::open(info.path.clone()).await?;
        loop {
            match reader.next().await? {
                DecodedRecord::Record {
                    record: Record::Put(item),
                    ..
                } => {
                    if item.id >= start_id {
                        let id = item.id.saturating_sub(1);
                        return Ok(Self {
                            handle,
                            current: Some(reader),
                            id,
                            pending: Some(item),
                        });
                    }
                }
                DecodedRecord::Record { .. } => continue,
                DecodedRecord::Eof => {
                    // Ran off the end of the file before finding anything
                    // at or past start_id: nothing left to scan.
                    return Ok(Self {
                        handle,
                        current: None,
                        id: tail_id,
                        pending: None,
                    });
                }
                DecodedRecord::Corrupted | DecodedRecord::UnknownTag(_) => {
                    return Err(corrupted(&reader));
                }
            }
        }
    }

    /// The id of the last item returned by `next`, or the scanner's
    /// positioning point if nothing has been returned yet.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Yields the next `Put` item, crossing file boundaries as needed.
    /// Returns `None` once the scanner has caught up to the live tail.
    #[instrument(level = "trace", skip(self))]
    pub async fn next(&mut self) -> Result<Option<QueueItem>, ScannerError> {
        if let Some(item) = self.pending.take() {
            self.id = item.id;
            return Ok(Some(item));
        }

        loop {
            let tail_id = self.handle.tail_id().await?;
            if self.id == tail_id {
                self.current = None;
                return Ok(None);
            }

            let Some(reader) = self.current.as_mut() else {
                let next_info = self
                    .handle
                    .file_info_for_id(self.id + 1)
                    .await?
                    .ok_or(ScannerError::IdGap { id: self.id + 1 })?;
                self.current = Some(JournalFileReader::open(next_info.path.clone()).await?);
                continue;
            };

            match reader.next().await? {
                DecodedRecord::Record {
                    record: Record::Put(item),
                    ..
                } => {
                    self.id = item.id;
                    return Ok(Some(item));
                }
                DecodedRecord::Record { .. } => continue,
                DecodedRecord::Eof => {
                    self.current = None;
                    continue;
                }
                DecodedRecord::Corrupted | DecodedRecord::UnknownTag(_) => {
                    return Err(corrupted(reader));
                }
            }
        }
    }
}

fn corrupted(reader: &JournalFileReader) -> ScannerError {
    ScannerError::JournalFile {
        source: JournalFileError::Corrupted {
            position: reader.position(),
        },
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::{
        config::{JournalConfig, SyncPolicy},
        journal::Journal,
    };

    async fn journal_with_items(dir: &std::path::Path, count: u64) -> Journal {
        let config = JournalConfig::builder(dir, "test")
            .sync_journal(SyncPolicy::Never)
            .build();
        let journal = Journal::open(config).await.unwrap();
        for i in 0..count {
            journal
                .put(Bytes::from(format!("item-{i}")), 0, None)
                .await
                .unwrap();
        }
        journal
    }

    #[tokio::test]
    async fn scans_from_start_id_to_tail() {
        let dir = temp_dir::TempDir::new().unwrap();
        let journal = journal_with_items(dir.path(), 5).await;

        let mut scanner = Scanner::start(journal.handle().clone(), 2).await.unwrap();
        let mut ids = Vec::new();
        while let Some(item) = scanner.next().await.unwrap() {
            ids.push(item.id);
        }
        assert_eq!(ids, vec![2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn exhausted_at_tail_returns_none_without_reread() {
        let dir = temp_dir::TempDir::new().unwrap();
        let journal = journal_with_items(dir.path(), 3).await;

        let mut scanner = Scanner::start(journal.handle().clone(), 10).await.unwrap();
        assert_eq!(scanner.next().await.unwrap(), None);
    }
}
