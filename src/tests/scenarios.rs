//! The literal worked examples from spec §8: file discovery, commit
//! tracking, rotation, and crash recovery.

use temp_dir::TempDir;

use super::{open_journal, payload};
use crate::naming;

#[test]
fn file_discovery_scenario() {
    let names = [
        "test.901",
        "test.8000",
        "test.3leet",
        "test.read.client1",
        "test.read.client2",
        "test.readmenot",
        "test.1",
        "test.5005",
        "test.read.client1~~",
    ];

    let mut writer_files = Vec::new();
    let mut reader_files = Vec::new();
    for name in names {
        if naming::is_temporary(std::path::Path::new(name)) {
            continue;
        }
        if naming::parse_data_file_name(name, "test").is_some() {
            writer_files.push(name);
        } else if naming::parse_reader_file_name(name, "test").is_some() {
            reader_files.push(name);
        }
    }
    writer_files.sort_unstable();
    reader_files.sort_unstable();

    assert_eq!(writer_files, vec!["test.1", "test.5005", "test.8000", "test.901"]);
    assert_eq!(reader_files, vec!["test.read.client1", "test.read.client2"]);
}

#[tokio::test]
async fn commit_tracking_scenario() {
    let dir = TempDir::new().unwrap();
    let journal = open_journal(&dir, "test").await;
    for i in 0..130 {
        journal.put(payload(i), 0, None).await.unwrap();
    }
    let reader = journal.reader("client").await.unwrap();
    reader.set_head(123).await.unwrap();

    reader.commit(124).await.unwrap();
    assert_eq!(reader.head(), 124);
    assert!(reader.done_set().is_empty());

    reader.commit(126).await.unwrap();
    reader.commit(127).await.unwrap();
    reader.commit(129).await.unwrap();
    assert_eq!(reader.head(), 124);
    assert_eq!(reader.done_set(), [126, 127, 129].into_iter().collect());

    reader.commit(125).await.unwrap();
    assert_eq!(reader.head(), 127);
    assert_eq!(reader.done_set(), [129].into_iter().collect());

    reader.commit(130).await.unwrap();
    reader.commit(128).await.unwrap();
    assert_eq!(reader.head(), 130);
    assert!(reader.done_set().is_empty());
}

#[tokio::test]
async fn rotation_scenario_creates_contiguous_files_with_no_gap() {
    let dir = TempDir::new().unwrap();
    let config = crate::config::JournalConfig::builder(dir.path(), "test")
        .sync_journal(crate::config::SyncPolicy::Immediate)
        .max_file_size(64)
        .build();
    let journal = crate::journal::Journal::open(config).await.unwrap();

    for i in 0..50 {
        journal.put(payload(i), 0, None).await.unwrap();
    }

    let mut data_files: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|name| naming::parse_data_file_name(name, "test").is_some())
        .collect();
    data_files.sort_unstable();
    assert!(data_files.len() > 1, "expected rotation to produce multiple files");

    // Every item from 1..=tail must be reachable via a scan across the
    // resulting files with no gaps.
    let tail = journal.tail().await.unwrap();
    let mut scanner = crate::scanner::Scanner::start(journal.handle().clone(), 1)
        .await
        .unwrap();
    let mut seen = Vec::new();
    while let Some(item) = scanner.next().await.unwrap() {
        seen.push(item.id);
    }
    assert_eq!(seen, (1..=tail).collect::<Vec<_>>());
}

#[tokio::test]
async fn crash_recovery_truncates_corrupted_tail() {
    let dir = TempDir::new().unwrap();
    {
        let journal = open_journal(&dir, "test").await;
        for i in 0..5 {
            journal.put(payload(i), 0, None).await.unwrap();
        }
        journal.close().await.unwrap();
    }

    // Corrupt the tail of the one data file by appending a few stray bytes
    // that don't form a complete record.
    let data_file = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .find(|p| naming::parse_data_file_name(p.file_name().unwrap().to_str().unwrap(), "test").is_some())
        .expect("a data file should exist");

    {
        use std::io::Write;
        let mut file = std::fs::OpenOptions::new().append(true).open(&data_file).unwrap();
        file.write_all(&[0xFF, 0xFF, 0xFF]).unwrap();
    }

    let journal = open_journal(&dir, "test").await;
    assert_eq!(journal.tail().await.unwrap(), 5);

    let (item, _) = journal.put(payload(99), 0, None).await.unwrap();
    assert_eq!(item.id, 6);
}

#[tokio::test]
async fn promoting_default_reader_preserves_its_done_set() {
    let dir = TempDir::new().unwrap();
    {
        let journal = open_journal(&dir, "test").await;
        for i in 0..10 {
            journal.put(payload(i), 0, None).await.unwrap();
        }

        // The unnamed reader is the default one created by `open()`. Commit
        // out of order so it accumulates a non-empty doneSet, then persist
        // that to disk the way a real process would before exiting.
        let default = journal.reader("").await.unwrap();
        default.commit(2).await.unwrap();
        default.commit(3).await.unwrap();
        default.checkpoint().await.unwrap();
        assert_eq!(default.done_set(), [2, 3].into_iter().collect());

        journal.close().await.unwrap();
    }

    // Reopen (simulating a restart) and ask for a *named* reader for the
    // first time this session. Since only the default survived on disk,
    // this should promote it rather than starting a fresh cursor at head 0.
    let journal = open_journal(&dir, "test").await;
    let promoted = journal.reader("client1").await.unwrap();
    assert_eq!(promoted.head(), 0);
    assert_eq!(
        promoted.done_set(),
        [2, 3].into_iter().collect(),
        "promotion must carry over the doneSet read from the default reader's checkpoint"
    );
}

#[tokio::test]
async fn put_accepts_items_larger_than_configured_max_item_size() {
    let dir = TempDir::new().unwrap();
    let config = crate::config::JournalConfig::builder(dir.path(), "test")
        .max_item_size(4)
        .build();
    let journal = crate::journal::Journal::open(config).await.unwrap();

    // Enforcing maxItemSize is the caller's job (spec §7); the core itself
    // accepts whatever it is handed.
    let (item, _) = journal.put(payload(123456), 0, None).await.unwrap();
    assert_eq!(item.id, 1);
}

#[tokio::test]
async fn gc_never_removes_a_file_a_reader_still_needs() {
    let dir = TempDir::new().unwrap();
    let config = crate::config::JournalConfig::builder(dir.path(), "test")
        .sync_journal(crate::config::SyncPolicy::Immediate)
        .max_file_size(64)
        .build();
    let journal = crate::journal::Journal::open(config).await.unwrap();

    let reader = journal.reader("slow").await.unwrap();
    for i in 0..50 {
        journal.put(payload(i), 0, None).await.unwrap();
    }
    // `slow` never commits, so no file covering an id > head should ever be
    // reachable through the reader's own progress.
    assert_eq!(reader.head(), 0);

    let mut scanner = crate::scanner::Scanner::start(journal.handle().clone(), 1)
        .await
        .unwrap();
    assert!(scanner.next().await.unwrap().is_some(), "item 1 must still be on disk");
}
