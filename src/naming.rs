//! File naming conventions under a journal's `queueDir` (spec §6).

use std::path::{Path, PathBuf};

const TEMP_MARKER: &str = "~~";

pub fn data_file_path(queue_dir: &Path, queue_name: &str, suffix: u64) -> PathBuf {
    queue_dir.join(format!("{queue_name}.{suffix}"))
}

pub fn reader_file_path(queue_dir: &Path, queue_name: &str, reader_name: &str) -> PathBuf {
    queue_dir.join(format!("{queue_name}.read.{reader_name}"))
}

pub fn reader_checkpoint_staging_path(reader_path: &Path, now_millis: u64) -> PathBuf {
    let mut name = reader_path
        .file_name()
        .expect("reader path always has a file name")
        .to_os_string();
    name.push(format!("{TEMP_MARKER}{now_millis}"));
    reader_path.with_file_name(name)
}

pub fn archive_path(archive_dir: &Path, original: &Path) -> PathBuf {
    let basename = original
        .file_name()
        .expect("data file path always has a file name")
        .to_string_lossy();
    archive_dir.join(format!("archive~{basename}"))
}

pub fn is_temporary(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.contains(TEMP_MARKER))
}

/// Parses `<queueName>.<digits>` writer file names, returning the numeric
/// suffix on a match.
pub fn parse_data_file_name(file_name: &str, queue_name: &str) -> Option<u64> {
    let suffix = file_name.strip_prefix(queue_name)?.strip_prefix('.')?;
    if suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    suffix.parse().ok()
}

/// Parses `<queueName>.read.<name>` reader file names, returning the reader
/// name (possibly empty) on a match.
pub fn parse_reader_file_name<'a>(file_name: &'a str, queue_name: &str) -> Option<&'a str> {
    let rest = file_name.strip_prefix(queue_name)?.strip_prefix(".read.")?;
    Some(rest)
}
