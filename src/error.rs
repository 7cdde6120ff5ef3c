//! Error types for each component, following the teacher's per-module
//! `snafu`-derived enum convention (one `Io` variant wrapping
//! `std::io::Error`, plus variants for the logical error conditions each
//! component can hit).
//!
//! Every enum here disables its context selectors (`#[snafu(context(false))]`):
//! with five sibling enums sharing one module, the auto-generated selectors
//! (`IoSnafu`, etc.) would collide by name. Call sites build these directly
//! or rely on the `From` impls below instead of `ResultExt::context`.

use std::io;

use snafu::Snafu;

/// Errors from decoding/encoding individual records (component A).
#[derive(Debug, Snafu)]
pub enum RecordError {
    #[snafu(display("record I/O error: {}", source), context(false))]
    Io { source: io::Error },
}

/// Errors from a single data/reader file handle (component B).
#[derive(Debug, Snafu)]
pub enum JournalFileError {
    #[snafu(display("journal file I/O error: {}", source), context(false))]
    Io { source: io::Error },

    #[snafu(display("record error: {}", source), context(false))]
    Record { source: RecordError },

    /// The length prefix or payload of a record was truncated or malformed.
    #[snafu(display("journal file corrupted at position {}", position))]
    Corrupted { position: u64 },

    /// A tag outside 1-6 was encountered; whether this is fatal depends on
    /// whether the file is a data file or a reader file (decided by the
    /// caller, not this error type).
    #[snafu(display("unknown record tag {} at position {}", tag, position))]
    UnknownTag { tag: u8, position: u64 },
}

/// Errors from the journal's lifecycle operations (component D).
#[derive(Debug, Snafu)]
pub enum JournalError {
    #[snafu(display("journal I/O error: {}", source), context(false))]
    Io { source: io::Error },

    #[snafu(display("journal file error: {}", source), context(false))]
    JournalFile { source: JournalFileError },

    #[snafu(display("reader error: {}", source), context(false))]
    Reader { source: Box<ReaderError> },

    /// Corruption found mid-file (not at the tail) during the initial scan;
    /// per spec this is unrecoverable for the queue.
    #[snafu(display(
        "unrecoverable corruption in {:?} at position {}: not at file tail",
        path,
        position
    ))]
    UnrecoverableCorruption {
        path: std::path::PathBuf,
        position: u64,
    },

    /// A `put` was attempted after the journal was marked unhealthy by a
    /// prior I/O failure on the active file. Item-size enforcement is the
    /// responsibility of the layer above this crate; the journal itself
    /// accepts whatever it is given.
    #[snafu(display("journal is unhealthy: a prior write failed and the process must restart"))]
    Unhealthy,

    /// The journal actor task is gone (it panicked or the journal was closed).
    #[snafu(display("journal actor is no longer running"))]
    ActorGone,
}

/// Errors from per-reader operations (component E).
#[derive(Debug, Snafu)]
pub enum ReaderError {
    #[snafu(display("reader I/O error: {}", source), context(false))]
    Io { source: io::Error },

    #[snafu(display("journal file error: {}", source), context(false))]
    JournalFile { source: JournalFileError },

    #[snafu(display("journal error: {}", source), context(false))]
    Journal { source: JournalError },

    #[snafu(display("read-behind scanner error: {}", source), context(false))]
    Scanner { source: ScannerError },

    /// The reader's checkpoint file exists but its contents were corrupt;
    /// callers fall back to the head the journal's initial scan recorded
    /// rather than treating this as fatal (spec §6: "skip with a warning").
    #[snafu(display("reader state file is corrupted"))]
    CorruptState,
}

/// Errors from read-behind scanning (component F).
#[derive(Debug, Snafu)]
pub enum ScannerError {
    #[snafu(display("scanner I/O error: {}", source), context(false))]
    Io { source: io::Error },

    #[snafu(display("journal file error: {}", source), context(false))]
    JournalFile { source: JournalFileError },

    #[snafu(display("journal error: {}", source), context(false))]
    Journal { source: JournalError },

    /// The scanner needed the file covering `id` but the index has no entry
    /// for it — an ID gap, which signals data loss and is fatal.
    #[snafu(display("missing data file for item id {}: data loss", id))]
    IdGap { id: u64 },
}
