use std::{io, path::PathBuf};

use thiserror::Error;

use super::entry::EntryId;

/// A queued program could not be started.
#[derive(Debug, Error)]
#[error("failed to start {}: {source}", program.display())]
pub struct LaunchError {
    pub program: PathBuf,
    #[source]
    pub source: io::Error,
}

/// A persisted queue record that could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CorruptStateError {
    #[error("record {index}: expected 3 fields, found {found}")]
    FieldCount { index: usize, found: usize },
    #[error("record {index}: invalid base64 output: {reason}")]
    Base64 { index: usize, reason: String },
    #[error("record {index}: output is not valid UTF-8")]
    Utf8 { index: usize },
}

#[derive(Debug, Error)]
pub enum TerminationError {
    #[error("process {0} has already exited")]
    AlreadyExited(u32),
    #[error("failed to terminate process {pid}: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: io::Error,
    },
}

/// Rejections of operator commands.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("entry {0} not found")]
    NotFound(EntryId),
    #[error("entry {0} is still working")]
    EntryWorking(EntryId),
    #[error("entry {0} has already finished")]
    AlreadyFinished(EntryId),
    #[error("another entry is already running")]
    Busy,
    #[error("index {index} is out of range for a queue of {len}")]
    IndexOutOfRange { index: usize, len: usize },
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("unsupported settings format version {found} (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },
    #[error(transparent)]
    Queue(#[from] QueueError),
}

pub type StorageResult<T> = Result<T, StorageError>;
