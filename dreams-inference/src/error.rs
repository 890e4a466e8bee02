//! Errors raised while loading the checkpoint and the vocabulary.
//!
//! All of them are boot-time failures: there is no fallback model, so callers are expected
//! to report the error and stop.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for loader operations.
pub type LoadResult<T> = std::result::Result<T, LoadError>;

#[derive(Error, Debug)]
pub enum LoadError {
    /// The file cannot be opened, or ends before its fixed-size header.
    #[error("cannot read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The backing buffer for a region cannot be reserved.
    #[error("cannot allocate {bytes} bytes for {what}")]
    Allocation { what: &'static str, bytes: usize },

    /// Fewer bytes are available than the header says there should be.
    #[error("short read from {}: expected {expected} bytes, got {actual}", path.display())]
    ShortRead { path: PathBuf, expected: usize, actual: usize },

    /// Header values that cannot describe a valid model.
    #[error("invalid checkpoint header: {0}")]
    InvalidHeader(String),

    /// The fork/join worker lanes cannot be started.
    #[error("cannot start worker lane: {0}")]
    WorkerSpawn(#[source] io::Error),

    /// Vocabulary entries that cannot be decoded.
    #[error("malformed vocabulary {}: {reason}", path.display())]
    Malformed { path: PathBuf, reason: String },
}

impl LoadError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io { path: path.into(), source }
    }
}
