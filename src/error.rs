use std::io;
use std::path::Path;

use thiserror::Error;

/// Error kinds surfaced by the store.
///
/// Transient backend failures (`Backend`) may be retried at the path layer;
/// logical errors (`AlreadyExists`, `CorruptManifest`, `CorruptData`) are
/// surfaced immediately.
#[derive(Error, Debug)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("unable to acquire lock on {0} - got timeout")]
    LockTimeout(String),

    #[error("lock lease on {0} was lost")]
    LockLost(String),

    #[error("corrupt manifest: {0}")]
    CorruptManifest(String),

    #[error("corrupt data file {path}: {reason}")]
    CorruptData { path: String, reason: String },

    #[error("backend unavailable: {0}")]
    Backend(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("index {index} out of range for length {len}")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("unsupported format operation: {0}")]
    Format(String),

    #[error("serialization failed: {0}")]
    Serde(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Classify an `io::Error` raised while operating on `path`.
    pub(crate) fn from_io(path: &Path, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => Error::NotFound(path.display().to_string()),
            io::ErrorKind::AlreadyExists => Error::AlreadyExists(path.display().to_string()),
            _ => Error::Backend(format!("{}: {}", path.display(), err)),
        }
    }

    pub(crate) fn corrupt_data(path: &crate::upath::UPath, reason: impl ToString) -> Self {
        Error::CorruptData {
            path: path.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Whether retrying the failed operation can possibly help.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Backend(_))
    }
}
