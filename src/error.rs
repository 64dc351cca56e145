use std::io;
use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of failures, mirroring the categories callers act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Corruption,
    Io,
    InvalidArgument,
    Busy,
    Aborted,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to decode {0}: {1}")]
    Decode(&'static str, io::Error),

    #[error("Corruption: {0}")]
    Corruption(String),

    #[error("Checksum mismatch in {path:?}: expected {expected:#018x}, found {actual:#018x}")]
    ChecksumMismatch {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },

    #[error("Size mismatch in {path:?}: expected {expected} bytes, found {actual}")]
    SizeMismatch {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },

    #[error("Missing file: {0:?}")]
    MissingFile(PathBuf),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Busy: {0}")]
    Busy(String),

    #[error("Aborted: {0}")]
    Aborted(String),

    #[error("Background error: {0}")]
    Background(String),

    #[error("Lock error: {0}")]
    LockError(io::Error),

    #[error("Mutex was poisoned")]
    MutexPoisoned,

    #[error("Memtable is frozen")]
    ReadOnly,

    #[error("Metadata serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound(_) | Error::MissingFile(_) => ErrorKind::NotFound,
            Error::Decode(..)
            | Error::Corruption(_)
            | Error::ChecksumMismatch { .. }
            | Error::SizeMismatch { .. }
            | Error::Serde(_) => ErrorKind::Corruption,
            Error::Io(_) | Error::LockError(_) | Error::Background(_) => ErrorKind::Io,
            Error::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Error::InvalidState(_) | Error::MutexPoisoned | Error::ReadOnly => {
                ErrorKind::InvalidArgument
            }
            Error::Busy(_) => ErrorKind::Busy,
            Error::Aborted(_) => ErrorKind::Aborted,
        }
    }

    /// The file a verification failure refers to, if any.
    pub fn file(&self) -> Option<&std::path::Path> {
        match self {
            Error::ChecksumMismatch { path, .. }
            | Error::SizeMismatch { path, .. }
            | Error::MissingFile(path) => Some(path),
            _ => None,
        }
    }

    pub fn is_corruption(&self) -> bool {
        self.kind() == ErrorKind::Corruption
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        Error::MutexPoisoned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        let err = Error::ChecksumMismatch {
            path: PathBuf::from("shared/000001.sst"),
            expected: 1,
            actual: 2,
        };
        assert_eq!(err.kind(), ErrorKind::Corruption);
        assert_eq!(err.file(), Some(std::path::Path::new("shared/000001.sst")));

        assert_eq!(Error::Busy("stall".into()).kind(), ErrorKind::Busy);
        assert_eq!(Error::Aborted("cancel".into()).kind(), ErrorKind::Aborted);
        assert_eq!(
            Error::from(io::Error::new(io::ErrorKind::Other, "disk")).kind(),
            ErrorKind::Io
        );
    }

    #[test]
    fn test_display_names_file() {
        let err = Error::MissingFile(PathBuf::from("private/1/000003.wal"));
        assert!(err.to_string().contains("000003.wal"));
    }
}
