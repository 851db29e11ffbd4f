//! Error taxonomy shared by every procfs/sysfs read in this crate.

use std::path::PathBuf;

/// Errors produced while reading procfs/sysfs.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The path does not exist. Per-tid occurrences of this usually mean the
    /// thread has exited since it was last observed.
    #[error("not found: {0}")]
    NotFound(PathBuf),

    /// The file existed but its contents did not parse as expected.
    #[error("parse error in {path}: {detail}")]
    ParseError {
        /// Path of the file that failed to parse.
        path: PathBuf,
        /// Human-readable description of the parse failure.
        detail: String,
    },

    /// Any other I/O failure (permissions, etc).
    #[error("io error on {path}: {source}")]
    Io {
        /// Path the I/O operation was performed against.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    /// Builds the right variant from a path and an I/O error, mapping
    /// `ENOENT` to [`Error::NotFound`].
    pub fn from_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        if source.kind() == std::io::ErrorKind::NotFound {
            Error::NotFound(path)
        } else {
            Error::Io { path, source }
        }
    }

    /// Builds a [`Error::ParseError`].
    pub fn parse(path: impl Into<PathBuf>, detail: impl Into<String>) -> Self {
        Error::ParseError {
            path: path.into(),
            detail: detail.into(),
        }
    }
}
