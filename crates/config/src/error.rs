//! Errors validating CLI input and CPU-partition files.

/// Errors raised while validating daemon configuration.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// `--period` was outside `1..=3600`.
    #[error("period must be between 1 and 3600 seconds, got {0}")]
    InvalidPeriod(u64),

    /// `--tracetime` was zero or not strictly less than `--period`.
    #[error("tracetime must be between 1 and period-1 ({max}) seconds, got {got}")]
    InvalidTraceTime {
        /// The value given.
        got: u64,
        /// The largest value that would have been accepted (`period - 1`).
        max: u64,
    },

    /// `--task` was required for the selected policy but missing.
    #[error("--task is required for policy {0:?}")]
    MissingTask(crate::cli::PolicyMode),

    /// The partition JSON file could not be read.
    #[error("failed to read partition file {path}: {source}")]
    PartitionFileIo {
        /// Path given to `--json`.
        path: std::path::PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The partition JSON file was malformed.
    #[error("failed to parse partition file {path}: {source}")]
    PartitionFileParse {
        /// Path given to `--json`.
        path: std::path::PathBuf,
        /// Underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// A token inside the partition file's `io`/`net` arrays was invalid.
    #[error(transparent)]
    PartitionToken(#[from] numadv_partition::Error),
}
