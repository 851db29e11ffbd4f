//! Errors for the net resolver.

use std::path::PathBuf;

/// Errors that can occur while resolving a process's preferred NUMA node.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A namespace, mount, or syscall-level operation failed.
    #[error("namespace operation failed: {0}")]
    Nix(#[from] nix::Error),

    /// A filesystem operation outside of procfs/sysfs (scratch mount point
    /// creation) failed.
    #[error("I/O error on {path}: {source}")]
    Io {
        /// The path that could not be accessed.
        path: PathBuf,
        /// The underlying error.
        source: std::io::Error,
    },

    /// A procfs or sysfs read failed.
    #[error(transparent)]
    Procio(#[from] numadv_procio::Error),

    /// Parsing an effective-affinity mask failed.
    #[error(transparent)]
    Mask(#[from] numadv_mask::Error),
}
