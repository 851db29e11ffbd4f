//! Errors for the trace driver.

/// Errors that can occur while tracing a tid.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// `PTRACE_SEIZE` failed; the tid is skipped, not fatal to the overall
    /// collection.
    #[error("failed to seize tid {tid}: {source}")]
    AttachFailed {
        /// The tid that could not be seized.
        tid: i32,
        /// The underlying ptrace errno.
        source: nix::Error,
    },

    /// A ptrace or waitpid call failed after a successful attach.
    #[error("ptrace call failed: {0}")]
    Ptrace(#[from] nix::Error),

    /// No [`crate::abi::SyscallAbi`] is available for the host architecture.
    #[error("unsupported architecture for syscall tracing")]
    UnsupportedArch,

    /// A procfs read needed by a callback failed.
    #[error(transparent)]
    Procio(#[from] numadv_procio::Error),
}
