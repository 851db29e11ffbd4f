//! Errors for the controller crate.

/// Errors the supervisor and its worker pool can raise.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Failed to spawn an OS thread.
    #[error("failed to spawn thread '{thread_name}': {source}")]
    ThreadSpawnError {
        /// Name of the thread we attempted to spawn.
        thread_name: String,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// A spawned thread panicked before returning its result.
    #[error("thread '{thread_name}' panicked: {panic_message}")]
    ThreadJoinPanic {
        /// The thread name that panicked.
        thread_name: String,
        /// Panic message, formatted from the payload.
        panic_message: String,
    },

    /// The control socket could not be bound, chmod'd, or accepted on.
    #[error("control socket error at {path}: {source}")]
    Socket {
        /// Path of the control socket.
        path: std::path::PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}
