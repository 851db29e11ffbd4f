//! Errors initializing the global tracing subscriber.

/// Errors setting up logging.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// `--loglevel` was not a level `tracing_subscriber::EnvFilter` accepts.
    #[error("invalid log level {level:?}: {source}")]
    InvalidLevel {
        /// The value given to `--loglevel`.
        level: String,
        /// The underlying parse error.
        #[source]
        source: tracing_subscriber::filter::ParseError,
    },

    /// A global subscriber was already installed (e.g. by a test harness).
    #[error("a global tracing subscriber is already set")]
    AlreadyInitialized,
}
