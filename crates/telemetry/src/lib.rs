//! Global tracing subscriber setup for the `advisord` daemon.
//!
//! `--loglevel` drives an [`tracing_subscriber::EnvFilter`]; `--printlog`
//! switches the sink from stderr to stdout for interactive debugging.

/// Errors initializing the global tracing subscriber.
pub mod error;

pub use error::Error;

use tracing_subscriber::EnvFilter;

/// Installs the global tracing subscriber. Call once, at startup.
pub fn init(loglevel: &str, printlog: bool) -> Result<(), Error> {
    let filter = EnvFilter::try_new(loglevel).map_err(|source| Error::InvalidLevel {
        level: loglevel.to_string(),
        source,
    })?;

    let result = if printlog {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stdout)
            .try_init()
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init()
    };
    result.map_err(|_| Error::AlreadyInitialized)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_an_unparseable_level() {
        let err = init("not_a_level!!", false).unwrap_err();
        assert!(matches!(err, Error::InvalidLevel { .. }));
    }
}
