//! Errors the policy engine itself can raise.
//!
//! Most per-tid failures are swallowed and turned into a retry, a silent
//! unbind, or a skipped entity (see [`crate::engine::PolicyEngine::tick`]);
//! this enum only carries the few failures that are not locally
//! recoverable.

/// Errors that abort a tick (or startup) outright.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The topology has no node of the type a query needed; this only
    /// happens if the topology tree was built from an empty or malformed
    /// sysfs snapshot, which is itself a startup-time fatal condition the
    /// caller should have already rejected.
    #[error("topology has no node of the requested type")]
    TopologyExhausted,
}
