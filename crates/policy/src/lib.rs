//! The policy engine: the periodic tick that decides which threads go on
//! which CPUs and carries out that decision.
//!
//! This crate is the orchestrator at the top of the stack — it owns the
//! topology, the load tracker, and the bind/retry/group bookkeeping, and
//! calls down into `numadv-net`, `numadv-group`, and the `sched_setaffinity`
//! syscall. It does not own OS-thread-pinned trace workers itself; the
//! futex-based group detector is supplied by the caller through
//! [`engine::PolicyEngine::tick`].

/// `SetAffinity`, the one syscall the engine issues directly.
pub mod affinity;
/// The tick loop: scan, bind, retry, migrate.
pub mod engine;
/// Errors the policy engine can raise.
pub mod error;
/// Plain data types shared across the engine's public surface.
pub mod types;

pub use affinity::{SchedAffinity, SetAffinity};
pub use engine::PolicyEngine;
pub use error::Error;
pub use types::{BindGroupInfo, BindTaskInfo, Flags, RetryRecord, TickReport};
