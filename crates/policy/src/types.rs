//! State owned by a [`crate::engine::PolicyEngine`] between ticks.

use numadv_procio::{Pid, Tid};
use numadv_topology::NodeId;

/// Global switches read at the start of every tick.
#[derive(Debug, Clone, Copy, Default)]
pub struct Flags {
    /// Prefer the net resolver's NUMA preference when choosing a group's node.
    pub net_aware: bool,
    /// Prefer `task_fault_siblings` aggregates when choosing a group's node.
    pub numa_aware: bool,
    /// Bind to a cluster within the chosen NUMA node rather than the node itself,
    /// and run the migration pass every tick.
    pub ccl_aware: bool,
    /// Bind to the whole `bind_node` mask rather than a single lightest CPU.
    pub coarse_grain: bool,
    /// Drive dispatch from ptrace/futex-based group detection instead of the
    /// `__SCHED_GROUP__` environment convention.
    pub affinity_aware: bool,
    /// Reserved for the single-CPU-per-thread mode subsumed by `coarse_grain`
    /// being off; kept as a distinct flag because callers still set it.
    pub per_core: bool,
}

/// One thread currently pinned to a topology node.
#[derive(Debug, Clone)]
pub struct BindTaskInfo {
    /// The bound thread.
    pub tid: Tid,
    /// The thread's owning process.
    pub pid: Pid,
    /// Name of the [`BindGroupInfo`] this task belongs to, if any.
    pub group: Option<String>,
    /// The node the thread's affinity mask currently matches.
    pub node: NodeId,
}

/// A set of threads bound together under one topology node.
#[derive(Debug, Clone)]
pub struct BindGroupInfo {
    /// The group's canonical name.
    pub name: String,
    /// Member tids.
    pub tids: Vec<Tid>,
    /// The NUMA node this group was assigned to.
    pub numa: NodeId,
    /// The node actually carrying the pinning (the NUMA node itself, or a
    /// cluster inside it when `ccl_aware`).
    pub bind_node: NodeId,
}

/// A thread whose affinity syscall failed and must be retried next tick.
#[derive(Debug, Clone, Copy)]
pub struct RetryRecord {
    /// The thread to retry.
    pub tid: Tid,
    /// The node whose mask should have been applied.
    pub node: NodeId,
}

/// Outcome counters for one [`crate::engine::PolicyEngine::tick`] call,
/// useful for logging and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Threads newly bound this tick.
    pub bound: usize,
    /// Threads successfully re-bound out of the retry list.
    pub retried_ok: usize,
    /// Threads dropped after a repeated retry failure.
    pub retried_dropped: usize,
    /// Threads unbound because their `/proc` entry disappeared.
    pub unbound_stale: usize,
    /// Groups migrated to a lighter sibling node.
    pub migrated: usize,
}
