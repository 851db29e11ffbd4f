//! The one syscall the policy engine issues directly: `sched_setaffinity`.

use nix::sched::{sched_setaffinity, CpuSet};
use nix::unistd::Pid as NixPid;
use numadv_procio::Tid;

/// Abstraction over `sched_setaffinity`, so tests can script failures
/// without actually pinning the test process's threads.
pub trait SetAffinity {
    /// Restricts `tid` to `cpus`. A failure here is treated by the caller
    /// as `TransientBind`: the thread may still be alive, so the record is
    /// queued for a retry rather than dropped immediately.
    fn set_affinity(&mut self, tid: Tid, cpus: &[usize]) -> Result<(), nix::Error>;
}

/// The real implementation, backed by the `sched_setaffinity(2)` syscall.
#[derive(Debug, Default)]
pub struct SchedAffinity;

impl SetAffinity for SchedAffinity {
    fn set_affinity(&mut self, tid: Tid, cpus: &[usize]) -> Result<(), nix::Error> {
        let mut set = CpuSet::new();
        for &cpu in cpus {
            set.set(cpu)?;
        }
        sched_setaffinity(NixPid::from_raw(tid), &set)
    }
}
