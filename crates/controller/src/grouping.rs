//! The `threadsgrouping` run mode: classify a target's threads as IO or NET
//! by syscall, then distribute them across a configured [`CpuPartition`]
//! instead of running the topology-driven bind/retry/migrate loop.

use crate::do_collect;
use crate::ControlBlock;
use numadv_partition::{bind_tagged, CpuPartition, Tag};
use numadv_policy::SetAffinity;
use numadv_procio::{Pid, ProcFs};
use numadv_trace::SyscallAbi;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Outcome counters for one [`GroupingSupervisor::tick_once`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GroupingReport {
    /// Threads pinned to an IO- or NET-tagged CPU group this tick.
    pub bound: usize,
}

/// Drives the IO/NET partition-binding loop for one named target process.
pub struct GroupingSupervisor<A: SetAffinity> {
    partition: CpuPartition,
    procfs: ProcFs,
    abi: Arc<dyn SyscallAbi>,
    affinity: A,
    trace_time: Duration,
    control: Arc<ControlBlock>,
    target_comm: String,
}

impl<A: SetAffinity> GroupingSupervisor<A> {
    /// Builds a grouping supervisor targeting every pid whose `comm`
    /// matches `target_comm`.
    pub fn new(
        partition: CpuPartition,
        procfs: ProcFs,
        abi: Arc<dyn SyscallAbi>,
        affinity: A,
        trace_time: Duration,
        control: Arc<ControlBlock>,
        target_comm: impl Into<String>,
    ) -> Self {
        Self {
            partition,
            procfs,
            abi,
            affinity,
            trace_time,
            control,
            target_comm: target_comm.into(),
        }
    }

    fn target_pids(&self) -> Vec<Pid> {
        self.procfs
            .resolve_comm_to_pids(&self.target_comm)
            .unwrap_or_default()
    }

    /// Traces every matching pid's threads for `trace_time`, classifies
    /// them IO/NET, and pins each classified thread to its assigned CPU
    /// group. A syscall-classification signal with no matching partition
    /// group (zero width for that tag) simply leaves those threads
    /// unpinned this tick.
    pub fn tick_once(&mut self) -> GroupingReport {
        let mut report = GroupingReport::default();
        if !self.control.is_enabled() {
            return report;
        }
        for pid in self.target_pids() {
            let features = do_collect(&self.procfs, &self.abi, pid, self.trace_time);
            for tag in [Tag::Io, Tag::Net] {
                for assignment in bind_tagged(&self.partition, tag, &features) {
                    match self.affinity.set_affinity(assignment.tid, &assignment.cpus) {
                        Ok(()) => report.bound += 1,
                        Err(source) => {
                            debug!(tid = assignment.tid, %source, "transient bind failure in grouping mode")
                        }
                    }
                }
            }
        }
        report
    }

    /// Runs ticks every `period` until `quit` is cancelled.
    pub fn run(&mut self, period: Duration, quit: &CancellationToken) {
        while !quit.is_cancelled() {
            let report = self.tick_once();
            info!(bound = report.bound, "grouping tick complete");
            let deadline = Instant::now() + period;
            while Instant::now() < deadline && !quit.is_cancelled() {
                thread::sleep(Duration::from_millis(100).min(deadline - Instant::now()));
            }
        }
    }
}
