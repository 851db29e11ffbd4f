//! The supervisor: the periodic ticker that drives [`numadv_policy::PolicyEngine`],
//! the pinned trace-worker pool that feeds it futex-based group detections,
//! and the local control socket that starts/stops the scan.
//!
//! One supervisor task runs the period timer; short-lived trace workers, one
//! OS thread per traced tid, are spawned and joined within a single
//! `detect_groups` call and never outlive it (the trace driver requires the
//! thread that seizes a tracee to be the one that detaches it).

/// Errors for the controller crate.
pub mod error;
/// The `threadsgrouping` run mode.
pub mod grouping;
/// The local control socket gating the supervisor's detection scan.
pub mod socket;
/// Runs a blocking closure on a dedicated, named OS thread.
pub mod thread_task;

pub use error::Error;
pub use grouping::{GroupingReport, GroupingSupervisor};
pub use socket::spawn_control_socket;

use numadv_group::{compute_groups, BindGroup};
use numadv_policy::{PolicyEngine, SetAffinity, TickReport};
use numadv_procio::{Pid, ProcFs, Tid};
use numadv_trace::{trace_tid, ProcessFeature, SyscallAbi};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Gates whether the supervisor's next tick runs a detection scan. Toggled
/// by the control socket, read once per tick.
#[derive(Debug, Default)]
pub struct ControlBlock {
    scan_enabled: AtomicBool,
}

impl ControlBlock {
    /// Builds a control block starting enabled or disabled.
    pub fn new(initial: bool) -> Self {
        Self {
            scan_enabled: AtomicBool::new(initial),
        }
    }

    /// Enables the scan (the `start` control command).
    pub fn enable(&self) {
        self.scan_enabled.store(true, Ordering::SeqCst);
    }

    /// Disables the scan (the `stop` control command).
    pub fn disable(&self) {
        self.scan_enabled.store(false, Ordering::SeqCst);
    }

    /// Whether the scan is currently enabled.
    pub fn is_enabled(&self) -> bool {
        self.scan_enabled.load(Ordering::SeqCst)
    }
}

/// Traces every task of `pid` for `trace_time`, one OS thread per tid, and
/// returns the [`ProcessFeature`] collected by whichever tids were
/// successfully seized. A tid that could not be seized, or exited before
/// its first syscall stop, contributes nothing (`SyscallDenied`/`NotFound`
/// are both treated as "skip this tid, don't abort the scan").
pub(crate) fn do_collect(
    procfs: &ProcFs,
    abi: &Arc<dyn SyscallAbi>,
    pid: Pid,
    trace_time: Duration,
) -> Vec<ProcessFeature> {
    let tids = match procfs.tasks(pid) {
        Ok(tids) => tids,
        Err(e) => {
            debug!(pid, error = %e, "failed listing tasks for trace collection");
            return Vec::new();
        }
    };
    let deadline = Instant::now() + trace_time;
    let cancel = CancellationToken::new();

    let mut handles = Vec::with_capacity(tids.len());
    for tid in tids {
        let procfs = procfs.clone();
        let abi = Arc::clone(abi);
        let cancel = cancel.clone();
        match thread_task::spawn_named(format!("trace-{tid}"), move || {
            trace_tid::<ProcessFeature>(&procfs, abi.as_ref(), pid, tid, deadline, &cancel)
        }) {
            Ok(handle) => handles.push((tid, handle)),
            Err(source) => warn!(tid, %source, "failed to spawn trace worker"),
        }
    }

    let mut features = Vec::with_capacity(handles.len());
    for (tid, handle) in handles {
        match handle.join() {
            Ok(Ok(Some(mut feature))) => {
                feature.tid = tid;
                features.push(feature);
            }
            Ok(Ok(None)) => {} // seize failed, or exited before the first stop
            Ok(Err(source)) => debug!(tid, %source, "trace worker returned an error"),
            Err(source) => warn!(tid, %source, "trace worker thread panicked"),
        }
    }
    features
}

/// Runs a bounded trace collection over `pid` and reduces the result to the
/// futex-sharing groups the policy engine's `affinity_aware` dispatch needs.
fn detect_groups_for(
    procfs: &ProcFs,
    abi: &Arc<dyn SyscallAbi>,
    pid: Pid,
    trace_time: Duration,
    name_prefix: &str,
) -> Vec<BindGroup> {
    let features = do_collect(procfs, abi, pid, trace_time);
    let futex_maps: Vec<(Tid, HashMap<u64, u64>)> = features
        .into_iter()
        .map(|f| (f.tid, f.futex_counts))
        .collect();
    compute_groups(&futex_maps, name_prefix)
}

/// Owns the period ticker, the policy engine, and the trace-collection
/// parameters needed to supply its `detect_groups` callback.
pub struct Supervisor<A: SetAffinity> {
    engine: PolicyEngine<A>,
    control: Arc<ControlBlock>,
    procfs: ProcFs,
    abi: Arc<dyn SyscallAbi>,
    trace_time: Duration,
    group_name_prefix: String,
}

impl<A: SetAffinity> Supervisor<A> {
    /// Builds a supervisor around an already-configured policy engine.
    pub fn new(
        engine: PolicyEngine<A>,
        control: Arc<ControlBlock>,
        procfs: ProcFs,
        abi: Arc<dyn SyscallAbi>,
        trace_time: Duration,
        group_name_prefix: impl Into<String>,
    ) -> Self {
        Self {
            engine,
            control,
            procfs,
            abi,
            trace_time,
            group_name_prefix: group_name_prefix.into(),
        }
    }

    /// Read-only access to the policy engine, mostly for tests and status
    /// reporting.
    pub fn engine(&self) -> &PolicyEngine<A> {
        &self.engine
    }

    /// Runs a single tick. Returns a default (all-zero) report without
    /// calling into the policy engine at all when the control socket has
    /// disabled scanning.
    pub fn tick_once(&mut self) -> TickReport {
        if !self.control.is_enabled() {
            return TickReport::default();
        }
        let procfs = &self.procfs;
        let abi = &self.abi;
        let trace_time = self.trace_time;
        let prefix = self.group_name_prefix.as_str();
        let mut detect =
            |pid: Pid| -> Vec<BindGroup> { detect_groups_for(procfs, abi, pid, trace_time, prefix) };
        self.engine.tick(Instant::now(), &mut detect)
    }

    /// Runs ticks every `period` until `quit` is cancelled. Suspends between
    /// ticks on a short poll loop bounded by the quit signal, since the
    /// supervisor has no async runtime to block on a timer with.
    pub fn run(&mut self, period: Duration, quit: &CancellationToken) {
        while !quit.is_cancelled() {
            let report = self.tick_once();
            info!(
                bound = report.bound,
                retried_ok = report.retried_ok,
                retried_dropped = report.retried_dropped,
                unbound_stale = report.unbound_stale,
                migrated = report.migrated,
                "tick complete"
            );
            wait_for_period_or_quit(period, quit);
        }
    }
}

const PERIOD_POLL: Duration = Duration::from_millis(100);

fn wait_for_period_or_quit(period: Duration, quit: &CancellationToken) {
    let deadline = Instant::now() + period;
    loop {
        if quit.is_cancelled() {
            return;
        }
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        thread::sleep(PERIOD_POLL.min(deadline - now));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_block_starts_in_the_requested_state() {
        let control = ControlBlock::new(true);
        assert!(control.is_enabled());
        control.disable();
        assert!(!control.is_enabled());
        control.enable();
        assert!(control.is_enabled());
    }

    #[test]
    fn wait_for_period_or_quit_returns_early_on_cancellation() {
        let quit = CancellationToken::new();
        quit.cancel();
        let start = Instant::now();
        wait_for_period_or_quit(Duration::from_secs(5), &quit);
        assert!(start.elapsed() < Duration::from_millis(500));
    }
}
