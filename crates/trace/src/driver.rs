//! The seize/interrupt/syscall-step/detach state machine for one tid.
//!
//! A single call to [`trace_tid`] must run entirely on one OS thread: ptrace
//! requires the thread that attached to a tracee to be the one that issues
//! `cont`/`detach` against it. The caller (the controller's worker pool)
//! is responsible for pinning the OS thread; this module only assumes it.

use crate::abi::SyscallAbi;
use crate::callback::{TraceCallback, TraceContext};
use crate::error::Error;
use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid as NixPid;
use numadv_procio::{Pid, ProcFs, Tid};
use std::thread;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

const POLL_BACKOFF: Duration = Duration::from_micros(500);

/// Traces `tid` (a thread of `pid`) until `deadline` or `cancel` fires,
/// feeding every syscall-entry stop to `callback`.
///
/// Returns `Ok(None)` if the initial seize fails (an expected, non-fatal
/// outcome per the trace driver's skip-on-failure rule) or if the tracee
/// exits before ever reaching the collection loop.
pub fn trace_tid<C: TraceCallback>(
    procfs: &ProcFs,
    abi: &dyn SyscallAbi,
    pid: Pid,
    tid: Tid,
    deadline: Instant,
    cancel: &CancellationToken,
) -> Result<Option<C>, Error> {
    let nix_tid = NixPid::from_raw(tid);

    if let Err(source) = ptrace::seize(nix_tid, ptrace::Options::empty()) {
        return Err(Error::AttachFailed { tid, source });
    }

    if !wait_until_stopped_or_exited(nix_tid)? {
        return Ok(None); // exited before the first interrupt landed
    }

    let ctx = TraceContext { pid, procfs };
    let mut callback = C::default();
    let mut stop_count: u64 = 0;

    loop {
        if cancel.is_cancelled() || Instant::now() >= deadline {
            break;
        }

        ptrace::syscall(nix_tid, None)?;

        match wait_for_syscall_stop(nix_tid, deadline, cancel)? {
            SyscallWait::Stopped => {}
            SyscallWait::Exited => return Ok(Some(callback)),
            SyscallWait::TimedOut => break,
        }

        if stop_count % 2 == 0 {
            if let Ok((nr, arg0)) = abi.read_syscall_frame(tid) {
                callback.on_syscall_entry(&ctx, nr, arg0);
            }
        }
        stop_count += 1;
    }

    detach(nix_tid)?;
    Ok(Some(callback))
}

fn wait_until_stopped_or_exited(tid: NixPid) -> Result<bool, Error> {
    ptrace::interrupt(tid)?;
    loop {
        match waitpid(tid, None) {
            Ok(WaitStatus::Stopped(_, _)) => return Ok(true),
            Ok(WaitStatus::Exited(_, _)) | Ok(WaitStatus::Signaled(_, _, _)) => return Ok(false),
            Ok(_) => continue,
            Err(e) => return Err(Error::Ptrace(e)),
        }
    }
}

enum SyscallWait {
    Stopped,
    Exited,
    TimedOut,
}

fn wait_for_syscall_stop(
    tid: NixPid,
    deadline: Instant,
    cancel: &CancellationToken,
) -> Result<SyscallWait, Error> {
    loop {
        if cancel.is_cancelled() || Instant::now() >= deadline {
            return Ok(SyscallWait::TimedOut);
        }
        match waitpid(tid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => {
                thread::sleep(POLL_BACKOFF);
            }
            Ok(WaitStatus::Stopped(_, Signal::SIGTRAP)) => return Ok(SyscallWait::Stopped),
            Ok(WaitStatus::Stopped(_, _)) => return Ok(SyscallWait::Stopped),
            Ok(WaitStatus::Exited(_, _)) | Ok(WaitStatus::Signaled(_, _, _)) => {
                return Ok(SyscallWait::Exited)
            }
            Ok(_) => continue,
            Err(e) => return Err(Error::Ptrace(e)),
        }
    }
}

fn detach(tid: NixPid) -> Result<(), Error> {
    if ptrace::detach(tid, None).is_ok() {
        return Ok(());
    }
    // The tracee was not stopped when we tried to detach; interrupt it,
    // wait for the stop, and retry once.
    ptrace::interrupt(tid)?;
    let _ = waitpid(tid, None);
    ptrace::detach(tid, None)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::FutexOnlyCallback;
    use std::process::{Child, Command};

    fn spawn_sleeper() -> Child {
        Command::new("sleep")
            .arg("2")
            .spawn()
            .expect("failed to spawn sleep(1)")
    }

    /// Requires `CAP_SYS_PTRACE`; not guaranteed in a CI sandbox.
    #[test]
    #[ignore]
    fn traces_a_live_process_without_hanging() {
        let mut child = spawn_sleeper();
        let pid = child.id() as Pid;
        let procfs = ProcFs::new("/proc");
        let abi = crate::abi::host_abi().unwrap();
        let cancel = CancellationToken::new();
        let deadline = Instant::now() + Duration::from_millis(200);

        let result = trace_tid::<FutexOnlyCallback>(&procfs, abi.as_ref(), pid, pid, deadline, &cancel);
        let _ = child.kill();
        let _ = child.wait();
        assert!(result.is_ok());
    }
}
