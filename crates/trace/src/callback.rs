//! Syscall-entry callbacks invoked by [`crate::driver::trace_tid`].
//!
//! Each worker traces exactly one tid, so a callback only needs to
//! accumulate state for that single tid; the caller assembles per-tid maps
//! once every worker has finished.

use numadv_procio::procfs::socket_inode;
use numadv_procio::{NetTable, Pid, ProcFs, Tid};
use std::collections::HashMap;

/// A thread's aggregated syscall statistics for one collection window,
/// assembled from the futex-only and syscall-classifier callbacks once
/// both have finished tracing the same tid.
#[derive(Debug, Clone, Default)]
pub struct ProcessFeature {
    /// The thread this feature set describes.
    pub tid: Tid,
    /// Reads/writes/sends/receives observed touching a live network socket.
    pub net_access_count: u64,
    /// `io_getevents` calls observed.
    pub io_getevents_count: u64,
    /// `futex_addr -> count` for this thread.
    pub futex_counts: HashMap<u64, u64>,
}

/// x86_64 syscall numbers the classifier and futex callbacks care about.
pub mod syscall_nr {
    /// `read(2)`
    pub const READ: u64 = 0;
    /// `write(2)`
    pub const WRITE: u64 = 1;
    /// `sendto(2)`
    pub const SENDTO: u64 = 44;
    /// `recvfrom(2)`
    pub const RECVFROM: u64 = 45;
    /// `futex(2)`
    pub const FUTEX: u64 = 202;
    /// `io_getevents(2)`
    pub const IO_GETEVENTS: u64 = 208;
}

/// Context passed to a callback alongside each syscall-entry stop.
pub struct TraceContext<'a> {
    /// The owning process id, needed to resolve `/proc/<pid>/fd/<fd>`.
    pub pid: Pid,
    /// A procfs view, usually rooted at `/proc`.
    pub procfs: &'a ProcFs,
}

/// Invoked once per syscall-entry stop.
pub trait TraceCallback: Default + Send + 'static {
    /// Handles one syscall-entry stop.
    fn on_syscall_entry(&mut self, ctx: &TraceContext<'_>, syscall_nr: u64, arg0: u64);
}

/// Combines the futex and syscall-classifier callbacks into the single
/// [`ProcessFeature`] the controller needs per traced tid, so a worker only
/// has to trace each tid once instead of twice.
impl TraceCallback for ProcessFeature {
    fn on_syscall_entry(&mut self, ctx: &TraceContext<'_>, syscall_nr: u64, arg0: u64) {
        match syscall_nr {
            syscall_nr::FUTEX => {
                *self.futex_counts.entry(arg0).or_insert(0) += 1;
            }
            syscall_nr::READ | syscall_nr::WRITE | syscall_nr::SENDTO | syscall_nr::RECVFROM => {
                let fd = arg0 as i32;
                let Ok(target) = ctx.procfs.fd_target(ctx.pid, fd) else {
                    return;
                };
                let Some(inode) = socket_inode(&target) else {
                    return;
                };
                if inode_is_live(ctx.procfs, inode) {
                    self.net_access_count += 1;
                }
            }
            syscall_nr::IO_GETEVENTS => {
                self.io_getevents_count += 1;
            }
            _ => {}
        }
    }
}

/// Counts futex addresses this tid waited/woke on, keyed by the address
/// itself (the syscall's first argument).
#[derive(Debug, Default, Clone)]
pub struct FutexOnlyCallback {
    /// `futex_addr -> count` for this tid.
    pub counts: HashMap<u64, u64>,
}

impl TraceCallback for FutexOnlyCallback {
    fn on_syscall_entry(&mut self, _ctx: &TraceContext<'_>, syscall_nr: u64, arg0: u64) {
        if syscall_nr == syscall_nr::FUTEX {
            *self.counts.entry(arg0).or_insert(0) += 1;
        }
    }
}

/// Classifies read/write/sendto/recvfrom as network access when the fd
/// backs a socket with a live `/proc/net/*` entry, and counts
/// `io_getevents` calls.
#[derive(Debug, Default, Clone)]
pub struct SyscallClassifierCallback {
    /// Number of read/write/sendto/recvfrom calls observed touching a live
    /// network socket.
    pub net_access_count: u64,
    /// Number of `io_getevents` calls observed.
    pub io_getevents_count: u64,
}

impl TraceCallback for SyscallClassifierCallback {
    fn on_syscall_entry(&mut self, ctx: &TraceContext<'_>, syscall_nr: u64, arg0: u64) {
        match syscall_nr {
            syscall_nr::READ | syscall_nr::WRITE | syscall_nr::SENDTO | syscall_nr::RECVFROM => {
                let fd = arg0 as i32;
                let Ok(target) = ctx.procfs.fd_target(ctx.pid, fd) else {
                    return;
                };
                let Some(inode) = socket_inode(&target) else {
                    return;
                };
                if inode_is_live(ctx.procfs, inode) {
                    self.net_access_count += 1;
                }
            }
            syscall_nr::IO_GETEVENTS => {
                self.io_getevents_count += 1;
            }
            _ => {}
        }
    }
}

fn inode_is_live(procfs: &ProcFs, inode: u64) -> bool {
    for table in NetTable::all() {
        let Ok(entries) = procfs.net_table(table) else {
            continue;
        };
        if entries.iter().any(|e| e.inode == inode) {
            return true;
        }
    }
    false
}
