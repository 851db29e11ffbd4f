//! Per-architecture register shim.
//!
//! Ptrace exposes the syscall number and first argument through different
//! registers on every architecture, so the rest of the driver depends only
//! on this trait instead of `libc::user_regs_struct`.

use crate::error::Error;
use nix::sys::ptrace;
use nix::unistd::Pid as NixPid;
use numadv_procio::Tid;

/// Reads the syscall number and first argument register of a tracee that is
/// currently stopped at a syscall boundary.
pub trait SyscallAbi: Send + Sync {
    /// Returns `(syscall_number, arg0)`.
    fn read_syscall_frame(&self, tid: Tid) -> Result<(u64, u64), Error>;
}

/// x86_64: syscall number in `orig_rax`, first argument in `rdi`.
#[derive(Debug, Default)]
pub struct X86_64Abi;

impl SyscallAbi for X86_64Abi {
    fn read_syscall_frame(&self, tid: Tid) -> Result<(u64, u64), Error> {
        let regs = ptrace::getregs(NixPid::from_raw(tid))?;
        Ok((regs.orig_rax, regs.rdi))
    }
}

/// Returns the ABI shim for the host architecture, or
/// [`Error::UnsupportedArch`] on platforms this driver has not been ported
/// to yet.
pub fn host_abi() -> Result<Box<dyn SyscallAbi>, Error> {
    #[cfg(target_arch = "x86_64")]
    {
        Ok(Box::new(X86_64Abi))
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        Err(Error::UnsupportedArch)
    }
}
