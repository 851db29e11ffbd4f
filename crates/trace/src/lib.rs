//! Ptrace-based syscall tracing for a bounded collection window.
//!
//! This crate owns the per-tid attach/step/detach mechanics and the two
//! syscall-entry callbacks; the OS-thread pinning and per-process fan-out
//! live in `numadv-controller`, which calls [`driver::trace_tid`] once per
//! worker thread.

/// The host syscall ABI: register layout and syscall-number mapping.
pub mod abi;
/// The `TraceCallback` trait and its `ProcessFeature`/futex/classifier implementations.
pub mod callback;
/// Attach/seize, syscall-stop stepping, and detach for one traced tid.
pub mod driver;
/// Errors for the trace driver.
pub mod error;

pub use abi::{host_abi, SyscallAbi};
pub use callback::{
    FutexOnlyCallback, ProcessFeature, SyscallClassifierCallback, TraceCallback, TraceContext,
};
pub use driver::trace_tid;
pub use error::Error;
