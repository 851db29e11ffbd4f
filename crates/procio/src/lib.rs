//! Read-only helpers over procfs and sysfs.
//!
//! Every function here maps straight onto one of the files listed in the
//! advisor's external-interface contract: `/proc/<pid>/...`, `/proc/stat`,
//! `/proc/net/...`, and `/sys/devices/system/cpu/...`. Callers translate
//! `ENOENT` (a thread or process that has since exited) into their own
//! "unbind silently" behavior; this crate only distinguishes "not found"
//! from "malformed" from "other I/O error".

/// Errors reading procfs/sysfs.
pub mod error;
/// `/proc` readers: tasks, `comm`, fd targets, per-cpu and per-task ticks.
pub mod procfs;
/// `/sys` readers: CPU topology and NIC IRQ affinity.
pub mod sysfs;

pub use error::Error;
pub use procfs::{NetEntry, NetTable, Pid, ProcFs, Tid};
pub use sysfs::{CpuSysfs, NetSysfs};
