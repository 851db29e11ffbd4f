//! Orchestrates the seven-step NUMA-preference resolution protocol.

use crate::error::Error;
use crate::ifaces::{build_ip_to_ifname_map, classify_ifnames, resolve_socket_ifnames};
use crate::irq::{resolve_numa_for_device, resolve_physical_devices};
use crate::ns::NamespaceSession;
use numadv_procio::{NetSysfs, Pid, ProcFs};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

/// Resolves a process's preferred NUMA node from the devices backing its
/// open sockets.
pub struct NetResolver {
    proc_root: PathBuf,
}

impl Default for NetResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl NetResolver {
    /// A resolver reading from the real `/proc`.
    pub fn new() -> Self {
        Self {
            proc_root: PathBuf::from("/proc"),
        }
    }

    /// A resolver reading from a custom root, for tests.
    pub fn with_proc_root(proc_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
        }
    }

    /// Resolves `pid`'s preferred NUMA node, entering its network namespace
    /// on the calling OS thread for the duration of the call. `cpu_to_numa`
    /// maps CPU ids (as they appear in IRQ affinity masks) to NUMA node ids.
    /// `scratch` is a private mount point used for the namespace-local and
    /// host-side sysfs views; it must not be shared with a concurrent call.
    pub fn resolve_preferred_numa(
        &self,
        pid: Pid,
        cpu_to_numa: &HashMap<usize, u32>,
        scratch: &Path,
    ) -> Result<Option<i64>, Error> {
        let mut session = NamespaceSession::enter(pid, scratch)?;

        let procfs = ProcFs::new(&self.proc_root);
        let ip_to_ifname = build_ip_to_ifname_map()?;
        let ifnames = resolve_socket_ifnames(&procfs, pid, &ip_to_ifname)?;
        let ns_sysfs = NetSysfs::new(scratch.join("class/net"));
        let (mut physical, virtual_tail) = classify_ifnames(&ns_sysfs, &ifnames)?;

        session.return_to_root_and_remount()?;
        let host_sysfs = NetSysfs::new(scratch.join("class/net"));
        physical.extend(resolve_physical_devices(&host_sysfs, &virtual_tail)?);
        physical.sort();
        physical.dedup();

        let mut irq_numa_ids = Vec::new();
        let mut pci_numa_ids = BTreeSet::new();
        for device in &physical {
            let (from_irq, fallback) =
                resolve_numa_for_device(&host_sysfs, &self.proc_root, device, cpu_to_numa)?;
            irq_numa_ids.extend(from_irq);
            if let Some(n) = fallback {
                let _ = pci_numa_ids.insert(n);
            }
        }

        drop(session);
        Ok(decide_preferred_numa(&irq_numa_ids, &pci_numa_ids))
    }
}

/// If every IRQ of every device maps to the same NUMA node, that node wins.
/// Otherwise, a singleton set of PCI `numa_node` fallbacks wins. Otherwise
/// there is no preference.
pub fn decide_preferred_numa(irq_numa_ids: &[i64], pci_numa_ids: &BTreeSet<i64>) -> Option<i64> {
    if let Some(&first) = irq_numa_ids.first() {
        if irq_numa_ids.iter().all(|&n| n == first) {
            return Some(first);
        }
    }
    if pci_numa_ids.len() == 1 {
        return pci_numa_ids.iter().next().copied();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unanimous_irq_numa_wins() {
        assert_eq!(decide_preferred_numa(&[1, 1, 1], &BTreeSet::new()), Some(1));
    }

    #[test]
    fn split_irq_numa_falls_back_to_singleton_pci() {
        let pci: BTreeSet<i64> = [2].into_iter().collect();
        assert_eq!(decide_preferred_numa(&[0, 1], &pci), Some(2));
    }

    #[test]
    fn no_signal_means_no_preference() {
        assert_eq!(decide_preferred_numa(&[], &BTreeSet::new()), None);
        let pci: BTreeSet<i64> = [0, 1].into_iter().collect();
        assert_eq!(decide_preferred_numa(&[], &pci), None);
    }
}
