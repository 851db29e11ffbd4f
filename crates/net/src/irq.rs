//! Host-side physical-device resolution and IRQ-to-NUMA mapping (steps 6-7
//! of the resolution protocol).

use crate::error::Error;
use numadv_procio::sysfs::irq_effective_affinity;
use numadv_procio::NetSysfs;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;

/// Follows `iflink` chains and bonding slaves from `seed_ifnames` (read from
/// the host-side sysfs) until only physical devices (`iflink == ifindex`)
/// remain.
pub fn resolve_physical_devices(sysfs: &NetSysfs, seed_ifnames: &[String]) -> Result<Vec<String>, Error> {
    let mut ifindex_to_name: HashMap<i64, String> = HashMap::new();
    for name in sysfs.interfaces()? {
        if let Ok(idx) = sysfs.ifindex(&name) {
            let _ = ifindex_to_name.entry(idx).or_insert(name);
        }
    }

    let mut physical = BTreeSet::new();
    let mut visited = HashSet::new();
    let mut stack: Vec<String> = seed_ifnames.to_vec();
    while let Some(name) = stack.pop() {
        if !visited.insert(name.clone()) {
            continue;
        }
        let slaves = sysfs.bonding_slaves(&name)?;
        if !slaves.is_empty() {
            stack.extend(slaves);
            continue;
        }
        let Ok(ifindex) = sysfs.ifindex(&name) else {
            continue;
        };
        let Ok(iflink) = sysfs.iflink(&name) else {
            continue;
        };
        if iflink == ifindex {
            let _ = physical.insert(name);
        } else if let Some(next) = ifindex_to_name.get(&iflink) {
            stack.push(next.clone());
        }
    }
    Ok(physical.into_iter().collect())
}

/// Resolves `ifname`'s IRQ-derived NUMA ids (via `effective_affinity` and
/// the CPU->NUMA map) and its PCI `device/numa_node` fallback (`-1` meaning
/// "no affinity" is filtered out, not treated as node zero).
pub fn resolve_numa_for_device(
    sysfs: &NetSysfs,
    proc_root: &Path,
    ifname: &str,
    cpu_to_numa: &HashMap<usize, u32>,
) -> Result<(Vec<i64>, Option<i64>), Error> {
    let mut numa_ids = Vec::new();
    for irq in sysfs.msi_irqs(ifname)? {
        let mask = irq_effective_affinity(proc_root, irq)?;
        for cpu in mask.iter() {
            if let Some(&numa) = cpu_to_numa.get(&cpu) {
                numa_ids.push(i64::from(numa));
            }
        }
    }
    let fallback = sysfs.device_numa_node(ifname)?.filter(|&n| n >= 0);
    Ok((numa_ids, fallback))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write(path: &std::path::Path, contents: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    #[test]
    fn follows_iflink_chain_to_physical_device() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        // veth0 (virtual, iflink points at eth0) -> eth0 (physical).
        write(&root.join("veth0/ifindex"), "5\n");
        write(&root.join("veth0/iflink"), "2\n");
        write(&root.join("eth0/ifindex"), "2\n");
        write(&root.join("eth0/iflink"), "2\n");

        let sysfs = NetSysfs::new(root);
        let physical = resolve_physical_devices(&sysfs, &["veth0".to_string()]).unwrap();
        assert_eq!(physical, vec!["eth0".to_string()]);
    }

    #[test]
    fn follows_bonding_slaves() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        write(&root.join("bond0/bonding/slaves"), "eth0 eth1\n");
        write(&root.join("eth0/ifindex"), "2\n");
        write(&root.join("eth0/iflink"), "2\n");
        write(&root.join("eth1/ifindex"), "3\n");
        write(&root.join("eth1/iflink"), "3\n");

        let sysfs = NetSysfs::new(root);
        let mut physical = resolve_physical_devices(&sysfs, &["bond0".to_string()]).unwrap();
        physical.sort();
        assert_eq!(physical, vec!["eth0".to_string(), "eth1".to_string()]);
    }

    #[test]
    fn negative_pci_numa_node_is_filtered() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        write(&root.join("eth0/device/numa_node"), "-1\n");
        let sysfs = NetSysfs::new(root);
        let (irq_ids, fallback) =
            resolve_numa_for_device(&sysfs, &tmp.path().join("proc"), "eth0", &HashMap::new()).unwrap();
        assert!(irq_ids.is_empty());
        assert_eq!(fallback, None);
    }
}
