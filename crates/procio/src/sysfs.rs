//! Read-only helpers over `/sys/devices/system/cpu/...`.

use crate::error::Error;
use numadv_mask::Cpumask;
use std::fs;
use std::path::{Path, PathBuf};

/// A view over the CPU topology exposed under sysfs, rooted at a
/// configurable directory so tests can point it at a fixture tree instead
/// of the real `/sys`.
#[derive(Debug, Clone)]
pub struct CpuSysfs {
    root: PathBuf,
}

impl Default for CpuSysfs {
    fn default() -> Self {
        Self::new("/sys/devices/system/cpu")
    }
}

impl CpuSysfs {
    /// Builds a view rooted at `root` (normally
    /// `/sys/devices/system/cpu`).
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn cpu_dir(&self, cpu: usize) -> PathBuf {
        self.root.join(format!("cpu{cpu}"))
    }

    fn read_trimmed(&self, path: &Path) -> Result<String, Error> {
        let raw = fs::read_to_string(path).map_err(|e| Error::from_io(path, e))?;
        Ok(raw.trim().trim_end_matches(',').to_string())
    }

    /// Returns the ids of every present, online CPU. A CPU whose `online`
    /// file is absent (commonly `cpu0`) is treated as online.
    pub fn online_cpus(&self) -> Result<Vec<usize>, Error> {
        let mut ids = Vec::new();
        let entries = fs::read_dir(&self.root).map_err(|e| Error::from_io(&self.root, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| Error::from_io(&self.root, e))?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let Some(suffix) = name.strip_prefix("cpu") else {
                continue;
            };
            let Ok(id) = suffix.parse::<usize>() else {
                continue;
            };
            if self.is_online(id)? {
                ids.push(id);
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    fn is_online(&self, cpu: usize) -> Result<bool, Error> {
        let path = self.cpu_dir(cpu).join("online");
        match fs::read_to_string(&path) {
            Ok(raw) => Ok(raw.trim() == "1"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(true),
            Err(e) => Err(Error::from_io(&path, e)),
        }
    }

    /// `topology/physical_package_id` — the chip id for `cpu`.
    pub fn physical_package_id(&self, cpu: usize) -> Result<i64, Error> {
        let path = self.cpu_dir(cpu).join("topology/physical_package_id");
        let raw = self.read_trimmed(&path)?;
        raw.parse::<i64>()
            .map_err(|e| Error::parse(&path, e.to_string()))
    }

    /// `topology/core_siblings` — the chip-wide CPU mask for `cpu`.
    pub fn core_siblings_mask(&self, cpu: usize) -> Result<Cpumask, Error> {
        let path = self.cpu_dir(cpu).join("topology/core_siblings");
        let raw = self.read_trimmed(&path)?;
        Cpumask::parse_hex(&raw.replace(',', "")).map_err(|e| Error::parse(&path, e.to_string()))
    }

    /// `topology/core_id` — the physical core id for `cpu`.
    pub fn core_id(&self, cpu: usize) -> Result<i64, Error> {
        let path = self.cpu_dir(cpu).join("topology/core_id");
        let raw = self.read_trimmed(&path)?;
        raw.parse::<i64>()
            .map_err(|e| Error::parse(&path, e.to_string()))
    }

    /// `topology/thread_siblings` — the core-wide CPU mask for `cpu`.
    pub fn thread_siblings_mask(&self, cpu: usize) -> Result<Cpumask, Error> {
        let path = self.cpu_dir(cpu).join("topology/thread_siblings");
        let raw = self.read_trimmed(&path)?;
        Cpumask::parse_hex(&raw.replace(',', "")).map_err(|e| Error::parse(&path, e.to_string()))
    }

    /// Numa node ids visible from `cpu`'s directory (`nodeK` entries).
    pub fn numa_node_ids(&self, cpu: usize) -> Result<Vec<u32>, Error> {
        let dir = self.cpu_dir(cpu);
        let mut ids = Vec::new();
        let entries = fs::read_dir(&dir).map_err(|e| Error::from_io(&dir, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| Error::from_io(&dir, e))?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(suffix) = name.strip_prefix("node") {
                if let Ok(id) = suffix.parse::<u32>() {
                    ids.push(id);
                }
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    /// `nodeK/cpumap` — the CPU mask of NUMA node `node` as seen from `cpu`.
    pub fn numa_cpumap(&self, cpu: usize, node: u32) -> Result<Cpumask, Error> {
        let path = self.cpu_dir(cpu).join(format!("node{node}/cpumap"));
        let raw = self.read_trimmed(&path)?;
        Cpumask::parse_hex(&raw.replace(',', "")).map_err(|e| Error::parse(&path, e.to_string()))
    }
}

/// A view over `/sys/class/net` and `/sys/devices` used by the net resolver.
#[derive(Debug, Clone)]
pub struct NetSysfs {
    root: PathBuf,
}

impl Default for NetSysfs {
    fn default() -> Self {
        Self::new("/sys/class/net")
    }
}

impl NetSysfs {
    /// Builds a view rooted at `root` (normally `/sys/class/net`).
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn iface_dir(&self, ifname: &str) -> PathBuf {
        self.root.join(ifname)
    }

    /// Lists interface names present under the root.
    pub fn interfaces(&self) -> Result<Vec<String>, Error> {
        let mut names = Vec::new();
        let entries = fs::read_dir(&self.root).map_err(|e| Error::from_io(&self.root, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| Error::from_io(&self.root, e))?;
            names.push(entry.file_name().to_string_lossy().to_string());
        }
        Ok(names)
    }

    /// `ifindex` of an interface.
    pub fn ifindex(&self, ifname: &str) -> Result<i64, Error> {
        let path = self.iface_dir(ifname).join("ifindex");
        let raw = fs::read_to_string(&path).map_err(|e| Error::from_io(&path, e))?;
        raw.trim()
            .parse()
            .map_err(|e: std::num::ParseIntError| Error::parse(&path, e.to_string()))
    }

    /// `iflink` of an interface; differs from `ifindex` for virtual devices.
    pub fn iflink(&self, ifname: &str) -> Result<i64, Error> {
        let path = self.iface_dir(ifname).join("iflink");
        let raw = fs::read_to_string(&path).map_err(|e| Error::from_io(&path, e))?;
        raw.trim()
            .parse()
            .map_err(|e: std::num::ParseIntError| Error::parse(&path, e.to_string()))
    }

    /// `device/numa_node` PCI fallback, or `None` when the device has no
    /// PCI-backed `numa_node` attribute.
    pub fn device_numa_node(&self, ifname: &str) -> Result<Option<i64>, Error> {
        let path = self.iface_dir(ifname).join("device/numa_node");
        match fs::read_to_string(&path) {
            Ok(raw) => raw
                .trim()
                .parse()
                .map(Some)
                .map_err(|e: std::num::ParseIntError| Error::parse(&path, e.to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::from_io(&path, e)),
        }
    }

    /// IRQ numbers behind `device/msi_irqs/*`.
    pub fn msi_irqs(&self, ifname: &str) -> Result<Vec<u32>, Error> {
        let dir = self.iface_dir(ifname).join("device/msi_irqs");
        match fs::read_dir(&dir) {
            Ok(entries) => {
                let mut irqs = Vec::new();
                for entry in entries {
                    let entry = entry.map_err(|e| Error::from_io(&dir, e))?;
                    if let Ok(n) = entry.file_name().to_string_lossy().parse::<u32>() {
                        irqs.push(n);
                    }
                }
                Ok(irqs)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(Error::from_io(&dir, e)),
        }
    }

    /// Bonding slave interface names, empty when `ifname` is not a bond.
    pub fn bonding_slaves(&self, ifname: &str) -> Result<Vec<String>, Error> {
        let path = self.iface_dir(ifname).join("bonding/slaves");
        match fs::read_to_string(&path) {
            Ok(raw) => Ok(raw.split_whitespace().map(str::to_string).collect()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(Error::from_io(&path, e)),
        }
    }
}

/// Reads `/proc/irq/<n>/effective_affinity`.
pub fn irq_effective_affinity(proc_root: &Path, irq: u32) -> Result<Cpumask, Error> {
    let path = proc_root.join(format!("irq/{irq}/effective_affinity"));
    let raw = fs::read_to_string(&path).map_err(|e| Error::from_io(&path, e))?;
    Cpumask::parse_hex(raw.trim().replace(',', "").as_str())
        .map_err(|e| Error::parse(&path, e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write(path: &Path, contents: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    #[test]
    fn reads_topology_fields() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        write(&root.join("cpu0/topology/physical_package_id"), "0\n");
        write(&root.join("cpu0/topology/core_siblings"), "ff\n");
        write(&root.join("cpu0/topology/core_id"), "3\n");
        write(&root.join("cpu0/topology/thread_siblings"), "3\n");
        write(&root.join("cpu0/node0/cpumap"), "ff\n");

        let sysfs = CpuSysfs::new(root);
        assert_eq!(sysfs.physical_package_id(0).unwrap(), 0);
        assert_eq!(sysfs.core_siblings_mask(0).unwrap().weight(), 8);
        assert_eq!(sysfs.core_id(0).unwrap(), 3);
        assert_eq!(sysfs.thread_siblings_mask(0).unwrap().weight(), 2);
        assert_eq!(sysfs.numa_node_ids(0).unwrap(), vec![0]);
        assert_eq!(sysfs.numa_cpumap(0, 0).unwrap().weight(), 8);
    }

    #[test]
    fn missing_online_file_means_online() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        fs::create_dir_all(root.join("cpu0")).unwrap();
        fs::create_dir_all(root.join("cpu1")).unwrap();
        write(&root.join("cpu1/online"), "0\n");
        let sysfs = CpuSysfs::new(root);
        assert_eq!(sysfs.online_cpus().unwrap(), vec![0]);
    }
}
