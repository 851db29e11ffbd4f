//! Interface and socket resolution performed inside the target's network
//! namespace (steps 3-5 of the resolution protocol).

use crate::error::Error;
use nix::ifaddrs::getifaddrs;
use numadv_procio::procfs::socket_inode;
use numadv_procio::{NetSysfs, NetTable, Pid, ProcFs};
use std::collections::HashMap;
use std::net::IpAddr;

/// Builds `ip -> ifname` for every address-bearing interface visible in the
/// current (target) network namespace.
pub fn build_ip_to_ifname_map() -> Result<HashMap<IpAddr, String>, Error> {
    let mut map = HashMap::new();
    for iface in getifaddrs().map_err(Error::Nix)? {
        let Some(addr) = iface.address else { continue };
        let ip = addr
            .as_sockaddr_in()
            .map(|a| IpAddr::V4(a.ip()))
            .or_else(|| addr.as_sockaddr_in6().map(|a| IpAddr::V6(a.ip())));
        if let Some(ip) = ip {
            let _ = map.insert(ip, iface.interface_name);
        }
    }
    Ok(map)
}

fn strip_port(addr: &str) -> &str {
    if let Some(rest) = addr.strip_prefix('[') {
        rest.split(']').next().unwrap_or(rest)
    } else {
        addr.rsplit_once(':').map_or(addr, |(ip, _)| ip)
    }
}

/// Reduces `::ffff:a.b.c.d` to the embedded IPv4 and drops loopback
/// addresses (neither can identify a useful NUMA-local device).
pub fn normalize_ip(addr: &str) -> Option<IpAddr> {
    let ip: IpAddr = strip_port(addr).parse().ok()?;
    let ip = match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map_or(IpAddr::V6(v6), IpAddr::V4),
        other => other,
    };
    if ip.is_loopback() {
        None
    } else {
        Some(ip)
    }
}

/// Resolves `pid`'s open sockets to interface names via the local address
/// each socket is bound to, consulting the TCP/UDP tables of the current
/// (target) namespace. The local address is the one that can actually
/// match an entry in `ip_to_ifname`, which is built from this host's own
/// interface addresses; a peer's address almost never will.
pub fn resolve_socket_ifnames(
    procfs: &ProcFs,
    pid: Pid,
    ip_to_ifname: &HashMap<IpAddr, String>,
) -> Result<Vec<String>, Error> {
    let mut socket_inodes = Vec::new();
    for fd in procfs.open_fds(pid)? {
        if let Ok(target) = procfs.fd_target(pid, fd) {
            if let Some(inode) = socket_inode(&target) {
                socket_inodes.push(inode);
            }
        }
    }

    let mut ifnames = Vec::new();
    for table in NetTable::all() {
        let Ok(entries) = procfs.net_table(table) else {
            continue;
        };
        for entry in entries {
            if !socket_inodes.contains(&entry.inode) {
                continue;
            }
            let Some(ip) = normalize_ip(&entry.local_addr) else {
                continue;
            };
            if let Some(ifname) = ip_to_ifname.get(&ip) {
                if !ifnames.contains(ifname) {
                    ifnames.push(ifname.clone());
                }
            }
        }
    }
    Ok(ifnames)
}

/// Splits `ifnames` into devices that are already physical
/// (`iflink == ifindex`) and devices that need host-side re-resolution.
pub fn classify_ifnames(sysfs: &NetSysfs, ifnames: &[String]) -> Result<(Vec<String>, Vec<String>), Error> {
    let mut physical = Vec::new();
    let mut virtual_ = Vec::new();
    for ifname in ifnames {
        let ifindex = sysfs.ifindex(ifname)?;
        let iflink = sysfs.iflink(ifname)?;
        if iflink == ifindex {
            physical.push(ifname.clone());
        } else {
            virtual_.push(ifname.clone());
        }
    }
    Ok((physical, virtual_))
}
