//! Read-only helpers over `/proc`.

use crate::error::Error;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Process id.
pub type Pid = i32;
/// Thread id.
pub type Tid = i32;

/// A view over `/proc`, rooted at a configurable directory so tests can
/// point it at a fixture tree instead of the real `/proc`.
#[derive(Debug, Clone)]
pub struct ProcFs {
    root: PathBuf,
}

impl Default for ProcFs {
    fn default() -> Self {
        Self::new("/proc")
    }
}

/// A `/proc/net/{tcp,udp,tcp6,udp6}` row relevant to socket resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetEntry {
    /// Local address, e.g. `127.0.0.1:8080`.
    pub local_addr: String,
    /// Remote address, e.g. `10.0.0.5:443`.
    pub remote_addr: String,
    /// Socket inode backing this connection.
    pub inode: u64,
}

/// Which `/proc/net` table to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetTable {
    /// `/proc/net/tcp`
    Tcp,
    /// `/proc/net/tcp6`
    Tcp6,
    /// `/proc/net/udp`
    Udp,
    /// `/proc/net/udp6`
    Udp6,
}

impl NetTable {
    fn filename(self) -> &'static str {
        match self {
            NetTable::Tcp => "tcp",
            NetTable::Tcp6 => "tcp6",
            NetTable::Udp => "udp",
            NetTable::Udp6 => "udp6",
        }
    }

    /// The four tables consulted by the net resolver.
    pub fn all() -> [NetTable; 4] {
        [NetTable::Tcp, NetTable::Tcp6, NetTable::Udp, NetTable::Udp6]
    }
}

impl ProcFs {
    /// Builds a view rooted at `root` (normally `/proc`).
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The root this view reads from.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn pid_dir(&self, pid: Pid) -> PathBuf {
        self.root.join(pid.to_string())
    }

    /// Every numeric pid directory under the root.
    pub fn pids(&self) -> Result<Vec<Pid>, Error> {
        let mut out = Vec::new();
        let entries = fs::read_dir(&self.root).map_err(|e| Error::from_io(&self.root, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| Error::from_io(&self.root, e))?;
            if let Ok(pid) = entry.file_name().to_string_lossy().parse::<Pid>() {
                out.push(pid);
            }
        }
        out.sort_unstable();
        Ok(out)
    }

    /// Every tid under `/proc/<pid>/task`.
    pub fn tasks(&self, pid: Pid) -> Result<Vec<Tid>, Error> {
        let dir = self.pid_dir(pid).join("task");
        let mut out = Vec::new();
        let entries = fs::read_dir(&dir).map_err(|e| Error::from_io(&dir, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| Error::from_io(&dir, e))?;
            if let Ok(tid) = entry.file_name().to_string_lossy().parse::<Tid>() {
                out.push(tid);
            }
        }
        out.sort_unstable();
        Ok(out)
    }

    /// Whether `/proc/<pid>/task/<tid>` still exists.
    pub fn task_exists(&self, pid: Pid, tid: Tid) -> bool {
        self.pid_dir(pid).join("task").join(tid.to_string()).exists()
    }

    /// `/proc/<pid>/task/<tid>/comm`, trimmed.
    pub fn comm(&self, pid: Pid, tid: Tid) -> Result<String, Error> {
        let path = self.pid_dir(pid).join("task").join(tid.to_string()).join("comm");
        let raw = fs::read_to_string(&path).map_err(|e| Error::from_io(&path, e))?;
        Ok(raw.trim().to_string())
    }

    /// Returns every pid whose `/proc/<pid>/comm` equals `comm`.
    pub fn resolve_comm_to_pids(&self, comm: &str) -> Result<Vec<Pid>, Error> {
        let mut out = Vec::new();
        for pid in self.pids()? {
            let path = self.pid_dir(pid).join("comm");
            match fs::read_to_string(&path) {
                Ok(raw) if raw.trim() == comm => out.push(pid),
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(Error::from_io(&path, e)),
            }
        }
        Ok(out)
    }

    /// `/proc/<pid>/environ`, split into key/value pairs.
    pub fn environ(&self, pid: Pid) -> Result<HashMap<String, String>, Error> {
        let path = self.pid_dir(pid).join("environ");
        let raw = fs::read(&path).map_err(|e| Error::from_io(&path, e))?;
        let mut out = HashMap::new();
        for chunk in raw.split(|&b| b == 0) {
            if chunk.is_empty() {
                continue;
            }
            let entry = String::from_utf8_lossy(chunk);
            if let Some((k, v)) = entry.split_once('=') {
                let _ = out.insert(k.to_string(), v.to_string());
            }
        }
        Ok(out)
    }

    /// `Tgid:` field of `/proc/<tid>/status`, the owning process id of a
    /// (possibly non-leader) thread id.
    pub fn tgid(&self, tid: Tid) -> Result<Pid, Error> {
        let path = self.root.join(tid.to_string()).join("status");
        let raw = fs::read_to_string(&path).map_err(|e| Error::from_io(&path, e))?;
        for line in raw.lines() {
            if let Some(rest) = line.strip_prefix("Tgid:") {
                return rest
                    .trim()
                    .parse()
                    .map_err(|e: std::num::ParseIntError| Error::parse(&path, e.to_string()));
            }
        }
        Err(Error::parse(&path, "missing Tgid field"))
    }

    /// Per-CPU `(user_ticks, system_ticks)` deltas from `/proc/stat`; the
    /// `nice` column is not folded into `user`.
    pub fn stat_cpu_lines(&self) -> Result<Vec<(usize, u64, u64)>, Error> {
        let path = self.root.join("stat");
        let raw = fs::read_to_string(&path).map_err(|e| Error::from_io(&path, e))?;
        let mut out = Vec::new();
        for line in raw.lines() {
            let Some(rest) = line.strip_prefix("cpu") else {
                continue;
            };
            let mut fields = rest.split_whitespace();
            let Some(id_str) = fields.next() else {
                continue;
            };
            let Ok(id) = id_str.parse::<usize>() else {
                continue; // the aggregate "cpu " line has no id
            };
            let values: Vec<u64> = fields.filter_map(|f| f.parse().ok()).collect();
            let user = *values.first().ok_or_else(|| Error::parse(&path, "missing user field"))?;
            let system = *values.get(2).ok_or_else(|| Error::parse(&path, "missing system field"))?;
            out.push((id, user, system));
        }
        Ok(out)
    }

    /// `(user_ticks, system_ticks)` for a task, parsed from fields 14 and 15
    /// of `/proc/<pid>/task/<tid>/stat` (1-indexed, canonical form). The
    /// `comm` field is skipped by locating the last `)` so that embedded
    /// spaces or parentheses in thread names do not shift field offsets.
    pub fn task_stat_ticks(&self, pid: Pid, tid: Tid) -> Result<(u64, u64), Error> {
        let path = self
            .pid_dir(pid)
            .join("task")
            .join(tid.to_string())
            .join("stat");
        let raw = fs::read_to_string(&path).map_err(|e| Error::from_io(&path, e))?;
        let after_comm = raw
            .rfind(')')
            .map(|idx| &raw[idx + 1..])
            .ok_or_else(|| Error::parse(&path, "missing comm terminator"))?;
        let fields: Vec<&str> = after_comm.split_whitespace().collect();
        // `fields[0]` is field 3 (state); field 14 is therefore index 11.
        let utime = fields
            .get(11)
            .ok_or_else(|| Error::parse(&path, "missing utime field"))?;
        let stime = fields
            .get(12)
            .ok_or_else(|| Error::parse(&path, "missing stime field"))?;
        let user = utime.parse().map_err(|e: std::num::ParseIntError| Error::parse(&path, e.to_string()))?;
        let system = stime.parse().map_err(|e: std::num::ParseIntError| Error::parse(&path, e.to_string()))?;
        Ok((user, system))
    }

    /// Per-NUMA-node page fault counters from `/proc/<pid>/task_fault_siblings`,
    /// a whitespace-separated list of counters indexed by NUMA node.
    pub fn task_fault_siblings(&self, pid: Pid) -> Result<Vec<u64>, Error> {
        let path = self.pid_dir(pid).join("task_fault_siblings");
        let raw = fs::read_to_string(&path).map_err(|e| Error::from_io(&path, e))?;
        raw.split_whitespace()
            .map(|f| f.parse().map_err(|e: std::num::ParseIntError| Error::parse(&path, e.to_string())))
            .collect()
    }

    /// Target of `/proc/<pid>/fd/<fd>`, e.g. `socket:[12345]`.
    pub fn fd_target(&self, pid: Pid, fd: i32) -> Result<String, Error> {
        let path = self.pid_dir(pid).join("fd").join(fd.to_string());
        let target = fs::read_link(&path).map_err(|e| Error::from_io(&path, e))?;
        Ok(target.to_string_lossy().to_string())
    }

    /// Every open fd number for `pid`.
    pub fn open_fds(&self, pid: Pid) -> Result<Vec<i32>, Error> {
        let dir = self.pid_dir(pid).join("fd");
        let mut out = Vec::new();
        let entries = fs::read_dir(&dir).map_err(|e| Error::from_io(&dir, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| Error::from_io(&dir, e))?;
            if let Ok(fd) = entry.file_name().to_string_lossy().parse::<i32>() {
                out.push(fd);
            }
        }
        Ok(out)
    }

    /// Parses one of the `/proc/net/{tcp,udp,tcp6,udp6}` tables.
    pub fn net_table(&self, table: NetTable) -> Result<Vec<NetEntry>, Error> {
        let path = self.root.join("net").join(table.filename());
        let raw = fs::read_to_string(&path).map_err(|e| Error::from_io(&path, e))?;
        let mut out = Vec::new();
        for line in raw.lines().skip(1) {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 10 {
                continue;
            }
            let local = decode_hex_addr(fields[1]);
            let remote = decode_hex_addr(fields[2]);
            let inode: u64 = fields[9].parse().unwrap_or(0);
            if let (Some(local), Some(remote)) = (local, remote) {
                out.push(NetEntry {
                    local_addr: local,
                    remote_addr: remote,
                    inode,
                });
            }
        }
        Ok(out)
    }
}

/// Parses the socket inode out of a `/proc/<pid>/fd/<fd>` readlink target of
/// the form `socket:[12345]`.
pub fn socket_inode(target: &str) -> Option<u64> {
    target
        .strip_prefix("socket:[")
        .and_then(|s| s.strip_suffix(']'))
        .and_then(|s| s.parse().ok())
}

/// Decodes a `/proc/net/{tcp,udp}` hex `ADDR:PORT` field into a textual
/// `ip:port` form. IPv4 fields are 8 hex chars (little-endian u32); IPv6
/// fields are 32 hex chars (four little-endian u32 words).
fn decode_hex_addr(field: &str) -> Option<String> {
    let (addr_hex, port_hex) = field.split_once(':')?;
    let port = u16::from_str_radix(port_hex, 16).ok()?;
    if addr_hex.len() == 8 {
        let raw = u32::from_str_radix(addr_hex, 16).ok()?;
        let bytes = raw.to_le_bytes();
        Some(format!("{}.{}.{}.{}:{port}", bytes[0], bytes[1], bytes[2], bytes[3]))
    } else if addr_hex.len() == 32 {
        let mut bytes = Vec::with_capacity(16);
        for word_idx in 0..4 {
            let word = u32::from_str_radix(&addr_hex[word_idx * 8..word_idx * 8 + 8], 16).ok()?;
            bytes.extend_from_slice(&word.to_le_bytes());
        }
        let segments: Vec<String> = bytes
            .chunks(2)
            .map(|c| format!("{:02x}{:02x}", c[0], c[1]))
            .collect();
        Some(format!("[{}]:{port}", segments.join(":")))
    } else {
        None
    }
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
    fn parses_task_stat_with_odd_comm() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        // comm "odd (name)" contains parens; utime=111 (field14), stime=222 (field15)
        let stat_line = "123 (odd (name)) S 1 1 1 0 -1 0 0 0 0 0 111 222 0 0 20 0 1 0 0 0";
        write(&root.join("1/task/123/stat"), stat_line);
        let pf = ProcFs::new(root);
        let (user, system) = pf.task_stat_ticks(1, 123).unwrap();
        assert_eq!((user, system), (111, 222));
    }

    #[test]
    fn parses_proc_stat_cpu_lines() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        write(
            &root.join("stat"),
            "cpu  100 0 50 900 0 0 0 0 0 0\ncpu0 50 0 25 450 0 0 0 0 0 0\ncpu1 50 0 25 450 0 0 0 0 0 0\n",
        );
        let pf = ProcFs::new(root);
        let rows = pf.stat_cpu_lines().unwrap();
        assert_eq!(rows, vec![(0, 50, 25), (1, 50, 25)]);
    }

    #[test]
    fn decodes_ipv4_hex_address() {
        // 0100007F:1F90 -> 127.0.0.1:8080
        assert_eq!(decode_hex_addr("0100007F:1F90").unwrap(), "127.0.0.1:8080");
    }

    #[test]
    fn environ_splits_on_nul() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        write_bytes(&root.join("1/environ"), b"FOO=bar\0BAZ=qux\0");
        let pf = ProcFs::new(root);
        let env = pf.environ(1).unwrap();
        assert_eq!(env.get("FOO"), Some(&"bar".to_string()));
        assert_eq!(env.get("BAZ"), Some(&"qux".to_string()));
    }

    fn write_bytes(path: &Path, contents: &[u8]) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    #[test]
    fn socket_inode_parses_fd_target() {
        assert_eq!(socket_inode("socket:[4567]"), Some(4567));
        assert_eq!(socket_inode("/dev/null"), None);
    }
}
