//! IO/NET CPU partitions and proportional thread-to-group binding.

use numadv_mask::Cpumask;
use numadv_procio::Tid;
use numadv_topology::{TopoTree, TopoType};
use numadv_trace::ProcessFeature;

/// Maximum CPU id a partition token may name.
pub const MAX_CPU_ID: usize = 2047;

/// Errors parsing partition tokens.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A token was neither `N` nor `L-H` with `0 <= L <= H <= 2047`.
    #[error("invalid CPU partition token {0:?}")]
    InvalidToken(String),
}

/// Which kind of thread a [`CpuGroup`] is reserved for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tag {
    /// Threads making `io_getevents` calls.
    Io,
    /// Threads observed touching a live network socket.
    Net,
}

/// A contiguous or discrete set of CPUs reserved for one [`Tag`].
#[derive(Debug, Clone)]
pub struct CpuGroup {
    /// The kind of thread this group accepts.
    pub tag: Tag,
    /// Member CPU ids, ascending.
    pub cpus: Vec<usize>,
}

impl CpuGroup {
    /// This group's CPUs as a [`Cpumask`].
    pub fn mask(&self) -> Cpumask {
        self.cpus.iter().copied().collect()
    }
}

/// A complete set of `IO`- and `NET`-tagged [`CpuGroup`]s.
#[derive(Debug, Clone, Default)]
pub struct CpuPartition {
    /// Every group, in parse/generation order.
    pub groups: Vec<CpuGroup>,
}

impl CpuPartition {
    /// Parses the `--io` and `--net` CLI tokens into a partition. Either
    /// string may be empty, producing no groups of that tag.
    pub fn parse(io: &str, net: &str) -> Result<Self, Error> {
        let mut groups = parse_tag(io, Tag::Io)?;
        groups.extend(parse_tag(net, Tag::Net)?);
        Ok(Self { groups })
    }

    /// The default partition used when no `--io`/`--net` input is given:
    /// one `NET`-tagged group per NUMA node, covering that node's CPUs.
    pub fn default_from_topology(tree: &TopoTree) -> Self {
        let mut groups = Vec::new();
        tree.foreach_type(TopoType::Numa, |id| {
            groups.push(CpuGroup {
                tag: Tag::Net,
                cpus: tree.node(id).mask().iter().collect(),
            });
        });
        Self { groups }
    }

    /// Groups tagged `tag`, in definition order.
    pub fn groups_with_tag(&self, tag: Tag) -> impl Iterator<Item = &CpuGroup> {
        self.groups.iter().filter(move |g| g.tag == tag)
    }
}

fn parse_tag(input: &str, tag: Tag) -> Result<Vec<CpuGroup>, Error> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    trimmed
        .split(',')
        .map(|token| {
            let cpus = parse_token(token.trim())?;
            Ok(CpuGroup { tag, cpus })
        })
        .collect()
}

fn parse_token(token: &str) -> Result<Vec<usize>, Error> {
    let invalid = || Error::InvalidToken(token.to_string());
    if let Some((lo, hi)) = token.split_once('-') {
        let lo: usize = lo.parse().map_err(|_| invalid())?;
        let hi: usize = hi.parse().map_err(|_| invalid())?;
        if lo > hi || hi > MAX_CPU_ID {
            return Err(invalid());
        }
        Ok((lo..=hi).collect())
    } else {
        let n: usize = token.parse().map_err(|_| invalid())?;
        if n > MAX_CPU_ID {
            return Err(invalid());
        }
        Ok(vec![n])
    }
}

/// One thread pinned to one group's CPU list.
#[derive(Debug, Clone)]
pub struct Assignment {
    /// The thread being pinned.
    pub tid: Tid,
    /// The CPUs it should be restricted to.
    pub cpus: Vec<usize>,
}

fn is_tagged(feature: &ProcessFeature, tag: Tag) -> bool {
    match tag {
        Tag::Net => feature.net_access_count > 0,
        Tag::Io => feature.io_getevents_count > 0,
    }
}

/// Distributes every `tag`-tagged thread in `features` across `partition`'s
/// `tag`-tagged groups, proportionally to each group's CPU width. A group
/// that would receive zero threads by the share formula, but threads and
/// width both remain, can still receive the final leftover batch (the last
/// group with nonzero width absorbs whatever remains).
pub fn bind_tagged(partition: &CpuPartition, tag: Tag, features: &[ProcessFeature]) -> Vec<Assignment> {
    let mut threads = features
        .iter()
        .filter(|f| is_tagged(f, tag))
        .map(|f| f.tid);

    let groups: Vec<&CpuGroup> = partition.groups_with_tag(tag).collect();
    let mut width: usize = groups.iter().map(|g| g.cpus.len()).sum();
    let mut remaining = features.iter().filter(|f| is_tagged(f, tag)).count();

    let mut assignments = Vec::new();
    for group in groups {
        if width == 0 {
            break;
        }
        let group_width = group.cpus.len();
        let share = (remaining * group_width + group_width) / width;
        let share = share.min(remaining);
        for _ in 0..share {
            let Some(tid) = threads.next() else { break };
            assignments.push(Assignment {
                tid,
                cpus: group.cpus.clone(),
            });
        }
        remaining -= share;
        width -= group_width;
    }
    assignments
}
