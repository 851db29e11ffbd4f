//! Five-level hardware topology: chip -> NUMA node -> cluster -> core -> CPU.
//!
//! The tree is built once from sysfs during startup and never torn down.
//! Nodes are stored in an arena (`Vec<TopoNode>`) and referenced by index so
//! that parent/child/attached-task links are plain integers rather than
//! owning pointers, following the no-cycles-through-ownership approach
//! `TopoTree` is meant to use.

use numadv_mask::Cpumask;
use numadv_procio::{CpuSysfs, Tid};
use std::collections::HashMap;

/// Fixed cluster width: four adjacent cores share a cluster.
pub const CPUS_PER_CLUSTER: usize = 4;

/// Errors that can occur while building the topology tree.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Reading the required sysfs topology files failed; this is fatal
    /// because the advisor has no way to make placement decisions without
    /// a topology.
    #[error("topology initialization failed: {0}")]
    Fatal(#[from] numadv_procio::Error),

    /// No online CPUs were found.
    #[error("no online CPUs found under sysfs")]
    NoOnlineCpus,
}

/// Ordered topology granularity. Ranking is by declaration order: coarser
/// types compare greater than finer ones and "contain" them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TopoType {
    /// A single logical CPU.
    Cpu,
    /// A physical core (possibly several SMT threads / CPUs).
    Core,
    /// A fixed 4-core group sharing a cache level.
    Cluster,
    /// A NUMA locality domain.
    Numa,
    /// A physical chip (package).
    Chip,
    /// The whole machine.
    All,
}

/// An arena index into [`TopoTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub usize);

/// One node of the topology tree.
#[derive(Debug, Clone)]
pub struct TopoNode {
    id: NodeId,
    ty: TopoType,
    mask: Cpumask,
    load: i64,
    bind_count: u32,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    attached_tasks: Vec<Tid>,
    numa_id: Option<u32>,
}

impl TopoNode {
    /// This node's arena id.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// This node's granularity.
    pub fn ty(&self) -> TopoType {
        self.ty
    }

    /// CPU mask covered by this node; equals the union of its children's
    /// masks.
    pub fn mask(&self) -> Cpumask {
        self.mask
    }

    /// Current scaled load (1024 == 100%).
    pub fn load(&self) -> i64 {
        self.load
    }

    /// Number of live bindings targeting this node or a descendant.
    pub fn bind_count(&self) -> u32 {
        self.bind_count
    }

    /// Parent node, `None` for the root.
    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    /// Direct children.
    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    /// Tids currently bound to exactly this node.
    pub fn attached_tasks(&self) -> &[Tid] {
        &self.attached_tasks
    }

    /// NUMA id, populated only for [`TopoType::Numa`] nodes.
    pub fn numa_id(&self) -> Option<u32> {
        self.numa_id
    }
}

/// Owns every [`TopoNode`] and indexes them by type and NUMA id.
#[derive(Debug, Default)]
pub struct TopoTree {
    nodes: Vec<TopoNode>,
    by_type: HashMap<TopoType, Vec<NodeId>>,
    by_numa: HashMap<u32, NodeId>,
    cpu_nodes: HashMap<usize, NodeId>,
    dedup: HashMap<(TopoType, Cpumask), NodeId>,
    root: Option<NodeId>,
}

impl TopoTree {
    fn get_or_create(&mut self, ty: TopoType, mask: Cpumask, numa_id: Option<u32>) -> NodeId {
        if let Some(&id) = self.dedup.get(&(ty, mask)) {
            return id;
        }
        let id = NodeId(self.nodes.len());
        self.nodes.push(TopoNode {
            id,
            ty,
            mask,
            load: 0,
            bind_count: 0,
            parent: None,
            children: Vec::new(),
            attached_tasks: Vec::new(),
            numa_id,
        });
        let _ = self.dedup.insert((ty, mask), id);
        self.by_type.entry(ty).or_default().push(id);
        if let Some(numa_id) = numa_id {
            let _ = self.by_numa.entry(numa_id).or_insert(id);
        }
        id
    }

    fn link(&mut self, child: NodeId, parent: NodeId) {
        if !self.nodes[parent.0].children.contains(&child) {
            self.nodes[parent.0].children.push(child);
        }
        self.nodes[child.0].parent = Some(parent);
    }

    /// Builds the topology tree by reading sysfs under `cpu_sysfs_root`
    /// (normally `/sys/devices/system/cpu`).
    pub fn build(sysfs: &CpuSysfs) -> Result<Self, Error> {
        let mut tree = Self::default();
        let online = sysfs.online_cpus()?;
        if online.is_empty() {
            return Err(Error::NoOnlineCpus);
        }

        let root = tree.get_or_create(TopoType::All, Cpumask::new(), None);
        tree.root = Some(root);

        for &cpu in &online {
            let cpu_node = tree.get_or_create(TopoType::Cpu, Cpumask::single(cpu), None);
            let _ = tree.cpu_nodes.insert(cpu, cpu_node);

            let core_mask = sysfs.thread_siblings_mask(cpu)?;
            let core_node = tree.get_or_create(TopoType::Core, core_mask, None);
            tree.link(cpu_node, core_node);

            let cluster_base = (cpu / CPUS_PER_CLUSTER) * CPUS_PER_CLUSTER;
            let mut cluster_mask = Cpumask::new();
            for c in cluster_base..cluster_base + CPUS_PER_CLUSTER {
                cluster_mask.set(c);
            }
            let cluster_node = tree.get_or_create(TopoType::Cluster, cluster_mask, None);
            tree.link(core_node, cluster_node);

            let numa_ids = sysfs.numa_node_ids(cpu)?;
            let numa_id = numa_ids.first().copied();
            let numa_mask = match numa_id {
                Some(n) => sysfs.numa_cpumap(cpu, n)?,
                None => Cpumask::single(cpu),
            };
            let numa_node = tree.get_or_create(TopoType::Numa, numa_mask, numa_id);
            tree.link(cluster_node, numa_node);

            let chip_mask = sysfs.core_siblings_mask(cpu)?;
            let chip_node = tree.get_or_create(TopoType::Chip, chip_mask, None);
            tree.link(numa_node, chip_node);

            tree.link(chip_node, root);
        }

        tree.recompute_masks_from_children();
        Ok(tree)
    }

    /// Recomputes every non-leaf mask as the union of its children's masks,
    /// guaranteeing invariant (a) even when offline CPUs make the raw sysfs
    /// masks (used only to *group* nodes) wider than the online set.
    fn recompute_masks_from_children(&mut self) {
        for ty in [
            TopoType::Core,
            TopoType::Cluster,
            TopoType::Numa,
            TopoType::Chip,
            TopoType::All,
        ] {
            let Some(ids) = self.by_type.get(&ty).cloned() else {
                continue;
            };
            for id in ids {
                let mut mask = Cpumask::new();
                for &child in &self.nodes[id.0].children {
                    mask = mask.or(&self.nodes[child.0].mask);
                }
                self.nodes[id.0].mask = mask;
            }
        }
    }

    /// The root ([`TopoType::All`]) node.
    pub fn root(&self) -> NodeId {
        self.root.expect("TopoTree::build always sets root")
    }

    /// Borrows a node by id.
    pub fn node(&self, id: NodeId) -> &TopoNode {
        &self.nodes[id.0]
    }

    /// The leaf node for a given CPU id, if it is online.
    pub fn cpu_node(&self, cpu: usize) -> Option<NodeId> {
        self.cpu_nodes.get(&cpu).copied()
    }

    /// The NUMA node with the given id, if present.
    pub fn numa_node(&self, numa_id: u32) -> Option<NodeId> {
        self.by_numa.get(&numa_id).copied()
    }

    /// Every node of the given type.
    pub fn nodes_of_type(&self, ty: TopoType) -> &[NodeId] {
        self.by_type.get(&ty).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Visits each node of `ty` once.
    pub fn foreach_type(&self, ty: TopoType, mut f: impl FnMut(NodeId)) {
        for &id in self.nodes_of_type(ty) {
            f(id);
        }
    }

    /// Walks upward from `node` until a node of `ty` is found; returns
    /// `None` if `ty` is finer than `node`'s own type (there is nothing to
    /// walk up to) or the root is reached without a match.
    pub fn parent(&self, node: NodeId, ty: TopoType) -> Option<NodeId> {
        if ty < self.nodes[node.0].ty {
            return None;
        }
        let mut cur = Some(node);
        while let Some(n) = cur {
            if self.nodes[n.0].ty == ty {
                return Some(n);
            }
            cur = self.nodes[n.0].parent;
        }
        None
    }

    fn descendants_of_type(&self, node: NodeId, ty: TopoType) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![node];
        while let Some(n) = stack.pop() {
            if self.nodes[n.0].ty == ty {
                out.push(n);
                continue; // ty is never an ancestor of itself in this tree
            }
            stack.extend(self.nodes[n.0].children.iter().copied());
        }
        out
    }

    /// Among descendants of `node` with type `ty`, returns the one with the
    /// smallest `bind_count`, ties broken by first-seen (discovery) order.
    pub fn select_lighter_bind(&self, node: NodeId, ty: TopoType) -> Option<NodeId> {
        self.descendants_of_type(node, ty)
            .into_iter()
            .min_by_key(|&id| self.nodes[id.0].bind_count)
    }

    /// Among descendants of `node` with type `ty`, returns the one with the
    /// smallest `load`, `bind_count` as tiebreaker, first-seen after that.
    pub fn select_lighter_load(&self, node: NodeId, ty: TopoType) -> Option<NodeId> {
        self.descendants_of_type(node, ty)
            .into_iter()
            .min_by_key(|&id| (self.nodes[id.0].load, self.nodes[id.0].bind_count))
    }

    fn cpu_leaves_under(&self, node: NodeId) -> Vec<NodeId> {
        self.descendants_of_type(node, TopoType::Cpu)
    }

    fn add_to_cpu_and_ancestors(&mut self, leaf: NodeId, delta: i64) {
        let mut cur = Some(leaf);
        while let Some(n) = cur {
            self.nodes[n.0].load += delta;
            cur = self.nodes[n.0].parent;
        }
    }

    /// Adds `delta` to `node`'s load. On a CPU leaf this propagates to every
    /// ancestor; on a non-leaf it distributes `delta / weight(mask)` to each
    /// CPU descendant (integer division, remainder lost).
    pub fn add_load(&mut self, node: NodeId, delta: i64) {
        if self.nodes[node.0].ty == TopoType::Cpu {
            self.add_to_cpu_and_ancestors(node, delta);
            return;
        }
        let leaves = self.cpu_leaves_under(node);
        if leaves.is_empty() {
            return;
        }
        let share = delta / leaves.len() as i64;
        for leaf in leaves {
            self.add_to_cpu_and_ancestors(leaf, share);
        }
    }

    /// Sets a CPU leaf's load to exactly `load`.
    pub fn set_load(&mut self, cpu: NodeId, load: i64) {
        debug_assert_eq!(self.nodes[cpu.0].ty, TopoType::Cpu);
        let cur = self.nodes[cpu.0].load;
        self.add_load(cpu, load - cur);
    }

    /// Subtracts `load` from `node` (any type).
    pub fn sub_load(&mut self, node: NodeId, load: i64) {
        self.add_load(node, -load);
    }

    /// Binds `tid` to `node`, bumping `bind_count` on `node` and every
    /// ancestor and recording the task in `node`'s attached set.
    pub fn bind_task(&mut self, node: NodeId, tid: Tid) {
        self.nodes[node.0].attached_tasks.push(tid);
        let mut cur = Some(node);
        while let Some(n) = cur {
            self.nodes[n.0].bind_count += 1;
            cur = self.nodes[n.0].parent;
        }
    }

    /// Reverses [`TopoTree::bind_task`]. Idempotent: unbinding a tid that is
    /// not attached to `node` only clears the matching entry, if any.
    pub fn unbind_task(&mut self, node: NodeId, tid: Tid) {
        let before = self.nodes[node.0].attached_tasks.len();
        self.nodes[node.0].attached_tasks.retain(|&t| t != tid);
        if self.nodes[node.0].attached_tasks.len() == before {
            return;
        }
        let mut cur = Some(node);
        while let Some(n) = cur {
            if self.nodes[n.0].bind_count > 0 {
                self.nodes[n.0].bind_count -= 1;
            }
            cur = self.nodes[n.0].parent;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::Path;

    /// Builds a fixture sysfs tree: `chips` chips, `numas_per_chip` NUMA
    /// nodes per chip, `clusters_per_numa` clusters of `CPUS_PER_CLUSTER`
    /// single-CPU cores each.
    fn build_fixture(root: &Path, chips: usize, numas_per_chip: usize, clusters_per_numa: usize) {
        let cpus_per_numa = clusters_per_numa * CPUS_PER_CLUSTER;
        let cpus_per_chip = numas_per_chip * cpus_per_numa;
        let total_cpus = chips * cpus_per_chip;

        for cpu in 0..total_cpus {
            let chip = cpu / cpus_per_chip;
            let within_chip = cpu % cpus_per_chip;
            let numa = chip * numas_per_chip + within_chip / cpus_per_numa;

            let mut chip_mask = Cpumask::new();
            for c in chip * cpus_per_chip..(chip + 1) * cpus_per_chip {
                chip_mask.set(c);
            }
            let mut numa_mask = Cpumask::new();
            let numa_within_chip = within_chip / cpus_per_numa;
            let numa_start = chip * cpus_per_chip + numa_within_chip * cpus_per_numa;
            for c in numa_start..numa_start + cpus_per_numa {
                numa_mask.set(c);
            }

            let dir = root.join(format!("cpu{cpu}"));
            fs::create_dir_all(dir.join("topology")).unwrap();
            fs::write(dir.join("topology/physical_package_id"), chip.to_string()).unwrap();
            fs::write(dir.join("topology/core_siblings"), chip_mask.to_hex()).unwrap();
            fs::write(dir.join("topology/core_id"), cpu.to_string()).unwrap();
            fs::write(dir.join("topology/thread_siblings"), Cpumask::single(cpu).to_hex())
                .unwrap();
            fs::create_dir_all(dir.join(format!("node{numa}"))).unwrap();
            fs::write(dir.join(format!("node{numa}/cpumap")), numa_mask.to_hex()).unwrap();
        }
    }

    #[test]
    fn mask_invariant_holds_across_tree() {
        let tmp = tempfile::tempdir().unwrap();
        build_fixture(tmp.path(), 1, 4, 8);
        let sysfs = CpuSysfs::new(tmp.path());
        let tree = TopoTree::build(&sysfs).unwrap();

        fn check(tree: &TopoTree, id: NodeId) {
            let node = tree.node(id);
            if node.children().is_empty() {
                return;
            }
            let mut union = Cpumask::new();
            for &c in node.children() {
                union = union.or(&tree.node(c).mask());
                check(tree, c);
            }
            assert!(union.equal(&node.mask()), "mask invariant violated at {:?}", node.ty());
        }
        check(&tree, tree.root());
        assert_eq!(tree.node(tree.root()).mask().weight(), 128);
    }

    #[test]
    fn select_lighter_bind_and_load() {
        let tmp = tempfile::tempdir().unwrap();
        build_fixture(tmp.path(), 1, 4, 8);
        let sysfs = CpuSysfs::new(tmp.path());
        let mut tree = TopoTree::build(&sysfs).unwrap();

        let numa0 = tree.numa_node(0).unwrap();
        let clusters = tree.descendants_of_type(numa0, TopoType::Cluster);
        assert_eq!(clusters.len(), 8);

        // Bump bind_count on one cluster so it is no longer the lightest.
        let heavy = clusters[0];
        tree.bind_task(heavy, 111);
        let lightest = tree.select_lighter_bind(numa0, TopoType::Cluster).unwrap();
        assert_ne!(lightest, heavy);

        // Give every cluster but one some load via its CPU leaves.
        for &cl in &clusters[1..] {
            let cpu_leaf = tree.descendants_of_type(cl, TopoType::Cpu)[0];
            tree.add_load(cpu_leaf, 1000);
        }
        let lightest_load = tree.select_lighter_load(numa0, TopoType::Cluster).unwrap();
        assert_eq!(lightest_load, clusters[0]);
    }

    #[test]
    fn load_propagates_to_ancestors() {
        let tmp = tempfile::tempdir().unwrap();
        build_fixture(tmp.path(), 1, 1, 1);
        let sysfs = CpuSysfs::new(tmp.path());
        let mut tree = TopoTree::build(&sysfs).unwrap();

        let cpu0 = tree.cpu_node(0).unwrap();
        tree.add_load(cpu0, 512);
        assert_eq!(tree.node(cpu0).load(), 512);
        let core = tree.parent(cpu0, TopoType::Core).unwrap();
        assert_eq!(tree.node(core).load(), 512);
        let root = tree.root();
        assert_eq!(tree.node(root).load(), 512);

        tree.set_load(cpu0, 100);
        assert_eq!(tree.node(cpu0).load(), 100);
        assert_eq!(tree.node(root).load(), 100);

        tree.sub_load(root, 50);
        assert_eq!(tree.node(root).load(), 50);
    }

    #[test]
    fn bind_count_follows_descendant_bindings() {
        let tmp = tempfile::tempdir().unwrap();
        build_fixture(tmp.path(), 1, 1, 1);
        let sysfs = CpuSysfs::new(tmp.path());
        let mut tree = TopoTree::build(&sysfs).unwrap();
        let cpu0 = tree.cpu_node(0).unwrap();
        let root = tree.root();

        tree.bind_task(cpu0, 42);
        assert_eq!(tree.node(cpu0).bind_count(), 1);
        assert_eq!(tree.node(root).bind_count(), 1);
        assert_eq!(tree.node(cpu0).attached_tasks(), &[42]);

        tree.unbind_task(cpu0, 42);
        assert_eq!(tree.node(cpu0).bind_count(), 0);
        assert_eq!(tree.node(root).bind_count(), 0);
        assert!(tree.node(cpu0).attached_tasks().is_empty());

        // Idempotent.
        tree.unbind_task(cpu0, 42);
        assert_eq!(tree.node(cpu0).bind_count(), 0);
    }

    #[test]
    fn parent_returns_none_for_finer_type() {
        let tmp = tempfile::tempdir().unwrap();
        build_fixture(tmp.path(), 1, 1, 1);
        let sysfs = CpuSysfs::new(tmp.path());
        let tree = TopoTree::build(&sysfs).unwrap();
        let numa0 = tree.numa_node(0).unwrap();
        assert!(tree.parent(numa0, TopoType::Cpu).is_none());
        assert_eq!(tree.parent(numa0, TopoType::Numa), Some(numa0));
    }
}
