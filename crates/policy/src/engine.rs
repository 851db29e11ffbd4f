//! The periodic tick: retry, dispatch, unbind-stale, balance.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Instant;

use numadv_channel::DelayQueue;
use numadv_group::{group_changed, BindGroup};
use numadv_load::LoadTracker;
use numadv_net::NetResolver;
use numadv_procio::{Pid, ProcFs, Tid};
use numadv_topology::{TopoTree, TopoType};
use tracing::{debug, warn};

use crate::affinity::SetAffinity;
use crate::types::{BindGroupInfo, BindTaskInfo, Flags, RetryRecord, TickReport};

const DELAY_QUEUE_CAPACITY: usize = 5000;
const SCHED_GROUP_PREFIX: &str = "__SCHED_GROUP__";
/// `0.30 * 1024`, truncated, expressed as a fraction to stay in integer math.
const MIGRATION_GAP_NUM: i64 = 307;
const MIGRATION_GAP_DEN: i64 = 100;

/// Owns every piece of mutable state the tick touches: the topology tree,
/// the load tracker, the bind maps, the retry list, and the delay queue.
pub struct PolicyEngine<A: SetAffinity> {
    flags: Flags,
    tree: TopoTree,
    loads: LoadTracker,
    procfs: ProcFs,
    affinity: A,
    net_resolver: NetResolver,
    cpu_to_numa: HashMap<usize, u32>,
    net_scratch: PathBuf,
    target_comm: Option<String>,

    bind_task_map: HashMap<Tid, BindTaskInfo>,
    bind_group_map: HashMap<String, BindGroupInfo>,
    retry_list: Vec<RetryRecord>,
    delay_queue: DelayQueue<Pid>,
    last_groups: HashMap<Pid, Vec<BindGroup>>,
}

impl<A: SetAffinity> PolicyEngine<A> {
    /// Builds a fresh engine over an already-built topology. `target_comm`
    /// restricts every procfs scan to processes with that `comm`; `None`
    /// scans every pid.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        flags: Flags,
        tree: TopoTree,
        procfs: ProcFs,
        affinity: A,
        net_resolver: NetResolver,
        cpu_to_numa: HashMap<usize, u32>,
        net_scratch: PathBuf,
        target_comm: Option<String>,
    ) -> Self {
        Self {
            flags,
            tree,
            loads: LoadTracker::new(),
            procfs,
            affinity,
            net_resolver,
            cpu_to_numa,
            net_scratch,
            target_comm,
            bind_task_map: HashMap::new(),
            bind_group_map: HashMap::new(),
            retry_list: Vec::new(),
            delay_queue: DelayQueue::new(DELAY_QUEUE_CAPACITY),
            last_groups: HashMap::new(),
        }
    }

    /// The topology tree, for inspection in tests and telemetry.
    pub fn tree(&self) -> &TopoTree {
        &self.tree
    }

    /// Currently bound threads, keyed by tid.
    pub fn bind_task_map(&self) -> &HashMap<Tid, BindTaskInfo> {
        &self.bind_task_map
    }

    /// Currently bound groups, keyed by name.
    pub fn bind_group_map(&self) -> &HashMap<String, BindGroupInfo> {
        &self.bind_group_map
    }

    /// Threads awaiting a retried affinity syscall.
    pub fn retry_list(&self) -> &[RetryRecord] {
        &self.retry_list
    }

    /// Mutable access to the affinity backend, for tests that script
    /// failures against a fake.
    pub fn affinity_mut(&mut self) -> &mut A {
        &mut self.affinity
    }

    /// Runs one tick in the fixed order: `update_loads` -> `retry_bind` ->
    /// dispatch -> unbind-stale -> `balance_task`. `detect_groups` performs
    /// the futex-based trace-and-group detection for one pid; it is
    /// supplied by the caller because it needs an OS-thread-pinned trace
    /// worker pool this crate does not own.
    pub fn tick(
        &mut self,
        now: Instant,
        detect_groups: &mut dyn FnMut(Pid) -> Vec<BindGroup>,
    ) -> TickReport {
        let mut report = TickReport::default();
        self.update_loads(now);
        self.retry_bind(&mut report);
        self.dispatch(now, detect_groups, &mut report);
        self.unbind_stale(&mut report);
        if self.flags.ccl_aware {
            self.balance_task(&mut report);
        }
        report
    }

    fn update_loads(&mut self, now: Instant) {
        if let Err(e) = self.loads.update_cpus(&self.procfs, now) {
            debug!(error = %e, "failed to refresh /proc/stat");
        }

        let cpu_nodes: Vec<_> = self.tree.nodes_of_type(TopoType::Cpu).to_vec();
        for node in cpu_nodes {
            let Some(cpu) = self.tree.node(node).mask().iter().next() else {
                continue;
            };
            if let Some(load) = self.loads.cpu_load(cpu) {
                self.tree.set_load(node, load);
            }
        }

        let tracked_tids: Vec<Tid> = self.loads.tasks().iter().map(|t| t.tid()).collect();
        for tid in tracked_tids {
            if let Err(e) = self.loads.update_task(&self.procfs, tid, now) {
                debug!(tid, error = %e, "failed to refresh task load");
            }
        }
    }

    fn retry_bind(&mut self, report: &mut TickReport) {
        let records = std::mem::take(&mut self.retry_list);
        for record in records {
            let cpus: Vec<usize> = self.tree.node(record.node).mask().iter().collect();
            match self.affinity.set_affinity(record.tid, &cpus) {
                Ok(()) => report.retried_ok += 1,
                Err(e) => {
                    warn!(tid = record.tid, error = %e, "affinity retry failed, unbinding");
                    self.unbind(record.tid);
                    report.retried_dropped += 1;
                }
            }
        }
    }

    fn dispatch(
        &mut self,
        now: Instant,
        detect_groups: &mut dyn FnMut(Pid) -> Vec<BindGroup>,
        report: &mut TickReport,
    ) {
        if self.flags.affinity_aware {
            self.dispatch_affinity_aware(now, detect_groups, report);
        } else if self.flags.numa_aware {
            let pids = self.delay_queue.drain();
            for pid in pids {
                self.bind_env_groups_for_pid(pid, now, report);
            }
            self.refill_delay_queue();
        } else {
            let candidates = self.scan_candidates();
            for pid in candidates {
                self.bind_env_groups_for_pid(pid, now, report);
            }
        }
    }

    fn scan_candidates(&self) -> Vec<Pid> {
        match &self.target_comm {
            Some(comm) => self.procfs.resolve_comm_to_pids(comm).unwrap_or_default(),
            None => self.procfs.pids().unwrap_or_default(),
        }
    }

    fn refill_delay_queue(&mut self) {
        for pid in self.scan_candidates() {
            let _ = self.delay_queue.push(pid);
        }
    }

    fn dispatch_affinity_aware(
        &mut self,
        now: Instant,
        detect_groups: &mut dyn FnMut(Pid) -> Vec<BindGroup>,
        report: &mut TickReport,
    ) {
        let pids = self.delay_queue.drain();
        for pid in pids {
            let groups = detect_groups(pid);
            let prev = self.last_groups.get(&pid).cloned().unwrap_or_default();
            if !group_changed(&prev, &groups) {
                continue;
            }
            for g in &prev {
                for &tid in &g.tids {
                    self.unbind(tid);
                }
            }
            for g in &groups {
                self.bind_group_auto(&g.tids, &g.name, now, report);
            }
            self.last_groups.insert(pid, groups);
        }
        self.refill_delay_queue();
    }

    /// Parses every `__SCHED_GROUP__<name>=comm1,comm2,…` variable of
    /// `pid`'s environment and binds the threads whose `comm` matches.
    fn bind_env_groups_for_pid(&mut self, pid: Pid, now: Instant, report: &mut TickReport) {
        let env = match self.procfs.environ(pid) {
            Ok(env) => env,
            Err(numadv_procio::Error::NotFound(_)) => return,
            Err(e) => {
                debug!(pid, error = %e, "failed reading environ");
                return;
            }
        };
        let tasks = match self.procfs.tasks(pid) {
            Ok(tasks) => tasks,
            Err(_) => return,
        };

        for (key, value) in &env {
            let Some(group_suffix) = key.strip_prefix(SCHED_GROUP_PREFIX) else {
                continue;
            };
            let names: Vec<&str> = value.split(',').map(str::trim).filter(|s| !s.is_empty()).collect();
            if names.is_empty() {
                continue;
            }
            let mut tids = Vec::new();
            for &tid in &tasks {
                match self.procfs.comm(pid, tid) {
                    Ok(comm) if names.contains(&comm.as_str()) => tids.push(tid),
                    _ => {}
                }
            }
            if tids.is_empty() {
                continue;
            }
            let group_name = format!("{group_suffix}_{pid}");
            self.bind_group_auto(&tids, &group_name, now, report);
        }
    }

    /// Chooses a NUMA node for `tids` and pins every not-yet-bound member,
    /// per the `task_fault_siblings` / net-resolver / lightest-load
    /// priority order.
    pub fn bind_group_auto(&mut self, tids: &[Tid], group_name: &str, now: Instant, report: &mut TickReport) {
        let mut numa_id: i64 = -1;

        if self.flags.numa_aware {
            let mut totals: Vec<u64> = Vec::new();
            for &tid in tids {
                if let Ok(counters) = self.procfs.task_fault_siblings(tid) {
                    for (i, v) in counters.into_iter().enumerate() {
                        if i >= totals.len() {
                            totals.resize(i + 1, 0);
                        }
                        totals[i] += v;
                    }
                }
            }
            if let Some((idx, &max)) = totals.iter().enumerate().max_by_key(|&(_, v)| *v) {
                if max > 0 {
                    numa_id = idx as i64;
                }
            }
        }

        if self.flags.net_aware {
            if let Some(&first) = tids.first() {
                match self
                    .net_resolver
                    .resolve_preferred_numa(first, &self.cpu_to_numa, &self.net_scratch)
                {
                    Ok(Some(resolved)) => numa_id = resolved,
                    Ok(None) => {}
                    Err(e) => debug!(tid = first, error = %e, "net resolver failed"),
                }
            }
        }

        let numa_node = if numa_id >= 0 {
            self.tree.numa_node(numa_id as u32)
        } else {
            None
        }
        .or_else(|| self.tree.select_lighter_load(self.tree.root(), TopoType::Numa));

        let Some(numa_node) = numa_node else {
            warn!(group_name, "no NUMA node available, dropping group");
            return;
        };

        let bind_node = if self.flags.ccl_aware {
            self.tree
                .select_lighter_load(numa_node, TopoType::Cluster)
                .unwrap_or(numa_node)
        } else {
            numa_node
        };

        let mut member_tids = Vec::with_capacity(tids.len());
        for &tid in tids {
            if self.bind_task_map.contains_key(&tid) {
                member_tids.push(tid);
                continue;
            }
            let target = if self.flags.coarse_grain {
                bind_node
            } else {
                self.tree
                    .select_lighter_load(bind_node, TopoType::Cpu)
                    .unwrap_or(bind_node)
            };
            let cpus: Vec<usize> = self.tree.node(target).mask().iter().collect();
            let pid = self.procfs.tgid(tid).unwrap_or(tid);

            self.tree.bind_task(target, tid);
            if let Err(e) = self.loads.add_task(&self.procfs, pid, tid, now) {
                debug!(tid, error = %e, "failed to start load tracking");
            }
            self.bind_task_map.insert(
                tid,
                BindTaskInfo {
                    tid,
                    pid,
                    group: Some(group_name.to_string()),
                    node: target,
                },
            );
            member_tids.push(tid);
            report.bound += 1;

            if let Err(e) = self.affinity.set_affinity(tid, &cpus) {
                warn!(tid, error = %e, "affinity syscall failed, queued for retry");
                self.retry_list.push(RetryRecord { tid, node: target });
            }
        }

        self.bind_group_map.insert(
            group_name.to_string(),
            BindGroupInfo {
                name: group_name.to_string(),
                tids: member_tids,
                numa: numa_node,
                bind_node,
            },
        );
    }

    /// Detaches `tid` from its group, its topology node, the retry list,
    /// and the load tracker. A no-op if `tid` is not currently bound.
    pub fn unbind(&mut self, tid: Tid) {
        let Some(info) = self.bind_task_map.remove(&tid) else {
            return;
        };
        self.tree.unbind_task(info.node, tid);
        self.loads.remove_task(tid);
        self.retry_list.retain(|r| r.tid != tid);
        let Some(group_name) = info.group else { return };
        let Some(group) = self.bind_group_map.get_mut(&group_name) else {
            return;
        };
        group.tids.retain(|&t| t != tid);
        if group.tids.is_empty() {
            self.bind_group_map.remove(&group_name);
        }
    }

    fn unbind_stale(&mut self, report: &mut TickReport) {
        let stale: Vec<Tid> = self
            .bind_task_map
            .values()
            .filter(|info| !self.procfs.task_exists(info.pid, info.tid))
            .map(|info| info.tid)
            .collect();
        for tid in stale {
            self.unbind(tid);
            report.unbound_stale += 1;
        }
    }

    fn balance_task(&mut self, report: &mut TickReport) {
        let names: Vec<String> = self.bind_group_map.keys().cloned().collect();
        for name in names {
            self.maybe_migrate_group(&name, report);
        }
    }

    fn maybe_migrate_group(&mut self, name: &str, report: &mut TickReport) {
        let Some(info) = self.bind_group_map.get(name).cloned() else {
            return;
        };
        let node_ty = self.tree.node(info.bind_node).ty();
        let Some(best) = self.tree.select_lighter_load(info.numa, node_ty) else {
            return;
        };
        if best == info.bind_node {
            return;
        }

        let diff = self.tree.node(info.bind_node).load() - self.tree.node(best).load();
        if diff <= 0 {
            return;
        }

        let weight = i64::from(self.tree.node(info.bind_node).mask().weight());
        let gap = weight * MIGRATION_GAP_NUM / MIGRATION_GAP_DEN;
        if diff <= gap {
            return;
        }

        let group_weight: i64 = info.tids.iter().filter_map(|&tid| self.loads.task_load(tid)).sum();
        if group_weight >= diff {
            return;
        }

        for &tid in &info.tids {
            let Some(task_info) = self.bind_task_map.get(&tid).cloned() else {
                continue;
            };
            let member_ty = self.tree.node(task_info.node).ty();
            let Some(new_node) = self.tree.select_lighter_load(best, member_ty) else {
                continue;
            };
            self.tree.unbind_task(task_info.node, tid);
            self.tree.bind_task(new_node, tid);
            if let Some(entry) = self.bind_task_map.get_mut(&tid) {
                entry.node = new_node;
            }
            let cpus: Vec<usize> = self.tree.node(new_node).mask().iter().collect();
            if let Err(e) = self.affinity.set_affinity(tid, &cpus) {
                warn!(tid, error = %e, "migration affinity syscall failed, queued for retry");
                self.retry_list.push(RetryRecord { tid, node: new_node });
            }
        }

        if let Some(group) = self.bind_group_map.get_mut(name) {
            group.bind_node = best;
        }
        report.migrated += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::affinity::test_support::FakeAffinity;
    use numadv_procio::CpuSysfs;
    use numadv_topology::CPUS_PER_CLUSTER;
    use std::fs;
    use std::path::Path;

    fn build_sysfs(root: &Path, chips: usize, numas_per_chip: usize, clusters_per_numa: usize) {
        let cpus_per_numa = clusters_per_numa * CPUS_PER_CLUSTER;
        let cpus_per_chip = numas_per_chip * cpus_per_numa;
        let total_cpus = chips * cpus_per_chip;

        for cpu in 0..total_cpus {
            let chip = cpu / cpus_per_chip;
            let within_chip = cpu % cpus_per_chip;
            let numa = chip * numas_per_chip + within_chip / cpus_per_numa;

            let mut chip_mask = numadv_mask::Cpumask::new();
            for c in chip * cpus_per_chip..(chip + 1) * cpus_per_chip {
                chip_mask.set(c);
            }
            let mut numa_mask = numadv_mask::Cpumask::new();
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
            fs::write(
                dir.join("topology/thread_siblings"),
                numadv_mask::Cpumask::single(cpu).to_hex(),
            )
            .unwrap();
            fs::create_dir_all(dir.join(format!("node{numa}"))).unwrap();
            fs::write(dir.join(format!("node{numa}/cpumap")), numa_mask.to_hex()).unwrap();
        }
    }

    fn touch_task(proc_root: &Path, tid: Tid) {
        fs::create_dir_all(proc_root.join(tid.to_string()).join("task").join(tid.to_string())).unwrap();
    }

    fn test_engine(
        proc_root: &Path,
        tree: TopoTree,
        flags: Flags,
    ) -> PolicyEngine<FakeAffinity> {
        PolicyEngine::new(
            flags,
            tree,
            ProcFs::new(proc_root),
            FakeAffinity::default(),
            NetResolver::with_proc_root(proc_root),
            HashMap::new(),
            proc_root.join("netns-scratch"),
            None,
        )
    }

    #[test]
    fn bind_with_ccl_aware_picks_the_lightest_cluster() {
        let sys_tmp = tempfile::tempdir().unwrap();
        build_sysfs(sys_tmp.path(), 1, 4, 8);
        let sysfs = CpuSysfs::new(sys_tmp.path());
        let mut tree = TopoTree::build(&sysfs).unwrap();

        let clusters = tree.nodes_of_type(TopoType::Cluster).to_vec();
        assert_eq!(clusters.len(), 32);
        let light_cluster = clusters[3];
        for (i, &cluster) in clusters.iter().enumerate() {
            if i == 3 {
                continue;
            }
            let cpu_leaf = tree.node(cluster).mask().iter().next().unwrap();
            let leaf_id = tree.cpu_node(cpu_leaf).unwrap();
            tree.add_load(leaf_id, 1024);
        }

        let proc_tmp = tempfile::tempdir().unwrap();
        let flags = Flags {
            ccl_aware: true,
            coarse_grain: true,
            ..Flags::default()
        };
        let mut engine = test_engine(proc_tmp.path(), tree, flags);
        let mut report = TickReport::default();
        engine.bind_group_auto(&[101, 102, 103, 104], "g", Instant::now(), &mut report);

        assert_eq!(report.bound, 4);
        let light_mask = engine.tree().node(light_cluster).mask();
        for tid in [101, 102, 103, 104] {
            let info = engine.bind_task_map().get(&tid).unwrap();
            assert!(light_mask.test(engine.tree().node(info.node).mask().iter().next().unwrap()));
        }
    }

    #[test]
    fn delayed_bind_waits_one_tick() {
        let sys_tmp = tempfile::tempdir().unwrap();
        build_sysfs(sys_tmp.path(), 1, 1, 1);
        let sysfs = CpuSysfs::new(sys_tmp.path());
        let tree = TopoTree::build(&sysfs).unwrap();

        let proc_tmp = tempfile::tempdir().unwrap();
        let root = proc_tmp.path();
        fs::create_dir_all(root.join("500/task/600")).unwrap();
        fs::write(root.join("500/task/600/comm"), "worker\n").unwrap();
        fs::write(root.join("500/environ"), b"__SCHED_GROUP__g=worker\0").unwrap();
        touch_task(root, 600);

        let flags = Flags {
            numa_aware: true,
            ..Flags::default()
        };
        let mut engine = test_engine(root, tree, flags);

        let report1 = engine.tick(Instant::now(), &mut |_| Vec::new());
        assert_eq!(report1.bound, 0);
        assert!(engine.bind_task_map().is_empty());

        let report2 = engine.tick(Instant::now(), &mut |_| Vec::new());
        assert_eq!(report2.bound, 1);
        assert!(engine.bind_task_map().contains_key(&600));
    }

    #[test]
    fn retry_then_succeed_clears_the_retry_list() {
        let sys_tmp = tempfile::tempdir().unwrap();
        build_sysfs(sys_tmp.path(), 1, 1, 1);
        let sysfs = CpuSysfs::new(sys_tmp.path());
        let tree = TopoTree::build(&sysfs).unwrap();

        let proc_tmp = tempfile::tempdir().unwrap();
        touch_task(proc_tmp.path(), 555);
        let mut engine = test_engine(proc_tmp.path(), tree, Flags::default());

        let mut report = TickReport::default();
        engine.affinity_mut().fail_tid_on(555, 1);
        engine.bind_group_auto(&[555], "g", Instant::now(), &mut report);
        assert_eq!(engine.retry_list().len(), 1);

        let report2 = engine.tick(Instant::now(), &mut |_| Vec::new());
        assert_eq!(report2.retried_ok, 1);
        assert!(engine.retry_list().is_empty());
        assert!(engine.bind_task_map().contains_key(&555));
    }

    #[test]
    fn retry_with_vanished_thread_drops_cleanly() {
        let sys_tmp = tempfile::tempdir().unwrap();
        build_sysfs(sys_tmp.path(), 1, 1, 1);
        let sysfs = CpuSysfs::new(sys_tmp.path());
        let tree = TopoTree::build(&sysfs).unwrap();

        let proc_tmp = tempfile::tempdir().unwrap();
        let mut engine = test_engine(proc_tmp.path(), tree, Flags::default());

        let mut report = TickReport::default();
        engine.affinity_mut().fail_tid_on(556, 1);
        engine.affinity_mut().fail_tid_on(556, 2);
        engine.bind_group_auto(&[556], "g", Instant::now(), &mut report);
        assert_eq!(engine.retry_list().len(), 1);

        let report2 = engine.tick(Instant::now(), &mut |_| Vec::new());
        assert_eq!(report2.retried_dropped, 1);
        assert!(!engine.bind_task_map().contains_key(&556));
    }

    #[test]
    fn migration_fires_only_once_the_gap_is_exceeded() {
        let sys_tmp = tempfile::tempdir().unwrap();
        build_sysfs(sys_tmp.path(), 1, 1, 2);
        let sysfs = CpuSysfs::new(sys_tmp.path());
        let tree = TopoTree::build(&sysfs).unwrap();
        let clusters = tree.nodes_of_type(TopoType::Cluster).to_vec();
        assert_eq!(clusters.len(), 2);
        let cluster0 = clusters[0];
        let cluster1 = clusters[1];

        let proc_tmp = tempfile::tempdir().unwrap();
        let root = proc_tmp.path();
        touch_task(root, 701);
        touch_task(root, 702);

        let flags = Flags {
            ccl_aware: true,
            coarse_grain: true,
            ..Flags::default()
        };
        let mut report = TickReport::default();
        let mut engine = test_engine(root, tree, flags);
        engine.bind_group_auto(&[701, 702], "g", Instant::now(), &mut report);

        // Both clusters tie at zero load; whichever the tie-break picked is
        // "home", the other is where a migration should land.
        let home = engine.bind_group_map().get("g").unwrap().bind_node;
        let other = if home == cluster0 { cluster1 } else { cluster0 };

        // A small gap between the clusters should not trigger a migration.
        let home_cpu = engine.tree().node(home).mask().iter().next().unwrap();
        let home_leaf = engine.tree().cpu_node(home_cpu).unwrap();
        engine.tree.add_load(home_leaf, 10);
        engine.balance_task(&mut TickReport::default());
        assert_eq!(engine.bind_group_map().get("g").unwrap().bind_node, home);

        // Pushing the gap well past the threshold does.
        engine.tree.add_load(home_leaf, 100);
        let mut migrate_report = TickReport::default();
        engine.balance_task(&mut migrate_report);
        assert_eq!(migrate_report.migrated, 1);
        assert_eq!(engine.bind_group_map().get("g").unwrap().bind_node, other);
    }
}
