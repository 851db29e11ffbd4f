//! Connected components over shared futex addresses.
//!
//! Two threads are connected when they share at least one futex address
//! with a non-zero wait/wake count. Components of size two or more are
//! emitted as [`BindGroup`]s; singletons are dropped since there is nothing
//! to co-locate.

use numadv_procio::Tid;
use std::collections::{BTreeSet, HashMap};

/// A set of tids that should be bound together because they share futexes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindGroup {
    /// `<name_prefix>_<tid1>_<tid2>…`, tids in component-discovery order.
    pub name: String,
    /// Member tids, in component-discovery order.
    pub tids: Vec<Tid>,
}

struct UnionFind {
    parent: Vec<usize>,
}

impl UnionFind {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
        }
    }

    fn find(&mut self, x: usize) -> usize {
        if self.parent[x] != x {
            self.parent[x] = self.find(self.parent[x]);
        }
        self.parent[x]
    }

    fn union(&mut self, a: usize, b: usize) {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra != rb {
            self.parent[ra] = rb;
        }
    }
}

fn shares_futex(a: &HashMap<u64, u64>, b: &HashMap<u64, u64>) -> bool {
    a.iter()
        .any(|(addr, count)| *count > 0 && b.get(addr).copied().unwrap_or(0) > 0)
}

/// Computes connected components over `futex_maps` (one `futex_addr ->
/// count` map per tid, in stable order), naming each group
/// `<name_prefix>_<tid1>_<tid2>…`. Groups are sorted by size descending;
/// singleton components are dropped.
pub fn compute_groups(futex_maps: &[(Tid, HashMap<u64, u64>)], name_prefix: &str) -> Vec<BindGroup> {
    let n = futex_maps.len();
    let mut uf = UnionFind::new(n);
    for i in 0..n {
        for j in (i + 1)..n {
            if shares_futex(&futex_maps[i].1, &futex_maps[j].1) {
                uf.union(i, j);
            }
        }
    }

    let mut components: HashMap<usize, Vec<usize>> = HashMap::new();
    for i in 0..n {
        let root = uf.find(i);
        components.entry(root).or_default().push(i);
    }

    let mut groups: Vec<BindGroup> = components
        .into_values()
        .filter(|members| members.len() >= 2)
        .map(|members| {
            let tids: Vec<Tid> = members.iter().map(|&i| futex_maps[i].0).collect();
            let suffix: Vec<String> = tids.iter().map(Tid::to_string).collect();
            BindGroup {
                name: format!("{name_prefix}_{}", suffix.join("_")),
                tids,
            }
        })
        .collect();

    groups.sort_by(|a, b| b.tids.len().cmp(&a.tids.len()));
    groups
}

/// True iff `prev` and `next` differ: a different number of groups, or a
/// different set of grouped tids. Equal groupings mean the caller should
/// leave the current binding untouched.
pub fn group_changed(prev: &[BindGroup], next: &[BindGroup]) -> bool {
    if prev.len() != next.len() {
        return true;
    }
    let prev_tids: BTreeSet<Tid> = prev.iter().flat_map(|g| g.tids.iter().copied()).collect();
    let next_tids: BTreeSet<Tid> = next.iter().flat_map(|g| g.tids.iter().copied()).collect();
    prev_tids != next_tids
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(u64, u64)]) -> HashMap<u64, u64> {
        pairs.iter().copied().collect()
    }

    #[test]
    fn groups_threads_sharing_a_futex() {
        let maps = vec![
            (1, map(&[(0xaaa, 2)])),
            (2, map(&[(0xaaa, 1)])),
            (3, map(&[(0xbbb, 5)])),
        ];
        let groups = compute_groups(&maps, "g");
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].tids, vec![1, 2]);
        assert_eq!(groups[0].name, "g_1_2");
    }

    #[test]
    fn singletons_are_dropped() {
        let maps = vec![(1, map(&[(0xaaa, 1)])), (2, map(&[(0xbbb, 1)]))];
        assert!(compute_groups(&maps, "g").is_empty());
    }

    #[test]
    fn zero_count_does_not_connect() {
        let maps = vec![(1, map(&[(0xaaa, 0)])), (2, map(&[(0xaaa, 3)]))];
        assert!(compute_groups(&maps, "g").is_empty());
    }

    #[test]
    fn transitive_sharing_forms_one_component() {
        // 1-2 share 0xaaa, 2-3 share 0xbbb: all three end up in one group.
        let maps = vec![
            (1, map(&[(0xaaa, 1)])),
            (2, map(&[(0xaaa, 1), (0xbbb, 1)])),
            (3, map(&[(0xbbb, 1)])),
        ];
        let groups = compute_groups(&maps, "g");
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].tids.len(), 3);
    }

    #[test]
    fn groups_sorted_by_size_descending() {
        let maps = vec![
            (1, map(&[(0x1, 1)])),
            (2, map(&[(0x1, 1)])),
            (3, map(&[(0x2, 1)])),
            (4, map(&[(0x2, 1)])),
            (5, map(&[(0x2, 1)])),
        ];
        let groups = compute_groups(&maps, "g");
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].tids.len(), 3);
        assert_eq!(groups[1].tids.len(), 2);
    }

    #[test]
    fn change_detection_matches_spec_rule() {
        let a = vec![BindGroup { name: "g_1_2".into(), tids: vec![1, 2] }];
        let same = vec![BindGroup { name: "g_2_1".into(), tids: vec![2, 1] }];
        assert!(!group_changed(&a, &same));

        let different_membership = vec![BindGroup { name: "g_1_3".into(), tids: vec![1, 3] }];
        assert!(group_changed(&a, &different_membership));

        let different_count = vec![
            BindGroup { name: "g_1_2".into(), tids: vec![1, 2] },
            BindGroup { name: "g_3_4".into(), tids: vec![3, 4] },
        ];
        assert!(group_changed(&a, &different_count));
    }
}
