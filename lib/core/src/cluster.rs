//! Two-stage duplicate clustering.
//!
//! Stage 1 links items whose fingerprint distance is within `T1` and takes
//! connected components. Stage 2 re-links only the members of each stage-1
//! component by feature distance within `T2`, so it can split a component but
//! never join two. Components are computed with a union-find over dense
//! indices; singletons are dropped at both stages.

use crate::distance::{DistanceEngine, Edge, Metric};
use crate::{ImageIdentity, Result};
use serde::{Deserialize, Serialize};

/// Whether stage 2 runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMode {
    FingerprintOnly,
    #[default]
    Refined,
}

impl std::str::FromStr for DetectionMode {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "fingerprint_only" | "fingerprint-only" | "hash" => Ok(DetectionMode::FingerprintOnly),
            "refined" | "features" => Ok(DetectionMode::Refined),
            other => Err(crate::Error::InvalidConfig(format!("unknown mode '{}'", other))),
        }
    }
}

/// Disjoint-set forest with path compression and union by rank.
#[derive(Debug, Clone)]
pub struct UnionFind {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl UnionFind {
    pub fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
            rank: vec![0; n],
        }
    }

    pub fn find(&mut self, x: usize) -> usize {
        let mut root = x;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        let mut node = x;
        while self.parent[node] != root {
            let next = self.parent[node];
            self.parent[node] = root;
            node = next;
        }
        root
    }

    /// Returns false when `x` and `y` were already joined.
    pub fn union(&mut self, x: usize, y: usize) -> bool {
        let rx = self.find(x);
        let ry = self.find(y);
        if rx == ry {
            return false;
        }
        match self.rank[rx].cmp(&self.rank[ry]) {
            std::cmp::Ordering::Less => self.parent[rx] = ry,
            std::cmp::Ordering::Greater => self.parent[ry] = rx,
            std::cmp::Ordering::Equal => {
                self.parent[ry] = rx;
                self.rank[rx] += 1;
            }
        }
        true
    }
}

/// A connected component with at least two members.
#[derive(Debug, Clone, PartialEq)]
pub struct Component {
    /// Ascending item indices.
    pub members: Vec<usize>,
    /// The edges that connected the members.
    pub edges: Vec<Edge>,
}

/// Connected components of size >= 2, ordered by their smallest member.
/// The result depends only on `n` and the edge set, not on edge order.
pub fn connected_components(n: usize, edges: &[Edge]) -> Vec<Component> {
    let mut uf = UnionFind::new(n);
    for e in edges {
        uf.union(e.a, e.b);
    }

    // Slot per root, assigned in order of first (smallest) member.
    let mut slot_of_root = vec![usize::MAX; n];
    let mut components: Vec<Component> = Vec::new();
    let mut sizes = vec![0usize; n];
    for i in 0..n {
        sizes[uf.find(i)] += 1;
    }
    for i in 0..n {
        let root = uf.find(i);
        if sizes[root] < 2 {
            continue;
        }
        if slot_of_root[root] == usize::MAX {
            slot_of_root[root] = components.len();
            components.push(Component {
                members: Vec::with_capacity(sizes[root]),
                edges: Vec::new(),
            });
        }
        components[slot_of_root[root]].members.push(i);
    }
    for e in edges {
        let slot = slot_of_root[uf.find(e.a)];
        components[slot].edges.push(*e);
    }
    for c in &mut components {
        c.edges.sort_by(|x, y| (x.a, x.b).cmp(&(y.a, y.b)));
    }
    components
}

/// Stage 1: components of the graph with an edge wherever `distance <= t1`.
pub fn prefilter<T, M>(engine: &DistanceEngine, items: &[T], metric: &M, t1: f64) -> Result<Vec<Component>>
where
    T: Sync,
    M: Metric<T>,
{
    let edges = engine.edges_within(items, metric, t1)?;
    Ok(connected_components(items.len(), &edges))
}

/// Stage 2 for one stage-1 component. `vectors[k]` belongs to `members[k]`;
/// the returned components use the same global indices as `members`.
pub fn refine<T, M>(
    engine: &DistanceEngine,
    members: &[usize],
    vectors: &[T],
    metric: &M,
    t2: f64,
) -> Result<Vec<Component>>
where
    T: Sync,
    M: Metric<T>,
{
    debug_assert_eq!(members.len(), vectors.len());
    if members.len() < 2 {
        return Ok(Vec::new());
    }
    let local = engine.edges_within(vectors, metric, t2)?;
    Ok(connected_components(members.len(), &local)
        .into_iter()
        .map(|c| Component {
            members: c.members.iter().map(|&k| members[k]).collect(),
            edges: c
                .edges
                .iter()
                .map(|e| Edge {
                    a: members[e.a],
                    b: members[e.b],
                    distance: e.distance,
                })
                .collect(),
        })
        .collect())
}

/// An edge of a final group, kept so every grouping can be audited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupEdge {
    pub a: ImageIdentity,
    pub b: ImageIdentity,
    pub fingerprint_distance: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feature_distance: Option<f64>,
}

/// A final set of images considered duplicates of one another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarityGroup {
    pub members: Vec<ImageIdentity>,
    pub edges: Vec<GroupEdge>,
}

impl SimilarityGroup {
    #[inline]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distance::HammingMetric;
    use crate::{Error, Fingerprint};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::HashMap;

    /// Distances looked up from a fixed table; absent pairs are far apart.
    struct Table(HashMap<(usize, usize), f64>);

    impl Table {
        fn new(pairs: &[(usize, usize, f64)]) -> Self {
            Self(
                pairs
                    .iter()
                    .map(|&(a, b, d)| ((a.min(b), a.max(b)), d))
                    .collect(),
            )
        }
    }

    impl Metric<usize> for Table {
        fn distance(&self, a: &usize, b: &usize) -> Result<f64> {
            Ok(*self.0.get(&((*a).min(*b), (*a).max(*b))).unwrap_or(&1e9))
        }
    }

    fn engine() -> DistanceEngine {
        DistanceEngine::new(4, 6).unwrap()
    }

    #[test]
    fn test_union_find() {
        let mut uf = UnionFind::new(5);
        assert!(uf.union(0, 1));
        assert!(uf.union(3, 4));
        assert!(!uf.union(1, 0));
        assert!(uf.union(1, 4));
        assert_eq!(uf.find(0), uf.find(3));
        assert_ne!(uf.find(2), uf.find(0));
    }

    #[test]
    fn test_chain_connects_through_middle() {
        // A-B = 2, B-C = 3, A-C = 10, T1 = 4
        let items = vec![0usize, 1, 2];
        let fingerprints = Table::new(&[(0, 1, 2.0), (1, 2, 3.0), (0, 2, 10.0)]);
        let groups = prefilter(&engine(), &items, &fingerprints, 4.0).unwrap();

        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].members, vec![0, 1, 2]);
        assert_eq!(groups[0].edges.len(), 2);
    }

    #[test]
    fn test_refinement_splits_component() {
        let items = vec![0usize, 1, 2];
        let fingerprints = Table::new(&[(0, 1, 2.0), (1, 2, 3.0), (0, 2, 10.0)]);
        let features = Table::new(&[(0, 1, 0.01), (1, 2, 0.5), (0, 2, 0.6)]);
        let e = engine();

        let stage_one = prefilter(&e, &items, &fingerprints, 4.0).unwrap();
        let members = &stage_one[0].members;
        let vectors: Vec<usize> = members.clone();
        let finals = refine(&e, members, &vectors, &features, 0.1).unwrap();

        // C becomes a singleton and is dropped
        assert_eq!(finals.len(), 1);
        assert_eq!(finals[0].members, vec![0, 1]);
        assert_eq!(finals[0].edges[0].distance, 0.01);
    }

    #[test]
    fn test_singletons_yield_no_groups() {
        let items = vec![0usize, 1, 2, 3];
        let metric = Table::new(&[(0, 1, 1.0)]);
        let groups = prefilter(&engine(), &items, &metric, 100.0).unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].members, vec![0, 1]);

        let lonely = prefilter(&engine(), &[7usize], &metric, 1e12).unwrap();
        assert!(lonely.is_empty());
    }

    #[test]
    fn test_threshold_tie_is_inclusive() {
        let items = vec![0usize, 1];
        let metric = Table::new(&[(0, 1, 4.0)]);
        assert_eq!(prefilter(&engine(), &items, &metric, 4.0).unwrap().len(), 1);
        assert!(prefilter(&engine(), &items, &metric, 3.0).unwrap().is_empty());
    }

    #[test]
    fn test_refine_maps_back_to_global_indices() {
        let features = Table::new(&[(0, 1, 0.0)]);
        // local vectors 0 and 1 belong to global members 4 and 9
        let finals = refine(&engine(), &[4, 9, 11], &[0usize, 1, 2], &features, 0.05).unwrap();
        assert_eq!(finals.len(), 1);
        assert_eq!(finals[0].members, vec![4, 9]);
        assert_eq!((finals[0].edges[0].a, finals[0].edges[0].b), (4, 9));
    }

    fn random_fingerprints(n: usize, seed: u64) -> Vec<Fingerprint> {
        let mut rng = StdRng::seed_from_u64(seed);
        let base: Vec<bool> = (0..64).map(|_| rng.random()).collect();
        (0..n)
            .map(|_| {
                let mut bits = base.clone();
                for _ in 0..rng.random_range(0..24) {
                    let i = rng.random_range(0..64);
                    bits[i] = !bits[i];
                }
                Fingerprint::from_bits(8, &bits).unwrap()
            })
            .collect()
    }

    #[test]
    fn test_prefilter_monotonic_in_threshold() {
        let items = random_fingerprints(40, 7);
        let e = engine();
        let mut previous: Option<Vec<Component>> = None;

        for t1 in 0..=24 {
            let current = prefilter(&e, &items, &HammingMetric, f64::from(t1)).unwrap();
            if let Some(prev) = &previous {
                for c in prev {
                    let holder = current
                        .iter()
                        .find(|big| big.members.contains(&c.members[0]))
                        .expect("component vanished as threshold grew");
                    assert!(c.members.iter().all(|m| holder.members.contains(m)));
                    for edge in &c.edges {
                        assert!(holder.edges.contains(edge));
                    }
                }
            }
            previous = Some(current);
        }
    }

    #[test]
    fn test_refinement_never_crosses_components() {
        let items = random_fingerprints(30, 11);
        let e = engine();
        let stage_one = prefilter(&e, &items, &HammingMetric, 10.0).unwrap();

        // A feature metric that would join everything
        struct Zero;
        impl Metric<usize> for Zero {
            fn distance(&self, _: &usize, _: &usize) -> Result<f64> {
                Ok(0.0)
            }
        }

        for component in &stage_one {
            let locals: Vec<usize> = (0..component.members.len()).collect();
            let finals = refine(&e, &component.members, &locals, &Zero, 0.0).unwrap();
            for group in finals {
                assert!(group.members.iter().all(|m| component.members.contains(m)));
            }
        }
    }

    #[test]
    fn test_components_independent_of_edge_order() {
        let mut edges = vec![
            Edge { a: 3, b: 4, distance: 1.0 },
            Edge { a: 0, b: 2, distance: 1.0 },
            Edge { a: 2, b: 5, distance: 1.0 },
        ];
        let forward = connected_components(6, &edges);
        edges.reverse();
        let backward = connected_components(6, &edges);
        assert_eq!(forward, backward);
        assert_eq!(forward[0].members, vec![0, 2, 5]);
        assert_eq!(forward[1].members, vec![3, 4]);
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!("fingerprint_only".parse::<DetectionMode>().unwrap(), DetectionMode::FingerprintOnly);
        assert_eq!("refined".parse::<DetectionMode>().unwrap(), DetectionMode::Refined);
        assert!(matches!("lpips".parse::<DetectionMode>(), Err(Error::InvalidConfig(_))));
    }
}
