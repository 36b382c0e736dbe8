//! Incremental union-find with periodic wrapping detection.
//!
//! Sites are added one at a time. Each occupied site starts its own cluster; bonding
//! it to an already-occupied neighbor merges that neighbor's cluster into the new
//! site's cluster, never the other way around, so a cluster's head site is stable
//! for its entire lifetime once created. Every node carries a fractional displacement
//! to its cluster's head, accumulated by delta at merge time; a nonzero delta when
//! bonding two sites already in the same cluster is exactly a cycle whose net lattice
//! translation is nonzero, i.e. a wrap.

use log::{debug, trace};
use nalgebra::Vector3;
use rand::Rng;

use crate::base::PercolateError;
use crate::lattice::Lattice;
use crate::neighbors::Translation;
use crate::rule::{AlwaysBonded, BondRule};

/// Append-only, tombstoned identifier for a cluster. Stable across merges: a
/// cluster's id never changes as it absorbs others, only as it is itself absorbed.
pub type ClusterId = usize;

#[derive(Debug, Clone, Copy)]
struct ClusterRecord {
    /// `None` for a tombstone.
    first: Option<usize>,
    /// 0 for a tombstone.
    size: usize,
    wrapping: [i32; 3],
}

impl ClusterRecord {
    fn tombstone() -> Self {
        Self {
            first: None,
            size: 0,
            wrapping: [0, 0, 0],
        }
    }
}

/// O(1) random-pick, O(1) remove-by-value pool of not-yet-occupied sites.
#[derive(Debug, Clone)]
struct VacantPool {
    items: Vec<usize>,
    pos: Vec<usize>,
}

impl VacantPool {
    fn full(n: usize) -> Self {
        Self {
            items: (0..n).collect(),
            pos: (0..n).collect(),
        }
    }

    fn remove(&mut self, site: usize) {
        let idx = self.pos[site];
        let last = self.items.len() - 1;
        self.items.swap(idx, last);
        self.pos[self.items[idx]] = idx;
        self.items.pop();
    }

    fn pick_random(&self, rng: &mut impl Rng) -> usize {
        let idx = rng.gen_range(0..self.items.len());
        self.items[idx]
    }
}

/// The incremental percolation engine over a fixed [`Lattice`].
pub struct Percolator<'a> {
    lattice: &'a Lattice,
    rule: Box<dyn BondRule>,

    cluster: Vec<Option<ClusterId>>,
    occupied: Vec<bool>,
    vec: Vec<Vector3<f64>>,
    next: Vec<Option<usize>>,
    bonds: Vec<Vec<bool>>,
    clusters: Vec<ClusterRecord>,
    vacant: VacantPool,
    occupied_order: Vec<usize>,

    nclusters: usize,
    nbonds: usize,
    largest: Option<ClusterId>,
    npercolating: usize,
    nclus_percol: usize,
    npaths: usize,
}

impl<'a> Percolator<'a> {
    /// Build a percolator with the default always-bonded rule.
    pub fn new(lattice: &'a Lattice) -> Self {
        Self::with_rule(lattice, Box::new(AlwaysBonded))
    }

    pub fn with_rule(lattice: &'a Lattice, rule: Box<dyn BondRule>) -> Self {
        let n = lattice.num_sites();
        let bonds = (0..n).map(|i| vec![false; lattice.neighbors(i).len()]).collect();
        Self {
            lattice,
            rule,
            cluster: vec![None; n],
            occupied: vec![false; n],
            vec: vec![Vector3::zeros(); n],
            next: vec![None; n],
            bonds,
            clusters: Vec::new(),
            vacant: VacantPool::full(n),
            occupied_order: Vec::new(),
            nclusters: 0,
            nbonds: 0,
            largest: None,
            npercolating: 0,
            nclus_percol: 0,
            npaths: 0,
        }
    }

    /// Restore the engine to the all-vacant state, ready for another trial.
    pub fn reset(&mut self) {
        let n = self.lattice.num_sites();
        self.cluster = vec![None; n];
        self.occupied = vec![false; n];
        self.vec = vec![Vector3::zeros(); n];
        self.next = vec![None; n];
        for slots in &mut self.bonds {
            slots.iter_mut().for_each(|b| *b = false);
        }
        self.clusters.clear();
        self.vacant = VacantPool::full(n);
        self.occupied_order.clear();
        self.nclusters = 0;
        self.nbonds = 0;
        self.largest = None;
        self.npercolating = 0;
        self.nclus_percol = 0;
        self.npaths = 0;
    }

    /// Occupy `site`. Errors if it's already occupied.
    pub fn add_site(&mut self, site: usize) -> Result<(), PercolateError> {
        if self.occupied[site] {
            return Err(PercolateError::SiteAlreadyOccupiedError(site));
        }
        self.occupy(site);
        Ok(())
    }

    /// Occupy a uniformly random vacant site, returning which one was chosen.
    pub fn add_random_site(&mut self, rng: &mut impl Rng) -> usize {
        let site = self.vacant.pick_random(rng);
        self.occupy(site);
        site
    }

    fn occupy(&mut self, site: usize) {
        self.vacant.remove(site);
        self.occupied[site] = true;
        self.occupied_order.push(site);

        let c1 = self.new_cluster(site);
        if self.largest.is_none() {
            self.largest = Some(c1);
        }

        let neighbors = self.lattice.neighbors(site).to_vec();
        for &(j, t) in &neighbors {
            if !self.occupied[j] {
                continue;
            }
            let cj = self.cluster[j].expect("occupied site has a cluster");
            self.merge(c1, site, cj, j, -t);

            if self.rule.needs_second_shell() {
                let j_neighbors = self.lattice.neighbors(j).to_vec();
                for &(j2, t2) in &j_neighbors {
                    if self.occupied[j2] {
                        let cj_now = self.cluster[j].expect("occupied site has a cluster");
                        let cj2 = self.cluster[j2].expect("occupied site has a cluster");
                        self.merge(cj_now, j, cj2, j2, -t2);
                    }
                }
            }
        }
    }

    fn new_cluster(&mut self, site: usize) -> ClusterId {
        let cid = self.clusters.len();
        self.clusters.push(ClusterRecord {
            first: Some(site),
            size: 1,
            wrapping: [0, 0, 0],
        });
        self.cluster[site] = Some(cid);
        self.vec[site] = Vector3::zeros();
        self.next[site] = None;
        self.nclusters += 1;
        cid
    }

    fn find_slot(&self, from: usize, to: usize, t: Translation) -> usize {
        self.lattice
            .neighbors(from)
            .iter()
            .position(|&(j, tj)| j == to && tj == t)
            .expect("neighbor list symmetry invariant violated")
    }

    /// `s1` and `s2` are occupied and adjacent via one neighbor-list entry with
    /// translation `t12` (the lattice translation such that the physical displacement
    /// s1 -> s2 is `A . (c[s2] + t12 - c[s1])`). `c1`/`c2` are their current clusters.
    fn merge(&mut self, c1: ClusterId, s1: usize, c2: ClusterId, s2: usize, t12: Translation) {
        if !self.rule.bonds(s1, s2, self.lattice, &self.occupied) {
            return;
        }

        let slot1 = self.find_slot(s1, s2, -t12);
        let slot2 = self.find_slot(s2, s1, t12);
        if !self.bonds[s1][slot1] {
            self.bonds[s1][slot1] = true;
            self.bonds[s2][slot2] = true;
            self.nbonds += 1;
        }

        let c_s1 = *self.lattice.fractional_coords(s1);
        let c_s2 = *self.lattice.fractional_coords(s2);
        let v12 = c_s2 + t12.map(|x| x as f64) - c_s1;
        let delta = self.vec[s1] - v12 - self.vec[s2];

        if c1 == c2 {
            let was_wrapping = self.is_wrapping(c1);
            for axis in 0..3 {
                if delta[axis].abs() > 0.5 {
                    self.clusters[c1].wrapping[axis] += 1;
                    self.npaths += 1;
                    debug!("bond {}-{} closes a wrapping loop along axis {}", s1, s2, axis);
                }
            }
            if !was_wrapping && self.is_wrapping(c1) {
                self.npercolating += self.clusters[c1].size;
                self.nclus_percol += 1;
            }
            return;
        }

        let c1_wrapping = self.is_wrapping(c1);
        let c2_wrapping = self.is_wrapping(c2);
        match (c1_wrapping, c2_wrapping) {
            (true, false) => self.npercolating += self.clusters[c2].size,
            (false, true) => self.npercolating += self.clusters[c1].size,
            (true, true) => self.nclus_percol -= 1,
            (false, false) => {}
        }

        let old_largest_size = self.clusters[self.largest.expect("largest set after first occupy")].size;
        let head1 = self.clusters[c1].first.expect("c1 is live");
        let head2 = self.clusters[c2].first.expect("c2 is live");

        let mut cur = head2;
        let tail2 = loop {
            self.vec[cur] += delta;
            self.cluster[cur] = Some(c1);
            match self.next[cur] {
                Some(n) => cur = n,
                None => break cur,
            }
        };
        self.next[tail2] = self.next[head1];
        self.next[head1] = Some(head2);

        self.clusters[c1].size += self.clusters[c2].size;
        let c2_wrap = self.clusters[c2].wrapping;
        for axis in 0..3 {
            self.clusters[c1].wrapping[axis] += c2_wrap[axis];
        }
        if self.clusters[c1].size > old_largest_size {
            self.largest = Some(c1);
        }

        self.nclusters -= 1;
        if c2 + 1 == self.clusters.len() {
            self.clusters.pop();
        } else {
            self.clusters[c2] = ClusterRecord::tombstone();
        }
        trace!("cluster {} absorbed cluster {} via bond {}-{}", c1, c2, s1, s2);
    }

    pub fn num_occupied(&self) -> usize {
        self.occupied_order.len()
    }

    pub fn num_clusters(&self) -> usize {
        self.nclusters
    }

    pub fn num_bonds(&self) -> usize {
        self.nbonds
    }

    pub fn num_percolating(&self) -> usize {
        self.npercolating
    }

    pub fn num_percolating_clusters(&self) -> usize {
        self.nclus_percol
    }

    pub fn num_paths(&self) -> usize {
        self.npaths
    }

    pub fn largest_cluster(&self) -> Option<ClusterId> {
        self.largest
    }

    pub fn largest_cluster_size(&self) -> usize {
        self.largest.map(|c| self.clusters[c].size).unwrap_or(0)
    }

    pub fn cluster_size(&self, cluster: ClusterId) -> usize {
        self.clusters[cluster].size
    }

    pub fn cluster_wrapping(&self, cluster: ClusterId) -> [i32; 3] {
        self.clusters[cluster].wrapping
    }

    pub fn is_wrapping(&self, cluster: ClusterId) -> bool {
        self.clusters[cluster].wrapping.iter().any(|&w| w > 0)
    }

    pub fn cluster_of(&self, site: usize) -> Option<ClusterId> {
        self.cluster[site]
    }

    /// Live (non-tombstone) cluster ids.
    pub fn live_cluster_ids(&self) -> impl Iterator<Item = ClusterId> + '_ {
        self.clusters.iter().enumerate().filter(|(_, c)| c.size > 0).map(|(i, _)| i)
    }

    /// The order sites were occupied in, for diagnosing a non-percolating run.
    pub fn occupation_order(&self) -> &[usize] {
        &self.occupied_order
    }

    /// Enumerate the sites of `cluster` by walking its intrusive linked list.
    pub fn members_of(&self, cluster: ClusterId) -> Vec<usize> {
        let mut out = Vec::new();
        if let Some(mut cur) = self.clusters[cluster].first {
            loop {
                out.push(cur);
                match self.next[cur] {
                    Some(n) => cur = n,
                    None => break,
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use nalgebra::{matrix, vector};
    use rstest::rstest;
    use test_log::test;

    use super::*;
    use crate::base::Basis;
    use crate::neighbors::{NeighborList, NeighborMode};
    use crate::rule::CommonNeighbor;

    fn chain_lattice(n: usize) -> Lattice {
        let basis = Basis::new(matrix![
            n as f64, 0.0, 0.0;
            0.0, 1.0, 0.0;
            0.0, 0.0, 1.0;
        ])
        .unwrap();
        let coords: Vec<Vector3<f64>> = (0..n).map(|k| vector![k as f64 / n as f64, 0.0, 0.0]).collect();
        Lattice::new(basis, coords, NeighborMode::default(), None).unwrap()
    }

    #[test]
    fn test_1d_chain_wrapping() {
        let lattice = chain_lattice(4);
        let mut p = Percolator::new(&lattice);
        p.add_site(0).unwrap();
        p.add_site(1).unwrap();
        p.add_site(2).unwrap();
        assert_eq!(p.num_clusters(), 1);
        assert_eq!(p.largest_cluster_size(), 3);
        let c = p.largest_cluster().unwrap();
        assert_eq!(p.cluster_wrapping(c), [0, 0, 0]);

        p.add_site(3).unwrap();
        assert_eq!(p.num_clusters(), 1);
        assert_eq!(p.largest_cluster_size(), 4);
        let c = p.largest_cluster().unwrap();
        assert_eq!(p.cluster_wrapping(c), [1, 0, 0]);
        assert_eq!(p.num_paths(), 1);
    }

    #[test]
    fn test_2x2x2_cubic_full_wrap() {
        let basis = Basis::new(matrix![
            2.0, 0.0, 0.0;
            0.0, 2.0, 0.0;
            0.0, 0.0, 2.0;
        ])
        .unwrap();
        let mut coords = Vec::new();
        for i in 0..2 {
            for j in 0..2 {
                for k in 0..2 {
                    coords.push(vector![i as f64 / 2.0, j as f64 / 2.0, k as f64 / 2.0]);
                }
            }
        }
        let lattice = Lattice::new(basis, coords, NeighborMode::default(), None).unwrap();
        let mut p = Percolator::new(&lattice);
        for site in 0..8 {
            p.add_site(site).unwrap();
        }
        assert_eq!(p.num_clusters(), 1);
        let c = p.largest_cluster().unwrap();
        assert_eq!(p.cluster_size(c), 8);
        assert!(p.cluster_wrapping(c).iter().all(|&w| w >= 1));
        assert_eq!(p.num_bonds(), 12);
        assert!(p.num_paths() >= 3);
    }

    #[rstest]
    #[case(5)]
    #[case(6)]
    #[case(10)]
    fn test_full_chain_wraps_exactly_once(#[case] n: usize) {
        let lattice = chain_lattice(n);
        let mut p = Percolator::new(&lattice);
        for site in 0..n {
            p.add_site(site).unwrap();
        }
        assert_eq!(p.num_clusters(), 1);
        assert_eq!(p.largest_cluster_size(), n);
        let c = p.largest_cluster().unwrap();
        assert_eq!(p.cluster_wrapping(c), [1, 0, 0]);
        assert_eq!(p.num_paths(), 1);
        assert_eq!(p.num_bonds(), n);
    }

    #[test]
    fn test_non_adjacent_sites_stay_disjoint() {
        let basis = Basis::new(matrix![
            8.0, 0.0, 0.0;
            0.0, 1.0, 0.0;
            0.0, 0.0, 1.0;
        ])
        .unwrap();
        let coords: Vec<Vector3<f64>> = [0.0, 2.0, 4.0, 6.0].iter().map(|&x| vector![x / 8.0, 0.0, 0.0]).collect();
        let lattice = Lattice::new(basis, coords, NeighborMode::default(), None).unwrap();
        let mut p = Percolator::new(&lattice);
        p.add_site(0).unwrap(); // x = 0
        p.add_site(2).unwrap(); // x = 4, not a nearest neighbor of x = 0
        assert_eq!(p.num_clusters(), 2);
        assert_eq!(p.largest_cluster_size(), 1);
        assert_eq!(p.num_percolating(), 0);
    }

    /// Sites 0,1,2 form a path (0-1-2) and each also neighbors the hub site 3, but 0
    /// and 2 are not neighbors of each other. Under a common-neighbor-1 rule, no pair
    /// among {0,1,2} can bond directly, and even 3 cannot bond to any of them until
    /// enough of its own neighbors are occupied to supply the one shared neighbor
    /// each bond needs.
    fn hub_lattice() -> Lattice {
        let basis = Basis::new(matrix![
            10.0, 0.0, 0.0;
            0.0, 10.0, 0.0;
            0.0, 0.0, 10.0;
        ])
        .unwrap();
        let coords = vec![Vector3::zeros(); 4];
        let z = Translation::zeros();
        let table = vec![
            vec![(1, z), (3, z)],
            vec![(0, z), (2, z), (3, z)],
            vec![(1, z), (3, z)],
            vec![(0, z), (1, z), (2, z)],
        ];
        Lattice::from_raw(basis, coords, NeighborList::from_table(table))
    }

    #[test]
    fn test_common_neighbor_rule_defers_merge_to_hub_site() {
        let lattice = hub_lattice();
        let mut p = Percolator::with_rule(&lattice, Box::new(CommonNeighbor { k: 1 }));
        p.add_site(0).unwrap();
        p.add_site(1).unwrap();
        p.add_site(2).unwrap();
        assert_eq!(p.num_clusters(), 3);
        assert_eq!(p.num_bonds(), 0);

        p.add_site(3).unwrap();
        assert_eq!(p.num_clusters(), 1);
        assert_eq!(p.largest_cluster_size(), 4);
    }

    #[test]
    fn test_reset_restores_initial_state() {
        let lattice = chain_lattice(4);
        let mut p = Percolator::new(&lattice);
        p.add_site(0).unwrap();
        p.add_site(1).unwrap();
        p.reset();
        assert_eq!(p.num_occupied(), 0);
        assert_eq!(p.num_clusters(), 0);
        assert_eq!(p.num_bonds(), 0);
        assert_eq!(p.largest_cluster(), None);
        p.add_site(0).unwrap();
        assert_eq!(p.num_occupied(), 1);
    }

    #[test]
    fn test_members_of_matches_cluster_size() {
        let lattice = chain_lattice(4);
        let mut p = Percolator::new(&lattice);
        p.add_site(0).unwrap();
        p.add_site(1).unwrap();
        p.add_site(2).unwrap();
        let c = p.largest_cluster().unwrap();
        let members = p.members_of(c);
        assert_eq!(members.len(), p.cluster_size(c));
        let mut sorted = members.clone();
        sorted.sort();
        assert_eq!(sorted, vec![0, 1, 2]);
    }
}
