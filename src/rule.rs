//! Pluggable bond predicates.
//!
//! By default, two occupied sites that are lattice neighbors are always bonded. A
//! [`CommonNeighbor`] rule instead requires a minimum number of mutually occupied
//! neighbors before a bond forms, which couples bond formation to the second
//! coordination shell and so requires the engine to re-examine next-nearest
//! neighbors whenever a new site is occupied.

use std::collections::HashSet;
use std::fmt::Debug;

use crate::lattice::Lattice;

/// Decides whether two lattice-adjacent, occupied sites are actually bonded.
pub trait BondRule: Debug + Send + Sync {
    fn bonds(&self, i: usize, j: usize, lattice: &Lattice, occupied: &[bool]) -> bool;

    /// Whether forming a bond under this rule can change the bonding status of
    /// next-nearest neighbors, requiring the engine to re-check them.
    fn needs_second_shell(&self) -> bool {
        false
    }
}

/// The default rule: every lattice-neighbor pair of occupied sites is bonded.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysBonded;

impl BondRule for AlwaysBonded {
    fn bonds(&self, _i: usize, _j: usize, _lattice: &Lattice, _occupied: &[bool]) -> bool {
        true
    }
}

/// Requires at least `k` mutually occupied neighbors before two adjacent occupied
/// sites are considered bonded.
#[derive(Debug, Clone, Copy)]
pub struct CommonNeighbor {
    pub k: usize,
}

impl BondRule for CommonNeighbor {
    fn bonds(&self, i: usize, j: usize, lattice: &Lattice, occupied: &[bool]) -> bool {
        common_occupied_neighbors(i, j, lattice, occupied) >= self.k
    }

    fn needs_second_shell(&self) -> bool {
        true
    }
}

fn occupied_neighbor_set(site: usize, lattice: &Lattice, occupied: &[bool]) -> HashSet<usize> {
    lattice
        .neighbors(site)
        .iter()
        .map(|&(n, _)| n)
        .filter(|&n| occupied[n])
        .collect()
}

fn common_occupied_neighbors(i: usize, j: usize, lattice: &Lattice, occupied: &[bool]) -> usize {
    let ni = occupied_neighbor_set(i, lattice, occupied);
    let nj = occupied_neighbor_set(j, lattice, occupied);
    ni.intersection(&nj).count()
}
