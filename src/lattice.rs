//! Combines a [`Basis`] with a set of fractional site coordinates and the periodic
//! neighbor table built over them.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use crate::base::{Basis, PercolateError};
use crate::neighbors::{build_neighbor_list, BoxPartition, NeighborList, NeighborMode, Translation};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lattice {
    basis: Basis,
    coords: Vec<Vector3<f64>>,
    neighbors: NeighborList,
}

impl Lattice {
    /// Build a lattice from a basis and a list of fractional site coordinates,
    /// precomputing the periodic neighbor table.
    pub fn new(
        basis: Basis,
        coords: Vec<Vector3<f64>>,
        mode: NeighborMode,
        explicit_boxes: Option<BoxPartition>,
    ) -> Result<Self, PercolateError> {
        let neighbors = build_neighbor_list(&basis, &coords, mode, explicit_boxes)?;
        Ok(Self {
            basis,
            coords,
            neighbors,
        })
    }

    /// Build a lattice from a basis, coordinates, and an already-constructed neighbor
    /// table, bypassing the builder. Used by tests that hand-specify a graph.
    #[cfg(test)]
    pub(crate) fn from_raw(basis: Basis, coords: Vec<Vector3<f64>>, neighbors: NeighborList) -> Self {
        Self {
            basis,
            coords,
            neighbors,
        }
    }

    pub fn basis(&self) -> &Basis {
        &self.basis
    }

    pub fn num_sites(&self) -> usize {
        self.coords.len()
    }

    pub fn fractional_coords(&self, site: usize) -> &Vector3<f64> {
        &self.coords[site]
    }

    pub fn cartesian_coords(&self, site: usize) -> Vector3<f64> {
        self.basis.cartesian_coords(&self.coords[site])
    }

    /// `(neighbor_site, translation)` pairs bonded to `site`. Each entry is an
    /// independent bond slot; the same neighbor site may appear more than once with
    /// distinct translations.
    pub fn neighbors(&self, site: usize) -> &[(usize, Translation)] {
        self.neighbors.neighbors(site)
    }

    /// Maximum number of bonds the lattice admits (`B_max`), counting each pair of
    /// distinct sites once regardless of how many translations connect them.
    pub fn max_bonds(&self) -> usize {
        self.neighbors.max_bonds()
    }

    pub fn check_neighbor_symmetry(&self) -> Result<(), PercolateError> {
        self.neighbors.check_symmetric()
    }
}
