use nalgebra::base::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};

use super::error::PercolateError;

#[derive(Debug, Clone, Serialize, Deserialize)]
/// Basis vectors of a three-dimensional periodic lattice.
pub struct Basis {
    /// basis.column(i) is the i-th basis vector
    basis: Matrix3<f64>,
}

impl Basis {
    /// Create a basis from row basis vectors, as they are conventionally written down.
    pub fn new(row_basis: Matrix3<f64>) -> Result<Self, PercolateError> {
        let basis = row_basis.transpose();
        if basis.determinant().abs() < 1e-12 {
            return Err(PercolateError::SingularBasisError);
        }
        Ok(Self { basis })
    }

    pub fn matrix(&self) -> &Matrix3<f64> {
        &self.basis
    }

    /// Build a basis directly from column vectors, bypassing the singularity check.
    /// Used internally to derive a scaled-down basis (e.g. per spatial box) from one
    /// already known to be non-singular.
    pub(crate) fn from_column_basis(basis: Matrix3<f64>) -> Self {
        Self { basis }
    }

    /// Return cartesian coordinates from the given fractional coordinates
    pub fn cartesian_coords(&self, fractional_coords: &Vector3<f64>) -> Vector3<f64> {
        self.basis * fractional_coords
    }

    /// Return volume of the cell
    pub fn volume(&self) -> f64 {
        self.basis.determinant().abs()
    }

    /// Euclidean norm of each basis vector, `(|a|, |b|, |c|)`.
    pub fn vector_norms(&self) -> Vector3<f64> {
        Vector3::new(
            self.basis.column(0).norm(),
            self.basis.column(1).norm(),
            self.basis.column(2).norm(),
        )
    }

    /// Surface area of the cell boundary, `2(|a x b| + |a x c| + |b x c|)`, used to
    /// normalize the percolation flux observable.
    pub fn surface_area(&self) -> f64 {
        let a = self.basis.column(0);
        let b = self.basis.column(1);
        let c = self.basis.column(2);
        2.0 * (a.cross(&b).norm() + a.cross(&c).norm() + b.cross(&c).norm())
    }
}
