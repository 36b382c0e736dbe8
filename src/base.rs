mod error;
mod lattice;

pub use error::PercolateError;
pub use lattice::Basis;
