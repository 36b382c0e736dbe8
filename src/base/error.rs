use thiserror::Error;

#[derive(Error, Debug, Clone)]
/// Error types for the **percolate** library
pub enum PercolateError {
    #[error("lattice basis is singular")]
    SingularBasisError,
    #[error("lattice has no sites")]
    EmptySiteListError,
    #[error("box partition collapses to zero along at least one axis")]
    InvalidBoxPartitionError,
    #[error("requested probability {0} is outside (0, 1)")]
    InvalidProbabilityError(f64),
    #[error("number of samples must be positive")]
    InvalidSampleCountError,
    #[error("neighbor list is not symmetric at site {site}, slot {slot}")]
    NeighborAsymmetryError { site: usize, slot: usize },
    #[error("add_site called on already-occupied site {0}")]
    SiteAlreadyOccupiedError(usize),
    #[error("exhausted all {n_sites} sites without satisfying the wrapping criterion")]
    NonPercolatingRunError {
        n_sites: usize,
        /// `occupation_order[k]` is the site occupied at step `k` (0-based).
        occupation_order: Vec<usize>,
    },
}
