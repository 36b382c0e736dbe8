#[allow(unused_imports)]
#[macro_use]
extern crate approx;

pub mod base;
pub mod config;
pub mod lattice;
pub mod neighbors;
pub mod percolator;
pub mod rule;
pub mod sampler;

pub use base::{Basis, PercolateError};
pub use config::{LatticeConfig, PercolationRunner, RuleConfig, SamplerConfig};
pub use lattice::Lattice;
pub use neighbors::{BoxPartition, NeighborMode, Translation};
pub use percolator::{ClusterId, Percolator};
pub use rule::{AlwaysBonded, BondRule, CommonNeighbor};
pub use sampler::{PercolationThresholds, SampleResult, Series};
