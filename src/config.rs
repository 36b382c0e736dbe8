//! External configuration surface.
//!
//! Every input named in spec \S6 is gathered here and validated once, at
//! construction, rather than re-checked defensively throughout the engine:
//! the rest of the crate trusts a [`LatticeConfig`]/[`SamplerConfig`] that made
//! it past `validate`.

use std::sync::atomic::AtomicBool;

use nalgebra::{Matrix3, Vector3};

use crate::base::{Basis, PercolateError};
use crate::lattice::Lattice;
use crate::neighbors::{BoxPartition, NeighborMode};
use crate::rule::{AlwaysBonded, BondRule, CommonNeighbor};
use crate::sampler::{self, SampleResult};

/// Everything needed to build a [`crate::lattice::Lattice`].
#[derive(Debug, Clone)]
pub struct LatticeConfig {
    /// Row basis vectors, as a caller would conventionally write them down.
    pub basis: Matrix3<f64>,
    pub coords: Vec<Vector3<f64>>,
    pub neighbor_mode: NeighborMode,
    /// Overrides the box-partition heuristic when set.
    pub box_partition: Option<BoxPartition>,
}

impl LatticeConfig {
    pub fn validate(&self) -> Result<(), PercolateError> {
        if self.coords.is_empty() {
            return Err(PercolateError::EmptySiteListError);
        }
        if let Some((na, nb, nc)) = self.box_partition {
            if na == 0 || nb == 0 || nc == 0 {
                return Err(PercolateError::InvalidBoxPartitionError);
            }
        }
        Ok(())
    }
}

/// Selects which [`BondRule`] the engine runs under.
#[derive(Debug, Clone, Copy)]
pub enum RuleConfig {
    AlwaysBonded,
    CommonNeighbor { k: usize },
}

impl Default for RuleConfig {
    fn default() -> Self {
        RuleConfig::AlwaysBonded
    }
}

impl RuleConfig {
    pub fn build(self) -> Box<dyn BondRule> {
        match self {
            RuleConfig::AlwaysBonded => Box::new(AlwaysBonded),
            RuleConfig::CommonNeighbor { k } => Box::new(CommonNeighbor { k }),
        }
    }
}

/// Monte Carlo sampling parameters.
#[derive(Debug, Clone)]
pub struct SamplerConfig {
    pub num_samples: usize,
    /// Root PRNG seed; each trial derives its own stream from this and its index.
    pub root_seed: u64,
    /// Occupation probabilities at which the n-indexed series are convolved.
    pub p_list: Vec<f64>,
    pub rule: RuleConfig,
    /// Caps the number of worker threads farming trials; `None` uses all available.
    pub num_workers: Option<usize>,
}

impl SamplerConfig {
    pub fn validate(&self) -> Result<(), PercolateError> {
        if self.num_samples == 0 {
            return Err(PercolateError::InvalidSampleCountError);
        }
        for &p in &self.p_list {
            if !(p > 0.0 && p < 1.0) {
                return Err(PercolateError::InvalidProbabilityError(p));
            }
        }
        Ok(())
    }
}

/// Top-level entry point: build a lattice from `lattice_config` and run
/// `sampler_config`'s trials over it. The one system boundary of the crate —
/// every input named in \S6 is validated here before anything downstream
/// trusts it.
pub struct PercolationRunner;

impl PercolationRunner {
    pub fn run(
        lattice_config: &LatticeConfig,
        sampler_config: &SamplerConfig,
        cancel: &AtomicBool,
    ) -> Result<SampleResult, PercolateError> {
        lattice_config.validate()?;
        sampler_config.validate()?;

        let basis = Basis::new(lattice_config.basis)?;
        let lattice = Lattice::new(
            basis,
            lattice_config.coords.clone(),
            lattice_config.neighbor_mode,
            lattice_config.box_partition,
        )?;
        sampler::run(&lattice, sampler_config, cancel)
    }
}
