//! Monte Carlo sampling driver.
//!
//! Runs many independent trials of the [`Percolator`], each occupying every site
//! of the lattice in a fresh random order, and accumulates the six observable
//! families of \S4.4 as n-indexed series. A single trial produces a contribution
//! to every requested observable at once, since all of them are functions of the
//! same underlying random occupation sequence; running them as separate trial
//! batches would just throw away shared randomness for no benefit.
//!
//! Trials are embarrassingly parallel: farmed across `std::thread::scope` worker
//! threads, each owning its own `Percolator` and `SmallRng`, reduced by elementwise
//! sum only after every worker has returned.

use std::sync::atomic::{AtomicBool, Ordering};

use log::warn;
use rand::rngs::SmallRng;
use rand::SeedableRng;

use crate::base::PercolateError;
use crate::config::SamplerConfig;
use crate::lattice::Lattice;
use crate::percolator::Percolator;

/// An n-indexed discrete series, one entry per occupation count `n = 1..=N`.
#[derive(Debug, Clone)]
pub struct Series {
    /// `values[n - 1]` is the accumulated contribution at occupation count `n`.
    pub values: Vec<f64>,
}

impl Series {
    fn zeros(n: usize) -> Self {
        Self { values: vec![0.0; n] }
    }

    fn add(&mut self, other: &Series) {
        for (a, b) in self.values.iter_mut().zip(&other.values) {
            *a += b;
        }
    }

    fn scale(&mut self, w: f64) {
        for v in &mut self.values {
            *v *= w;
        }
    }

    /// Convolve with `Binom(n; N, p)` for each requested `p`, in log space so
    /// large `N` doesn't overflow the coefficient.
    pub fn convolve(&self, p_list: &[f64]) -> Vec<f64> {
        let n = self.values.len();
        let ln_fact = ln_factorial_table(n);
        p_list
            .iter()
            .map(|&p| {
                let p = p.clamp(1e-300, 1.0 - 1e-300);
                let ln_p = p.ln();
                let ln_1mp = (1.0 - p).ln();
                let mut total = 0.0;
                for k in 1..=n {
                    let ln_choose = ln_fact[n] - ln_fact[k] - ln_fact[n - k];
                    let log_pmf = ln_choose + k as f64 * ln_p + (n - k) as f64 * ln_1mp;
                    let pmf = log_pmf.exp();
                    if !pmf.is_finite() || pmf < 1e-300 {
                        warn!("binomial coefficient underflow at n={}, k={}, p={}; clamped to 0", n, k, p);
                        continue;
                    }
                    total += pmf * self.values[k - 1];
                }
                total
            })
            .collect()
    }
}

fn ln_factorial_table(n: usize) -> Vec<f64> {
    let mut table = vec![0.0; n + 1];
    for i in 1..=n {
        table[i] = table[i - 1] + (i as f64).ln();
    }
    table
}

/// The six observable families of \S4.4, plus the three-criterion percolation
/// thresholds, all accumulated from the same batch of trials.
#[derive(Debug, Clone)]
pub struct SampleResult {
    /// P∞: probability a site belongs to the largest cluster.
    pub p_infinity: Series,
    /// χ: percolation susceptibility.
    pub chi: Series,
    /// Pwrap: probability the wrapping event has occurred by occupation count n.
    pub p_wrap_onset: Series,
    pub p_wrap_cumulative: Series,
    pub bond_fraction: Series,
    pub inaccessible_sites: Series,
    pub wrapping_cluster_fraction: Series,
    pub flux: Series,
    pub pc: PercolationThresholds,
}

/// The six pc scalars of \S6: occupation-fraction and bond-fraction thresholds
/// for each of the three wrapping criteria.
#[derive(Debug, Clone, Copy, Default)]
pub struct PercolationThresholds {
    pub pc_site_any: f64,
    pub pc_site_two: f64,
    pub pc_site_all: f64,
    pub pc_bond_any: f64,
    pub pc_bond_two: f64,
    pub pc_bond_all: f64,
}

impl SampleResult {
    fn zeros(n: usize) -> Self {
        Self {
            p_infinity: Series::zeros(n),
            chi: Series::zeros(n),
            p_wrap_onset: Series::zeros(n),
            p_wrap_cumulative: Series::zeros(n),
            bond_fraction: Series::zeros(n),
            inaccessible_sites: Series::zeros(n),
            wrapping_cluster_fraction: Series::zeros(n),
            flux: Series::zeros(n),
            pc: PercolationThresholds::default(),
        }
    }

    fn add(&mut self, other: &SampleResult) {
        self.p_infinity.add(&other.p_infinity);
        self.chi.add(&other.chi);
        self.p_wrap_onset.add(&other.p_wrap_onset);
        self.p_wrap_cumulative.add(&other.p_wrap_cumulative);
        self.bond_fraction.add(&other.bond_fraction);
        self.inaccessible_sites.add(&other.inaccessible_sites);
        self.wrapping_cluster_fraction.add(&other.wrapping_cluster_fraction);
        self.flux.add(&other.flux);
        self.pc.pc_site_any += other.pc.pc_site_any;
        self.pc.pc_site_two += other.pc.pc_site_two;
        self.pc.pc_site_all += other.pc.pc_site_all;
        self.pc.pc_bond_any += other.pc.pc_bond_any;
        self.pc.pc_bond_two += other.pc.pc_bond_two;
        self.pc.pc_bond_all += other.pc.pc_bond_all;
    }

    fn scale(&mut self, w: f64) {
        self.p_infinity.scale(w);
        self.chi.scale(w);
        self.p_wrap_onset.scale(w);
        self.p_wrap_cumulative.scale(w);
        self.bond_fraction.scale(w);
        self.inaccessible_sites.scale(w);
        self.wrapping_cluster_fraction.scale(w);
        self.flux.scale(w);
        self.pc.pc_site_any *= w;
        self.pc.pc_site_two *= w;
        self.pc.pc_site_all *= w;
        self.pc.pc_bond_any *= w;
        self.pc.pc_bond_two *= w;
        self.pc.pc_bond_all *= w;
    }
}

/// Derive a trial-local seed from the sampler's root seed and trial index, so
/// results are reproducible regardless of how trials are divided across workers.
fn derive_seed(root_seed: u64, trial_index: u64) -> u64 {
    root_seed ^ trial_index.wrapping_mul(0x9E3779B97F4A7C15)
}

fn split_trials(total: usize, workers: usize) -> Vec<(usize, usize)> {
    let workers = workers.max(1).min(total.max(1));
    let base = total / workers;
    let extra = total % workers;
    let mut out = Vec::with_capacity(workers);
    let mut start = 0;
    for w in 0..workers {
        let count = base + if w < extra { 1 } else { 0 };
        if count > 0 {
            out.push((start, count));
        }
        start += count;
    }
    out
}

/// Run one trial to completion (every site occupied, in a fresh random order),
/// folding its contribution into every observable at once.
fn run_one_trial(
    lattice: &Lattice,
    config: &SamplerConfig,
    rng: &mut SmallRng,
    acc: &mut SampleResult,
) -> Result<(), PercolateError> {
    let n = lattice.num_sites();
    let b_max = lattice.max_bonds().max(1) as f64;
    let a_surf = lattice.basis().surface_area().max(f64::MIN_POSITIVE);

    let mut engine = Percolator::with_rule(lattice, config.rule.build());

    let mut wrap_onset: Option<usize> = None;
    let mut pc_site: [Option<usize>; 3] = [None; 3];
    let mut pc_bond: [Option<f64>; 3] = [None; 3];

    for step in 1..=n {
        engine.add_random_site(rng);

        let largest = engine.largest_cluster().expect("at least one site occupied");
        let largest_size = engine.cluster_size(largest);

        acc.p_infinity.values[step - 1] += largest_size as f64 / step as f64;

        let mut chi_term = 0.0;
        for c in engine.live_cluster_ids() {
            if c != largest {
                let s = engine.cluster_size(c) as f64;
                chi_term += s * s;
            }
        }
        acc.chi.values[step - 1] += (n as f64 / step as f64) * chi_term;

        acc.bond_fraction.values[step - 1] += engine.num_bonds() as f64 / b_max;

        acc.inaccessible_sites.values[step - 1] += (step - engine.num_percolating()) as f64 / step as f64;
        acc.wrapping_cluster_fraction.values[step - 1] +=
            engine.num_percolating_clusters() as f64 / engine.num_clusters() as f64;

        acc.flux.values[step - 1] += engine.num_paths() as f64 / a_surf;

        if wrap_onset.is_none() && engine.is_wrapping(largest) {
            wrap_onset = Some(step);
        }

        let axes = engine.cluster_wrapping(largest).iter().filter(|&&w| w > 0).count();
        for (criterion, threshold) in [1usize, 2, 3].into_iter().enumerate() {
            if pc_site[criterion].is_none() && axes >= threshold {
                pc_site[criterion] = Some(step);
                pc_bond[criterion] = Some(engine.num_bonds() as f64 / b_max);
            }
        }
    }

    let n_f = n as f64;
    if let Some(n_star) = wrap_onset {
        acc.p_wrap_onset.values[n_star - 1] += n_f;
        for v in acc.p_wrap_cumulative.values[n_star - 1..].iter_mut() {
            *v += 1.0;
        }
    }

    let Some(site_any) = pc_site[0] else {
        return Err(PercolateError::NonPercolatingRunError {
            n_sites: n,
            occupation_order: engine.occupation_order().to_vec(),
        });
    };
    acc.pc.pc_site_any += site_any as f64 / n_f;
    acc.pc.pc_bond_any += pc_bond[0].expect("set alongside pc_site[0]");
    if let (Some(s), Some(b)) = (pc_site[1], pc_bond[1]) {
        acc.pc.pc_site_two += s as f64 / n_f;
        acc.pc.pc_bond_two += b;
    }
    if let (Some(s), Some(b)) = (pc_site[2], pc_bond[2]) {
        acc.pc.pc_site_all += s as f64 / n_f;
        acc.pc.pc_bond_all += b;
    }

    Ok(())
}

/// Run `config.num_samples` independent trials over `lattice`, farmed across
/// worker threads, and return the combined observable set.
///
/// `cancel` is checked between trials; a set flag stops each worker early with
/// whatever partial accumulation it has gathered so far (still combined into
/// the result, just under-weighted relative to a full run).
pub fn run(lattice: &Lattice, config: &SamplerConfig, cancel: &AtomicBool) -> Result<SampleResult, PercolateError> {
    config.validate()?;
    let n = lattice.num_sites();

    let num_workers = config
        .num_workers
        .unwrap_or_else(|| std::thread::available_parallelism().map(|p| p.get()).unwrap_or(1));
    let chunks = split_trials(config.num_samples, num_workers);

    let partials: Vec<Result<SampleResult, PercolateError>> = std::thread::scope(|scope| {
        let handles: Vec<_> = chunks
            .into_iter()
            .map(|(start, count)| {
                scope.spawn(move || -> Result<SampleResult, PercolateError> {
                    let mut acc = SampleResult::zeros(n);
                    for local_idx in 0..count {
                        if cancel.load(Ordering::Relaxed) {
                            break;
                        }
                        let trial_index = (start + local_idx) as u64;
                        let mut rng = SmallRng::seed_from_u64(derive_seed(config.root_seed, trial_index));
                        run_one_trial(lattice, config, &mut rng, &mut acc)?;
                    }
                    Ok(acc)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().expect("trial worker thread panicked")).collect()
    });

    let mut total = SampleResult::zeros(n);
    for partial in partials {
        total.add(&partial?);
    }
    total.scale(1.0 / config.num_samples as f64);
    Ok(total)
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use nalgebra::{matrix, vector, Vector3};

    use super::*;
    use crate::base::Basis;
    use crate::config::RuleConfig;
    use crate::neighbors::NeighborMode;

    fn cubic_lattice(side: usize) -> Lattice {
        let basis = Basis::new(matrix![
            side as f64, 0.0, 0.0;
            0.0, side as f64, 0.0;
            0.0, 0.0, side as f64;
        ])
        .unwrap();
        let mut coords = Vec::new();
        for i in 0..side {
            for j in 0..side {
                for k in 0..side {
                    coords.push(vector![
                        i as f64 / side as f64,
                        j as f64 / side as f64,
                        k as f64 / side as f64
                    ]);
                }
            }
        }
        Lattice::new(basis, coords, NeighborMode::default(), None).unwrap()
    }

    #[test]
    fn test_binomial_convolution_conserves_mass_for_large_n() {
        // The constant-1 sequence convolved with Binom(k; N, p) for k = 1..N sums
        // to 1 - (1-p)^N: the full binomial law sums to 1 only once the k = 0
        // term is included, which these n-indexed Pn arrays never carry (n = 0
        // occupied sites isn't a meaningful observable). For N large enough and p
        // bounded away from 0, (1-p)^N is negligible and the sum is ~1.
        let n = 60;
        let series = Series { values: vec![1.0; n] };
        let p_list = vec![0.2, 0.5, 0.8];
        let out = series.convolve(&p_list);
        for v in out {
            assert_relative_eq!(v, 1.0, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_binomial_pmf_sums_to_one_over_full_support() {
        // The underlying mathematical law: summing the full pmf (including k=0)
        // over a binomial distribution always totals 1, for any N and p.
        let n = 10;
        let ln_fact = ln_factorial_table(n);
        for &p in &[0.05, 0.3, 0.5, 0.7, 0.95] {
            let ln_p = p.ln();
            let ln_1mp = (1.0 - p).ln();
            let mut total = 0.0;
            for k in 0..=n {
                let ln_choose = ln_fact[n] - ln_fact[k] - ln_fact[n - k];
                total += (ln_choose + k as f64 * ln_p + (n - k) as f64 * ln_1mp).exp();
            }
            assert_relative_eq!(total, 1.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_small_cubic_sampler_runs_and_percolates() {
        let lattice = cubic_lattice(3);
        let config = SamplerConfig {
            num_samples: 20,
            root_seed: 42,
            p_list: vec![0.3, 0.6, 0.9],
            rule: RuleConfig::AlwaysBonded,
            num_workers: Some(2),
        };
        let cancel = AtomicBool::new(false);
        let result = run(&lattice, &config, &cancel).unwrap();

        assert_eq!(result.p_infinity.values.len(), lattice.num_sites());
        // the last occupation step always has everyone in the largest cluster
        assert_relative_eq!(*result.p_infinity.values.last().unwrap(), 1.0, epsilon = 1e-9);
        assert!(result.pc.pc_site_any > 0.0 && result.pc.pc_site_any <= 1.0);

        let p_curve = result.p_infinity.convolve(&config.p_list);
        assert_eq!(p_curve.len(), 3);
        for v in p_curve {
            assert!((0.0..=1.01).contains(&v));
        }
    }

    #[test]
    fn test_seed_derivation_is_stable_across_worker_counts() {
        let lattice = cubic_lattice(3);
        let base_config = SamplerConfig {
            num_samples: 12,
            root_seed: 7,
            p_list: vec![0.5],
            rule: RuleConfig::AlwaysBonded,
            num_workers: Some(1),
        };
        let cancel = AtomicBool::new(false);
        let single = run(&lattice, &base_config, &cancel).unwrap();

        let parallel_config = SamplerConfig { num_workers: Some(4), ..base_config };
        let parallel = run(&lattice, &parallel_config, &cancel).unwrap();

        for (a, b) in single.p_infinity.values.iter().zip(&parallel.p_infinity.values) {
            assert_relative_eq!(a, b, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_non_percolating_rule_surfaces_terminal_error() {
        use crate::neighbors::NeighborList;

        // Four sites with no neighbor-list entries at all: no bond can ever form,
        // so no cluster can ever wrap, regardless of occupation order.
        let basis = Basis::new(matrix![
            10.0, 0.0, 0.0;
            0.0, 10.0, 0.0;
            0.0, 0.0, 10.0;
        ])
        .unwrap();
        let coords = vec![Vector3::zeros(); 4];
        let table = vec![Vec::new(); 4];
        let lattice = Lattice::from_raw(basis, coords, NeighborList::from_table(table));
        let config = SamplerConfig {
            num_samples: 1,
            root_seed: 1,
            p_list: vec![0.5],
            rule: RuleConfig::AlwaysBonded,
            num_workers: Some(1),
        };
        let cancel = AtomicBool::new(false);
        let result = run(&lattice, &config, &cancel);
        assert!(matches!(result, Err(PercolateError::NonPercolatingRunError { .. })));
    }
}
