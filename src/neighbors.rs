//! Periodic neighbor-list construction.
//!
//! For a general (possibly non-orthogonal) periodic cell, enumerates each site's
//! neighbors together with the integer lattice translation vector connecting them.
//! Sites are assigned to a grid of boxes so that a query only has to scan a bounded
//! "star" of nearby boxes rather than all `N` sites.

use std::collections::HashSet;

use log::{debug, warn};
use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};

use crate::base::{Basis, PercolateError};

/// An integer lattice translation in units of the three basis vectors.
pub type Translation = Vector3<i32>;

const EPS: f64 = 1e-8;

/// How neighbors of a site are defined.
#[derive(Debug, Clone, Copy)]
pub enum NeighborMode {
    /// Only the nearest neighbors, allowing `dr` of slack in the cutoff distance.
    Nearest { dr: f64 },
    /// All neighbors within a fixed interaction range `r`.
    Range { r: f64 },
}

impl Default for NeighborMode {
    fn default() -> Self {
        NeighborMode::Nearest { dr: 0.1 }
    }
}

/// Box partition of the unit cell, `(na, nb, nc)` boxes along each basis direction.
pub type BoxPartition = (usize, usize, usize);

/// For every site, an ordered list of `(neighbor_site, translation)` pairs.
///
/// A single `(i, j)` pair may appear multiple times with distinct translations: each
/// slot is an independent bond candidate and must not be deduplicated by site id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NeighborList {
    table: Vec<Vec<(usize, Translation)>>,
}

impl NeighborList {
    pub fn num_sites(&self) -> usize {
        self.table.len()
    }

    pub fn neighbors(&self, site: usize) -> &[(usize, Translation)] {
        &self.table[site]
    }

    /// Build a neighbor list directly from an explicit adjacency table, bypassing
    /// box decomposition. Used by tests that need an exact hand-specified graph.
    #[cfg(test)]
    pub(crate) fn from_table(table: Vec<Vec<(usize, Translation)>>) -> Self {
        Self { table }
    }

    /// `B_max`: the maximum number of bonds the lattice admits, counting each
    /// `(i, j)` pair of distinct sites once regardless of how many translations
    /// connect them.
    pub fn max_bonds(&self) -> usize {
        let mut total = 0usize;
        for site_neighbors in &self.table {
            let unique: HashSet<usize> = site_neighbors.iter().map(|&(j, _)| j).collect();
            total += unique.len();
        }
        total / 2
    }

    /// Verify the invariant that every `(i, j, T)` entry has a matching `(j, i, -T)`
    /// entry. Returns the first violation found, if any.
    pub fn check_symmetric(&self) -> Result<(), PercolateError> {
        for (i, site_neighbors) in self.table.iter().enumerate() {
            for (k, &(j, t)) in site_neighbors.iter().enumerate() {
                let has_reverse = self.table[j].iter().any(|&(back, t2)| back == i && t2 == -t);
                if !has_reverse {
                    return Err(PercolateError::NeighborAsymmetryError { site: i, slot: k });
                }
            }
        }
        Ok(())
    }
}

fn wrap_to_unit_cell(coords: &[Vector3<f64>]) -> Vec<Vector3<f64>> {
    coords
        .iter()
        .map(|c| c.map(|x| x - x.floor()))
        .collect()
}

fn box_id(na: i32, nb: i32, nc: i32, nboxes: BoxPartition) -> usize {
    let (na_n, nb_n, nc_n) = nboxes;
    let wa = na.rem_euclid(na_n as i32) as usize;
    let wb = nb.rem_euclid(nb_n as i32) as usize;
    let wc = nc.rem_euclid(nc_n as i32) as usize;
    wa + wb * na_n + wc * na_n * nb_n
}

fn box_coords(bid: usize, nboxes: BoxPartition) -> (i32, i32, i32) {
    let (na_n, nb_n, _) = nboxes;
    let plane = na_n * nb_n;
    let nc = bid / plane;
    let rest = bid % plane;
    let nb = rest / na_n;
    let na = rest % na_n;
    (na as i32, nb as i32, nc as i32)
}

fn default_box_partition(basis: &Basis, num_sites: usize, natoms_per_box: f64) -> BoxPartition {
    let norms = basis.vector_norms();
    let target = (num_sites as f64 / natoms_per_box).max(1.0);
    let d = (basis.volume() / target).cbrt();
    let n = |len: f64| -> usize { (len / d).round().max(1.0) as usize };
    (n(norms.x), n(norms.y), n(norms.z))
}

/// The "star" of translations `T` whose box-to-box displacement may bring any corner
/// of a remote box within range of any corner of the home box. Always includes the 26
/// immediate neighbors; extended outward when `interaction_range` is set.
fn star_setup(basis: &Basis, interaction_range: Option<f64>) -> Vec<Translation> {
    let mut star: Vec<Translation> = Vec::new();
    for ix in -1..=1 {
        for iy in -1..=1 {
            for iz in -1..=1 {
                if (ix, iy, iz) != (0, 0, 0) {
                    let t = Translation::new(ix, iy, iz);
                    if !star.contains(&t) {
                        star.push(t);
                    }
                }
            }
        }
    }

    let Some(r) = interaction_range else {
        return star;
    };
    let r2 = r * r;

    let common: [Translation; 8] = [
        Translation::new(0, 0, 0),
        Translation::new(-1, 0, 0),
        Translation::new(0, -1, 0),
        Translation::new(0, 0, -1),
        Translation::new(-1, -1, 0),
        Translation::new(-1, 0, -1),
        Translation::new(0, -1, -1),
        Translation::new(-1, -1, -1),
    ];

    let mut ix = 0i32;
    loop {
        let mut iy = 0i32;
        let mut found_one_x = false;
        loop {
            let mut iz = 0i32;
            let mut found_one_y = false;
            loop {
                if (ix, iy, iz) == (0, 0, 0) {
                    iz += 1;
                    continue;
                }
                let frac = Vector3::new(ix as f64, iy as f64, iz as f64);
                let d2 = basis.cartesian_coords(&frac).norm_squared();
                if d2 - EPS < r2 {
                    for t in &common {
                        let t_new = Translation::new(ix, iy, iz) + t;
                        if !star.contains(&t_new) {
                            star.push(t_new);
                        }
                        let t_new2 = Translation::new(-ix, -iy, -iz) + t;
                        if !star.contains(&t_new2) {
                            star.push(t_new2);
                        }
                    }
                    found_one_y = true;
                } else {
                    break;
                }
                iz += 1;
            }
            if found_one_y {
                iy += 1;
                found_one_x = true;
            } else {
                break;
            }
        }
        if found_one_x {
            ix += 1;
        } else {
            break;
        }
    }
    star
}

fn scaled_basis(basis: &Basis, nboxes: BoxPartition) -> Basis {
    let scale = Matrix3::from_diagonal(&Vector3::new(
        1.0 / nboxes.0 as f64,
        1.0 / nboxes.1 as f64,
        1.0 / nboxes.2 as f64,
    ));
    Basis::from_column_basis(basis.matrix() * scale)
}

fn box_star(basis: &Basis, nboxes: BoxPartition, interaction_range: Option<f64>) -> Vec<(i32, i32, i32)> {
    let raw = star_setup(&scaled_basis(basis, nboxes), interaction_range);
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for t in raw {
        let key = (
            t.x.rem_euclid(nboxes.0 as i32),
            t.y.rem_euclid(nboxes.1 as i32),
            t.z.rem_euclid(nboxes.2 as i32),
        );
        if seen.insert(key) {
            out.push(key);
        }
    }
    out
}

/// Build a periodic neighbor list for `coords` under `basis`, per the mode requested.
///
/// `explicit_boxes`, if given, overrides the default box-partition heuristic
/// (`natoms_per_box` sites per box on average).
pub fn build_neighbor_list(
    basis: &Basis,
    coords: &[Vector3<f64>],
    mode: NeighborMode,
    explicit_boxes: Option<BoxPartition>,
) -> Result<NeighborList, PercolateError> {
    if coords.is_empty() {
        return Err(PercolateError::EmptySiteListError);
    }
    let n = coords.len();
    let coords = wrap_to_unit_cell(coords);

    let nboxes = match explicit_boxes {
        Some(nb) => nb,
        None => default_box_partition(basis, n, 10.0),
    };
    if nboxes.0 == 0 || nboxes.1 == 0 || nboxes.2 == 0 {
        return Err(PercolateError::InvalidBoxPartitionError);
    }
    debug!("partitioned {} sites into {:?} boxes", n, nboxes);

    let mut box_of_site = vec![0usize; n];
    let mut box_contents: Vec<Vec<usize>> = vec![Vec::new(); nboxes.0 * nboxes.1 * nboxes.2];
    for (i, c) in coords.iter().enumerate() {
        let na = (c.x * nboxes.0 as f64).floor() as i32;
        let nb = (c.y * nboxes.1 as f64).floor() as i32;
        let nc = (c.z * nboxes.2 as f64).floor() as i32;
        let bid = box_id(na, nb, nc, nboxes);
        box_of_site[i] = bid;
        box_contents[bid].push(i);
    }

    let interaction_range = match mode {
        NeighborMode::Range { r } => Some(r),
        NeighborMode::Nearest { .. } => None,
    };
    let mut t_latt = vec![Translation::zeros()];
    t_latt.extend(star_setup(basis, interaction_range));
    let star = box_star(basis, nboxes, interaction_range);
    debug!(
        "lattice-translation star has {} entries, box star has {} entries",
        t_latt.len(),
        star.len()
    );

    let mut table = vec![Vec::new(); n];
    for i in 0..n {
        let (na, nb, nc) = box_coords(box_of_site[i], nboxes);
        let mut candidates: Vec<usize> = box_contents[box_of_site[i]]
            .iter()
            .copied()
            .filter(|&j| j != i)
            .collect();
        for &(ox, oy, oz) in &star {
            let nbid = box_id(na + ox, nb + oy, nc + oz, nboxes);
            candidates.extend(box_contents[nbid].iter().copied());
        }

        table[i] = match mode {
            NeighborMode::Nearest { dr } => nearest_neighbors(i, &coords, basis, &t_latt, dr, &candidates),
            NeighborMode::Range { r } => range_neighbors(i, &coords, basis, &t_latt, r, &candidates),
        };
        if table[i].is_empty() {
            warn!("site {} has no neighbors within range", i);
        }
    }

    let list = NeighborList { table };
    list.check_symmetric()?;
    Ok(list)
}

fn nearest_neighbors(
    site: usize,
    coords: &[Vector3<f64>],
    basis: &Basis,
    t_latt: &[Translation],
    dr: f64,
    candidates: &[usize],
) -> Vec<(usize, Translation)> {
    let coo_i = coords[site];
    let coo_i_t: Vec<Vector3<f64>> = t_latt
        .iter()
        .map(|t| basis.cartesian_coords(&(coo_i - t.map(|x| x as f64))))
        .collect();

    let mut d_min_min = basis.cartesian_coords(&Vector3::new(1.0, 1.0, 1.0)).norm();
    let mut nbl: Vec<usize> = Vec::new();
    let mut tvecs: Vec<Translation> = Vec::new();

    for &j in candidates {
        let coo_j = basis.cartesian_coords(&coords[j]);
        let d2: Vec<f64> = coo_i_t.iter().map(|p| (p - coo_j).norm_squared()).collect();
        let d_min = d2.iter().cloned().fold(f64::INFINITY, f64::min).sqrt();

        if d_min + dr < d_min_min {
            nbl.clear();
            tvecs.clear();
        }
        d_min_min = d_min.min(d_min_min);
        if d_min > d_min_min + dr {
            continue;
        }

        // A candidate can tie across more than one translation (e.g. a cell with
        // only two layers along an axis puts a neighbor equidistant "ahead" and
        // "behind"). Collapse an exact tie to a single slot so repeated slots to the
        // same site don't inflate the realized bond count past `B_max`; a genuinely
        // closer *second* image within the `dr` window still gets its own slot.
        let threshold2 = (d_min_min + dr).powi(2);
        let d_candidate_min = d2.iter().cloned().fold(f64::INFINITY, f64::min);
        let mut took_tied_min = false;
        for (k, &dd2) in d2.iter().enumerate() {
            if dd2 > threshold2 {
                continue;
            }
            if (dd2 - d_candidate_min).abs() < EPS {
                if took_tied_min {
                    continue;
                }
                took_tied_min = true;
            }
            nbl.push(j);
            tvecs.push(t_latt[k]);
        }
    }

    nbl.into_iter().zip(tvecs).collect()
}

fn range_neighbors(
    site: usize,
    coords: &[Vector3<f64>],
    basis: &Basis,
    t_latt: &[Translation],
    r: f64,
    candidates: &[usize],
) -> Vec<(usize, Translation)> {
    let r2 = r * r;
    let coo_i = coords[site];
    let coo_i_t: Vec<Vector3<f64>> = t_latt
        .iter()
        .map(|t| basis.cartesian_coords(&(coo_i - t.map(|x| x as f64))))
        .collect();

    let mut out = Vec::new();
    for &j in candidates {
        let coo_j = basis.cartesian_coords(&coords[j]);
        for (k, &t) in t_latt.iter().enumerate() {
            let d2 = (coo_i_t[k] - coo_j).norm_squared();
            if d2 - EPS <= r2 {
                out.push((j, t));
            }
        }
    }
    out
}
