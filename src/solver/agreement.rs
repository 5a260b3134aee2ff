//! Agreement clustering of kept candidates.
//!
//! Independently found candidates that put the image in the same place on
//! the sky corroborate each other. Candidates are bucketed by their field
//! center in an equal-area sky grid: latitude is split into `3 * nside`
//! bands uniform in `z = sin(dec)` and longitude into `4 * nside` bins.
//! A new candidate is compared against everything in the cells its
//! tolerance cone touches, and agreeing groups are merged with union-find.

use std::collections::HashMap;
use std::f64::consts::{PI, TAU};

use super::code::DIMQUADS;
use super::MatchCandidate;
use crate::geom::{self, arcsec_to_rad};

/// Finest grid resolution used, whatever the tolerance.
pub const MAX_GRID_NSIDE: u32 = 1 << 12;

/// What the clusterer remembers about a candidate.
#[derive(Debug, Clone, PartialEq)]
pub struct Footprint {
    pub index_id: u32,
    pub quad_id: usize,
    pub center: [f64; 3],
    pub corner_min: [f64; 3],
    pub corner_max: [f64; 3],
    /// `(field point, reference star)` pairs of the quad.
    pub pairs: [(usize, usize); DIMQUADS],
}

impl Footprint {
    pub fn of(c: &MatchCandidate) -> Self {
        let mut pairs = [(0, 0); DIMQUADS];
        for (k, p) in pairs.iter_mut().enumerate() {
            *p = (c.field[k], c.stars[k]);
        }
        Self {
            index_id: c.index_id,
            quad_id: c.quad_id,
            center: c.center,
            corner_min: c.corner_min,
            corner_max: c.corner_max,
            pairs,
        }
    }

    /// Do the quads map some field point, or some reference star, differently?
    fn conflicts_with(&self, other: &Footprint) -> bool {
        if self.index_id != other.index_id {
            return false;
        }
        self.pairs.iter().any(|&(f1, s1)| {
            other
                .pairs
                .iter()
                .any(|&(f2, s2)| (f1 == f2) != (s1 == s2))
        })
    }

    /// Agreement test with squared tolerance `tol2` (chord units).
    pub fn agrees_with(&self, other: &Footprint, tol2: f64) -> bool {
        if self.index_id == other.index_id && self.quad_id == other.quad_id {
            return false;
        }
        if self.conflicts_with(other) {
            return false;
        }
        let d2 = geom::dist2_3(self.corner_min, other.corner_min)
            + geom::dist2_3(self.corner_max, other.corner_max);
        d2 <= tol2
    }
}

// ── Sky grid ────────────────────────────────────────────────────────────────

/// Sparse equal-area grid of candidate ids.
#[derive(Debug, Clone)]
pub struct SkyGrid {
    n_lat: u32,
    n_lon: u32,
    cells: HashMap<u64, Vec<usize>>,
}

impl SkyGrid {
    /// Grid whose cells are roughly `cell_rad` across.
    pub fn for_cell_size(cell_rad: f64) -> Self {
        // 12·nside² cells share 4π steradians.
        let nside = if cell_rad > 0.0 && cell_rad.is_finite() {
            ((PI / 3.0).sqrt() / cell_rad).ceil().clamp(1.0, MAX_GRID_NSIDE as f64) as u32
        } else {
            MAX_GRID_NSIDE
        };
        Self::new(nside)
    }

    pub fn new(nside: u32) -> Self {
        let nside = nside.clamp(1, MAX_GRID_NSIDE);
        Self {
            n_lat: 3 * nside,
            n_lon: 4 * nside,
            cells: HashMap::new(),
        }
    }

    pub fn nside(&self) -> u32 {
        self.n_lat / 3
    }

    pub fn insert(&mut self, id: usize, dir: [f64; 3]) {
        let cell = self.cell_for(dir);
        self.cells.entry(cell).or_default().push(id);
    }

    /// Ids in every cell touched by the cone of `radius_rad` around `dir`.
    pub fn query(&self, dir: [f64; 3], radius_rad: f64, out: &mut Vec<usize>) {
        out.clear();
        if self.cells.is_empty() {
            return;
        }
        let Some(dir) = geom::normalize3(dir) else {
            return;
        };
        let radius = radius_rad.clamp(0.0, PI);
        let z_step = 2.0 / self.n_lat as f64;
        let lon_step = TAU / self.n_lon as f64;

        let z_min = (dir[2] - radius.sin()).max(-1.0);
        let z_max = (dir[2] + radius.sin()).min(1.0);
        // The cone may reach over a pole.
        let polar = radius >= pole_distance(dir[2]);

        let phi = dir[1].atan2(dir[0]).rem_euclid(TAU);
        for lat_bin in z_to_bin(self.n_lat, z_min)..=z_to_bin(self.n_lat, z_max) {
            let zc = -1.0 + (lat_bin as f64 + 0.5) * z_step;
            let cos_dec = zc.clamp(-1.0, 1.0).asin().cos().abs().max(1e-9);
            let half_span = (radius / cos_dec).min(PI) + lon_step;
            if polar || 2.0 * half_span >= TAU {
                for lon_bin in 0..self.n_lon {
                    self.collect(lat_bin, lon_bin, out);
                }
                continue;
            }
            let start = phi_to_bin(self.n_lon, (phi - half_span).rem_euclid(TAU));
            let end = phi_to_bin(self.n_lon, (phi + half_span).rem_euclid(TAU));
            if start <= end {
                for lon_bin in start..=end {
                    self.collect(lat_bin, lon_bin, out);
                }
            } else {
                for lon_bin in (start..self.n_lon).chain(0..=end) {
                    self.collect(lat_bin, lon_bin, out);
                }
            }
        }
        out.sort_unstable();
        out.dedup();
    }

    fn collect(&self, lat_bin: u32, lon_bin: u32, out: &mut Vec<usize>) {
        let cell = lat_bin as u64 * self.n_lon as u64 + lon_bin as u64;
        if let Some(ids) = self.cells.get(&cell) {
            out.extend_from_slice(ids);
        }
    }

    fn cell_for(&self, dir: [f64; 3]) -> u64 {
        let (ra, dec) = geom::xyz_to_radec(dir);
        let lat_bin = z_to_bin(self.n_lat, dec.sin());
        let lon_bin = phi_to_bin(self.n_lon, ra);
        lat_bin as u64 * self.n_lon as u64 + lon_bin as u64
    }
}

/// Angular distance from a direction with the given z to the nearer pole.
fn pole_distance(z: f64) -> f64 {
    0.5 * PI - z.abs().clamp(0.0, 1.0).asin()
}

fn z_to_bin(n_lat: u32, z: f64) -> u32 {
    let u = ((z.clamp(-1.0, 1.0) + 1.0) * 0.5).clamp(0.0, 1.0);
    ((u * n_lat as f64).floor() as u32).min(n_lat - 1)
}

fn phi_to_bin(n_lon: u32, phi: f64) -> u32 {
    let u = (phi / TAU).clamp(0.0, 1.0);
    ((u * n_lon as f64).floor() as u32).min(n_lon - 1)
}

// ── Clusterer ───────────────────────────────────────────────────────────────

/// Union-find over agreeing candidates, with the largest group tracked.
#[derive(Debug, Clone)]
pub struct AgreementClusterer {
    tol_rad: f64,
    tol2: f64,
    grid: SkyGrid,
    footprints: Vec<Footprint>,
    parent: Vec<usize>,
    size: Vec<usize>,
    best: Option<usize>,
    nearby: Vec<usize>,
}

impl AgreementClusterer {
    pub fn new(tolerance_arcsec: f64) -> Self {
        let tol_rad = arcsec_to_rad(tolerance_arcsec);
        Self {
            tol_rad,
            tol2: tol_rad * tol_rad,
            grid: SkyGrid::for_cell_size(tol_rad),
            footprints: Vec::new(),
            parent: Vec::new(),
            size: Vec::new(),
            best: None,
            nearby: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.footprints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.footprints.is_empty()
    }

    pub fn footprint(&self, id: usize) -> &Footprint {
        &self.footprints[id]
    }

    /// Add a candidate; returns its id and the size of the group it joined.
    pub fn insert(&mut self, fp: Footprint) -> (usize, usize) {
        let id = self.footprints.len();
        let mut nearby = std::mem::take(&mut self.nearby);
        self.grid.query(fp.center, self.tol_rad, &mut nearby);

        self.parent.push(id);
        self.size.push(1);
        for &other in &nearby {
            if fp.agrees_with(&self.footprints[other], self.tol2) {
                self.union(id, other);
            }
        }
        self.nearby = nearby;

        self.grid.insert(id, fp.center);
        self.footprints.push(fp);

        let root = self.find(id);
        let group_size = self.size[root];
        let best_size = self.best.map_or(0, |b| self.size[self.find(b)]);
        if group_size > best_size {
            self.best = Some(root);
        }
        (id, group_size)
    }

    pub fn find(&self, mut id: usize) -> usize {
        while self.parent[id] != id {
            id = self.parent[id];
        }
        id
    }

    fn union(&mut self, a: usize, b: usize) {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra == rb {
            return;
        }
        let (big, small) = if self.size[ra] >= self.size[rb] {
            (ra, rb)
        } else {
            (rb, ra)
        };
        self.parent[small] = big;
        self.size[big] += self.size[small];
    }

    pub fn group_size(&self, id: usize) -> usize {
        self.size[self.find(id)]
    }

    /// Members of the group containing `id`, in insertion order.
    pub fn group_members(&self, id: usize) -> Vec<usize> {
        let root = self.find(id);
        (0..self.footprints.len())
            .filter(|&m| self.find(m) == root)
            .collect()
    }

    /// Representative id and size of the largest group.
    pub fn best_group(&self) -> Option<(usize, usize)> {
        let root = self.find(self.best?);
        Some((root, self.size[root]))
    }
}
