//! The real-space Hamiltonian description and its per-thread working state.
//!
//! The operator is a sum of four pieces:
//!
//! - a *regular* translation-invariant part: per-orbital hopping lists with a
//!   displacement vector and an amplitude;
//! - *Anderson* on-site disorder, per orbital either absent, shared by all
//!   sites of the orbital, or drawn per site from a distribution;
//! - *structural* disorder: small impurity clusters ("patterns") with
//!   internal hoppings and on-site terms, anchored at random cells;
//! - *vacancies*: sites whose amplitude is forced to zero.
//!
//! The description (`*Spec` types) is immutable and shared; each worker
//! thread builds its own `Hamiltonian` with thread-local disorder tables and
//! redraws them once per disorder realization via `generate_disorder`.

use crate::error::{KpmError, Result};
use crate::generics::Scalar;
use crate::lattice::Domain;
use rand::seq::index::sample;
use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Description
// ---------------------------------------------------------------------------

/// One directed hopping of the regular part. Hermiticity is the model
/// builder's responsibility: list the reverse hop with the conjugate
/// amplitude, as in any tight-binding front end.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HoppingSpec {
    pub from_orb: usize,
    pub to_orb: usize,
    pub delta: [i32; 3],
    pub re: f64,
    #[serde(default)]
    pub im: f64,
}

/// Per-orbital Anderson on-site policy.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AndersonSpec {
    /// No on-site term for this orbital.
    None,
    /// A fixed orbital energy, identical on every site.
    Shared { value: f64 },
    /// Per-site value drawn uniformly from [mean - width/2, mean + width/2].
    Uniform { mean: f64, width: f64 },
    /// Per-site Gaussian value.
    Gaussian { mean: f64, stddev: f64 },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PatternNode {
    pub offset: [i32; 3],
    pub orb: usize,
}

/// Internal bond of an impurity pattern, directed from the written node to
/// the read node, in the same sense as the regular hoppings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PatternBondSpec {
    pub write_node: usize,
    pub read_node: usize,
    pub re: f64,
    #[serde(default)]
    pub im: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PatternOnsiteSpec {
    pub node: usize,
    pub value: f64,
}

/// An impurity pattern: a small node graph placed at random anchors each
/// disorder realization, or at fixed global cells for reproducible tests.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PatternSpec {
    pub nodes: Vec<PatternNode>,
    #[serde(default)]
    pub bonds: Vec<PatternBondSpec>,
    #[serde(default)]
    pub onsites: Vec<PatternOnsiteSpec>,
    /// Anchors per bulk cell and per realization.
    #[serde(default)]
    pub concentration: f64,
    /// Fixed anchor cells in global coordinates; used in place of random
    /// placement when non-empty.
    #[serde(default)]
    pub fixed_anchors: Vec<[i64; 3]>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct VacancySpec {
    /// Vacancy probability per bulk site-orbital, redrawn each realization.
    #[serde(default)]
    pub concentration: f64,
    /// Fixed vacancies as (global cell, orbital); kept across realizations.
    #[serde(default)]
    pub fixed: Vec<FixedVacancy>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FixedVacancy {
    pub cell: [i64; 3],
    pub orb: usize,
}

/// The immutable Hamiltonian description shared by all threads.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HamiltonianSpec {
    pub hoppings: Vec<HoppingSpec>,
    /// One policy per orbital; missing tail entries default to `None`.
    #[serde(default)]
    pub anderson: Vec<AndersonSpec>,
    #[serde(default)]
    pub patterns: Vec<PatternSpec>,
    #[serde(default)]
    pub vacancies: VacancySpec,
}

// ---------------------------------------------------------------------------
// Built, per-thread state
// ---------------------------------------------------------------------------

/// A hopping with its precomputed linear offset in the local index space.
#[derive(Clone, Copy, Debug)]
pub struct Hop<S> {
    /// Linear offset of the read site relative to the written site.
    pub offset: isize,
    /// Cell displacement of the hop, for the Peierls phase and the velocity
    /// factors.
    pub delta: [i32; 3],
    pub t: S,
}

impl<S: Scalar> Hop<S> {
    /// The velocity amplitude for the given axis list: the hopping amplitude
    /// times one displacement component per axis. An empty list returns the
    /// plain amplitude.
    #[inline(always)]
    pub fn velocity(&self, axes: &[usize]) -> S {
        let mut f = 1.0;
        for &a in axes {
            f *= self.delta[a] as f64;
        }
        self.t.scale(f)
    }
}

/// Per-orbital velocity table: the regular hoppings with amplitudes replaced
/// by their velocity factors.
pub type VelocityTable<S> = Vec<Vec<Hop<S>>>;

/// Anderson state of one orbital after `generate_disorder`.
#[derive(Clone, Debug)]
pub enum AndersonOrbital {
    None,
    Shared(f64),
    /// Per-site values indexed by local cell (ghost cells unused).
    PerSite(Vec<f64>),
}

/// A structural bond that must be applied once, globally, after the tile
/// sweep: its anchor sticks out of the bulk, so either the written site was
/// wrapped back into this domain or the read site sits in a ghost layer.
#[derive(Clone, Debug)]
pub struct BorderBond<S> {
    pub write: usize,
    pub read: usize,
    pub delta: [i32; 3],
    pub t: S,
}

#[derive(Clone, Debug)]
pub struct BorderOnsite {
    pub site: usize,
    pub value: f64,
}

/// One impurity pattern, compiled against the local geometry and carrying
/// the anchors of the current disorder realization.
#[derive(Clone, Debug)]
pub struct PatternState<S> {
    /// Linear offset of each node relative to the anchor base index.
    pub node_offset: Vec<isize>,
    /// Cell displacement of each node relative to the anchor cell.
    pub node_delta: Vec<[i32; 3]>,
    /// Orbital of each node.
    pub node_orb: Vec<usize>,
    pub bonds: Vec<PatternBond<S>>,
    pub onsites: Vec<(usize, f64)>,
    concentration: f64,
    fixed_anchors: Vec<[i64; 3]>,
    /// Anchor base indices (orbital-0 site index of the anchor cell), one
    /// list per tile. Applied during that tile's pass.
    pub anchors: Vec<Vec<usize>>,
    pub border_bonds: Vec<BorderBond<S>>,
    pub border_onsites: Vec<BorderOnsite>,
}

#[derive(Clone, Copy, Debug)]
pub struct PatternBond<S> {
    pub write_node: usize,
    pub read_node: usize,
    /// Displacement from the written node's cell to the read node's cell.
    pub delta: [i32; 3],
    pub t: S,
}

impl<S: Scalar> PatternBond<S> {
    #[inline(always)]
    pub fn velocity(&self, axes: &[usize]) -> S {
        velocity_factor(self.t, self.delta, axes)
    }
}

impl<S: Scalar> BorderBond<S> {
    #[inline(always)]
    pub fn velocity(&self, axes: &[usize]) -> S {
        velocity_factor(self.t, self.delta, axes)
    }
}

#[inline(always)]
fn velocity_factor<S: Scalar>(t: S, delta: [i32; 3], axes: &[usize]) -> S {
    let mut f = 1.0;
    for &a in axes {
        f *= delta[a] as f64;
    }
    t.scale(f)
}

/// Vacancy sites of the current realization.
#[derive(Clone, Debug, Default)]
pub struct VacancyState {
    /// Linear site indices per tile, zeroed at the end of each tile pass.
    pub per_tile: Vec<Vec<usize>>,
    /// Vacancies that coincide with structural-defect sites; re-zeroed after
    /// the global border corrections so the vacancy always wins.
    pub with_defects: Vec<usize>,
    /// Local vacancy count, used by the random-vector normalization.
    pub total: usize,
}

/// The per-thread working Hamiltonian.
#[derive(Clone, Debug)]
pub struct Hamiltonian<S: Scalar> {
    /// Regular hoppings per orbital.
    pub regular: Vec<Vec<Hop<S>>>,
    pub anderson: Vec<AndersonOrbital>,
    pub patterns: Vec<PatternState<S>>,
    pub vacancies: VacancyState,
    /// Tiles written by a structural bond anchored in another tile. These
    /// are initialized in a pre-pass and skipped by the in-sweep
    /// initialization.
    pub cross_tile: Vec<bool>,
    pub cross_tile_indices: Vec<usize>,
    anderson_spec: Vec<AndersonSpec>,
    vacancy_spec: VacancySpec,
}

impl<S: Scalar> Hamiltonian<S> {
    /// Compile the shared description against one thread's geometry. The
    /// disorder tables start empty; call `generate_disorder` before the
    /// first multiply.
    pub fn build(spec: &HamiltonianSpec, domain: &Domain) -> Result<Hamiltonian<S>> {
        let l = &domain.lattice;
        let norb = l.orbitals;

        let mut regular: Vec<Vec<Hop<S>>> = vec![Vec::new(); norb];
        for h in &spec.hoppings {
            if h.from_orb >= norb || h.to_orb >= norb {
                return Err(KpmError::OrbitalOutOfRange {
                    orb: h.from_orb.max(h.to_orb),
                    norb,
                });
            }
            for d in 0..l.dim {
                let reach = h.delta[d].unsigned_abs() as usize;
                if reach > l.nghosts {
                    return Err(KpmError::HoppingExceedsGhosts {
                        axis: d,
                        reach,
                        nghosts: l.nghosts,
                    });
                }
            }
            if !S::IS_COMPLEX && h.im != 0.0 {
                return Err(KpmError::ComplexAmplitudeNeedsComplex);
            }
            let t = amplitude::<S>(h.re, h.im);
            regular[h.from_orb].push(Hop {
                offset: l.hop_offset(h.delta, h.from_orb, h.to_orb),
                delta: h.delta,
                t,
            });
        }

        let mut anderson_spec = spec.anderson.clone();
        anderson_spec.resize(norb, AndersonSpec::None);

        let mut patterns = Vec::with_capacity(spec.patterns.len());
        for p in &spec.patterns {
            let mut node_offset = Vec::with_capacity(p.nodes.len());
            let mut node_delta = Vec::with_capacity(p.nodes.len());
            let mut node_orb = Vec::with_capacity(p.nodes.len());
            for n in &p.nodes {
                if n.orb >= norb {
                    return Err(KpmError::OrbitalOutOfRange { orb: n.orb, norb });
                }
                for d in 0..l.dim {
                    if n.offset[d].unsigned_abs() as usize > l.nghosts {
                        return Err(KpmError::PatternExceedsGhosts {
                            offset: n.offset,
                            nghosts: l.nghosts,
                        });
                    }
                }
                node_offset.push(l.hop_offset(n.offset, 0, n.orb));
                node_delta.push(n.offset);
                node_orb.push(n.orb);
            }
            let mut bonds = Vec::with_capacity(p.bonds.len());
            for b in &p.bonds {
                if !S::IS_COMPLEX && b.im != 0.0 {
                    return Err(KpmError::ComplexAmplitudeNeedsComplex);
                }
                let mut delta = [0i32; 3];
                for d in 0..3 {
                    delta[d] = node_delta[b.read_node][d] - node_delta[b.write_node][d];
                }
                for d in 0..l.dim {
                    if delta[d].unsigned_abs() as usize > l.nghosts {
                        return Err(KpmError::PatternExceedsGhosts {
                            offset: delta,
                            nghosts: l.nghosts,
                        });
                    }
                }
                bonds.push(PatternBond {
                    write_node: b.write_node,
                    read_node: b.read_node,
                    delta,
                    t: amplitude::<S>(b.re, b.im),
                });
            }
            patterns.push(PatternState {
                node_offset,
                node_delta,
                node_orb,
                bonds,
                onsites: p.onsites.iter().map(|o| (o.node, o.value)).collect(),
                concentration: p.concentration,
                fixed_anchors: p.fixed_anchors.clone(),
                anchors: vec![Vec::new(); l.n_tiles],
                border_bonds: Vec::new(),
                border_onsites: Vec::new(),
            });
        }

        Ok(Hamiltonian {
            regular,
            anderson: vec![AndersonOrbital::None; norb],
            patterns,
            vacancies: VacancyState {
                per_tile: vec![Vec::new(); l.n_tiles],
                ..VacancyState::default()
            },
            cross_tile: vec![false; l.n_tiles],
            cross_tile_indices: Vec::new(),
            anderson_spec,
            vacancy_spec: spec.vacancies.clone(),
        })
    }

    /// Redraw every disorder table for a new realization: Anderson on-site
    /// values, structural-disorder anchors with their border splits and the
    /// cross-tile masks, and the vacancy lists.
    pub fn generate_disorder<R: Rng>(&mut self, domain: &Domain, rng: &mut R) {
        self.draw_anderson(domain, rng);
        self.draw_patterns(domain, rng);
        self.draw_vacancies(domain, rng);
        self.mark_defect_vacancies();
    }

    fn draw_anderson<R: Rng>(&mut self, domain: &Domain, rng: &mut R) {
        let l = &domain.lattice;
        for (orb, policy) in self.anderson_spec.iter().enumerate() {
            self.anderson[orb] = match policy {
                AndersonSpec::None => AndersonOrbital::None,
                AndersonSpec::Shared { value } => AndersonOrbital::Shared(*value),
                AndersonSpec::Uniform { mean, width } => {
                    let mut values = vec![0.0; l.nd];
                    let half = width / 2.0;
                    l.for_each_bulk_row(0, |row| {
                        for cell in row..row + l.row_len() {
                            values[cell] = mean + rng.gen_range(-half..=half);
                        }
                    });
                    AndersonOrbital::PerSite(values)
                }
                AndersonSpec::Gaussian { mean, stddev } => {
                    let normal = Normal::new(*mean, *stddev)
                        .expect("gaussian stddev must be finite and non-negative");
                    let mut values = vec![0.0; l.nd];
                    l.for_each_bulk_row(0, |row| {
                        for cell in row..row + l.row_len() {
                            values[cell] = normal.sample(rng);
                        }
                    });
                    AndersonOrbital::PerSite(values)
                }
            };
        }
    }

    fn draw_patterns<R: Rng>(&mut self, domain: &Domain, rng: &mut R) {
        let l = &domain.lattice;
        let bulk_cells = l.bulk[0] * l.bulk[1] * l.bulk[2];
        self.cross_tile.fill(false);
        for pat in &mut self.patterns {
            for list in &mut pat.anchors {
                list.clear();
            }
            pat.border_bonds.clear();
            pat.border_onsites.clear();

            let mut anchor_cells: Vec<[usize; 3]> = Vec::new();
            if pat.fixed_anchors.is_empty() {
                let count = ((pat.concentration * bulk_cells as f64).round() as usize)
                    .min(bulk_cells);
                for id in sample(rng, bulk_cells, count) {
                    anchor_cells.push(bulk_cell_coords(l, id));
                }
            } else {
                for g in &pat.fixed_anchors {
                    if let Some(x) = domain.global_to_local(*g) {
                        anchor_cells.push(x);
                    }
                }
            }

            for x in anchor_cells {
                let base = l.site_index(x, 0);
                // An anchor whose written nodes all stay inside the bulk is
                // applied during its tile pass; anything else is decomposed
                // into global border corrections.
                let mut intact = true;
                for b in &pat.bonds {
                    if !node_in_bulk(l, x, pat.node_delta[b.write_node]) {
                        intact = false;
                        break;
                    }
                }
                if intact {
                    for &(node, _) in &pat.onsites {
                        if !node_in_bulk(l, x, pat.node_delta[node]) {
                            intact = false;
                            break;
                        }
                    }
                }

                if intact {
                    let tile = l.tile_of(x);
                    pat.anchors[tile].push(base);
                    for b in &pat.bonds {
                        let wx = shifted(x, pat.node_delta[b.write_node]);
                        let wt = l.tile_of(wx);
                        if wt != tile && !self.cross_tile[wt] {
                            self.cross_tile[wt] = true;
                        }
                    }
                } else {
                    // The read site is addressed relative to the (possibly
                    // wrapped) written cell; when it leaves the bulk the
                    // ghost layers hold the right neighbour image.
                    for b in &pat.bonds {
                        let Some(wcell) =
                            wrap_into_bulk(domain, x, pat.node_delta[b.write_node])
                        else {
                            continue;
                        };
                        let wbase = l.site_index(wcell, 0) as isize;
                        let write =
                            wbase + (pat.node_orb[b.write_node] * l.basis[3]) as isize;
                        let read = wbase
                            + l.hop_offset(b.delta, 0, 0)
                            + (pat.node_orb[b.read_node] * l.basis[3]) as isize;
                        pat.border_bonds.push(BorderBond {
                            write: write as usize,
                            read: read as usize,
                            delta: b.delta,
                            t: b.t,
                        });
                    }
                    for &(node, value) in &pat.onsites {
                        let Some(cell) = wrap_into_bulk(domain, x, pat.node_delta[node])
                        else {
                            continue;
                        };
                        pat.border_onsites.push(BorderOnsite {
                            site: l.site_index(cell, 0)
                                + pat.node_orb[node] * l.basis[3],
                            value,
                        });
                    }
                }
            }
        }
        self.cross_tile_indices = self
            .cross_tile
            .iter()
            .enumerate()
            .filter_map(|(i, &c)| c.then_some(i))
            .collect();
    }

    fn draw_vacancies<R: Rng>(&mut self, domain: &Domain, rng: &mut R) {
        let l = &domain.lattice;
        for list in &mut self.vacancies.per_tile {
            list.clear();
        }
        self.vacancies.with_defects.clear();
        self.vacancies.total = 0;

        let c = self.vacancy_spec.concentration;
        if c > 0.0 {
            for orb in 0..l.orbitals {
                l.for_each_bulk_row(orb, |row| {
                    for i in row..row + l.row_len() {
                        if rng.gen_bool(c) {
                            let (x, _) = l.decompose(i);
                            self.vacancies.per_tile[l.tile_of(x)].push(i);
                            self.vacancies.total += 1;
                        }
                    }
                });
            }
        }
        for v in &self.vacancy_spec.fixed {
            if let Some(x) = domain.global_to_local(v.cell) {
                let i = l.site_index(x, v.orb);
                self.vacancies.per_tile[l.tile_of(x)].push(i);
                self.vacancies.total += 1;
            }
        }
    }

    /// Vacancies that sit on a structural-defect site must be zeroed again
    /// after the border corrections.
    fn mark_defect_vacancies(&mut self) {
        use std::collections::HashSet;
        let mut defect_sites: HashSet<usize> = HashSet::new();
        for pat in &self.patterns {
            for tile in &pat.anchors {
                for &base in tile {
                    for &off in &pat.node_offset {
                        defect_sites.insert((base as isize + off) as usize);
                    }
                }
            }
            for b in &pat.border_bonds {
                defect_sites.insert(b.write);
            }
            for o in &pat.border_onsites {
                defect_sites.insert(o.site);
            }
        }
        if defect_sites.is_empty() {
            return;
        }
        for tile in &self.vacancies.per_tile {
            for &v in tile {
                if defect_sites.contains(&v) {
                    self.vacancies.with_defects.push(v);
                }
            }
        }
    }

    /// The regular hopping table with every amplitude replaced by its
    /// velocity factor for the given axes. Pure function of the hopping
    /// structure; the structural bonds compute the same factor inline from
    /// their stored displacement.
    pub fn build_velocity(&self, axes: &[usize]) -> VelocityTable<S> {
        self.regular
            .iter()
            .map(|hops| {
                hops.iter()
                    .map(|h| Hop {
                        offset: h.offset,
                        delta: h.delta,
                        t: h.velocity(axes),
                    })
                    .collect()
            })
            .collect()
    }
}

#[inline(always)]
fn amplitude<S: Scalar>(re: f64, im: f64) -> S {
    S::from_re(re) + S::from_im(im)
}

/// Local coordinates of the bulk cell with the given row-major id.
#[inline(always)]
fn bulk_cell_coords(l: &crate::lattice::Lattice, id: usize) -> [usize; 3] {
    let x0 = id % l.bulk[0];
    let x1 = (id / l.bulk[0]) % l.bulk[1];
    let x2 = id / (l.bulk[0] * l.bulk[1]);
    let mut x = [x0 + l.nghosts, 0, 0];
    if l.dim > 1 {
        x[1] = x1 + l.nghosts;
    }
    if l.dim > 2 {
        x[2] = x2 + l.nghosts;
    }
    x
}

#[inline(always)]
fn shifted(x: [usize; 3], delta: [i32; 3]) -> [usize; 3] {
    [
        (x[0] as i64 + delta[0] as i64) as usize,
        (x[1] as i64 + delta[1] as i64) as usize,
        (x[2] as i64 + delta[2] as i64) as usize,
    ]
}

#[inline(always)]
fn node_in_bulk(l: &crate::lattice::Lattice, anchor: [usize; 3], delta: [i32; 3]) -> bool {
    for d in 0..l.dim {
        let c = anchor[d] as i64 + delta[d] as i64;
        if c < l.nghosts as i64 || c >= (l.ld[d] - l.nghosts) as i64 {
            return false;
        }
    }
    true
}

/// Wrap a node cell that left the bulk back into it through the local
/// periodic image. Exact when the crossed axis has a single thread; with a
/// thread grid the written site belongs to a neighbour domain and the
/// contribution is dropped (the read side of such bonds is still served by
/// the ghost layers).
fn wrap_into_bulk(domain: &Domain, anchor: [usize; 3], delta: [i32; 3]) -> Option<[usize; 3]> {
    let l = &domain.lattice;
    let mut x = [0usize; 3];
    for d in 0..l.dim {
        let mut c = anchor[d] as i64 + delta[d] as i64;
        let lo = l.nghosts as i64;
        let hi = (l.ld[d] - l.nghosts) as i64;
        if c < lo || c >= hi {
            if l.threads[d] != 1 || l.boundary[d] == crate::lattice::Boundary::Open {
                return None;
            }
            c = lo + (c - lo).rem_euclid(l.bulk[d] as i64);
        }
        x[d] = c as usize;
    }
    Some(x)
}
