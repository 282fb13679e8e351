//! The KPM vector: a ring buffer of recursion slots over one thread's
//! subdomain, and the sparse operator applications that drive the Chebyshev
//! recursion.
//!
//! A vector owns `memory` slots of `sized` amplitudes each. The recursion
//!
//! psi_new = (MULT+1) H psi_prev - MULT psi_prev2
//!
//! advances the rotating `index`; MULT = 0 is the plain application of H
//! that seeds the recursion, MULT = 1 is the true Chebyshev step. With two
//! slots the psi_prev2 slot is the one being overwritten, which is safe
//! because every cell is read exactly once, by its own initialization.
//!
//! The bulk is traversed tile by tile. Tiles that receive structural-defect
//! writes from anchors in other tiles are initialized in a pre-pass and
//! skipped by the in-sweep initialization, so the sweep order cannot
//! overwrite a contribution that arrived early.

use crate::error::{KpmError, Result};
use crate::exchange::exchange_boundaries;
use crate::generics::Scalar;
use crate::hamiltonian::{AndersonOrbital, Hamiltonian, VelocityTable};
use crate::lattice::Domain;
use crate::parallel::Shared;
use ndarray::Array2;
use rand::Rng;

pub struct KpmVector<S: Scalar> {
    /// Slots as rows, so each slot is one contiguous slice.
    v: Array2<S>,
    pub memory: usize,
    pub index: usize,
}

impl<S: Scalar> KpmVector<S> {
    pub fn new(memory: usize, domain: &Domain) -> Result<KpmVector<S>> {
        let sized = domain.lattice.sized;
        let bytes = memory
            .checked_mul(sized)
            .and_then(|n| n.checked_mul(std::mem::size_of::<S>()));
        match bytes {
            Some(b) if b < isize::MAX as usize => {}
            _ => {
                return Err(KpmError::VectorAllocation {
                    slots: memory,
                    amplitudes: sized,
                    bytes: bytes.unwrap_or(usize::MAX),
                })
            }
        }
        Ok(KpmVector {
            v: Array2::zeros((memory, sized)),
            memory,
            index: 0,
        })
    }

    #[inline(always)]
    pub fn set_index(&mut self, i: usize) {
        self.index = i % self.memory;
    }

    #[inline(always)]
    pub fn inc_index(&mut self) {
        self.index = (self.index + 1) % self.memory;
    }

    #[inline(always)]
    pub fn slot(&self, k: usize) -> &[S] {
        let sized = self.v.ncols();
        &self.v.as_slice().expect("slot storage is contiguous")[k * sized..(k + 1) * sized]
    }

    #[inline(always)]
    pub fn slot_mut(&mut self, k: usize) -> &mut [S] {
        let sized = self.v.ncols();
        &mut self.v.as_slice_mut().expect("slot storage is contiguous")
            [k * sized..(k + 1) * sized]
    }

    /// Copy one slot of another vector into a slot of this one.
    pub fn copy_slot(&mut self, k: usize, other: &KpmVector<S>, j: usize) {
        self.slot_mut(k).copy_from_slice(other.slot(j));
    }

    /// `self[k] = w * other[j]` with a real weight.
    pub fn copy_scaled(&mut self, k: usize, other: &KpmVector<S>, j: usize, w: f64) {
        for (a, b) in self.slot_mut(k).iter_mut().zip(other.slot(j)) {
            *a = b.scale(w);
        }
    }

    /// `self[k] += w * other[j]` with a real weight.
    pub fn scaled_add(&mut self, k: usize, other: &KpmVector<S>, j: usize, w: f64) {
        for (a, b) in self.slot_mut(k).iter_mut().zip(other.slot(j)) {
            *a += b.scale(w);
        }
    }

    /// Fill slot 0 with a fresh random vector: unit-variance zero-mean
    /// samples on the bulk, zero on ghosts and vacancy sites, normalized so
    /// the expectation of <psi|psi> over the whole lattice is one.
    pub fn init_random<R: Rng>(
        &mut self,
        rng: &mut R,
        h: &Hamiltonian<S>,
        domain: &Domain,
    ) {
        let l = &domain.lattice;
        self.index = 0;
        let norm = 1.0
            / ((l.sizet.saturating_sub(h.vacancies.total)) as f64).sqrt();
        let phi = self.slot_mut(0);
        phi.fill(S::zero());
        for orb in 0..l.orbitals {
            l.for_each_bulk_row(orb, |row| {
                for i in row..row + l.row_len() {
                    phi[i] = S::random_unit(rng).scale(norm);
                }
            });
        }
        for tile in &h.vacancies.per_tile {
            for &i in tile {
                phi[i] = S::zero();
            }
        }
    }

    /// Refresh the ghost layers of the current slot from the neighbours.
    pub fn exchange(&mut self, domain: &Domain, shared: &Shared<S>) {
        let k = self.index;
        exchange_boundaries(self.slot_mut(k), domain, shared);
    }

    /// Zero the ghost faces of a slot so a subsequent inner product only
    /// counts sites owned by this thread.
    pub fn empty_ghosts(&mut self, k: usize, domain: &Domain) {
        let l = &domain.lattice;
        let dim = l.dim;
        let nghosts = l.nghosts;
        let ld = l.ld;
        let phi = self.slot_mut(k);
        let mut i = 0usize;
        for _orb in 0..l.orbitals {
            for x2 in 0..ld[2] {
                for x1 in 0..ld[1] {
                    for x0 in 0..ld[0] {
                        let mut ghost = x0 < nghosts || x0 >= ld[0] - nghosts;
                        if dim > 1 {
                            ghost |= x1 < nghosts || x1 >= ld[1] - nghosts;
                        }
                        if dim > 2 {
                            ghost |= x2 < nghosts || x2 >= ld[2] - nghosts;
                        }
                        if ghost {
                            phi[i] = S::zero();
                        }
                        i += 1;
                    }
                }
            }
        }
    }

    /// Full inner product <self[k] | other[j]>. The caller guarantees that
    /// one side has zeroed ghosts, so the sum runs branchless over the whole
    /// slot.
    #[inline(always)]
    pub fn dot(&self, k: usize, other: &KpmVector<S>, j: usize) -> S {
        let a = self.slot(k);
        let b = other.slot(j);
        let mut s = S::zero();
        for (x, y) in a.iter().zip(b.iter()) {
            s += x.conj() * *y;
        }
        s
    }

    /// One recursion step: advance the ring and write
    /// `(mult+1) H psi_prev - mult psi_prev2` into the new slot, tile by
    /// tile, then refresh the ghosts.
    pub fn multiply(
        &mut self,
        mult: usize,
        h: &Hamiltonian<S>,
        domain: &Domain,
        shared: &Shared<S>,
    ) {
        let l = &domain.lattice;
        self.inc_index();
        let sized = l.sized;
        let b0 = self.index * sized;
        let b1 = ((self.index + self.memory - 1) % self.memory) * sized;
        let b2 = ((self.index + self.memory - 2) % self.memory) * sized;
        let buf = self.v.as_slice_mut().expect("slot storage is contiguous");
        let mm = mult as f64;
        let mp1 = (mult + 1) as f64;
        let has_field = field_is_on(domain);

        // Tiles written by defects anchored elsewhere come first.
        for &t in &h.cross_tile_indices {
            for orb in 0..l.orbitals {
                l.for_each_tile_row(t, orb, |row| {
                    for i in row..row + l.tile {
                        buf[b0 + i] = buf[b2 + i].scale(-mm);
                    }
                });
            }
        }

        for t in 0..l.n_tiles {
            for orb in 0..l.orbitals {
                if !h.cross_tile[t] {
                    l.for_each_tile_row(t, orb, |row| {
                        for i in row..row + l.tile {
                            buf[b0 + i] = buf[b2 + i].scale(-mm);
                        }
                    });
                }

                match &h.anderson[orb] {
                    AndersonOrbital::None => {}
                    AndersonOrbital::Shared(u) => {
                        let f = mp1 * u;
                        l.for_each_tile_row(t, orb, |row| {
                            for i in row..row + l.tile {
                                buf[b0 + i] += buf[b1 + i].scale(f);
                            }
                        });
                    }
                    AndersonOrbital::PerSite(values) => {
                        let dd = orb * l.basis[3];
                        l.for_each_tile_row(t, orb, |row| {
                            for i in row..row + l.tile {
                                buf[b0 + i] += buf[b1 + i].scale(mp1 * values[i - dd]);
                            }
                        });
                    }
                }

                for hop in &h.regular[orb] {
                    let t1 = hop.t.scale(mp1);
                    if has_field {
                        l.for_each_tile_row(t, orb, |row| {
                            for i in row..row + l.tile {
                                let (x, _) = l.decompose(i);
                                let ph =
                                    domain.peierls_phase(hop.delta, domain.local_to_global(x));
                                let j = (b1 as isize + i as isize + hop.offset) as usize;
                                buf[b0 + i] += t1 * buf[j] * S::peierls(ph);
                            }
                        });
                    } else {
                        l.for_each_tile_row(t, orb, |row| {
                            for i in row..row + l.tile {
                                let j = (b1 as isize + i as isize + hop.offset) as usize;
                                buf[b0 + i] += t1 * buf[j];
                            }
                        });
                    }
                }
            }

            for pat in &h.patterns {
                for &anchor in &pat.anchors[t] {
                    for bond in &pat.bonds {
                        let k1 = (anchor as isize + pat.node_offset[bond.write_node]) as usize;
                        let k2 = (anchor as isize + pat.node_offset[bond.read_node]) as usize;
                        let mut term = bond.t.scale(mp1) * buf[b1 + k2];
                        if has_field {
                            let (x, _) = l.decompose(k1);
                            let ph =
                                domain.peierls_phase(bond.delta, domain.local_to_global(x));
                            term *= S::peierls(ph);
                        }
                        buf[b0 + k1] += term;
                    }
                    for &(node, u) in &pat.onsites {
                        let k1 = (anchor as isize + pat.node_offset[node]) as usize;
                        buf[b0 + k1] += buf[b1 + k1].scale(mp1 * u);
                    }
                }
            }

            for &vi in &h.vacancies.per_tile[t] {
                buf[b0 + vi] = S::zero();
            }
        }

        // Global corrections: bonds and on-sites of anchors broken across
        // tile or domain borders, then the vacancies sitting on defects.
        for pat in &h.patterns {
            for bb in &pat.border_bonds {
                let mut term = bb.t.scale(mp1) * buf[b1 + bb.read];
                if has_field {
                    let (x, _) = l.decompose(bb.write);
                    let ph = domain.peierls_phase(bb.delta, domain.local_to_global(x));
                    term *= S::peierls(ph);
                }
                buf[b0 + bb.write] += term;
            }
            for bo in &pat.border_onsites {
                buf[b0 + bo.site] += buf[b1 + bo.site].scale(mp1 * bo.value);
            }
        }
        for &vc in &h.vacancies.with_defects {
            buf[b0 + vc] = S::zero();
        }

        exchange_boundaries(&mut buf[b0..b0 + sized], domain, shared);
    }

    /// The untiled validation path: the same recursion step computed cell by
    /// cell over the bulk. Covers the regular part, Anderson disorder and
    /// vacancies; models with structural disorder use the tiled path.
    pub fn multiply_simple(
        &mut self,
        mult: usize,
        h: &Hamiltonian<S>,
        domain: &Domain,
        shared: &Shared<S>,
    ) {
        let l = &domain.lattice;
        self.inc_index();
        let sized = l.sized;
        let b0 = self.index * sized;
        let b1 = ((self.index + self.memory - 1) % self.memory) * sized;
        let b2 = ((self.index + self.memory - 2) % self.memory) * sized;
        let buf = self.v.as_slice_mut().expect("slot storage is contiguous");
        let mm = mult as f64;
        let mp1 = (mult + 1) as f64;
        let has_field = field_is_on(domain);

        for orb in 0..l.orbitals {
            let dd = orb * l.basis[3];
            l.for_each_bulk_row(orb, |row| {
                for i in row..row + l.row_len() {
                    let mut acc = buf[b2 + i].scale(-mm);
                    match &h.anderson[orb] {
                        AndersonOrbital::None => {}
                        AndersonOrbital::Shared(u) => {
                            acc += buf[b1 + i].scale(mp1 * u);
                        }
                        AndersonOrbital::PerSite(values) => {
                            acc += buf[b1 + i].scale(mp1 * values[i - dd]);
                        }
                    }
                    for hop in &h.regular[orb] {
                        let j = (b1 as isize + i as isize + hop.offset) as usize;
                        let mut term = hop.t.scale(mp1) * buf[j];
                        if has_field {
                            let (x, _) = l.decompose(i);
                            let ph = domain.peierls_phase(hop.delta, domain.local_to_global(x));
                            term *= S::peierls(ph);
                        }
                        acc += term;
                    }
                    buf[b0 + i] = acc;
                }
            });
        }
        for tile in &h.vacancies.per_tile {
            for &vi in tile {
                buf[b0 + vi] = S::zero();
            }
        }

        exchange_boundaries(&mut buf[b0..b0 + sized], domain, shared);
    }

    /// Apply a velocity operator: identical traversal to `multiply` but the
    /// destination starts at zero, the velocity table replaces the
    /// Hamiltonian amplitudes and the on-site terms drop out (the identity
    /// has no velocity). The destination slot's ghosts are refreshed.
    #[allow(clippy::too_many_arguments)]
    pub fn velocity_from(
        &mut self,
        dst_slot: usize,
        src: &KpmVector<S>,
        src_slot: usize,
        axes: &[usize],
        table: &VelocityTable<S>,
        h: &Hamiltonian<S>,
        domain: &Domain,
        shared: &Shared<S>,
    ) {
        let l = &domain.lattice;
        let phi1 = src.slot(src_slot);
        let phi0 = self.slot_mut(dst_slot);
        let has_field = field_is_on(domain);

        for &t in &h.cross_tile_indices {
            for orb in 0..l.orbitals {
                l.for_each_tile_row(t, orb, |row| {
                    phi0[row..row + l.tile].fill(S::zero());
                });
            }
        }

        for t in 0..l.n_tiles {
            for orb in 0..l.orbitals {
                if !h.cross_tile[t] {
                    l.for_each_tile_row(t, orb, |row| {
                        phi0[row..row + l.tile].fill(S::zero());
                    });
                }
                for hop in &table[orb] {
                    if has_field {
                        l.for_each_tile_row(t, orb, |row| {
                            for i in row..row + l.tile {
                                let (x, _) = l.decompose(i);
                                let ph =
                                    domain.peierls_phase(hop.delta, domain.local_to_global(x));
                                let j = (i as isize + hop.offset) as usize;
                                phi0[i] += hop.t * phi1[j] * S::peierls(ph);
                            }
                        });
                    } else {
                        l.for_each_tile_row(t, orb, |row| {
                            for i in row..row + l.tile {
                                let j = (i as isize + hop.offset) as usize;
                                phi0[i] += hop.t * phi1[j];
                            }
                        });
                    }
                }
            }

            for pat in &h.patterns {
                for &anchor in &pat.anchors[t] {
                    for bond in &pat.bonds {
                        let k1 = (anchor as isize + pat.node_offset[bond.write_node]) as usize;
                        let k2 = (anchor as isize + pat.node_offset[bond.read_node]) as usize;
                        let mut term = bond.velocity(axes) * phi1[k2];
                        if has_field {
                            let (x, _) = l.decompose(k1);
                            let ph =
                                domain.peierls_phase(bond.delta, domain.local_to_global(x));
                            term *= S::peierls(ph);
                        }
                        phi0[k1] += term;
                    }
                }
            }

            for &vi in &h.vacancies.per_tile[t] {
                phi0[vi] = S::zero();
            }
        }

        for pat in &h.patterns {
            for bb in &pat.border_bonds {
                let mut term = bb.velocity(axes) * phi1[bb.read];
                if has_field {
                    let (x, _) = l.decompose(bb.write);
                    let ph = domain.peierls_phase(bb.delta, domain.local_to_global(x));
                    term *= S::peierls(ph);
                }
                phi0[bb.write] += term;
            }
        }
        for &vc in &h.vacancies.with_defects {
            phi0[vc] = S::zero();
        }

        exchange_boundaries(phi0, domain, shared);
    }

    /// The hopping-resolved bilinear form <bra| v |ket> over the bulk, the
    /// direct evaluation used by validation tests.
    pub fn velocity_product(
        &self,
        k: usize,
        other: &KpmVector<S>,
        j: usize,
        table: &VelocityTable<S>,
        domain: &Domain,
    ) -> S {
        let l = &domain.lattice;
        let bra = self.slot(k);
        let ket = other.slot(j);
        let mut sum = S::zero();
        for orb in 0..l.orbitals {
            for hop in &table[orb] {
                l.for_each_bulk_row(orb, |row| {
                    for i in row..row + l.row_len() {
                        let jj = (i as isize + hop.offset) as usize;
                        sum += bra[i].conj() * hop.t * ket[jj];
                    }
                });
            }
        }
        sum
    }
}

#[inline(always)]
fn field_is_on(domain: &Domain) -> bool {
    domain.lattice.vect_pot.iter().any(|&a| a != 0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hamiltonian::{HamiltonianSpec, HoppingSpec, VacancySpec};
    use crate::lattice::{Boundary, Lattice};
    use ndarray::Array2;
    use num_complex::Complex64;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn chain(n: usize, t: f64) -> (Domain, Hamiltonian<Complex64>) {
        let l = Lattice::new(
            1,
            &[n],
            1,
            &[1],
            2,
            4,
            &[Boundary::Periodic],
            Array2::zeros((1, 1)),
        )
        .unwrap();
        let dom = Domain::new(l, 0);
        let spec = HamiltonianSpec {
            hoppings: vec![
                HoppingSpec {
                    from_orb: 0,
                    to_orb: 0,
                    delta: [1, 0, 0],
                    re: t,
                    im: 0.0,
                },
                HoppingSpec {
                    from_orb: 0,
                    to_orb: 0,
                    delta: [-1, 0, 0],
                    re: t,
                    im: 0.0,
                },
            ],
            anderson: vec![],
            patterns: vec![],
            vacancies: VacancySpec::default(),
        };
        let mut h = Hamiltonian::build(&spec, &dom).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        h.generate_disorder(&dom, &mut rng);
        (dom, h)
    }

    #[test]
    fn zero_hamiltonian_reproduces_chebyshev_of_zero() {
        // With H = 0 the recursion gives psi, 0, -psi, 0, psi, ... which is
        // T_n(0) = cos(n pi / 2) acting on the start vector.
        let (dom, h) = chain(16, 0.0);
        let shared = Shared::new(&dom.lattice, 1);
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let mut phi0 = KpmVector::<Complex64>::new(1, &dom).unwrap();
        phi0.init_random(&mut rng, &h, &dom);
        let mut phi = KpmVector::<Complex64>::new(2, &dom).unwrap();
        phi.set_index(0);
        phi.copy_slot(0, &phi0, 0);
        phi.exchange(&dom, &shared);

        let norm = phi0.dot(0, &phi0, 0).re;
        let expected = [0.0, -norm, 0.0, norm, 0.0, -norm];
        phi.multiply(0, &h, &dom, &shared);
        assert!((phi0.dot(0, &phi, phi.index).re - expected[0]).abs() < 1e-12);
        for step in 1..6 {
            phi.multiply(1, &h, &dom, &shared);
            let mu = phi0.dot(0, &phi, phi.index);
            assert!(
                (mu.re - expected[step]).abs() < 1e-12 && mu.im.abs() < 1e-12,
                "step {step}: {mu}"
            );
        }
    }

    #[test]
    fn tiled_and_simple_multiply_agree() {
        let (dom, h) = chain(16, 1.0);
        let shared = Shared::new(&dom.lattice, 1);
        let mut rng = ChaCha8Rng::seed_from_u64(9);
        let mut phi0 = KpmVector::<Complex64>::new(1, &dom).unwrap();
        phi0.init_random(&mut rng, &h, &dom);

        let mut a = KpmVector::<Complex64>::new(3, &dom).unwrap();
        let mut b = KpmVector::<Complex64>::new(3, &dom).unwrap();
        for v in [&mut a, &mut b] {
            v.set_index(0);
            v.copy_slot(0, &phi0, 0);
            v.exchange(&dom, &shared);
        }
        a.multiply(0, &h, &dom, &shared);
        b.multiply_simple(0, &h, &dom, &shared);
        for _ in 0..4 {
            a.multiply(1, &h, &dom, &shared);
            b.multiply_simple(1, &h, &dom, &shared);
        }
        let ai = a.index;
        let bi = b.index;
        for (x, y) in a.slot(ai).iter().zip(b.slot(bi)) {
            assert!((x - y).norm() < 1e-12);
        }
    }

    #[test]
    fn single_axis_velocity_is_anti_hermitian() {
        let (dom, h) = chain(16, 1.0);
        let shared = Shared::new(&dom.lattice, 1);
        let table = h.build_velocity(&[0]);
        let mut rng = ChaCha8Rng::seed_from_u64(21);

        let mut a = KpmVector::<Complex64>::new(1, &dom).unwrap();
        let mut b = KpmVector::<Complex64>::new(1, &dom).unwrap();
        a.init_random(&mut rng, &h, &dom);
        b.init_random(&mut rng, &h, &dom);

        let mut va = KpmVector::<Complex64>::new(1, &dom).unwrap();
        let mut vb = KpmVector::<Complex64>::new(1, &dom).unwrap();
        let mut src = KpmVector::<Complex64>::new(1, &dom).unwrap();
        src.copy_slot(0, &a, 0);
        exchange_boundaries(src.slot_mut(0), &dom, &shared);
        va.velocity_from(0, &src, 0, &[0], &table, &h, &dom, &shared);
        va.empty_ghosts(0, &dom);
        src.copy_slot(0, &b, 0);
        exchange_boundaries(src.slot_mut(0), &dom, &shared);
        vb.velocity_from(0, &src, 0, &[0], &table, &h, &dom, &shared);
        vb.empty_ghosts(0, &dom);

        let lhs = a.dot(0, &vb, 0);
        let rhs = b.dot(0, &va, 0);
        assert!((lhs + rhs.conj()).norm() < 1e-12, "{lhs} vs {rhs}");

        // The hopping-resolved bilinear form gives the same number as the
        // apply-then-contract route. src still holds the exchanged |b>.
        let direct = a.velocity_product(0, &src, 0, &table, &dom);
        assert!((direct - lhs).norm() < 1e-12, "{direct} vs {lhs}");
    }

    #[test]
    fn vacancies_stay_empty_through_the_recursion() {
        let l = Lattice::new(
            1,
            &[16],
            1,
            &[1],
            2,
            4,
            &[Boundary::Periodic],
            Array2::zeros((1, 1)),
        )
        .unwrap();
        let dom = Domain::new(l, 0);
        let spec = HamiltonianSpec {
            hoppings: vec![
                HoppingSpec {
                    from_orb: 0,
                    to_orb: 0,
                    delta: [1, 0, 0],
                    re: 1.0,
                    im: 0.0,
                },
                HoppingSpec {
                    from_orb: 0,
                    to_orb: 0,
                    delta: [-1, 0, 0],
                    re: 1.0,
                    im: 0.0,
                },
            ],
            anderson: vec![],
            patterns: vec![],
            vacancies: VacancySpec {
                concentration: 0.0,
                fixed: vec![crate::hamiltonian::FixedVacancy {
                    cell: [4, 0, 0],
                    orb: 0,
                }],
            },
        };
        let mut h: Hamiltonian<Complex64> = Hamiltonian::build(&spec, &dom).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        h.generate_disorder(&dom, &mut rng);
        let shared = Shared::new(&dom.lattice, 1);

        let mut phi0 = KpmVector::<Complex64>::new(1, &dom).unwrap();
        phi0.init_random(&mut rng, &h, &dom);
        let vac = dom.lattice.site_index([4 + dom.lattice.nghosts, 0, 0], 0);
        assert_eq!(phi0.slot(0)[vac], Complex64::new(0.0, 0.0));

        let mut phi = KpmVector::<Complex64>::new(2, &dom).unwrap();
        phi.set_index(0);
        phi.copy_slot(0, &phi0, 0);
        phi.exchange(&dom, &shared);
        phi.multiply(0, &h, &dom, &shared);
        for _ in 0..5 {
            phi.multiply(1, &h, &dom, &shared);
            assert_eq!(phi.slot(phi.index)[vac], Complex64::new(0.0, 0.0));
        }
    }
}
