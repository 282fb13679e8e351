//! Dense reference implementation, the correctness oracle for the tiled
//! engine.
//!
//! For lattices small enough to hold the full operator in memory, the same
//! per-thread Hamiltonian state (one realization of the disorder) is
//! assembled into a dense matrix over the global site basis. Reference
//! moments then follow from the matrix three-term recursion
//! T_{k+1} = 2 H T_k - T_{k-1}, with exact traces instead of stochastic
//! estimates. Only single-thread geometries are supported; the oracle
//! exists to validate, not to scale.

use crate::generics::Scalar;
use crate::hamiltonian::{AndersonOrbital, Hamiltonian};
use crate::lattice::Domain;
use ndarray::Array2;
use num_complex::Complex64;

/// Global dense index of a (wrapped) global cell and orbital.
#[inline(always)]
fn global_index(l: &crate::lattice::Lattice, g: [i64; 3], orb: usize) -> usize {
    let cells = l.lt[0] * l.lt[1] * l.lt[2];
    g[0] as usize + g[1] as usize * l.lt[0] + g[2] as usize * l.lt[0] * l.lt[1] + orb * cells
}

/// Assemble the dense Hamiltonian of the current disorder realization.
/// Vacancy rows and columns are zeroed last, so a vacancy always wins over
/// any term that touches it.
pub fn dense_hamiltonian<S: Scalar>(h: &Hamiltonian<S>, domain: &Domain) -> Array2<Complex64> {
    assemble(h, domain, None)
}

/// Assemble the dense velocity operator for the given axes.
pub fn dense_velocity<S: Scalar>(
    h: &Hamiltonian<S>,
    domain: &Domain,
    axes: &[usize],
) -> Array2<Complex64> {
    assemble(h, domain, Some(axes))
}

fn assemble<S: Scalar>(
    h: &Hamiltonian<S>,
    domain: &Domain,
    axes: Option<&[usize]>,
) -> Array2<Complex64> {
    let l = &domain.lattice;
    assert!(
        l.n_threads() == 1,
        "the dense oracle runs on single-thread geometries"
    );
    let dim = l.sizet;
    let mut m = Array2::<Complex64>::zeros((dim, dim));
    let field = l.vect_pot.iter().any(|&a| a != 0.0);

    for orb in 0..l.orbitals {
        l.for_each_bulk_row(orb, |row| {
            for i in row..row + l.row_len() {
                let (x, _) = l.decompose(i);
                let g = domain.local_to_global(x);
                let gi = global_index(l, g, orb);

                if axes.is_none() {
                    match &h.anderson[orb] {
                        AndersonOrbital::None => {}
                        AndersonOrbital::Shared(u) => {
                            m[[gi, gi]] += Complex64::new(*u, 0.0);
                        }
                        AndersonOrbital::PerSite(values) => {
                            m[[gi, gi]] += Complex64::new(values[i - orb * l.basis[3]], 0.0);
                        }
                    }
                }

                for hop in &h.regular[orb] {
                    let j = (i as isize + hop.offset) as usize;
                    let (xj, orb_j) = l.decompose(j);
                    let gj = global_index(l, domain.local_to_global(xj), orb_j);
                    let amp = match axes {
                        Some(a) => hop.velocity(a),
                        None => hop.t,
                    };
                    let mut term = amp.to_c64();
                    if field {
                        term *= Complex64::new(0.0, domain.peierls_phase(hop.delta, g)).exp();
                    }
                    m[[gi, gj]] += term;
                }
            }
        });
    }

    for pat in &h.patterns {
        let mut bond_entries: Vec<(usize, usize, [i32; 3], Complex64)> = Vec::new();
        for anchors in &pat.anchors {
            for &anchor in anchors {
                for bond in &pat.bonds {
                    let k1 = (anchor as isize + pat.node_offset[bond.write_node]) as usize;
                    let k2 = (anchor as isize + pat.node_offset[bond.read_node]) as usize;
                    let amp = match axes {
                        Some(a) => bond.velocity(a),
                        None => bond.t,
                    };
                    bond_entries.push((k1, k2, bond.delta, amp.to_c64()));
                }
                if axes.is_none() {
                    for &(node, u) in &pat.onsites {
                        let k1 = (anchor as isize + pat.node_offset[node]) as usize;
                        let (x1, o1) = l.decompose(k1);
                        let gi = global_index(l, domain.local_to_global(x1), o1);
                        m[[gi, gi]] += Complex64::new(u, 0.0);
                    }
                }
            }
        }
        for bb in &pat.border_bonds {
            let amp = match axes {
                Some(a) => bb.velocity(a),
                None => bb.t,
            };
            bond_entries.push((bb.write, bb.read, bb.delta, amp.to_c64()));
        }
        for (k1, k2, delta, amp) in bond_entries {
            let (x1, o1) = l.decompose(k1);
            let (x2, o2) = l.decompose(k2);
            let g1 = domain.local_to_global(x1);
            let g2 = domain.local_to_global(x2);
            let mut term = amp;
            if field {
                term *= Complex64::new(0.0, domain.peierls_phase(delta, g1)).exp();
            }
            m[[global_index(l, g1, o1), global_index(l, g2, o2)]] += term;
        }
        if axes.is_none() {
            for bo in &pat.border_onsites {
                let (x1, o1) = l.decompose(bo.site);
                let gi = global_index(l, domain.local_to_global(x1), o1);
                m[[gi, gi]] += Complex64::new(bo.value, 0.0);
            }
        }
    }

    for tile in &h.vacancies.per_tile {
        for &v in tile {
            let (x, o) = l.decompose(v);
            let gv = global_index(l, domain.local_to_global(x), o);
            m.row_mut(gv).fill(Complex64::new(0.0, 0.0));
            m.column_mut(gv).fill(Complex64::new(0.0, 0.0));
        }
    }
    m
}

/// Exact traces Tr[T_n(H)] for n = 0..n_moments, via the matrix recursion.
pub fn chebyshev_traces(h: &Array2<Complex64>, n_moments: usize) -> Vec<Complex64> {
    let dim = h.nrows();
    let mut traces = Vec::with_capacity(n_moments);
    let mut t_prev = Array2::<Complex64>::eye(dim);
    let mut t_cur = h.clone();
    traces.push(Complex64::new(dim as f64, 0.0));
    if n_moments > 1 {
        traces.push(t_cur.diag().sum());
    }
    for _ in 2..n_moments {
        let t_next = h.dot(&t_cur) * Complex64::new(2.0, 0.0) - &t_prev;
        t_prev = t_cur;
        t_cur = t_next;
        traces.push(t_cur.diag().sum());
    }
    traces
}

/// Exact traces Tr[A T_n(H)] for a fixed dense operator A.
pub fn weighted_chebyshev_traces(
    a: &Array2<Complex64>,
    h: &Array2<Complex64>,
    n_moments: usize,
) -> Vec<Complex64> {
    let dim = h.nrows();
    let mut traces = Vec::with_capacity(n_moments);
    let mut t_prev = Array2::<Complex64>::eye(dim);
    let mut t_cur = h.clone();
    traces.push(a.diag().sum());
    if n_moments > 1 {
        traces.push(a.dot(&t_cur).diag().sum());
    }
    for _ in 2..n_moments {
        let t_next = h.dot(&t_cur) * Complex64::new(2.0, 0.0) - &t_prev;
        t_prev = t_cur;
        t_cur = t_next;
        traces.push(a.dot(&t_cur).diag().sum());
    }
    traces
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hamiltonian::{HamiltonianSpec, HoppingSpec, VacancySpec};
    use crate::lattice::{Boundary, Lattice};
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn ring(n: usize, t: f64) -> (Domain, Hamiltonian<Complex64>) {
        let l = Lattice::new(
            1,
            &[n],
            1,
            &[1],
            2,
            4,
            &[Boundary::Periodic],
            ndarray::Array2::zeros((1, 1)),
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
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        h.generate_disorder(&dom, &mut rng);
        (dom, h)
    }

    #[test]
    fn dense_ring_is_hermitian_and_circulant() {
        let (dom, h) = ring(8, 0.25);
        let m = dense_hamiltonian(&h, &dom);
        for i in 0..8 {
            for j in 0..8 {
                assert_eq!(m[[i, j]], m[[j, i]].conj());
            }
            assert_eq!(m[[i, (i + 1) % 8]], Complex64::new(0.25, 0.0));
        }
    }

    #[test]
    fn ring_traces_match_the_analytic_bands() {
        // Eigenvalues of the 0.25-hopping ring are 0.5 cos(2 pi k / L), so
        // Tr[T_n(H)] = sum_k cos(n arccos(0.5 cos(2 pi k / L))).
        let n_sites = 8;
        let (dom, h) = ring(n_sites, 0.25);
        let m = dense_hamiltonian(&h, &dom);
        let traces = chebyshev_traces(&m, 6);
        for (n, tr) in traces.iter().enumerate() {
            let mut expect = 0.0;
            for k in 0..n_sites {
                let e = 0.5 * (2.0 * std::f64::consts::PI * k as f64 / n_sites as f64).cos();
                expect += (n as f64 * e.acos()).cos();
            }
            assert!(
                (tr.re - expect).abs() < 1e-9 && tr.im.abs() < 1e-12,
                "n={n}: {tr} vs {expect}"
            );
        }
    }

    #[test]
    fn dense_velocity_is_antisymmetric() {
        let (dom, h) = ring(8, 1.0);
        let v = dense_velocity(&h, &dom, &[0]);
        for i in 0..8 {
            for j in 0..8 {
                assert_eq!(v[[i, j]], -v[[j, i]]);
            }
        }
    }
}
