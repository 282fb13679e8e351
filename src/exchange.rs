//! Halo exchange between neighbouring subdomains.
//!
//! After `exchange_boundaries` returns, every ghost face of the thread's
//! local array equals the matching bulk face of the neighbour thread (or
//! zero across an open boundary). The protocol per axis is:
//!
//! 1. publish the two own bulk faces into the thread's shared staging slot;
//! 2. barrier - every slot is now visible;
//! 3. read the two neighbour slots into the own ghost faces;
//! 4. barrier - nobody republishes before every reader is done.
//!
//! Axes are exchanged in increasing order and the face of axis `d` spans the
//! full (ghost-included) extent of the axes already done, which carries
//! corner data across without a dedicated corner exchange.

use crate::generics::Scalar;
use crate::lattice::Domain;
use crate::parallel::Shared;

pub fn exchange_boundaries<S: Scalar>(phi: &mut [S], domain: &Domain, shared: &Shared<S>) {
    let l = &domain.lattice;
    shared.barrier.wait();
    for d in 0..l.dim {
        let volume = l.face_volume(d);
        let per_orb = volume / l.orbitals;

        {
            let mut slot = shared.staging[domain.thread_id]
                .write()
                .expect("staging slot poisoned");
            for orb in 0..l.orbitals {
                let base = orb * per_orb;
                l.for_each_face_cell(d, l.nghosts, orb, |k, i| {
                    slot[base + k] = phi[i];
                });
                l.for_each_face_cell(d, l.ld[d] - 2 * l.nghosts, orb, |k, i| {
                    slot[volume + base + k] = phi[i];
                });
            }
        }
        shared.barrier.wait();

        // Low ghost face takes the low neighbour's high face and vice versa.
        copy_ghost_face(phi, domain, shared, d, 0, 0, volume, per_orb);
        copy_ghost_face(
            phi,
            domain,
            shared,
            d,
            1,
            l.ld[d] - l.nghosts,
            volume,
            per_orb,
        );
        shared.barrier.wait();
    }
}

#[allow(clippy::too_many_arguments)]
fn copy_ghost_face<S: Scalar>(
    phi: &mut [S],
    domain: &Domain,
    shared: &Shared<S>,
    d: usize,
    side: usize,
    xd: usize,
    volume: usize,
    per_orb: usize,
) {
    let l = &domain.lattice;
    match domain.neighbors[d][side] {
        Some(nb) => {
            let slot = shared.staging[nb].read().expect("staging slot poisoned");
            // side 0 reads the neighbour's high face, side 1 its low face.
            let from = if side == 0 { volume } else { 0 };
            for orb in 0..l.orbitals {
                let base = from + orb * per_orb;
                l.for_each_face_cell(d, xd, orb, |k, i| {
                    phi[i] = slot[base + k];
                });
            }
        }
        None => {
            for orb in 0..l.orbitals {
                l.for_each_face_cell(d, xd, orb, |_, i| {
                    phi[i] = S::zero();
                });
            }
        }
    }
}

/// Deterministic amplitude encoding a global cell; the ghost-exchange
/// self-test fills the bulk with it and checks every cell afterwards.
#[inline(always)]
pub fn global_tag<S: Scalar>(g: [i64; 3], orb: usize) -> S {
    let x = (g[0] + 131 * g[1] + 17161 * g[2]) as f64 + 2248091.0 * orb as f64;
    S::from_re(x) + S::from_im(2.0 * x)
}

/// Fill the bulk with `global_tag`, exchange, and count the cells whose
/// value differs from the expected one. Returns 0 when the exchange is
/// correct; every worker of the grid must call this collectively.
pub fn ghost_exchange_selftest<S: Scalar>(domain: &Domain, shared: &Shared<S>) -> usize {
    let l = &domain.lattice;
    let mut phi = vec![S::zero(); l.sized];
    for orb in 0..l.orbitals {
        l.for_each_bulk_row(orb, |row| {
            for i in row..row + l.row_len() {
                let (x, _) = l.decompose(i);
                phi[i] = global_tag(domain.local_to_global(x), orb);
            }
        });
    }
    exchange_boundaries(&mut phi, domain, shared);

    let mut mismatches = 0;
    for i in 0..l.sized {
        let (x, orb) = l.decompose(i);
        // A ghost layer across an open boundary must be zero instead.
        let mut open_edge = false;
        for d in 0..l.dim {
            if x[d] < l.nghosts && domain.neighbors[d][0].is_none() {
                open_edge = true;
            }
            if x[d] >= l.ld[d] - l.nghosts && domain.neighbors[d][1].is_none() {
                open_edge = true;
            }
        }
        let expect = if open_edge {
            S::zero()
        } else {
            global_tag(domain.local_to_global(x), orb)
        };
        if phi[i] != expect {
            mismatches += 1;
        }
    }
    mismatches
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lattice::{Boundary, Lattice};
    use crate::parallel::run_workers;
    use ndarray::Array2;
    use num_complex::Complex64;

    fn lattice(dim: usize, extents: &[usize], threads: &[usize], bc: Boundary) -> Lattice {
        Lattice::new(
            dim,
            extents,
            2,
            threads,
            2,
            4,
            &vec![bc; dim],
            Array2::zeros((dim, dim)),
        )
        .unwrap()
    }

    fn run_selftest(l: &Lattice) -> usize {
        let shared: Shared<Complex64> = Shared::new(l, 1);
        run_workers(l.n_threads(), |id| {
            let domain = Domain::new(l.clone(), id);
            ghost_exchange_selftest(&domain, &shared)
        })
        .into_iter()
        .sum()
    }

    #[test]
    fn single_thread_periodic_wrap_1d() {
        assert_eq!(run_selftest(&lattice(1, &[16], &[1], Boundary::Periodic)), 0);
    }

    #[test]
    fn thread_row_1d() {
        assert_eq!(run_selftest(&lattice(1, &[32], &[4], Boundary::Periodic)), 0);
    }

    #[test]
    fn thread_grid_2d_includes_corners() {
        assert_eq!(
            run_selftest(&lattice(2, &[16, 16], &[2, 2], Boundary::Periodic)),
            0
        );
    }

    #[test]
    fn thread_grid_3d() {
        assert_eq!(
            run_selftest(&lattice(3, &[8, 8, 8], &[2, 1, 2], Boundary::Periodic)),
            0
        );
    }

    #[test]
    fn open_boundary_zeroes_the_outer_ghosts() {
        assert_eq!(run_selftest(&lattice(2, &[16, 16], &[2, 1], Boundary::Open)), 0);
    }
}
