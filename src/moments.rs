//! Moment accumulators.
//!
//! A rank-k moment tensor
//!
//! mu(n1..nk) = Tr[ v^{a1} T_n1(H) v^{a2} T_n2(H) ... v^{ak} T_nk(H) ]
//!
//! is estimated stochastically: the trace becomes an average of quadratic
//! forms over random vectors, the Chebyshev polynomials come from the
//! three-term recursion, and every thread contributes the partial trace over
//! its own bulk. Rank 1 and 2 keep a thread-local running mean that is
//! reduced between disorder realizations; the rank-3 tensor can be very
//! large, so its running mean lives in the global accumulator and the
//! per-block partial sums are combined through the shared MEMORY x MEMORY
//! block.
//!
//! The velocity factors are not self-adjoint (one commutator flips sign
//! under the adjoint), which the symmetrization step absorbs through
//! `factor = 1 - 2 (num_velocities mod 2)`.

use crate::error::{KpmError, Result};
use crate::generics::Scalar;
use crate::hamiltonian::Hamiltonian;
use crate::lattice::Domain;
use crate::parallel::{Shared, MEMORY};
use crate::vector::KpmVector;
use ndarray::{Array2, Array3, ArrayD, Zip};
use num_complex::Complex64;
use rand_chacha::ChaCha8Rng;

/// Everything one worker thread needs for the lifetime of a quantity.
pub struct Worker<'a, S: Scalar> {
    pub domain: Domain,
    pub ham: Hamiltonian<S>,
    pub shared: &'a Shared<S>,
    pub rng: ChaCha8Rng,
}

impl<S: Scalar> Worker<'_, S> {
    #[inline(always)]
    pub fn is_master(&self) -> bool {
        self.domain.thread_id == 0
    }
}

/// Optional on-disk sink called by the master thread at every flush, so a
/// long job leaves a valid running average behind at all times.
pub type FlushSink<'a> = Option<&'a (dyn Fn(&ArrayD<Complex64>) + Sync)>;

/// The Welford running-mean update mu <- mu + (x - mu)/(count + 1).
#[inline(always)]
pub fn welford<S: Scalar>(mu: &mut S, x: S, count: usize) {
    *mu += (x - *mu).scale(1.0 / (count + 1) as f64);
}

#[inline(always)]
fn sign_factor(num_velocities: usize) -> f64 {
    1.0 - 2.0 * (num_velocities % 2) as f64
}

/// One Chebyshev advance: the step that produced slot `prev_step` was the
/// seed copy when `prev_step == 0`, so the next application is the plain
/// H-apply; afterwards it is the true recursion step.
#[inline(always)]
fn cheb<S: Scalar>(
    v: &mut KpmVector<S>,
    prev_step: usize,
    h: &Hamiltonian<S>,
    domain: &Domain,
    shared: &Shared<S>,
) {
    v.multiply(usize::from(prev_step != 0), h, domain, shared);
}

/// Estimate a moment tensor of rank `moments.len()`; every thread of the
/// grid calls this collectively with identical arguments.
pub fn accumulate<S: Scalar>(
    w: &mut Worker<S>,
    indices: &[Vec<usize>],
    moments: &[usize],
    randoms: usize,
    disorder: usize,
    sink: FlushSink,
) -> Result<()> {
    match moments.len() {
        1 => rank1(w, &indices[0], moments[0], randoms, disorder, sink),
        2 => rank2(w, indices, moments, randoms, disorder, sink),
        3 => rank3(w, indices, moments, randoms, disorder, sink),
        r => Err(KpmError::UnsupportedRank("moments".into(), r)),
    }
}

// ---------------------------------------------------------------------------
// Rank 1: mu[n] = <0| v^a T_n(H) |0>
// ---------------------------------------------------------------------------

fn rank1<S: Scalar>(
    w: &mut Worker<S>,
    axes: &[usize],
    n_moments: usize,
    randoms: usize,
    disorder: usize,
    sink: FlushSink,
) -> Result<()> {
    let num_velocities = axes.len();
    let mut phi0 = KpmVector::<S>::new(1, &w.domain)?;
    let mut phi = KpmVector::<S>::new(2, &w.domain)?;
    let mut local = vec![S::zero(); n_moments];
    let mut samples = 0usize;

    for _ in 0..disorder {
        w.ham.generate_disorder(&w.domain, &mut w.rng);
        let table = (!axes.is_empty()).then(|| w.ham.build_velocity(axes));

        for _ in 0..randoms {
            phi0.init_random(&mut w.rng, &w.ham, &w.domain);
            phi.set_index(0);
            phi.copy_slot(0, &phi0, 0);
            phi.exchange(&w.domain, w.shared);

            // The bra side becomes v^a |0>; its ghosts are zeroed so the
            // dots below count only sites owned by this thread. The adjoint
            // sign of the odd velocity is restored at symmetrization.
            if let Some(table) = &table {
                phi0.velocity_from(0, &phi, 0, axes, table, &w.ham, &w.domain, w.shared);
            }
            phi0.empty_ghosts(0, &w.domain);

            phi.multiply(0, &w.ham, &w.domain, w.shared);
            let prev = (phi.index + 1) % 2;
            welford(&mut local[0], phi0.dot(0, &phi, prev), samples);
            welford(&mut local[1], phi0.dot(0, &phi, phi.index), samples);
            let mut m = 2;
            while m < n_moments {
                phi.multiply(1, &w.ham, &w.domain, w.shared);
                phi.multiply(1, &w.ham, &w.domain, w.shared);
                welford(&mut local[m], phi0.dot(0, &phi, (phi.index + 1) % 2), samples);
                welford(&mut local[m + 1], phi0.dot(0, &phi, phi.index), samples);
                m += 2;
            }
            samples += 1;
        }

        flush_reduced(w, &local, sink, |acc| {
            let mut out = ArrayD::from_shape_vec(vec![n_moments], acc).expect("shape");
            symmetrize_rank1(&mut out, num_velocities);
            out
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Rank 2: mu[n + N0 m] = <0| v^a T_n(H) v^b T_m(H) |0>
// ---------------------------------------------------------------------------

fn rank2<S: Scalar>(
    w: &mut Worker<S>,
    indices: &[Vec<usize>],
    moments: &[usize],
    randoms: usize,
    disorder: usize,
    sink: FlushSink,
) -> Result<()> {
    let (n0, n1) = (moments[0], moments[1]);
    let num_velocities = indices[0].len() + indices[1].len();

    let mut phi0 = KpmVector::<S>::new(1, &w.domain)?;
    let mut phi_l = KpmVector::<S>::new(2, &w.domain)?;
    let mut phi_lv = KpmVector::<S>::new(MEMORY, &w.domain)?;
    let mut phi_r = KpmVector::<S>::new(MEMORY, &w.domain)?;
    let mut local = vec![S::zero(); n0 * n1];
    let mut samples = 0usize;

    for _ in 0..disorder {
        w.ham.generate_disorder(&w.domain, &mut w.rng);
        let t0 = (!indices[0].is_empty()).then(|| w.ham.build_velocity(&indices[0]));
        let t1 = (!indices[1].is_empty()).then(|| w.ham.build_velocity(&indices[1]));

        for _ in 0..randoms {
            phi0.init_random(&mut w.rng, &w.ham, &w.domain);
            phi0.exchange(&w.domain, w.shared);

            // Left recursion runs on v^a |0>.
            phi_l.set_index(0);
            match &t0 {
                Some(t) => phi_l.velocity_from(
                    0, &phi0, 0, &indices[0], t, &w.ham, &w.domain, w.shared,
                ),
                None => phi_l.copy_slot(0, &phi0, 0),
            }

            for n in (0..n0).step_by(MEMORY) {
                let w1 = MEMORY.min(n0 - n);
                for i in n..n + w1 {
                    if i != 0 {
                        cheb(&mut phi_l, i - 1, &w.ham, &w.domain, w.shared);
                    }
                    let j = i - n;
                    match &t1 {
                        Some(t) => phi_lv.velocity_from(
                            j,
                            &phi_l,
                            phi_l.index,
                            &indices[1],
                            t,
                            &w.ham,
                            &w.domain,
                            w.shared,
                        ),
                        None => phi_lv.copy_slot(j, &phi_l, phi_l.index),
                    }
                    phi_lv.empty_ghosts(j, &w.domain);
                }

                // Right recursion restarts from |0> for every left block.
                phi_r.set_index(0);
                phi_r.copy_slot(0, &phi0, 0);
                for m in (0..n1).step_by(MEMORY) {
                    let w2 = MEMORY.min(n1 - m);
                    let entry = phi_r.index;
                    for i in m..m + w2 {
                        if i != 0 {
                            cheb(&mut phi_r, i - 1, &w.ham, &w.domain, w.shared);
                        }
                    }
                    let base = if m == 0 { 0 } else { (entry + 1) % MEMORY };

                    for j2 in 0..w2 {
                        let slot_r = (base + j2) % MEMORY;
                        for j1 in 0..w1 {
                            let x = phi_lv.dot(j1, &phi_r, slot_r);
                            welford(&mut local[(m + j2) * n0 + (n + j1)], x, samples);
                        }
                    }
                }
            }
            samples += 1;
        }

        flush_reduced(w, &local, sink, |acc| {
            let raw = Array2::from_shape_vec((n1, n0), acc).expect("shape");
            symmetrize_rank2(&raw, num_velocities).into_dyn()
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Rank 3: mu[n + N0 m + N0 N1 p] = <0| v^a T_n v^b T_m v^c T_p |0>
// ---------------------------------------------------------------------------

fn rank3<S: Scalar>(
    w: &mut Worker<S>,
    indices: &[Vec<usize>],
    moments: &[usize],
    randoms: usize,
    disorder: usize,
    sink: FlushSink,
) -> Result<()> {
    let (n0, n1, n2) = (moments[0], moments[1], moments[2]);
    let num_velocities: usize = indices.iter().map(Vec::len).sum();

    let mut phi0 = KpmVector::<S>::new(1, &w.domain)?;
    let mut phi_vn = KpmVector::<S>::new(2, &w.domain)?;
    let mut phi_vnv = KpmVector::<S>::new(MEMORY, &w.domain)?;
    let mut phi_p = KpmVector::<S>::new(2, &w.domain)?;
    let mut phi_pvm = KpmVector::<S>::new(MEMORY, &w.domain)?;
    let mut samples = 0usize;

    for _ in 0..disorder {
        w.ham.generate_disorder(&w.domain, &mut w.rng);
        let t0 = (!indices[0].is_empty()).then(|| w.ham.build_velocity(&indices[0]));
        let t1 = (!indices[1].is_empty()).then(|| w.ham.build_velocity(&indices[1]));
        let t2 = (!indices[2].is_empty()).then(|| w.ham.build_velocity(&indices[2]));

        for _ in 0..randoms {
            phi0.init_random(&mut w.rng, &w.ham, &w.domain);
            phi0.exchange(&w.domain, w.shared);

            phi_vn.set_index(0);
            match &t0 {
                Some(t) => phi_vn.velocity_from(
                    0, &phi0, 0, &indices[0], t, &w.ham, &w.domain, w.shared,
                ),
                None => phi_vn.copy_slot(0, &phi0, 0),
            }

            for n in (0..n0).step_by(MEMORY) {
                let w1 = MEMORY.min(n0 - n);
                for i in n..n + w1 {
                    if i != 0 {
                        cheb(&mut phi_vn, i - 1, &w.ham, &w.domain, w.shared);
                    }
                    let j = i - n;
                    match &t1 {
                        Some(t) => phi_vnv.velocity_from(
                            j,
                            &phi_vn,
                            phi_vn.index,
                            &indices[1],
                            t,
                            &w.ham,
                            &w.domain,
                            w.shared,
                        ),
                        None => phi_vnv.copy_slot(j, &phi_vn, phi_vn.index),
                    }
                    phi_vnv.empty_ghosts(j, &w.domain);
                }

                // The rightmost recursion advances one step at a time.
                phi_p.set_index(0);
                phi_p.copy_slot(0, &phi0, 0);
                for p in 0..n2 {
                    if p != 0 {
                        cheb(&mut phi_p, p - 1, &w.ham, &w.domain, w.shared);
                    }
                    phi_pvm.set_index(0);
                    match &t2 {
                        Some(t) => phi_pvm.velocity_from(
                            0,
                            &phi_p,
                            phi_p.index,
                            &indices[2],
                            t,
                            &w.ham,
                            &w.domain,
                            w.shared,
                        ),
                        None => phi_pvm.copy_slot(0, &phi_p, phi_p.index),
                    }

                    for m in (0..n1).step_by(MEMORY) {
                        let w2 = MEMORY.min(n1 - m);
                        let entry = phi_pvm.index;
                        for i in m..m + w2 {
                            if i != 0 {
                                cheb(&mut phi_pvm, i - 1, &w.ham, &w.domain, w.shared);
                            }
                        }
                        let base = if m == 0 { 0 } else { (entry + 1) % MEMORY };

                        // The block of partial sums is combined across the
                        // grid, then folded into the global running mean by
                        // the master thread alone.
                        if w.is_master() {
                            let mut block =
                                w.shared.block.lock().expect("block poisoned");
                            block.fill(S::zero());
                        }
                        w.shared.barrier.wait();
                        {
                            let mut block =
                                w.shared.block.lock().expect("block poisoned");
                            for j1 in 0..w1 {
                                for j2 in 0..w2 {
                                    let slot_r = (base + j2) % MEMORY;
                                    block[j1 * MEMORY + j2] +=
                                        phi_vnv.dot(j1, &phi_pvm, slot_r);
                                }
                            }
                        }
                        w.shared.barrier.wait();
                        if w.is_master() {
                            let block = w.shared.block.lock().expect("block poisoned");
                            let mut acc =
                                w.shared.accumulator.lock().expect("accumulator poisoned");
                            for j2 in 0..w2 {
                                for j1 in 0..w1 {
                                    let ind =
                                        p * n0 * n1 + (m + j2) * n0 + (n + j1);
                                    welford(
                                        &mut acc[ind],
                                        block[j1 * MEMORY + j2],
                                        samples,
                                    );
                                }
                            }
                        }
                        w.shared.barrier.wait();
                    }
                }
            }
            samples += 1;
        }

        // The rank-3 running mean already lives in the global accumulator;
        // the flush only snapshots it.
        w.shared.barrier.wait();
        if w.is_master() {
            let acc = w.shared.accumulator.lock().expect("accumulator poisoned");
            let raw = Array3::from_shape_vec(
                (n2, n1, n0),
                acc.iter().map(|x| x.to_c64()).collect(),
            )
            .expect("shape");
            drop(acc);
            let out = symmetrize_rank3(&raw, indices, num_velocities).into_dyn();
            if let Some(f) = sink {
                f(&out);
            }
            *w.shared.output.lock().expect("output poisoned") = Some(out);
        }
        w.shared.barrier.wait();
    }
    Ok(())
}

/// Reduce a thread-local running mean into the global accumulator, let the
/// master symmetrize and publish the snapshot, and zero the accumulator for
/// the next realization.
fn flush_reduced<S: Scalar>(
    w: &Worker<S>,
    local: &[S],
    sink: FlushSink,
    finish: impl Fn(Vec<Complex64>) -> ArrayD<Complex64>,
) {
    w.shared.reduce(local);
    w.shared.barrier.wait();
    if w.is_master() {
        let acc = w.shared.accumulator.lock().expect("accumulator poisoned");
        let snapshot: Vec<Complex64> = acc.iter().map(|x| x.to_c64()).collect();
        drop(acc);
        let out = finish(snapshot);
        if let Some(f) = sink {
            f(&out);
        }
        *w.shared.output.lock().expect("output poisoned") = Some(out);
        w.shared.reset_accumulator();
    }
    w.shared.barrier.wait();
}

// ---------------------------------------------------------------------------
// Symmetrization
// ---------------------------------------------------------------------------

/// Rank 1: the adjoint of each odd velocity contributes one sign.
pub fn symmetrize_rank1(mu: &mut ArrayD<Complex64>, num_velocities: usize) {
    let f = sign_factor(num_velocities);
    mu.mapv_inplace(|x| x * f);
}

/// Rank 2: mu <- (factor mu + mu^dagger)/2 on the (n, m) indices. The
/// Hermitian combination needs a square matrix; rectangular tensors only
/// get the sign factor.
pub fn symmetrize_rank2(raw: &Array2<Complex64>, num_velocities: usize) -> Array2<Complex64> {
    let f = sign_factor(num_velocities);
    let (rows, cols) = raw.dim();
    if rows != cols {
        return raw.mapv(|x| x * f);
    }
    let mut out = Array2::zeros((rows, cols));
    Zip::indexed(&mut out).par_for_each(|(m, n), v| {
        *v = (f * raw[[m, n]] + raw[[n, m]].conj()) / 2.0;
    });
    out
}

/// Rank 3, stored as `[p][m][n]`. With all three axis lists equal the six
/// permutations average (three cyclic, three factor-weighted conjugated
/// transpositions); with exactly two equal the matching two-term average
/// applies; with all distinct the tensor is used as-is.
pub fn symmetrize_rank3(
    raw: &Array3<Complex64>,
    indices: &[Vec<usize>],
    num_velocities: usize,
) -> Array3<Complex64> {
    let f = sign_factor(num_velocities);
    let (d2, d1, d0) = raw.dim();
    let cube = d0 == d1 && d1 == d2;

    if indices[0] == indices[1] && indices[0] == indices[2] && cube {
        let mut out = Array3::zeros((d2, d1, d0));
        Zip::indexed(&mut out).par_for_each(|(p, m, n), v| {
            let direct = raw[[p, m, n]] + raw[[n, p, m]] + raw[[m, n, p]];
            let flipped = raw[[n, m, p]] + raw[[m, p, n]] + raw[[p, n, m]];
            *v = (direct + f * flipped.conj()) / 6.0;
        });
        return out;
    }
    if indices[0] == indices[1] && indices[0] != indices[2] && d1 == d2 {
        let mut out = Array3::zeros((d2, d1, d0));
        Zip::indexed(&mut out).par_for_each(|(p, m, n), v| {
            *v = (raw[[p, m, n]] + f * raw[[m, p, n]].conj()) / 2.0;
        });
        return out;
    }
    if indices[0] == indices[2] && indices[0] != indices[1] && d0 == d2 {
        let mut out = Array3::zeros((d2, d1, d0));
        Zip::indexed(&mut out).par_for_each(|(p, m, n), v| {
            *v = (raw[[p, m, n]] + f * raw[[p, n, m]].conj()) / 2.0;
        });
        return out;
    }
    if indices[1] == indices[2] && indices[0] != indices[1] && d0 == d1 {
        let mut out = Array3::zeros((d2, d1, d0));
        Zip::indexed(&mut out).par_for_each(|(p, m, n), v| {
            *v = (raw[[p, m, n]] + f * raw[[n, m, p]].conj()) / 2.0;
        });
        return out;
    }
    raw.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array1;
    use proptest::prelude::*;

    fn c(re: f64, im: f64) -> Complex64 {
        Complex64::new(re, im)
    }

    #[test]
    fn welford_equals_plain_mean() {
        let xs = [0.3, -1.2, 2.5, 0.0, 7.25];
        let mut mu = 0.0f64;
        for (k, x) in xs.iter().enumerate() {
            welford(&mut mu, *x, k);
        }
        let plain: f64 = xs.iter().sum::<f64>() / xs.len() as f64;
        assert!((mu - plain).abs() < 1e-14);
    }

    proptest! {
        // Running one pass over r + s samples matches combining the two
        // partial means with their counts.
        #[test]
        fn welford_merges_with_weights(
            a in proptest::collection::vec(-1e3f64..1e3, 1..40),
            b in proptest::collection::vec(-1e3f64..1e3, 1..40),
        ) {
            let mut full = 0.0;
            for (k, x) in a.iter().chain(b.iter()).enumerate() {
                welford(&mut full, *x, k);
            }
            let mut ma = 0.0;
            for (k, x) in a.iter().enumerate() { welford(&mut ma, *x, k); }
            let mut mb = 0.0;
            for (k, x) in b.iter().enumerate() { welford(&mut mb, *x, k); }
            let (ra, rb) = (a.len() as f64, b.len() as f64);
            let merged = (ma * ra + mb * rb) / (ra + rb);
            prop_assert!((full - merged).abs() < 1e-9 * (1.0 + merged.abs()));
        }

        // The symmetrized rank-2 tensor satisfies mu = factor * mu^dagger.
        #[test]
        fn rank2_symmetrization_law(
            entries in proptest::collection::vec((-1.0f64..1.0, -1.0f64..1.0), 16),
            odd in any::<bool>(),
        ) {
            let raw = Array2::from_shape_vec(
                (4, 4),
                entries.iter().map(|&(re, im)| c(re, im)).collect(),
            ).unwrap();
            let nv = if odd { 1 } else { 2 };
            let f = if odd { -1.0 } else { 1.0 };
            let sym = symmetrize_rank2(&raw, nv);
            for m in 0..4 {
                for n in 0..4 {
                    let lhs = sym[[m, n]];
                    let rhs = f * sym[[n, m]].conj();
                    prop_assert!((lhs - rhs).norm() < 1e-12);
                }
            }
        }

        // With all axes equal the symmetrized rank-3 tensor is invariant
        // under cyclic permutations and factor-conjugates under swaps.
        #[test]
        fn rank3_symmetrization_law(
            entries in proptest::collection::vec((-1.0f64..1.0, -1.0f64..1.0), 27),
        ) {
            let raw = Array3::from_shape_vec(
                (3, 3, 3),
                entries.iter().map(|&(re, im)| c(re, im)).collect(),
            ).unwrap();
            let indices = vec![vec![0usize], vec![0], vec![0]];
            let sym = symmetrize_rank3(&raw, &indices, 3);
            for p in 0..3 {
                for m in 0..3 {
                    for n in 0..3 {
                        // G(n,m,p) = G(m,p,n) = G(p,n,m)
                        prop_assert!((sym[[p, m, n]] - sym[[n, p, m]]).norm() < 1e-12);
                        prop_assert!((sym[[p, m, n]] - sym[[m, n, p]]).norm() < 1e-12);
                        // G(n,m,p) = factor * conj(G(p,m,n))
                        let swap = -sym[[n, m, p]].conj();
                        prop_assert!((sym[[p, m, n]] - swap).norm() < 1e-12);
                    }
                }
            }
        }
    }

    #[test]
    fn rank1_symmetrization_flips_odd_velocity_counts() {
        let mut mu = Array1::from_vec(vec![c(1.0, 0.5), c(-2.0, 0.0)]).into_dyn();
        symmetrize_rank1(&mut mu, 1);
        assert_eq!(mu[[0]], c(-1.0, -0.5));
        symmetrize_rank1(&mut mu, 2);
        assert_eq!(mu[[0]], c(-1.0, -0.5));
    }

    #[test]
    fn rank3_distinct_axes_pass_through() {
        let raw = Array3::from_elem((2, 2, 2), c(0.7, -0.1));
        let indices = vec![vec![0usize], vec![1], vec![2]];
        let sym = symmetrize_rank3(&raw, &indices, 3);
        assert_eq!(sym, raw);
    }
}
