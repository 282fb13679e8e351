//! Direct evaluation of a zero-temperature DC response at fixed energies.
//!
//! Instead of assembling the full moment tensor, the single-shot path sums
//! the Chebyshev series of the broadened Green's function on the fly:
//!
//! |psi(E)> = Im G(H, E + i gamma) v^a |0>
//!
//! with the analytic expansion Im G = sum_n g_n(E + i gamma) T_n(H), and
//! contracts <psi(E)| v^b |psi'(E)> where |psi'(E)> carries no velocity
//! prefix. Both velocity factors are anti-Hermitian, so their adjoint signs
//! cancel in the contraction.

use crate::error::Result;
use crate::generics::Scalar;
use crate::moments::{welford, FlushSink, Worker};
use crate::vector::KpmVector;
use ndarray::Array2;
use num_complex::Complex64;

/// The n-th scalar coefficient of the Chebyshev expansion of the resolvent
/// at complex energy `z`, retarded for `sigma = 1`. The n = 0 term enters
/// the series with half weight.
pub fn green_coefficient(n: usize, sigma: f64, z: Complex64) -> Complex64 {
    let i = Complex64::i();
    let sq = (Complex64::new(1.0, 0.0) - z * z).sqrt();
    let sign = if n % 2 == 0 { 1.0 } else { -1.0 };
    sign * 2.0 * sigma / sq * i * (-i * sigma * n as f64 * z.acos()).exp()
}

/// Evaluate the response at every requested energy, averaging over random
/// vectors and disorder. Every thread of the grid calls this collectively;
/// the master publishes a (2 x n_energies) array of rescaled energies and
/// response values.
#[allow(clippy::too_many_arguments)]
pub fn singleshot<S: Scalar>(
    w: &mut Worker<S>,
    axes_left: &[usize],
    axes_right: &[usize],
    n_moments: usize,
    energies: &[f64],
    gamma: f64,
    randoms: usize,
    disorder: usize,
    energy_scale: f64,
    sink: FlushSink,
) -> Result<()> {
    let mut phi0 = KpmVector::<S>::new(1, &w.domain)?;
    let mut phi = KpmVector::<S>::new(2, &w.domain)?;
    let mut acc_l = KpmVector::<S>::new(1, &w.domain)?;
    let mut acc_r = KpmVector::<S>::new(1, &w.domain)?;
    let mut tmp = KpmVector::<S>::new(1, &w.domain)?;

    let mut local = vec![S::zero(); energies.len()];

    for (e, &energy) in energies.iter().enumerate() {
        let z = Complex64::new(energy, gamma);
        let weights: Vec<f64> = (0..n_moments)
            .map(|n| {
                let g = green_coefficient(n, 1.0, z).im;
                if n == 0 {
                    g / 2.0
                } else {
                    g
                }
            })
            .collect();

        let mut samples = 0usize;
        for _ in 0..disorder {
            w.ham.generate_disorder(&w.domain, &mut w.rng);
            let t_l = w.ham.build_velocity(axes_left);
            let t_r = w.ham.build_velocity(axes_right);

            for _ in 0..randoms {
                phi0.init_random(&mut w.rng, &w.ham, &w.domain);
                phi0.exchange(&w.domain, w.shared);

                // Left vector: Im G applied to v^a |0>, then v^b.
                phi.set_index(0);
                phi.velocity_from(0, &phi0, 0, axes_left, &t_l, &w.ham, &w.domain, w.shared);
                acc_l.copy_scaled(0, &phi, 0, weights[0]);
                phi.multiply(0, &w.ham, &w.domain, w.shared);
                acc_l.scaled_add(0, &phi, phi.index, weights[1]);
                for &wn in &weights[2..] {
                    phi.multiply(1, &w.ham, &w.domain, w.shared);
                    acc_l.scaled_add(0, &phi, phi.index, wn);
                }
                tmp.copy_slot(0, &acc_l, 0);
                acc_l.velocity_from(0, &tmp, 0, axes_right, &t_r, &w.ham, &w.domain, w.shared);
                acc_l.empty_ghosts(0, &w.domain);

                // Right vector: Im G applied to the bare |0>.
                phi.set_index(0);
                phi.copy_slot(0, &phi0, 0);
                acc_r.copy_scaled(0, &phi, 0, weights[0]);
                phi.multiply(0, &w.ham, &w.domain, w.shared);
                acc_r.scaled_add(0, &phi, phi.index, weights[1]);
                for &wn in &weights[2..] {
                    phi.multiply(1, &w.ham, &w.domain, w.shared);
                    acc_r.scaled_add(0, &phi, phi.index, wn);
                }

                welford(&mut local[e], acc_l.dot(0, &acc_r, 0), samples);
                samples += 1;
            }
        }
    }

    w.shared.reduce(&local);
    w.shared.barrier.wait();
    if w.is_master() {
        let acc = w.shared.accumulator.lock().expect("accumulator poisoned");
        let mut out = Array2::<Complex64>::zeros((2, energies.len()));
        for (e, &energy) in energies.iter().enumerate() {
            out[[0, e]] = Complex64::new(energy * energy_scale, 0.0);
            out[[1, e]] = acc[e].to_c64();
        }
        drop(acc);
        let out = out.into_dyn();
        if let Some(f) = sink {
            f(&out);
        }
        *w.shared.output.lock().expect("output poisoned") = Some(out);
    }
    w.shared.barrier.wait();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    // The scalar Chebyshev series of the coefficients must reproduce the
    // resolvent it expands: sum_n' g_n(z) T_n(x) = -1/(z + x).
    #[test]
    fn coefficients_resum_to_the_resolvent() {
        for &x in &[-0.62f64, -0.1, 0.0, 0.35, 0.8] {
            for &(energy, gamma) in &[(0.3f64, 0.05f64), (-0.5, 0.1), (0.0, 0.02)] {
                let z = Complex64::new(energy, gamma);
                let mut sum = Complex64::new(0.0, 0.0);
                let mut t_prev = 1.0f64; // T_0(x)
                let mut t_cur = x; // T_1(x)
                sum += green_coefficient(0, 1.0, z) / 2.0;
                sum += green_coefficient(1, 1.0, z) * t_cur;
                for n in 2..4000 {
                    let t_next = 2.0 * x * t_cur - t_prev;
                    t_prev = t_cur;
                    t_cur = t_next;
                    sum += green_coefficient(n, 1.0, z) * t_cur;
                }
                let expect = -1.0 / (z + x);
                assert!(
                    (sum - expect).norm() < 1e-6,
                    "x={x} z={z}: {sum} vs {expect}"
                );
            }
        }
    }

    // The imaginary part of the resummed series is the Lorentzian
    // broadening of the spectral weight, so it must be positive.
    #[test]
    fn broadened_weight_is_positive() {
        let z = Complex64::new(0.4, 0.05);
        for &x in &[-0.9f64, -0.4, 0.0, 0.5, 0.9] {
            let mut sum = 0.0f64;
            let mut t_prev = 1.0f64;
            let mut t_cur = x;
            sum += green_coefficient(0, 1.0, z).im / 2.0;
            sum += green_coefficient(1, 1.0, z).im * t_cur;
            for n in 2..4000 {
                let t_next = 2.0 * x * t_cur - t_prev;
                t_prev = t_cur;
                t_cur = t_next;
                sum += green_coefficient(n, 1.0, z).im * t_cur;
            }
            assert!(sum > 0.0, "x={x}: {sum}");
        }
    }
}
