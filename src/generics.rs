//! Generic support for the amplitude type of the engine.
//!
//! The whole recursion is generic over one scalar parameter: `f32`/`f64` for
//! time-reversal-symmetric models and `Complex32`/`Complex64` when hoppings
//! carry phases. The trait also owns the two behaviours that differ between
//! the real and the complex branch: the Peierls factor (a real model forbids
//! a magnetic field, so the factor collapses to 1) and the random-vector
//! sample (a unit-modulus phase for complex amplitudes, a sign for real ones).

use num_complex::{Complex, Complex32, Complex64};
use num_traits::Zero;
use rand::Rng;
use std::fmt::Debug;
use std::f64::consts::PI;
use std::ops::{Add, AddAssign, Mul, MulAssign, Neg, Sub, SubAssign};

/// Amplitude scalar of the KPM vectors, hoppings and moment arrays.
pub trait Scalar:
    Copy
    + Clone
    + Debug
    + PartialEq
    + Zero
    + Add<Output = Self>
    + Sub<Output = Self>
    + Mul<Output = Self>
    + Neg<Output = Self>
    + AddAssign
    + SubAssign
    + MulAssign
    + Send
    + Sync
    + 'static
{
    /// Whether the amplitude carries an imaginary part. A magnetic field is
    /// only representable when this is true.
    const IS_COMPLEX: bool;

    /// Embed a real number.
    fn from_re(x: f64) -> Self;

    /// Embed an imaginary number; zero for real amplitudes (job validation
    /// rejects complex model data before a real-amplitude worker starts).
    fn from_im(x: f64) -> Self;

    /// Complex conjugate (identity for real amplitudes).
    fn conj(self) -> Self;

    /// Real part as `f64`.
    fn re(self) -> f64;

    /// Imaginary part as `f64` (zero for real amplitudes).
    fn im(self) -> f64;

    /// Multiply by a real factor.
    #[inline(always)]
    fn scale(self, x: f64) -> Self {
        self * Self::from_re(x)
    }

    /// |z|^2 as `f64`.
    #[inline(always)]
    fn abs2(self) -> f64 {
        let c = self.conj() * self;
        c.re()
    }

    /// The Peierls factor exp(i phase). The real branch asserts in debug
    /// builds that no phase is ever requested; job validation rejects a
    /// magnetic field for real amplitudes before any worker starts.
    fn peierls(phase: f64) -> Self;

    /// A zero-mean unit-variance sample for the initial random vector.
    fn random_unit<R: Rng + ?Sized>(rng: &mut R) -> Self;

    /// Widen to `Complex64` for storage in the output container.
    fn to_c64(self) -> Complex64;
}

impl Scalar for f64 {
    const IS_COMPLEX: bool = false;

    #[inline(always)]
    fn from_re(x: f64) -> Self {
        x
    }
    #[inline(always)]
    fn from_im(_x: f64) -> Self {
        0.0
    }
    #[inline(always)]
    fn conj(self) -> Self {
        self
    }
    #[inline(always)]
    fn re(self) -> f64 {
        self
    }
    #[inline(always)]
    fn im(self) -> f64 {
        0.0
    }
    #[inline(always)]
    fn peierls(phase: f64) -> Self {
        debug_assert!(phase == 0.0);
        1.0
    }
    #[inline(always)]
    fn random_unit<R: Rng + ?Sized>(rng: &mut R) -> Self {
        if rng.gen::<bool>() {
            1.0
        } else {
            -1.0
        }
    }
    #[inline(always)]
    fn to_c64(self) -> Complex64 {
        Complex64::new(self, 0.0)
    }
}

impl Scalar for f32 {
    const IS_COMPLEX: bool = false;

    #[inline(always)]
    fn from_re(x: f64) -> Self {
        x as f32
    }
    #[inline(always)]
    fn from_im(_x: f64) -> Self {
        0.0
    }
    #[inline(always)]
    fn conj(self) -> Self {
        self
    }
    #[inline(always)]
    fn re(self) -> f64 {
        self as f64
    }
    #[inline(always)]
    fn im(self) -> f64 {
        0.0
    }
    #[inline(always)]
    fn peierls(phase: f64) -> Self {
        debug_assert!(phase == 0.0);
        1.0
    }
    #[inline(always)]
    fn random_unit<R: Rng + ?Sized>(rng: &mut R) -> Self {
        if rng.gen::<bool>() {
            1.0
        } else {
            -1.0
        }
    }
    #[inline(always)]
    fn to_c64(self) -> Complex64 {
        Complex64::new(self as f64, 0.0)
    }
}

impl Scalar for Complex64 {
    const IS_COMPLEX: bool = true;

    #[inline(always)]
    fn from_re(x: f64) -> Self {
        Complex64::new(x, 0.0)
    }
    #[inline(always)]
    fn from_im(x: f64) -> Self {
        Complex64::new(0.0, x)
    }
    #[inline(always)]
    fn conj(self) -> Self {
        Complex::conj(&self)
    }
    #[inline(always)]
    fn re(self) -> f64 {
        self.re
    }
    #[inline(always)]
    fn im(self) -> f64 {
        self.im
    }
    #[inline(always)]
    fn peierls(phase: f64) -> Self {
        Complex64::new(0.0, phase).exp()
    }
    #[inline(always)]
    fn random_unit<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let theta: f64 = rng.gen_range(0.0..2.0 * PI);
        Complex64::new(theta.cos(), theta.sin())
    }
    #[inline(always)]
    fn to_c64(self) -> Complex64 {
        self
    }
}

impl Scalar for Complex32 {
    const IS_COMPLEX: bool = true;

    #[inline(always)]
    fn from_re(x: f64) -> Self {
        Complex32::new(x as f32, 0.0)
    }
    #[inline(always)]
    fn from_im(x: f64) -> Self {
        Complex32::new(0.0, x as f32)
    }
    #[inline(always)]
    fn conj(self) -> Self {
        Complex::conj(&self)
    }
    #[inline(always)]
    fn re(self) -> f64 {
        self.re as f64
    }
    #[inline(always)]
    fn im(self) -> f64 {
        self.im as f64
    }
    #[inline(always)]
    fn peierls(phase: f64) -> Self {
        Complex32::new(0.0, phase as f32).exp()
    }
    #[inline(always)]
    fn random_unit<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let theta: f32 = rng.gen_range(0.0..2.0 * PI as f32);
        Complex32::new(theta.cos(), theta.sin())
    }
    #[inline(always)]
    fn to_c64(self) -> Complex64 {
        Complex64::new(self.re as f64, self.im as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn random_units_have_unit_modulus() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        for _ in 0..100 {
            let z = <Complex64 as Scalar>::random_unit(&mut rng);
            assert!((z.norm() - 1.0).abs() < 1e-12);
            let x = <f64 as Scalar>::random_unit(&mut rng);
            assert_eq!(x.abs(), 1.0);
        }
    }

    #[test]
    fn peierls_is_a_phase() {
        let z = <Complex64 as Scalar>::peierls(0.3);
        assert!((z.norm() - 1.0).abs() < 1e-12);
        assert!((z.arg() - 0.3).abs() < 1e-12);
        assert_eq!(<f64 as Scalar>::peierls(0.0), 1.0);
    }
}
