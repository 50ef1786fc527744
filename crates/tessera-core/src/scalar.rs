//! Element types.
//!
//! [`Scalar`] covers the four supported types (`f32`, `f64`, `Complex32`,
//! `Complex64`). Norms and tolerances are always computed in `f64`.

use std::fmt::Debug;
use std::ops::{AddAssign, MulAssign, Neg, SubAssign};

use ndarray::LinalgScalar;
use num_complex::{Complex32, Complex64};

pub trait Scalar:
    LinalgScalar
    + Send
    + Sync
    + Debug
    + PartialEq
    + Neg<Output = Self>
    + AddAssign
    + SubAssign
    + MulAssign
{
    /// Unit roundoff of the type, as `f64`.
    const EPSILON: f64;

    /// Complex types carry an imaginary part that conjugation flips.
    const IS_COMPLEX: bool;

    fn conj(self) -> Self;

    /// Modulus.
    fn abs(self) -> f64;

    fn re(self) -> f64;

    fn from_f64(x: f64) -> Self;

    fn from_parts(re: f64, im: f64) -> Self;

    fn sqrt_real(x: f64) -> Self {
        Self::from_f64(x.sqrt())
    }
}

impl Scalar for f32 {
    const EPSILON: f64 = f32::EPSILON as f64;
    const IS_COMPLEX: bool = false;

    fn conj(self) -> Self {
        self
    }
    fn abs(self) -> f64 {
        f32::abs(self) as f64
    }
    fn re(self) -> f64 {
        self as f64
    }
    fn from_f64(x: f64) -> Self {
        x as f32
    }
    fn from_parts(re: f64, _im: f64) -> Self {
        re as f32
    }
}

impl Scalar for f64 {
    const EPSILON: f64 = f64::EPSILON;
    const IS_COMPLEX: bool = false;

    fn conj(self) -> Self {
        self
    }
    fn abs(self) -> f64 {
        f64::abs(self)
    }
    fn re(self) -> f64 {
        self
    }
    fn from_f64(x: f64) -> Self {
        x
    }
    fn from_parts(re: f64, _im: f64) -> Self {
        re
    }
}

impl Scalar for Complex32 {
    const EPSILON: f64 = f32::EPSILON as f64;
    const IS_COMPLEX: bool = true;

    fn conj(self) -> Self {
        Complex32::conj(&self)
    }
    fn abs(self) -> f64 {
        self.norm() as f64
    }
    fn re(self) -> f64 {
        self.re as f64
    }
    fn from_f64(x: f64) -> Self {
        Complex32::new(x as f32, 0.0)
    }
    fn from_parts(re: f64, im: f64) -> Self {
        Complex32::new(re as f32, im as f32)
    }
}

impl Scalar for Complex64 {
    const EPSILON: f64 = f64::EPSILON;
    const IS_COMPLEX: bool = true;

    fn conj(self) -> Self {
        Complex64::conj(&self)
    }
    fn abs(self) -> f64 {
        self.norm()
    }
    fn re(self) -> f64 {
        self.re
    }
    fn from_f64(x: f64) -> Self {
        Complex64::new(x, 0.0)
    }
    fn from_parts(re: f64, im: f64) -> Self {
        Complex64::new(re, im)
    }
}

/// A high precision type paired with its low precision partner.
pub trait MixedPrecision: Scalar {
    type Low: Scalar;

    fn demote(self) -> Self::Low;

    fn promote(low: Self::Low) -> Self;
}

impl MixedPrecision for f64 {
    type Low = f32;

    fn demote(self) -> f32 {
        self as f32
    }
    fn promote(low: f32) -> f64 {
        low as f64
    }
}

impl MixedPrecision for Complex64 {
    type Low = Complex32;

    fn demote(self) -> Complex32 {
        Complex32::new(self.re as f32, self.im as f32)
    }
    fn promote(low: Complex32) -> Complex64 {
        Complex64::new(low.re as f64, low.im as f64)
    }
}

/// Element conversion used by precision-changing copies.
pub trait ConvertFrom<T> {
    fn convert_from(x: T) -> Self;
}

impl<T: Scalar> ConvertFrom<T> for T {
    fn convert_from(x: T) -> Self {
        x
    }
}

impl ConvertFrom<f64> for f32 {
    fn convert_from(x: f64) -> Self {
        x as f32
    }
}

impl ConvertFrom<f32> for f64 {
    fn convert_from(x: f32) -> Self {
        x as f64
    }
}

impl ConvertFrom<Complex64> for Complex32 {
    fn convert_from(x: Complex64) -> Self {
        <Complex64 as MixedPrecision>::demote(x)
    }
}

impl ConvertFrom<Complex32> for Complex64 {
    fn convert_from(x: Complex32) -> Self {
        <Complex64 as MixedPrecision>::promote(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conjugate_and_modulus() {
        let z = Complex64::new(3.0, -4.0);
        assert_eq!(Scalar::conj(z), Complex64::new(3.0, 4.0));
        assert_eq!(Scalar::abs(z), 5.0);
        assert_eq!(Scalar::abs(-2.5_f32), 2.5);
        assert_eq!(Scalar::conj(1.5_f64), 1.5);
    }

    #[test]
    fn test_demote_promote() {
        let x = 1.0_f64 + 1e-12;
        assert_eq!(x.demote(), 1.0_f32);
        assert_eq!(<f64 as MixedPrecision>::promote(0.5), 0.5);
        let z = Complex64::new(0.25, -2.0);
        assert_eq!(<Complex64 as MixedPrecision>::promote(z.demote()), z);
    }
}
