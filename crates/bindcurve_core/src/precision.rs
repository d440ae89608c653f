//! Double-double arithmetic.
//!
//! A `DoubleDouble` is the unevaluated sum `hi + lo` of two `f64` values with
//! `|lo| <= ulp(hi) / 2`, giving roughly 106 bits of mantissa. Addition,
//! multiplication, division and square roots are carried out in full
//! precision; transcendental functions are first-order corrected `f64`
//! evaluations, which is enough for the residuals the solvers evaluate.

use num_traits::{Float, FromPrimitive, Num, NumCast, One, ToPrimitive, Zero};
use std::cmp::Ordering;
use std::fmt;
use std::ops::{Add, Div, Mul, Neg, Rem, Sub};

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DoubleDouble {
    pub hi: f64,
    pub lo: f64,
}

#[inline]
fn two_sum(a: f64, b: f64) -> (f64, f64) {
    let s = a + b;
    let bb = s - a;
    let err = (a - (s - bb)) + (b - bb);
    (s, err)
}

#[inline]
fn quick_two_sum(a: f64, b: f64) -> (f64, f64) {
    let s = a + b;
    let err = b - (s - a);
    (s, err)
}

#[inline]
fn two_prod(a: f64, b: f64) -> (f64, f64) {
    let p = a * b;
    let err = a.mul_add(b, -p);
    (p, err)
}

impl DoubleDouble {
    pub const ZERO: Self = Self::from_f64(0.0);

    pub const fn from_f64(value: f64) -> Self {
        Self { hi: value, lo: 0.0 }
    }

    /// Builds a normalized value from an arbitrary pair.
    fn renormalize(hi: f64, lo: f64) -> Self {
        let (s, e) = quick_two_sum(hi, lo);
        if s.is_finite() {
            Self { hi: s, lo: e }
        } else {
            Self { hi: s, lo: 0.0 }
        }
    }

    pub fn to_f64(self) -> f64 {
        self.hi + self.lo
    }

    /// Multiplies by a plain `f64`.
    pub fn scale(self, factor: f64) -> Self {
        let (p, e) = two_prod(self.hi, factor);
        Self::renormalize(p, e + self.lo * factor)
    }
}

impl From<f64> for DoubleDouble {
    fn from(value: f64) -> Self {
        Self::from_f64(value)
    }
}

impl fmt::Display for DoubleDouble {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.lo == 0.0 {
            write!(f, "{}", self.hi)
        } else {
            write!(f, "{} {:+e}", self.hi, self.lo)
        }
    }
}

impl PartialOrd for DoubleDouble {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match self.hi.partial_cmp(&other.hi)? {
            Ordering::Equal => self.lo.partial_cmp(&other.lo),
            ord => Some(ord),
        }
    }
}

impl Add for DoubleDouble {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        let (s, mut e) = two_sum(self.hi, rhs.hi);
        if !s.is_finite() {
            return Self::from_f64(s);
        }
        let (t, f) = two_sum(self.lo, rhs.lo);
        e += t;
        let (s, e) = quick_two_sum(s, e);
        Self::renormalize(s, e + f)
    }
}

impl Sub for DoubleDouble {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        self + (-rhs)
    }
}

impl Mul for DoubleDouble {
    type Output = Self;
    fn mul(self, rhs: Self) -> Self {
        let (p, e) = two_prod(self.hi, rhs.hi);
        if !p.is_finite() {
            return Self::from_f64(p);
        }
        Self::renormalize(p, e + (self.hi * rhs.lo + self.lo * rhs.hi))
    }
}

impl Div for DoubleDouble {
    type Output = Self;
    fn div(self, rhs: Self) -> Self {
        let q1 = self.hi / rhs.hi;
        if !q1.is_finite() || q1 == 0.0 {
            return Self::from_f64(q1);
        }
        let r = self - rhs.scale(q1);
        let q2 = r.hi / rhs.hi;
        let r = r - rhs.scale(q2);
        let q3 = r.hi / rhs.hi;
        Self::renormalize(q1, q2) + Self::from_f64(q3)
    }
}

impl Neg for DoubleDouble {
    type Output = Self;
    fn neg(self) -> Self {
        Self {
            hi: -self.hi,
            lo: -self.lo,
        }
    }
}

impl Rem for DoubleDouble {
    type Output = Self;
    fn rem(self, rhs: Self) -> Self {
        self - (self / rhs).trunc() * rhs
    }
}

impl_assign_ops!(DoubleDouble);

impl Zero for DoubleDouble {
    fn zero() -> Self {
        Self::from_f64(0.0)
    }
    fn is_zero(&self) -> bool {
        self.hi == 0.0
    }
}

impl One for DoubleDouble {
    fn one() -> Self {
        Self::from_f64(1.0)
    }
}

impl Num for DoubleDouble {
    type FromStrRadixErr = num_traits::ParseFloatError;
    fn from_str_radix(s: &str, radix: u32) -> Result<Self, Self::FromStrRadixErr> {
        f64::from_str_radix(s, radix).map(Self::from_f64)
    }
}

impl ToPrimitive for DoubleDouble {
    fn to_i64(&self) -> Option<i64> {
        self.trunc_f64().to_i64()
    }
    fn to_u64(&self) -> Option<u64> {
        self.trunc_f64().to_u64()
    }
    fn to_f64(&self) -> Option<f64> {
        Some(self.hi + self.lo)
    }
}

impl DoubleDouble {
    fn trunc_f64(&self) -> f64 {
        Float::trunc(*self).to_f64()
    }
}

impl FromPrimitive for DoubleDouble {
    fn from_i64(n: i64) -> Option<Self> {
        let hi = n as f64;
        let lo = (n - hi as i64) as f64;
        Some(Self::renormalize(hi, lo))
    }
    fn from_u64(n: u64) -> Option<Self> {
        let hi = n as f64;
        let lo = n.wrapping_sub(hi as u64) as i64 as f64;
        Some(Self::renormalize(hi, lo))
    }
    fn from_f64(n: f64) -> Option<Self> {
        Some(DoubleDouble::from_f64(n))
    }
}

impl NumCast for DoubleDouble {
    fn from<N: ToPrimitive>(n: N) -> Option<Self> {
        n.to_f64().map(DoubleDouble::from_f64)
    }
}

impl Float for DoubleDouble {
    fn nan() -> Self {
        Self::from_f64(f64::NAN)
    }
    fn infinity() -> Self {
        Self::from_f64(f64::INFINITY)
    }
    fn neg_infinity() -> Self {
        Self::from_f64(f64::NEG_INFINITY)
    }
    fn neg_zero() -> Self {
        Self::from_f64(-0.0)
    }
    fn min_value() -> Self {
        Self::from_f64(f64::MIN)
    }
    fn min_positive_value() -> Self {
        Self::from_f64(f64::MIN_POSITIVE)
    }
    fn epsilon() -> Self {
        // 2^-104
        Self::from_f64(4.930_380_657_631_324e-32)
    }
    fn max_value() -> Self {
        Self::from_f64(f64::MAX)
    }
    fn is_nan(self) -> bool {
        self.hi.is_nan() || self.lo.is_nan()
    }
    fn is_infinite(self) -> bool {
        self.hi.is_infinite()
    }
    fn is_finite(self) -> bool {
        self.hi.is_finite() && self.lo.is_finite()
    }
    fn is_normal(self) -> bool {
        self.hi.is_normal()
    }
    fn classify(self) -> std::num::FpCategory {
        self.hi.classify()
    }
    fn floor(self) -> Self {
        let hi = self.hi.floor();
        if hi == self.hi {
            Self::renormalize(hi, self.lo.floor())
        } else {
            Self::from_f64(hi)
        }
    }
    fn ceil(self) -> Self {
        let hi = self.hi.ceil();
        if hi == self.hi {
            Self::renormalize(hi, self.lo.ceil())
        } else {
            Self::from_f64(hi)
        }
    }
    fn round(self) -> Self {
        let half = Self::from_f64(0.5);
        if self.hi >= 0.0 {
            (self + half).floor()
        } else {
            (self - half).ceil()
        }
    }
    fn trunc(self) -> Self {
        if self.hi >= 0.0 {
            self.floor()
        } else {
            self.ceil()
        }
    }
    fn fract(self) -> Self {
        self - self.trunc()
    }
    fn abs(self) -> Self {
        if self.hi < 0.0 || (self.hi == 0.0 && self.lo < 0.0) {
            -self
        } else {
            self
        }
    }
    fn signum(self) -> Self {
        Self::from_f64(self.hi.signum())
    }
    fn is_sign_positive(self) -> bool {
        self.hi.is_sign_positive()
    }
    fn is_sign_negative(self) -> bool {
        self.hi.is_sign_negative()
    }
    fn mul_add(self, a: Self, b: Self) -> Self {
        self * a + b
    }
    fn recip(self) -> Self {
        Self::one() / self
    }
    fn powi(self, n: i32) -> Self {
        let mut base = if n < 0 { self.recip() } else { self };
        let mut exp = n.unsigned_abs();
        let mut acc = Self::one();
        while exp > 0 {
            if exp & 1 == 1 {
                acc = acc * base;
            }
            base = base * base;
            exp >>= 1;
        }
        acc
    }
    fn powf(self, n: Self) -> Self {
        if n.lo == 0.0 && n.hi.fract() == 0.0 && n.hi.abs() <= i32::MAX as f64 {
            return self.powi(n.hi as i32);
        }
        (n * self.ln()).exp()
    }
    fn sqrt(self) -> Self {
        if self.hi <= 0.0 {
            return if self.hi == 0.0 {
                Self::zero()
            } else {
                Self::nan()
            };
        }
        // One Newton correction on the f64 root doubles the precision.
        let s = self.hi.sqrt();
        let residual = self - Self::from_f64(s) * Self::from_f64(s);
        Self::renormalize(s, residual.hi / (2.0 * s))
    }
    fn exp(self) -> Self {
        let e = self.hi.exp();
        Self::renormalize(e, e * self.lo)
    }
    fn exp2(self) -> Self {
        (self * Self::from_f64(std::f64::consts::LN_2)).exp()
    }
    fn ln(self) -> Self {
        Self::renormalize(self.hi.ln(), self.lo / self.hi)
    }
    fn log(self, base: Self) -> Self {
        self.ln() / base.ln()
    }
    fn log2(self) -> Self {
        self.ln() / Self::from_f64(std::f64::consts::LN_2)
    }
    fn log10(self) -> Self {
        self.ln() / Self::from_f64(std::f64::consts::LN_10)
    }
    fn max(self, other: Self) -> Self {
        if self.is_nan() || other > self {
            other
        } else {
            self
        }
    }
    fn min(self, other: Self) -> Self {
        if self.is_nan() || other < self {
            other
        } else {
            self
        }
    }
    fn abs_sub(self, other: Self) -> Self {
        if self > other {
            self - other
        } else {
            Self::zero()
        }
    }
    fn cbrt(self) -> Self {
        let c = self.hi.cbrt();
        if c == 0.0 || !c.is_finite() {
            return Self::from_f64(c);
        }
        let cc = Self::from_f64(c);
        let residual = self - cc * cc * cc;
        Self::renormalize(c, residual.hi / (3.0 * c * c))
    }
    fn hypot(self, other: Self) -> Self {
        (self * self + other * other).sqrt()
    }
    fn sin(self) -> Self {
        Self::renormalize(self.hi.sin(), self.lo * self.hi.cos())
    }
    fn cos(self) -> Self {
        Self::renormalize(self.hi.cos(), -self.lo * self.hi.sin())
    }
    fn tan(self) -> Self {
        self.sin() / self.cos()
    }
    fn asin(self) -> Self {
        Self::from_f64(self.to_f64().asin())
    }
    fn acos(self) -> Self {
        Self::from_f64(self.to_f64().acos())
    }
    fn atan(self) -> Self {
        Self::from_f64(self.to_f64().atan())
    }
    fn atan2(self, other: Self) -> Self {
        Self::from_f64(self.to_f64().atan2(other.to_f64()))
    }
    fn sin_cos(self) -> (Self, Self) {
        (self.sin(), self.cos())
    }
    fn exp_m1(self) -> Self {
        if self.hi.abs() < 1e-5 {
            // Taylor series to fourth order.
            let x = self;
            let x2 = x * x;
            x + x2.scale(0.5) + (x2 * x).scale(1.0 / 6.0) + (x2 * x2).scale(1.0 / 24.0)
        } else {
            self.exp() - Self::one()
        }
    }
    fn ln_1p(self) -> Self {
        (Self::one() + self).ln()
    }
    fn sinh(self) -> Self {
        (self.exp() - (-self).exp()).scale(0.5)
    }
    fn cosh(self) -> Self {
        (self.exp() + (-self).exp()).scale(0.5)
    }
    fn tanh(self) -> Self {
        self.sinh() / self.cosh()
    }
    fn asinh(self) -> Self {
        (self + (self * self + Self::one()).sqrt()).ln()
    }
    fn acosh(self) -> Self {
        (self + (self * self - Self::one()).sqrt()).ln()
    }
    fn atanh(self) -> Self {
        ((Self::one() + self) / (Self::one() - self)).ln().scale(0.5)
    }
    fn integer_decode(self) -> (u64, i16, i8) {
        self.hi.integer_decode()
    }
}

#[cfg(test)]
mod tests {
    use super::DoubleDouble;
    use num_traits::Float;

    #[test]
    fn addition_keeps_bits_lost_by_f64() {
        let big = DoubleDouble::from_f64(1.0);
        let tiny = DoubleDouble::from_f64(1e-20);
        let sum = big + tiny;
        assert_eq!(sum.hi, 1.0);
        assert!((sum.lo - 1e-20).abs() < 1e-36);
        let back = sum - big;
        assert!((back.to_f64() - 1e-20).abs() < 1e-36);
    }

    #[test]
    fn division_and_multiplication_round_trip() {
        let a = DoubleDouble::from_f64(1.0);
        let three = DoubleDouble::from_f64(3.0);
        let third = a / three;
        let restored = third * three;
        let err = (restored - a).abs();
        assert!(err.to_f64() < 1e-30, "error {err}");
    }

    #[test]
    fn sqrt_is_accurate_beyond_f64() {
        let two = DoubleDouble::from_f64(2.0);
        let root = two.sqrt();
        let err = (root * root - two).abs();
        assert!(err.to_f64() < 1e-30, "error {err}");
    }

    #[test]
    fn powi_matches_repeated_multiplication() {
        let x = DoubleDouble::from_f64(1.1);
        let cubed = x * x * x;
        assert!((x.powi(3) - cubed).abs().to_f64() < 1e-30);
        assert!((x.powi(-1) * x - DoubleDouble::from_f64(1.0)).abs().to_f64() < 1e-30);
    }

    #[test]
    fn ordering_uses_low_word() {
        let a = DoubleDouble::from_f64(1.0) + DoubleDouble::from_f64(1e-20);
        let b = DoubleDouble::from_f64(1.0);
        assert!(a > b);
        assert_eq!(a.max(b), a);
        assert_eq!(a.min(b), b);
    }

    #[test]
    fn non_finite_values_stay_clean() {
        let inf = DoubleDouble::from_f64(f64::MAX) * DoubleDouble::from_f64(2.0);
        assert!(inf.is_infinite());
        assert_eq!(inf.lo, 0.0);
        let nan = DoubleDouble::from_f64(-1.0).sqrt();
        assert!(nan.is_nan());
    }
}
