use crate::traits::{DynamicalSystem, Objective};
use nalgebra::DMatrix;
use num_traits::{Float, FromPrimitive, Num, NumCast, One, ToPrimitive, Zero};
use std::ops::{Add, Div, Mul, Neg, Rem, Sub};

/// Dual number for forward-mode differentiation.
/// val: real part
/// eps: derivative along the seeded direction
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct Dual {
    pub val: f64,
    pub eps: f64,
}

impl Dual {
    pub fn new(val: f64, eps: f64) -> Self {
        Self { val, eps }
    }

    pub fn constant(val: f64) -> Self {
        Self::new(val, 0.0)
    }

    /// Applies the chain rule for a unary function with value `f` and derivative `df`.
    #[inline]
    fn chain(self, f: f64, df: f64) -> Self {
        Self::new(f, df * self.eps)
    }
}

/// Jacobian of `system` at `x`, one forward pass per column.
pub fn jacobian<S>(system: &S, x: &[f64]) -> DMatrix<f64>
where
    S: DynamicalSystem<Dual> + ?Sized,
{
    let n = x.len();
    let m = system.dimension();
    let mut jac = DMatrix::zeros(m, n);
    let mut seeded: Vec<Dual> = x.iter().map(|&v| Dual::constant(v)).collect();
    let mut out = vec![Dual::constant(0.0); m];
    for j in 0..n {
        seeded[j].eps = 1.0;
        system.apply(Dual::constant(0.0), &seeded, &mut out);
        for i in 0..m {
            jac[(i, j)] = out[i].eps;
        }
        seeded[j].eps = 0.0;
    }
    jac
}

/// Gradient of a scalar objective at `x`.
pub fn gradient<F>(objective: &F, x: &[f64]) -> Vec<f64>
where
    F: Objective<Dual> + ?Sized,
{
    let mut seeded: Vec<Dual> = x.iter().map(|&v| Dual::constant(v)).collect();
    let mut grad = vec![0.0; x.len()];
    for j in 0..x.len() {
        seeded[j].eps = 1.0;
        grad[j] = objective.value(&seeded).eps;
        seeded[j].eps = 0.0;
    }
    grad
}

impl Zero for Dual {
    fn zero() -> Self {
        Self::constant(0.0)
    }
    fn is_zero(&self) -> bool {
        self.val == 0.0 && self.eps == 0.0
    }
}

impl One for Dual {
    fn one() -> Self {
        Self::constant(1.0)
    }
}

impl Add for Dual {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Self::new(self.val + rhs.val, self.eps + rhs.eps)
    }
}

impl Sub for Dual {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        Self::new(self.val - rhs.val, self.eps - rhs.eps)
    }
}

impl Mul for Dual {
    type Output = Self;
    fn mul(self, rhs: Self) -> Self {
        Self::new(self.val * rhs.val, self.val * rhs.eps + self.eps * rhs.val)
    }
}

impl Div for Dual {
    type Output = Self;
    fn div(self, rhs: Self) -> Self {
        let q = self.val / rhs.val;
        Self::new(q, (self.eps - q * rhs.eps) / rhs.val)
    }
}

impl Neg for Dual {
    type Output = Self;
    fn neg(self) -> Self {
        Self::new(-self.val, -self.eps)
    }
}

impl Rem for Dual {
    type Output = Self;
    fn rem(self, rhs: Self) -> Self {
        // d/dx (x mod c) = 1 almost everywhere.
        Self::new(self.val % rhs.val, self.eps)
    }
}

impl_assign_ops!(Dual);

impl Num for Dual {
    type FromStrRadixErr = num_traits::ParseFloatError;
    fn from_str_radix(s: &str, radix: u32) -> Result<Self, Self::FromStrRadixErr> {
        f64::from_str_radix(s, radix).map(Self::constant)
    }
}

impl ToPrimitive for Dual {
    fn to_i64(&self) -> Option<i64> {
        self.val.to_i64()
    }
    fn to_u64(&self) -> Option<u64> {
        self.val.to_u64()
    }
    fn to_f64(&self) -> Option<f64> {
        Some(self.val)
    }
}

impl FromPrimitive for Dual {
    fn from_i64(n: i64) -> Option<Self> {
        Some(Self::constant(n as f64))
    }
    fn from_u64(n: u64) -> Option<Self> {
        Some(Self::constant(n as f64))
    }
    fn from_f64(n: f64) -> Option<Self> {
        Some(Self::constant(n))
    }
}

impl NumCast for Dual {
    fn from<T: ToPrimitive>(n: T) -> Option<Self> {
        n.to_f64().map(Self::constant)
    }
}

impl Float for Dual {
    fn nan() -> Self {
        Self::constant(f64::NAN)
    }
    fn infinity() -> Self {
        Self::constant(f64::INFINITY)
    }
    fn neg_infinity() -> Self {
        Self::constant(f64::NEG_INFINITY)
    }
    fn neg_zero() -> Self {
        Self::new(-0.0, -0.0)
    }
    fn min_value() -> Self {
        Self::constant(f64::MIN)
    }
    fn min_positive_value() -> Self {
        Self::constant(f64::MIN_POSITIVE)
    }
    fn max_value() -> Self {
        Self::constant(f64::MAX)
    }
    fn is_nan(self) -> bool {
        self.val.is_nan()
    }
    fn is_infinite(self) -> bool {
        self.val.is_infinite()
    }
    fn is_finite(self) -> bool {
        self.val.is_finite()
    }
    fn is_normal(self) -> bool {
        self.val.is_normal()
    }
    fn classify(self) -> std::num::FpCategory {
        self.val.classify()
    }
    fn floor(self) -> Self {
        Self::constant(self.val.floor())
    }
    fn ceil(self) -> Self {
        Self::constant(self.val.ceil())
    }
    fn round(self) -> Self {
        Self::constant(self.val.round())
    }
    fn trunc(self) -> Self {
        Self::constant(self.val.trunc())
    }
    fn fract(self) -> Self {
        Self::new(self.val.fract(), self.eps)
    }
    fn abs(self) -> Self {
        if self.val < 0.0 {
            -self
        } else {
            self
        }
    }
    fn signum(self) -> Self {
        Self::constant(self.val.signum())
    }
    fn is_sign_positive(self) -> bool {
        self.val.is_sign_positive()
    }
    fn is_sign_negative(self) -> bool {
        self.val.is_sign_negative()
    }
    fn mul_add(self, a: Self, b: Self) -> Self {
        self * a + b
    }
    fn recip(self) -> Self {
        let r = 1.0 / self.val;
        self.chain(r, -r * r)
    }
    fn powi(self, n: i32) -> Self {
        if n == 0 {
            return Self::one();
        }
        self.chain(self.val.powi(n), n as f64 * self.val.powi(n - 1))
    }
    fn powf(self, n: Self) -> Self {
        let value = self.val.powf(n.val);
        let mut eps = n.val * self.val.powf(n.val - 1.0) * self.eps;
        if n.eps != 0.0 {
            eps += value * self.val.ln() * n.eps;
        }
        Self::new(value, eps)
    }
    fn sqrt(self) -> Self {
        let s = self.val.sqrt();
        self.chain(s, 0.5 / s)
    }
    fn exp(self) -> Self {
        let e = self.val.exp();
        self.chain(e, e)
    }
    fn exp2(self) -> Self {
        let e = self.val.exp2();
        self.chain(e, e * std::f64::consts::LN_2)
    }
    fn ln(self) -> Self {
        self.chain(self.val.ln(), 1.0 / self.val)
    }
    fn log(self, base: Self) -> Self {
        self.ln() / base.ln()
    }
    fn log2(self) -> Self {
        self.chain(self.val.log2(), 1.0 / (self.val * std::f64::consts::LN_2))
    }
    fn log10(self) -> Self {
        self.chain(self.val.log10(), 1.0 / (self.val * std::f64::consts::LN_10))
    }
    fn max(self, other: Self) -> Self {
        if other.val > self.val {
            other
        } else {
            self
        }
    }
    fn min(self, other: Self) -> Self {
        if other.val < self.val {
            other
        } else {
            self
        }
    }
    fn abs_sub(self, other: Self) -> Self {
        if self.val > other.val {
            self - other
        } else {
            Self::zero()
        }
    }
    fn cbrt(self) -> Self {
        let c = self.val.cbrt();
        self.chain(c, 1.0 / (3.0 * c * c))
    }
    fn hypot(self, other: Self) -> Self {
        (self * self + other * other).sqrt()
    }
    fn sin(self) -> Self {
        self.chain(self.val.sin(), self.val.cos())
    }
    fn cos(self) -> Self {
        self.chain(self.val.cos(), -self.val.sin())
    }
    fn tan(self) -> Self {
        let t = self.val.tan();
        self.chain(t, 1.0 + t * t)
    }
    fn asin(self) -> Self {
        self.chain(self.val.asin(), 1.0 / (1.0 - self.val * self.val).sqrt())
    }
    fn acos(self) -> Self {
        self.chain(self.val.acos(), -1.0 / (1.0 - self.val * self.val).sqrt())
    }
    fn atan(self) -> Self {
        self.chain(self.val.atan(), 1.0 / (1.0 + self.val * self.val))
    }
    fn atan2(self, other: Self) -> Self {
        let denom = self.val * self.val + other.val * other.val;
        Self::new(
            self.val.atan2(other.val),
            (other.val * self.eps - self.val * other.eps) / denom,
        )
    }
    fn sin_cos(self) -> (Self, Self) {
        (self.sin(), self.cos())
    }
    fn exp_m1(self) -> Self {
        self.chain(self.val.exp_m1(), self.val.exp())
    }
    fn ln_1p(self) -> Self {
        self.chain(self.val.ln_1p(), 1.0 / (1.0 + self.val))
    }
    fn sinh(self) -> Self {
        self.chain(self.val.sinh(), self.val.cosh())
    }
    fn cosh(self) -> Self {
        self.chain(self.val.cosh(), self.val.sinh())
    }
    fn tanh(self) -> Self {
        let t = self.val.tanh();
        self.chain(t, 1.0 - t * t)
    }
    fn asinh(self) -> Self {
        self.chain(self.val.asinh(), 1.0 / (self.val * self.val + 1.0).sqrt())
    }
    fn acosh(self) -> Self {
        self.chain(self.val.acosh(), 1.0 / (self.val * self.val - 1.0).sqrt())
    }
    fn atanh(self) -> Self {
        self.chain(self.val.atanh(), 1.0 / (1.0 - self.val * self.val))
    }
    fn integer_decode(self) -> (u64, i16, i8) {
        self.val.integer_decode()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Quadratic;

    impl DynamicalSystem<Dual> for Quadratic {
        fn dimension(&self) -> usize {
            2
        }

        fn apply(&self, _t: Dual, x: &[Dual], out: &mut [Dual]) {
            out[0] = x[0] * x[1];
            out[1] = x[0] * x[0] / x[1];
        }
    }

    impl Objective<Dual> for Quadratic {
        fn value(&self, x: &[Dual]) -> Dual {
            x[0] * x[0] + x[1].sqrt()
        }
    }

    #[test]
    fn jacobian_matches_hand_derivatives() {
        let jac = jacobian(&Quadratic, &[3.0, 2.0]);
        assert!((jac[(0, 0)] - 2.0).abs() < 1e-14);
        assert!((jac[(0, 1)] - 3.0).abs() < 1e-14);
        assert!((jac[(1, 0)] - 3.0).abs() < 1e-14);
        assert!((jac[(1, 1)] + 2.25).abs() < 1e-14);
    }

    #[test]
    fn gradient_matches_hand_derivatives() {
        let grad = gradient(&Quadratic, &[3.0, 4.0]);
        assert!((grad[0] - 6.0).abs() < 1e-14);
        assert!((grad[1] - 0.25).abs() < 1e-14);
    }

    #[test]
    fn transcendental_derivatives_are_consistent() {
        let x = Dual::new(0.3, 1.0);
        assert!((x.atan().eps - 1.0 / 1.09).abs() < 1e-12);
        assert!((x.ln_1p().eps - 1.0 / 1.3).abs() < 1e-12);
        assert!((x.cbrt().eps - 1.0 / (3.0 * 0.3f64.cbrt().powi(2))).abs() < 1e-12);
        assert!((x.powi(3).eps - 3.0 * 0.09).abs() < 1e-12);
    }
}
