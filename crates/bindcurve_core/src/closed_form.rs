//! Exact equilibria for the four canonical binding topologies.
//!
//! Quadratic systems use the cancellation-free root. Cubic systems take their
//! roots from Cardano's formula and polish the physical one in double-double.

use crate::equilibrium::{regularize_kd, SolveError, SolverSettings};
use crate::error::BindingError;
use crate::precision::DoubleDouble;
use crate::traits::EquilibriumBackend;
use crate::types::{ParameterSchema, SpeciesMap};
use num_complex::Complex;
use num_traits::{Float, Zero};
use serde::{Deserialize, Serialize};

type DD = DoubleDouble;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClosedFormKind {
    /// `p + l <-> pl`
    OneToOne,
    /// `p + l <-> pl`, `p + i <-> pi`
    Competition,
    /// `p + p <-> pp`
    HomodimerFormation,
    /// `p + p <-> pp`, `p + i <-> pi`
    HomodimerBreaking,
}

impl ClosedFormKind {
    pub fn schema(self) -> ParameterSchema {
        let names = |v: &[&str]| v.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        match self {
            ClosedFormKind::OneToOne => ParameterSchema::new(names(&["p", "l"]), names(&["kdpl"])),
            ClosedFormKind::Competition => {
                ParameterSchema::new(names(&["p", "l", "i"]), names(&["kdpl", "kdpi"]))
            }
            ClosedFormKind::HomodimerFormation => {
                ParameterSchema::new(names(&["p"]), names(&["kdpp"]))
            }
            ClosedFormKind::HomodimerBreaking => {
                ParameterSchema::new(names(&["p", "i"]), names(&["kdpp", "kdpi"]))
            }
        }
    }

    pub fn default_readout(self) -> &'static str {
        match self {
            ClosedFormKind::OneToOne | ClosedFormKind::Competition => "pl",
            ClosedFormKind::HomodimerFormation | ClosedFormKind::HomodimerBreaking => "pp",
        }
    }

    pub fn species(self) -> &'static [&'static str] {
        match self {
            ClosedFormKind::OneToOne => &["p_f", "l_f", "pl"],
            ClosedFormKind::Competition => &["p_f", "l_f", "i_f", "pl", "pi"],
            ClosedFormKind::HomodimerFormation => &["p_f", "pp"],
            ClosedFormKind::HomodimerBreaking => &["p_f", "i_f", "pp", "pi"],
        }
    }

    fn is_cubic(self) -> bool {
        matches!(
            self,
            ClosedFormKind::Competition | ClosedFormKind::HomodimerBreaking
        )
    }
}

#[derive(Debug, Clone)]
pub struct ClosedFormSystem {
    kind: ClosedFormKind,
    schema: ParameterSchema,
    kd_floor: f64,
}

impl ClosedFormSystem {
    pub fn new(kind: ClosedFormKind) -> Self {
        Self::with_settings(kind, &SolverSettings::default())
    }

    /// Uses the `kd_floor` of `settings`, matching the compiled solver.
    pub fn with_settings(kind: ClosedFormKind, settings: &SolverSettings) -> Self {
        Self {
            kind,
            schema: kind.schema(),
            kd_floor: settings.kd_floor,
        }
    }

    pub fn kind(&self) -> ClosedFormKind {
        self.kind
    }

    fn prepare(&self, args: &[f64]) -> Result<Vec<f64>, BindingError> {
        if args.len() != self.schema.len() {
            return Err(SolveError::DimensionMismatch {
                expected: self.schema.len(),
                found: args.len(),
            }
            .into());
        }
        args.iter()
            .zip(self.schema.names())
            .enumerate()
            .map(|(i, (&value, name))| {
                if !value.is_finite() || value < 0.0 {
                    return Err(BindingError::InvalidParameter {
                        name: name.to_string(),
                        value,
                    });
                }
                Ok(if self.schema.is_kd(i) {
                    regularize_kd(value, self.kd_floor)
                } else {
                    value
                })
            })
            .collect()
    }
}

impl EquilibriumBackend for ClosedFormSystem {
    fn schema(&self) -> &ParameterSchema {
        &self.schema
    }

    fn default_readout(&self) -> &str {
        self.kind.default_readout()
    }

    fn is_analytical(&self) -> bool {
        true
    }

    fn num_solutions(&self) -> usize {
        if self.kind.is_cubic() {
            2
        } else {
            1
        }
    }

    fn species(&self) -> Vec<String> {
        self.kind.species().iter().map(|s| s.to_string()).collect()
    }

    /// Ligand total for the heterodimer systems, half the protein total for
    /// the homodimer systems. A `pi` readout is bounded by the inhibitor.
    fn normalizer(&self, readout: &str, args: &[f64]) -> f64 {
        let arg = |i: usize| args.get(i).copied().unwrap_or(0.0);
        match (self.kind, readout) {
            (ClosedFormKind::Competition, "pi") => arg(2),
            (ClosedFormKind::HomodimerBreaking, "pi") => arg(1),
            (ClosedFormKind::OneToOne | ClosedFormKind::Competition, _) => arg(1),
            (ClosedFormKind::HomodimerFormation | ClosedFormKind::HomodimerBreaking, _) => {
                arg(0) / 2.0
            }
        }
    }

    fn equilibrate(&self, args: &[f64]) -> Result<Vec<SpeciesMap>, BindingError> {
        let a = self.prepare(args)?;
        Ok(match self.kind {
            ClosedFormKind::OneToOne => vec![one_to_one(a[0], a[1], a[2])],
            ClosedFormKind::HomodimerFormation => vec![homodimer_formation(a[0], a[1])],
            ClosedFormKind::Competition => competition(a[0], a[1], a[2], a[3], a[4]),
            ClosedFormKind::HomodimerBreaking => homodimer_breaking(a[0], a[1], a[2], a[3]),
        })
    }
}

fn species_map(entries: &[(&str, DD)]) -> SpeciesMap {
    let mut map = SpeciesMap::with_capacity(entries.len());
    for &(name, value) in entries {
        map.insert(name, value.to_f64());
    }
    map
}

/// `pl = 2·p·l / (s + √((p−l)² + kd·(2(p+l) + kd)))` with `s = p + l + kd`.
pub fn one_to_one(p: f64, l: f64, kdpl: f64) -> SpeciesMap {
    let (p, l, kd) = (DD::from_f64(p), DD::from_f64(l), DD::from_f64(kdpl));
    let two = DD::from_f64(2.0);
    let s = p + l + kd;
    let diff = p - l;
    let disc = diff * diff + kd * (two * (p + l) + kd);
    let denom = s + disc.sqrt();
    let pl = if denom > DD::ZERO {
        two * p * l / denom
    } else {
        DD::ZERO
    };
    species_map(&[("p_f", p - pl), ("l_f", l - pl), ("pl", pl)])
}

/// `p_f = 2·p·kd / (kd + √(kd² + 8·p·kd))`, `pp = p_f² / kd`.
pub fn homodimer_formation(p: f64, kdpp: f64) -> SpeciesMap {
    let (p, kd) = (DD::from_f64(p), DD::from_f64(kdpp));
    let denom = kd + (kd * kd + DD::from_f64(8.0) * p * kd).sqrt();
    let free = if denom > DD::ZERO {
        DD::from_f64(2.0) * p * kd / denom
    } else {
        DD::ZERO
    };
    species_map(&[("p_f", free), ("pp", free * free / kd)])
}

/// Free protein solves
/// `x³ + (kdpl+kdpi+l+i−p)x² + (kdpl·kdpi + l·kdpi + i·kdpl − p·kdpl − p·kdpi)x − p·kdpl·kdpi = 0`.
pub fn competition(p: f64, l: f64, i: f64, kdpl: f64, kdpi: f64) -> Vec<SpeciesMap> {
    let coefficients = [
        1.0,
        kdpl + kdpi + l + i - p,
        kdpl * kdpi + l * kdpi + i * kdpl - p * kdpl - p * kdpi,
        -p * kdpl * kdpi,
    ];
    let (l, i, kdpl, kdpi) = (
        DD::from_f64(l),
        DD::from_f64(i),
        DD::from_f64(kdpl),
        DD::from_f64(kdpi),
    );
    let exact = cubic_in_dd(p, l, i, kdpl, kdpi, CubicSystem::Competition);
    let back_substitute = |x: DD| {
        let pl = l * x / (kdpl + x);
        let pi = i * x / (kdpi + x);
        species_map(&[
            ("p_f", x),
            ("l_f", l - pl),
            ("i_f", i - pi),
            ("pl", pl),
            ("pi", pi),
        ])
    };
    branches(p, &coefficients, exact, back_substitute)
}

/// Free protein solves
/// `2x³ + (kdpp + 2·kdpi)x² + kdpp·(kdpi + i − p)x − p·kdpp·kdpi = 0`.
pub fn homodimer_breaking(p: f64, i: f64, kdpp: f64, kdpi: f64) -> Vec<SpeciesMap> {
    let coefficients = [
        2.0,
        kdpp + 2.0 * kdpi,
        kdpp * (kdpi + i - p),
        -p * kdpp * kdpi,
    ];
    let (i, kdpp, kdpi) = (DD::from_f64(i), DD::from_f64(kdpp), DD::from_f64(kdpi));
    let exact = cubic_in_dd(p, DD::ZERO, i, kdpp, kdpi, CubicSystem::Breaking);
    let back_substitute = |x: DD| {
        let pi = i * x / (kdpi + x);
        species_map(&[
            ("p_f", x),
            ("i_f", i - pi),
            ("pp", x * x / kdpp),
            ("pi", pi),
        ])
    };
    branches(p, &coefficients, exact, back_substitute)
}

#[derive(Clone, Copy)]
enum CubicSystem {
    Competition,
    Breaking,
}

/// The cubic of either system with coefficients formed in double-double.
fn cubic_in_dd(p: f64, l: DD, i: DD, k1: DD, k2: DD, system: CubicSystem) -> [DD; 4] {
    let p = DD::from_f64(p);
    match system {
        CubicSystem::Competition => [
            DD::from_f64(1.0),
            k1 + k2 + l + i - p,
            k1 * k2 + l * k2 + i * k1 - p * k1 - p * k2,
            -(p * k1 * k2),
        ],
        CubicSystem::Breaking => {
            let two = DD::from_f64(2.0);
            [two, k1 + two * k2, k1 * (k2 + i - p), -(p * k1 * k2)]
        }
    }
}

/// Physical branch first, then the largest remaining real root if any.
fn branches(
    p: f64,
    coefficients: &[f64; 4],
    exact: [DD; 4],
    back_substitute: impl Fn(DD) -> SpeciesMap,
) -> Vec<SpeciesMap> {
    let roots = cubic_roots(coefficients);
    let physical = polish_root(&exact, p, &roots);
    let mut out = vec![back_substitute(physical)];

    let scale = 1.0 + p.abs();
    let nearest = roots
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| {
            let da = (*a - Complex::new(physical.to_f64(), 0.0)).norm();
            let db = (*b - Complex::new(physical.to_f64(), 0.0)).norm();
            da.total_cmp(&db)
        })
        .map(|(idx, _)| idx);
    let other = roots
        .iter()
        .enumerate()
        .filter(|(idx, r)| Some(*idx) != nearest && r.im.abs() <= 1e-7 * (scale + r.re.abs()))
        .map(|(_, r)| r.re)
        .fold(None, |best: Option<f64>, re| Some(best.map_or(re, |b| b.max(re))));
    if let Some(root) = other {
        out.push(back_substitute(DD::from_f64(root)));
    }
    out
}

/// Roots of `a·x³ + b·x² + c·x + d` by Cardano's formula in complex arithmetic.
pub fn cubic_roots(coefficients: &[f64; 4]) -> [Complex<f64>; 3] {
    let [a, b, c, d] = *coefficients;
    let (b, c, d) = (b / a, c / a, d / a);
    let shift = b / 3.0;
    // Depressed cubic t³ + p·t + q with x = t − b/3.
    let p = c - b * b / 3.0;
    let q = 2.0 * b * b * b / 27.0 - b * c / 3.0 + d;

    let sqrt_disc = Complex::new(q * q / 4.0 + p * p * p / 27.0, 0.0).sqrt();
    let half_q = Complex::new(-q / 2.0, 0.0);
    let mut u = (half_q + sqrt_disc).powf(1.0 / 3.0);
    if u.norm() < 1e-300 {
        u = (half_q - sqrt_disc).powf(1.0 / 3.0);
    }

    let omega = Complex::new(-0.5, 3f64.sqrt() / 2.0);
    let mut roots = [Complex::new(0.0, 0.0); 3];
    let mut rotated = u;
    for root in roots.iter_mut() {
        let t = if rotated.norm() < 1e-300 {
            Complex::new(0.0, 0.0)
        } else {
            rotated - p / (3.0 * rotated)
        };
        *root = t - shift;
        rotated *= omega;
    }
    roots
}

/// Bracketed Newton on `[0, p]`, where the cubic changes sign.
fn polish_root(exact: &[DD; 4], p: f64, roots: &[Complex<f64>; 3]) -> DD {
    if p <= 0.0 {
        return DD::ZERO;
    }
    let eval = |x: DD| {
        let value = ((exact[0] * x + exact[1]) * x + exact[2]) * x + exact[3];
        let three = DD::from_f64(3.0);
        let two = DD::from_f64(2.0);
        let slope = (three * exact[0] * x + two * exact[1]) * x + exact[2];
        (value, slope)
    };

    let mut lo = DD::ZERO;
    let mut hi = DD::from_f64(p);
    let start = roots
        .iter()
        .filter(|r| r.re > 0.0 && r.re <= p)
        .min_by(|a, b| a.im.abs().total_cmp(&b.im.abs()))
        .map_or(0.5 * p, |r| r.re);
    let mut x = DD::from_f64(start);

    for _ in 0..200 {
        let (value, slope) = eval(x);
        if value.is_zero() {
            return x;
        }
        if value < DD::ZERO {
            lo = x;
        } else {
            hi = x;
        }
        let mut next = x - value / slope;
        if !(next > lo && next < hi) {
            next = (lo + hi) * DD::from_f64(0.5);
        }
        let step = (next - x).abs();
        x = next;
        if step <= DD::from_f64(1e-30) * x.abs() || hi - lo <= DD::from_f64(1e-30) * hi {
            break;
        }
    }
    x
}
