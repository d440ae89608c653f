use crate::autodiff::{self, Dual};
use crate::precision::DoubleDouble;
use crate::traits::{DynamicalSystem, Objective};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, trace};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SolveError {
    #[error("no equilibrium found after {iterations} iterations (relative residual {residual:e})")]
    NonConvergence { iterations: usize, residual: f64 },

    #[error("invalid value {value} for '{name}'")]
    InvalidParameter { name: String, value: f64 },

    #[error("expected {expected} arguments, got {found}")]
    DimensionMismatch { expected: usize, found: usize },

    #[error("invalid solver settings: {0}")]
    InvalidSettings(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SolverSettings {
    pub max_steps: usize,
    /// Convergence threshold on `max_i |F_i| / total_i`.
    pub tolerance: f64,
    /// Dissociation constants with magnitude at or below this are shifted up by it.
    pub kd_floor: f64,
    /// Largest change of `ln x_i` allowed in one Newton step.
    pub max_log_step: f64,
}

impl Default for SolverSettings {
    fn default() -> Self {
        Self {
            max_steps: 500,
            tolerance: 1e-10,
            kd_floor: 1e-10,
            max_log_step: 1e4_f64.ln(),
        }
    }
}

impl SolverSettings {
    pub fn validate(&self) -> Result<(), SolveError> {
        if self.max_steps == 0 {
            return Err(SolveError::InvalidSettings(
                "max_steps must be greater than zero".into(),
            ));
        }
        if !(self.tolerance > 0.0) {
            return Err(SolveError::InvalidSettings("tolerance must be positive".into()));
        }
        if !(self.kd_floor >= 0.0) {
            return Err(SolveError::InvalidSettings("kd_floor must be non-negative".into()));
        }
        if !(self.max_log_step > 0.0) {
            return Err(SolveError::InvalidSettings("max_log_step must be positive".into()));
        }
        Ok(())
    }
}

/// Shifts a near-zero dissociation constant away from the singular limit.
pub fn regularize_kd(kd: f64, floor: f64) -> f64 {
    if kd.abs() <= floor {
        trace!(kd, floor, "regularizing dissociation constant");
        kd + floor
    } else {
        kd
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EquilibriumSolution {
    /// Free concentration of each fundamental species.
    pub free: Vec<f64>,
    /// Lagrange multipliers of the conservation constraints, when solved for.
    pub multipliers: Option<Vec<f64>>,
    pub iterations: usize,
    /// Final `max_i |F_i| / total_i`.
    pub residual: f64,
    /// Number of coordinate bisection sweeps used when Newton stalled.
    pub fallback_sweeps: usize,
}

const LINE_SEARCH_HALVINGS: usize = 40;
const ARMIJO: f64 = 1e-4;
const BISECTION_STEPS: usize = 400;
const LAGRANGE_FD_STEP: f64 = 1e-6;

/// Solves `F(x) = 0` for the free concentrations of a conservation system.
///
/// `residual` evaluates `F` in double-double precision, `tangent` provides the
/// Jacobian through dual numbers. Both must describe the same system, with
/// `F_i = total_i - (x_i + bound_i(x))`. Iteration runs in `u = ln x`, seeded
/// by a single Newton step from `x = 0`. Species with a zero total are pinned
/// at zero.
pub fn solve_direct<S, D>(
    residual: &S,
    tangent: &D,
    totals: &[f64],
    settings: &SolverSettings,
) -> Result<EquilibriumSolution, SolveError>
where
    S: DynamicalSystem<DoubleDouble> + ?Sized,
    D: DynamicalSystem<Dual> + ?Sized,
{
    let mut state = Workspace::new(residual, totals, settings)?;
    if state.active.is_empty() {
        return Ok(state.finish(0, 0.0, None));
    }
    state.seed(tangent);

    for iteration in 0..settings.max_steps {
        let residual_max = state.max_relative();
        if residual_max <= settings.tolerance {
            debug!(iteration, residual = residual_max, "equilibrium converged");
            return Ok(state.finish(iteration, residual_max, None));
        }

        let scaled = state.scaled_jacobian(tangent);
        let rhs = DVector::from_iterator(
            state.active.len(),
            state.active.iter().map(|&i| state.relative(i)),
        );
        let direction = scaled.lu().solve(&rhs).map(|d| -d);
        if !state.advance(direction.as_ref().map(|d| d.as_slice())) {
            state.sweep();
        }
    }

    Err(SolveError::NonConvergence {
        iterations: settings.max_steps,
        residual: state.max_relative(),
    })
}

/// Finds the stationary point of `L = R(x) - Σ μ_i F_i(x) / total_i`, where
/// `R` is the readout objective of `model`.
///
/// Newton runs jointly over `(ln x, μ)` with the bordered matrix
/// `[[H, -Âᵀ], [-Â, 0]]`, `Â` being the row/column scaled Jacobian and `H` a
/// central difference of the gradient in `ln x`. The multipliers are
/// recomputed exactly from the converged point.
pub fn solve_lagrangian<S, D>(
    residual: &S,
    model: &D,
    totals: &[f64],
    settings: &SolverSettings,
) -> Result<EquilibriumSolution, SolveError>
where
    S: DynamicalSystem<DoubleDouble> + ?Sized,
    D: DynamicalSystem<Dual> + Objective<Dual> + ?Sized,
{
    let mut state = Workspace::new(residual, totals, settings)?;
    if state.active.is_empty() {
        return Ok(state.finish(0, 0.0, Some(vec![0.0; totals.len()])));
    }
    state.seed(model);
    let m = state.active.len();
    let mut mu = vec![0.0; m];

    for iteration in 0..settings.max_steps {
        let residual_max = state.max_relative();
        if residual_max <= settings.tolerance {
            let multipliers = state.recover_multipliers(model);
            debug!(iteration, residual = residual_max, "lagrangian stationary point found");
            return Ok(state.finish(iteration, residual_max, multipliers));
        }

        let scaled = state.scaled_jacobian(model);
        let grad = state.lagrangian_gradient(model, &state.x, &mu);
        let hessian = state.lagrangian_hessian(model, &mu);

        let mut kkt: DMatrix<f64> = DMatrix::zeros(2 * m, 2 * m);
        kkt.view_mut((0, 0), (m, m)).copy_from(&hessian);
        kkt.view_mut((0, m), (m, m)).copy_from(&(-scaled.transpose()));
        kkt.view_mut((m, 0), (m, m)).copy_from(&(-scaled.clone()));
        let mut rhs: DVector<f64> = DVector::zeros(2 * m);
        for a in 0..m {
            rhs[a] = -grad[a];
            rhs[m + a] = state.relative(state.active[a]);
        }

        let Some(step) = kkt.lu().solve(&rhs) else {
            state.sweep();
            continue;
        };
        let du: Vec<f64> = step.rows(0, m).iter().copied().collect();
        match state.line_search(&du) {
            Some(lambda) => {
                for (a, value) in mu.iter_mut().enumerate() {
                    *value += lambda * step[m + a];
                }
            }
            None => state.sweep(),
        }
    }

    Err(SolveError::NonConvergence {
        iterations: settings.max_steps,
        residual: state.max_relative(),
    })
}

/// Iterate state shared by both strategies.
struct Workspace<'a, S: ?Sized> {
    residual: &'a S,
    totals: &'a [f64],
    settings: &'a SolverSettings,
    /// Indices with a positive total.
    active: Vec<usize>,
    x: Vec<f64>,
    f: Vec<DoubleDouble>,
    sweeps: usize,
}

impl<'a, S> Workspace<'a, S>
where
    S: DynamicalSystem<DoubleDouble> + ?Sized,
{
    fn new(
        residual: &'a S,
        totals: &'a [f64],
        settings: &'a SolverSettings,
    ) -> Result<Self, SolveError> {
        settings.validate()?;
        let n = residual.dimension();
        if totals.len() != n {
            return Err(SolveError::DimensionMismatch {
                expected: n,
                found: totals.len(),
            });
        }
        for (i, &total) in totals.iter().enumerate() {
            if !total.is_finite() || total < 0.0 {
                return Err(SolveError::InvalidParameter {
                    name: format!("total[{i}]"),
                    value: total,
                });
            }
        }
        let active = (0..n).filter(|&i| totals[i] > 0.0).collect();
        let mut ws = Self {
            residual,
            totals,
            settings,
            active,
            x: vec![0.0; n],
            f: vec![DoubleDouble::ZERO; n],
            sweeps: 0,
        };
        ws.refresh();
        Ok(ws)
    }

    fn refresh(&mut self) {
        evaluate(self.residual, &self.x, &mut self.f);
    }

    fn relative(&self, i: usize) -> f64 {
        self.f[i].to_f64() / self.totals[i]
    }

    fn max_relative(&self) -> f64 {
        self.active
            .iter()
            .map(|&i| self.relative(i).abs())
            .fold(0.0, |acc, v| if v.is_nan() || acc.is_nan() { f64::NAN } else { acc.max(v) })
    }

    fn merit(&self, f: &[DoubleDouble]) -> f64 {
        self.active
            .iter()
            .map(|&i| {
                let r = f[i].to_f64() / self.totals[i];
                r * r
            })
            .sum()
    }

    /// Newton step from the origin, where the Jacobian is `-I`, clamped into `(0, total]`.
    fn seed<D: DynamicalSystem<Dual> + ?Sized>(&mut self, tangent: &D) {
        let jac = autodiff::jacobian(tangent, &self.x);
        let rhs = DVector::from_iterator(self.f.len(), self.f.iter().map(|&v| -v.to_f64()));
        let step = jac.lu().solve(&rhs);
        for &i in &self.active {
            let total = self.totals[i];
            let guess = step.as_ref().map_or(total, |s| s[i]);
            self.x[i] = if guess > 0.0 && guess <= total { guess } else { total };
        }
        self.refresh();
    }

    /// `Â[a][b] = J[i][j] * x_j / total_i` over the active indices.
    fn scaled_jacobian<D: DynamicalSystem<Dual> + ?Sized>(&self, tangent: &D) -> DMatrix<f64> {
        let jac = autodiff::jacobian(tangent, &self.x);
        let m = self.active.len();
        DMatrix::from_fn(m, m, |a, b| {
            let (i, j) = (self.active[a], self.active[b]);
            jac[(i, j)] * self.x[j] / self.totals[i]
        })
    }

    /// Applies a log-space step `du` with backtracking, falling back to false
    /// when the direction is unusable or no step reduces the merit.
    fn advance(&mut self, du: Option<&[f64]>) -> bool {
        match du {
            Some(du) => self.line_search(du).is_some(),
            None => false,
        }
    }

    /// Returns the accepted step fraction.
    fn line_search(&mut self, du: &[f64]) -> Option<f64> {
        let largest = du.iter().fold(0.0_f64, |acc, v| acc.max(v.abs()));
        if !largest.is_finite() {
            return None;
        }
        let current = self.merit(&self.f);
        let mut lambda = if largest > 0.0 {
            (self.settings.max_log_step / largest).min(1.0)
        } else {
            1.0
        };

        let mut trial = self.x.clone();
        let mut f_trial = vec![DoubleDouble::ZERO; self.f.len()];
        for _ in 0..LINE_SEARCH_HALVINGS {
            for (a, &i) in self.active.iter().enumerate() {
                trial[i] = self.x[i] * (lambda * du[a]).exp();
            }
            evaluate(self.residual, &trial, &mut f_trial);
            let merit = self.merit(&f_trial);
            if merit.is_finite() && merit <= current * (1.0 - ARMIJO * lambda) {
                self.x.copy_from_slice(&trial);
                self.f.copy_from_slice(&f_trial);
                return Some(lambda);
            }
            lambda *= 0.5;
        }
        None
    }

    /// One Gauss-Seidel pass of geometric bisection on each active coordinate.
    ///
    /// Each `F_i` decreases monotonically in `x_i`, so the root is bracketed
    /// by `[0, total_i]`.
    fn sweep(&mut self) {
        self.sweeps += 1;
        debug!(sweep = self.sweeps, "newton step rejected, bisecting coordinates");
        let active = self.active.clone();
        for i in active {
            let (mut lo, mut hi) = (0.0_f64, self.totals[i]);
            for _ in 0..BISECTION_STEPS {
                let mid = if lo > 0.0 { (lo * hi).sqrt() } else { hi * 1e-4 };
                if mid <= 0.0 {
                    break;
                }
                self.x[i] = mid;
                self.refresh();
                if self.f[i].to_f64() > 0.0 {
                    lo = mid;
                } else {
                    hi = mid;
                }
                if hi - lo <= 1e-15 * hi {
                    break;
                }
            }
            self.x[i] = if lo > 0.0 { 0.5 * (lo + hi) } else { hi };
            self.refresh();
        }
    }

    /// `∂L/∂u_j = x_j (∂R/∂x_j - Σ_i μ_i J_ij / total_i)` over the active set.
    fn lagrangian_gradient<D>(&self, model: &D, x: &[f64], mu: &[f64]) -> Vec<f64>
    where
        D: DynamicalSystem<Dual> + Objective<Dual> + ?Sized,
    {
        let jac = autodiff::jacobian(model, x);
        let grad = autodiff::gradient(model, x);
        self.active
            .iter()
            .map(|&j| {
                let constraint: f64 = self
                    .active
                    .iter()
                    .zip(mu)
                    .map(|(&i, m)| m * jac[(i, j)] / self.totals[i])
                    .sum();
                x[j] * (grad[j] - constraint)
            })
            .collect()
    }

    fn lagrangian_hessian<D>(&self, model: &D, mu: &[f64]) -> DMatrix<f64>
    where
        D: DynamicalSystem<Dual> + Objective<Dual> + ?Sized,
    {
        let m = self.active.len();
        let mut hessian = DMatrix::zeros(m, m);
        let mut shifted = self.x.clone();
        for (b, &k) in self.active.iter().enumerate() {
            shifted[k] = self.x[k] * LAGRANGE_FD_STEP.exp();
            let plus = self.lagrangian_gradient(model, &shifted, mu);
            shifted[k] = self.x[k] * (-LAGRANGE_FD_STEP).exp();
            let minus = self.lagrangian_gradient(model, &shifted, mu);
            shifted[k] = self.x[k];
            for a in 0..m {
                hessian[(a, b)] = (plus[a] - minus[a]) / (2.0 * LAGRANGE_FD_STEP);
            }
        }
        hessian
    }

    /// Solves `Âᵀ μ = x ∘ ∇R` at the converged point.
    fn recover_multipliers<D>(&self, model: &D) -> Option<Vec<f64>>
    where
        D: DynamicalSystem<Dual> + Objective<Dual> + ?Sized,
    {
        let scaled = self.scaled_jacobian(model);
        let grad = autodiff::gradient(model, &self.x);
        let rhs = DVector::from_iterator(
            self.active.len(),
            self.active.iter().map(|&j| self.x[j] * grad[j]),
        );
        let solved = scaled.transpose().lu().solve(&rhs)?;
        let mut multipliers = vec![0.0; self.totals.len()];
        for (a, &i) in self.active.iter().enumerate() {
            multipliers[i] = solved[a];
        }
        Some(multipliers)
    }

    fn finish(
        self,
        iterations: usize,
        residual: f64,
        multipliers: Option<Vec<f64>>,
    ) -> EquilibriumSolution {
        EquilibriumSolution {
            free: self.x,
            multipliers,
            iterations,
            residual,
            fallback_sweeps: self.sweeps,
        }
    }
}

fn evaluate<S>(system: &S, x: &[f64], out: &mut [DoubleDouble])
where
    S: DynamicalSystem<DoubleDouble> + ?Sized,
{
    let lifted: Vec<DoubleDouble> = x.iter().map(|&v| DoubleDouble::from_f64(v)).collect();
    system.apply(DoubleDouble::ZERO, &lifted, out);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::Scalar;

    /// `p + l <-> pl` and `p + i <-> pi` written out by hand.
    struct Competition {
        totals: [f64; 3],
        kd_pl: f64,
        kd_pi: f64,
    }

    impl<T: Scalar> DynamicalSystem<T> for Competition {
        fn dimension(&self) -> usize {
            3
        }

        fn apply(&self, _t: T, x: &[T], out: &mut [T]) {
            let pl = x[0] * x[1] / T::of(self.kd_pl);
            let pi = x[0] * x[2] / T::of(self.kd_pi);
            out[0] = T::of(self.totals[0]) - (x[0] + pl + pi);
            out[1] = T::of(self.totals[1]) - (x[1] + pl);
            out[2] = T::of(self.totals[2]) - (x[2] + pi);
        }
    }

    impl<T: Scalar> Objective<T> for Competition {
        fn value(&self, x: &[T]) -> T {
            x[0] * x[1] / T::of(self.kd_pl)
        }
    }

    fn assert_err_contains<T: std::fmt::Debug>(result: Result<T, SolveError>, needle: &str) {
        let err = result.expect_err("expected error");
        let message = format!("{err}");
        assert!(
            message.contains(needle),
            "expected error to contain \"{needle}\", got \"{message}\""
        );
    }

    fn competition(p: f64, l: f64, i: f64, kd_pl: f64, kd_pi: f64) -> Competition {
        Competition {
            totals: [p, l, i],
            kd_pl,
            kd_pi,
        }
    }

    #[test]
    fn direct_solver_reproduces_competition_reference() {
        let system = competition(12.0, 10.0, 25.0, 10.0, 1.0);
        let solution = solve_direct(&system, &system, &system.totals, &SolverSettings::default())
            .expect("solve");
        let pl = solution.free[0] * solution.free[1] / 10.0;
        assert!((pl - 0.683784871182570).abs() < 1e-9, "pl = {pl}");
        assert!(solution.residual <= 1e-10);
        assert!(solution.multipliers.is_none());
    }

    #[test]
    fn lagrangian_matches_direct() {
        let system = competition(5.0, 3.0, 40.0, 0.2, 7.0);
        let settings = SolverSettings::default();
        let direct = solve_direct(&system, &system, &system.totals, &settings).expect("direct");
        let lagrange =
            solve_lagrangian(&system, &system, &system.totals, &settings).expect("lagrangian");
        for (a, b) in direct.free.iter().zip(&lagrange.free) {
            assert!((a - b).abs() <= 1e-8 * a.abs().max(1e-300), "{a} vs {b}");
        }
        let multipliers = lagrange.multipliers.expect("multipliers");
        assert_eq!(multipliers.len(), 3);
        assert!(multipliers.iter().all(|m| m.is_finite()));
    }

    #[test]
    fn zero_totals_stay_at_zero() {
        let system = competition(2.0, 0.0, 1.0, 1.0, 1.0);
        let solution = solve_direct(&system, &system, &system.totals, &SolverSettings::default())
            .expect("solve");
        assert_eq!(solution.free[1], 0.0);
        assert!(solution.free[0] > 0.0 && solution.free[0] <= 2.0);

        let empty = competition(0.0, 0.0, 0.0, 1.0, 1.0);
        let solution = solve_direct(&empty, &empty, &empty.totals, &SolverSettings::default())
            .expect("solve");
        assert_eq!(solution.free, vec![0.0; 3]);
        assert_eq!(solution.iterations, 0);
    }

    #[test]
    fn handles_extreme_binding_strength() {
        let system = competition(1e3, 1e-12, 1e-3, 1e-10, 1e3);
        let solution = solve_direct(&system, &system, &system.totals, &SolverSettings::default())
            .expect("solve");
        let mut f = vec![DoubleDouble::ZERO; 3];
        evaluate(&system, &solution.free, &mut f);
        for (&value, total) in f.iter().zip(system.totals) {
            assert!(value.to_f64().abs() / total <= 1e-10);
        }
    }

    #[test]
    fn reports_non_convergence() {
        let system = competition(12.0, 10.0, 25.0, 10.0, 1.0);
        let settings = SolverSettings {
            max_steps: 1,
            tolerance: 1e-30,
            ..SolverSettings::default()
        };
        assert_err_contains(
            solve_direct(&system, &system, &system.totals, &settings),
            "no equilibrium found after 1 iterations",
        );
    }

    #[test]
    fn rejects_invalid_inputs() {
        let system = competition(1.0, 1.0, 1.0, 1.0, 1.0);
        assert_err_contains(
            solve_direct(&system, &system, &[1.0, 1.0], &SolverSettings::default()),
            "expected 3 arguments, got 2",
        );
        assert_err_contains(
            solve_direct(&system, &system, &[1.0, -1.0, 1.0], &SolverSettings::default()),
            "invalid value -1",
        );
        let settings = SolverSettings {
            tolerance: 0.0,
            ..SolverSettings::default()
        };
        assert_err_contains(
            solve_direct(&system, &system, &system.totals, &settings),
            "tolerance must be positive",
        );
    }

    #[test]
    fn regularizes_only_near_zero_constants() {
        assert_eq!(regularize_kd(0.0, 1e-10), 1e-10);
        assert_eq!(regularize_kd(5e-11, 1e-10), 1.5e-10);
        assert_eq!(regularize_kd(1e-3, 1e-10), 1e-3);
    }
}
