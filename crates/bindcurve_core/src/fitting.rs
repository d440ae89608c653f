use crate::error::BindingError;
use crate::system::{BindingSystem, Query};
use argmin::core::{
    ArgminError, Error, Executor, IterState, Jacobian, Operator, Problem, Solver, State,
    TerminationReason, TerminationStatus, KV,
};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum FitError {
    #[error("at least one parameter must be fitted")]
    NoParameters,

    #[error("no target values to fit")]
    EmptyData,

    #[error("model produced {found} values for {expected} targets")]
    LengthMismatch { expected: usize, found: usize },

    #[error("parameter '{0}' is both fixed in the query and fitted")]
    AlreadyFixed(String),

    #[error("invalid fit input: {0}")]
    InvalidInput(String),

    #[error("fitted dissociation constant '{name}' is negative ({value})")]
    NegativeDissociationConstant { name: String, value: f64 },

    #[error("model evaluation failed: {0}")]
    Model(#[from] BindingError),

    #[error("optimizer failed: {0}")]
    Optimizer(String),
}

impl FitError {
    fn from_argmin(err: Error) -> Self {
        match err.downcast::<FitError>() {
            Ok(fit) => fit,
            Err(other) => FitError::Optimizer(other.to_string()),
        }
    }
}

/// A parameter adjusted by the fit.
#[derive(Debug, Clone, PartialEq)]
pub struct FitParameter {
    pub name: String,
    pub initial: f64,
    pub bounds: Option<(f64, f64)>,
}

impl FitParameter {
    pub fn new(name: &str, initial: f64) -> Self {
        Self {
            name: name.trim().to_lowercase(),
            initial,
            bounds: None,
        }
    }

    pub fn bounded(mut self, lower: f64, upper: f64) -> Self {
        self.bounds = Some((lower, upper));
        self
    }

    fn clamp(&self, value: f64) -> f64 {
        match self.bounds {
            Some((lower, upper)) => value.clamp(lower, upper),
            None => value,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FitSettings {
    pub max_iterations: usize,
    /// Relative decrease of the sum of squares below which the fit stops.
    pub tolerance: f64,
    pub initial_lambda: f64,
}

impl Default for FitSettings {
    fn default() -> Self {
        Self {
            max_iterations: 200,
            tolerance: 1e-12,
            initial_lambda: 1e-3,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FitResult {
    pub values: Vec<(String, f64)>,
    /// NaN when the problem has no residual degrees of freedom.
    pub std_errors: Vec<(String, f64)>,
    pub iterations: usize,
    pub ssr: f64,
}

impl FitResult {
    pub fn value(&self, name: &str) -> Option<f64> {
        lookup(&self.values, name)
    }

    pub fn std_error(&self, name: &str) -> Option<f64> {
        lookup(&self.std_errors, name)
    }
}

fn lookup(pairs: &[(String, f64)], name: &str) -> Option<f64> {
    pairs.iter().find(|(n, _)| n == name).map(|&(_, v)| v)
}

/// Residuals of the model against fixed targets.
struct Residuals<'a> {
    system: &'a BindingSystem,
    base: &'a Query,
    parameters: &'a [FitParameter],
    targets: DVector<f64>,
}

impl Residuals<'_> {
    fn evaluate(&self, values: &DVector<f64>) -> Result<DVector<f64>, FitError> {
        let query = self
            .parameters
            .iter()
            .zip(values.iter())
            .fold(self.base.clone(), |q, (param, &v)| q.with(&param.name, v));
        let model = self.system.query(&query)?.values();
        if model.len() != self.targets.len() {
            return Err(FitError::LengthMismatch {
                expected: self.targets.len(),
                found: model.len(),
            });
        }
        Ok(DVector::from_vec(model) - &self.targets)
    }

    /// Forward differences, stepping inward at an upper bound.
    fn forward_jacobian(&self, values: &DVector<f64>) -> Result<DMatrix<f64>, FitError> {
        let base = self.evaluate(values)?;
        let mut jac = DMatrix::zeros(self.targets.len(), values.len());
        for j in 0..values.len() {
            let h = 1e-7 * values[j].abs().max(1e-8);
            let mut shifted = values.clone();
            shifted[j] += h;
            let h = if self.parameters[j].clamp(shifted[j]) < shifted[j] {
                shifted[j] = values[j] - h;
                -h
            } else {
                h
            };
            let column = (self.evaluate(&shifted)? - &base) / h;
            jac.set_column(j, &column);
        }
        Ok(jac)
    }

}

impl Operator for Residuals<'_> {
    type Param = DVector<f64>;
    type Output = DVector<f64>;

    fn apply(&self, param: &Self::Param) -> Result<Self::Output, Error> {
        Ok(self.evaluate(param)?)
    }
}

impl Jacobian for Residuals<'_> {
    type Param = DVector<f64>;
    type Jacobian = DMatrix<f64>;

    fn jacobian(&self, param: &Self::Param) -> Result<Self::Jacobian, Error> {
        Ok(self.forward_jacobian(param)?)
    }
}

type FitState = IterState<DVector<f64>, (), (), (), (), f64>;

/// Damped Gauss-Newton steps with box bounds applied by clamping.
struct LevenbergMarquardt {
    bounds: Vec<Option<(f64, f64)>>,
    lambda: f64,
    tolerance: f64,
    residual: DVector<f64>,
    jacobian: DMatrix<f64>,
    converged: bool,
}

impl LevenbergMarquardt {
    fn new(parameters: &[FitParameter], settings: &FitSettings) -> Self {
        Self {
            bounds: parameters.iter().map(|p| p.bounds).collect(),
            lambda: settings.initial_lambda,
            tolerance: settings.tolerance,
            residual: DVector::zeros(0),
            jacobian: DMatrix::zeros(0, 0),
            converged: false,
        }
    }

    fn clamp(&self, values: DVector<f64>) -> DVector<f64> {
        DVector::from_iterator(
            values.len(),
            self.bounds.iter().zip(values.iter()).map(|(bounds, &v)| match bounds {
                Some((lower, upper)) => v.clamp(*lower, *upper),
                None => v,
            }),
        )
    }
}

fn missing_param() -> Error {
    ArgminError::NotInitialized {
        text: "Levenberg-Marquardt requires an initial parameter vector".to_string(),
    }
    .into()
}

impl<O> Solver<O, FitState> for LevenbergMarquardt
where
    O: Operator<Param = DVector<f64>, Output = DVector<f64>>
        + Jacobian<Param = DVector<f64>, Jacobian = DMatrix<f64>>,
{
    fn name(&self) -> &str {
        "Levenberg-Marquardt"
    }

    fn init(
        &mut self,
        problem: &mut Problem<O>,
        state: FitState,
    ) -> Result<(FitState, Option<KV>), Error> {
        let param = state.get_param().cloned().ok_or_else(missing_param)?;
        self.residual = problem.apply(&param)?;
        self.jacobian = problem.jacobian(&param)?;
        let ssr = self.residual.norm_squared();
        self.converged = ssr == 0.0;
        Ok((state.cost(ssr), None))
    }

    fn next_iter(
        &mut self,
        problem: &mut Problem<O>,
        mut state: FitState,
    ) -> Result<(FitState, Option<KV>), Error> {
        let param = state.take_param().ok_or_else(missing_param)?;
        let ssr = self.residual.norm_squared();
        let normal = self.jacobian.transpose() * &self.jacobian;
        let gradient = self.jacobian.transpose() * &self.residual;

        let mut accepted = None;
        for _ in 0..20 {
            let mut damped = normal.clone();
            for i in 0..damped.nrows() {
                damped[(i, i)] += self.lambda * normal[(i, i)].max(1e-30);
            }
            let Some(delta) = damped.lu().solve(&(-gradient.clone())) else {
                self.lambda *= 10.0;
                continue;
            };
            let candidate = self.clamp(&param + delta);
            match problem.apply(&candidate) {
                Ok(r) if r.norm_squared() < ssr => {
                    accepted = Some((candidate, r));
                    self.lambda = (self.lambda / 10.0).max(1e-12);
                    break;
                }
                Ok(_) => self.lambda *= 10.0,
                // Trial points the model rejects count as uphill steps.
                Err(err) if matches!(err.downcast_ref::<FitError>(), Some(FitError::Model(_))) => {
                    self.lambda *= 10.0
                }
                Err(err) => return Err(err),
            }
        }

        let Some((candidate, residual)) = accepted else {
            debug!(iteration = state.get_iter(), ssr, "no downhill step, stopping");
            self.converged = true;
            return Ok((state.param(param).cost(ssr), None));
        };
        let new_ssr = residual.norm_squared();
        if ssr - new_ssr <= self.tolerance * new_ssr.max(f64::MIN_POSITIVE) || new_ssr == 0.0 {
            self.converged = true;
        }
        self.jacobian = problem.jacobian(&candidate)?;
        self.residual = residual;
        Ok((state.param(candidate).cost(new_ssr), None))
    }

    fn terminate(&mut self, _state: &FitState) -> TerminationStatus {
        if self.converged {
            TerminationStatus::Terminated(TerminationReason::SolverConverged)
        } else {
            TerminationStatus::NotTerminated
        }
    }
}

/// Fits `parameters` so that `system.query(base + parameters)` reproduces `targets`.
///
/// `base` supplies every other parameter, typically including the swept
/// concentration that produced the targets.
pub fn fit(
    system: &BindingSystem,
    base: &Query,
    parameters: &[FitParameter],
    targets: &[f64],
    settings: &FitSettings,
) -> Result<FitResult, FitError> {
    if parameters.is_empty() {
        return Err(FitError::NoParameters);
    }
    if targets.is_empty() {
        return Err(FitError::EmptyData);
    }
    if let Some(param) = parameters.iter().find(|p| base.get(&p.name).is_some()) {
        return Err(FitError::AlreadyFixed(param.name.clone()));
    }
    if targets.iter().any(|y| !y.is_finite()) {
        return Err(FitError::InvalidInput("target values must be finite".into()));
    }
    if settings.max_iterations == 0 || settings.initial_lambda <= 0.0 {
        return Err(FitError::InvalidInput(
            "max_iterations and initial_lambda must be positive".into(),
        ));
    }
    for param in parameters {
        if let Some((lower, upper)) = param.bounds {
            if lower > upper {
                return Err(FitError::InvalidInput(format!(
                    "bounds for '{}' are inverted",
                    param.name
                )));
            }
        }
    }

    if !base.is_scaled() {
        let largest_x = base
            .sweep()
            .map(|xs| xs.iter().copied().fold(f64::NEG_INFINITY, f64::max));
        let largest_y = targets.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        if let Some(x) = largest_x {
            if largest_y > x {
                warn!(
                    largest_y,
                    largest_x = x,
                    "fit targets exceed the swept concentration; set ymin/ymax to fit a signal"
                );
            }
        }
    }

    let residuals = || Residuals {
        system,
        base,
        parameters,
        targets: DVector::from_column_slice(targets),
    };
    let initial = DVector::from_iterator(
        parameters.len(),
        parameters.iter().map(|p| p.clamp(p.initial)),
    );

    let executor: Executor<_, _, FitState> =
        Executor::new(residuals(), LevenbergMarquardt::new(parameters, settings));
    let result = executor
        .configure(|state| state.param(initial).max_iters(settings.max_iterations as u64))
        .run()
        .map_err(FitError::from_argmin)?;

    let state = result.state();
    let values = state
        .get_best_param()
        .or_else(|| state.get_param())
        .cloned()
        .ok_or_else(|| FitError::Optimizer("no parameters returned".into()))?;
    let iterations = state.get_iter() as usize;

    for (param, &value) in parameters.iter().zip(values.iter()) {
        if param.name.starts_with("kd") && value < 0.0 {
            return Err(FitError::NegativeDissociationConstant {
                name: param.name.clone(),
                value,
            });
        }
    }

    let problem = residuals();
    let ssr = problem.evaluate(&values)?.norm_squared();
    let jac = problem.forward_jacobian(&values)?;
    let dof = targets.len() as f64 - parameters.len() as f64;
    let covariance = (jac.transpose() * &jac).try_inverse();
    let std_errors = parameters
        .iter()
        .enumerate()
        .map(|(i, param)| {
            let se = match (&covariance, dof > 0.0) {
                (Some(cov), true) => (cov[(i, i)] * ssr / dof).sqrt(),
                _ => f64::NAN,
            };
            (param.name.clone(), se)
        })
        .collect();

    let values: Vec<(String, f64)> = parameters
        .iter()
        .zip(values.iter())
        .map(|(p, &v)| (p.name.clone(), v))
        .collect();
    info!(iterations, ssr, fitted = values.len(), "fit finished");

    Ok(FitResult {
        values,
        std_errors,
        iterations,
        ssr,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_err_contains<T: std::fmt::Debug>(result: Result<T, FitError>, needle: &str) {
        let err = result.expect_err("expected an error");
        let message = err.to_string();
        assert!(message.contains(needle), "'{message}' does not contain '{needle}'");
    }

    fn titration() -> Vec<f64> {
        (0..12).map(|i| 0.05 * 2f64.powi(i)).collect()
    }

    fn synthetic(system: &BindingSystem, base: &Query, name: &str, kd: f64) -> Vec<f64> {
        system
            .query(&base.clone().with(name, kd))
            .expect("synthetic data")
            .values()
    }

    #[test]
    fn recovers_kd_from_noiseless_data() {
        let system = BindingSystem::one_to_one();
        let base = Query::new().with_sweep("p", titration()).with("l", 1.0);
        let targets = synthetic(&system, &base, "kdpl", 2.5);

        let result = fit(
            &system,
            &base,
            &[FitParameter::new("kdpl", 0.3)],
            &targets,
            &FitSettings::default(),
        )
        .expect("fit");

        let kd = result.value("kdpl").expect("kdpl fitted");
        assert!((kd - 2.5).abs() < 1e-5, "kd = {kd}");
        assert!(result.ssr < 1e-12, "ssr = {}", result.ssr);
        assert!(result.std_error("kdpl").expect("std error") < 1e-4);
    }

    #[test]
    fn recovers_kd_of_a_custom_network() {
        let system = BindingSystem::custom("p+l<->pl*").expect("network");
        let base = Query::new().with_sweep("p", titration()).with("l", 0.5);
        let targets = synthetic(&system, &base, "kd_p_l_pl", 0.8);

        let result = fit(
            &system,
            &base,
            &[FitParameter::new("kd_p_l_pl", 5.0).bounded(1e-6, 1e3)],
            &targets,
            &FitSettings::default(),
        )
        .expect("fit");
        let kd = result.value("kd_p_l_pl").expect("kd fitted");
        assert!((kd - 0.8).abs() < 1e-5, "kd = {kd}");
    }

    #[test]
    fn iteration_cap_is_honored() {
        let system = BindingSystem::one_to_one();
        let base = Query::new().with_sweep("p", titration()).with("l", 1.0);
        let targets = synthetic(&system, &base, "kdpl", 2.5);
        let settings = FitSettings {
            max_iterations: 1,
            ..FitSettings::default()
        };

        let result = fit(&system, &base, &[FitParameter::new("kdpl", 0.01)], &targets, &settings)
            .expect("fit");
        assert_eq!(result.iterations, 1);
        let kd = result.value("kdpl").expect("kdpl fitted");
        assert!(kd > 0.01 && (kd - 2.5).abs() > 1e-3, "kd = {kd}");
    }

    #[test]
    fn bounds_are_respected() {
        let system = BindingSystem::one_to_one();
        let base = Query::new().with_sweep("p", titration()).with("l", 1.0);
        let targets = synthetic(&system, &base, "kdpl", 10.0);

        let result = fit(
            &system,
            &base,
            &[FitParameter::new("kdpl", 1.0).bounded(0.1, 4.0)],
            &targets,
            &FitSettings::default(),
        )
        .expect("fit");
        let kd = result.value("kdpl").expect("kdpl fitted");
        assert!((0.1..=4.0).contains(&kd));
        assert!((kd - 4.0).abs() < 1e-6, "kd = {kd}");
    }

    #[test]
    fn negative_kd_is_rejected() {
        let system = BindingSystem::one_to_one();
        let base = Query::new().with_sweep("p", titration()).with("l", 1.0);
        let targets = synthetic(&system, &base, "kdpl", 1.0);

        // An initial guess the bounds cannot lift out of the negative range.
        let result = fit(
            &system,
            &base,
            &[FitParameter::new("kdpl", -1.0).bounded(-2.0, -0.5)],
            &targets,
            &FitSettings::default(),
        );
        assert!(matches!(
            result,
            Err(FitError::Model(BindingError::InvalidParameter { .. }))
                | Err(FitError::NegativeDissociationConstant { .. })
        ));
    }

    #[test]
    fn input_errors() {
        let system = BindingSystem::one_to_one();
        let base = Query::new().with_sweep("p", titration()).with("l", 1.0);
        let settings = FitSettings::default();
        let kd = [FitParameter::new("kdpl", 1.0)];

        assert_err_contains(fit(&system, &base, &[], &[1.0], &settings), "at least one");
        assert_err_contains(fit(&system, &base, &kd, &[], &settings), "no target");
        assert_err_contains(fit(&system, &base, &kd, &[0.1, 0.2], &settings), "for 2 targets");
        assert_err_contains(
            fit(&system, &base, &[FitParameter::new("l", 1.0)], &[0.0; 12], &settings),
            "both fixed",
        );
        assert_err_contains(
            fit(
                &system,
                &base,
                &[FitParameter::new("kdpl", 1.0).bounded(2.0, 1.0)],
                &[0.0; 12],
                &settings,
            ),
            "inverted",
        );
    }
}
