//! Mass-action kinetics integrated to steady state.
//!
//! Each reaction `r1 + r2 <-> p` runs forward with unit rate and backward with
//! rate `Kd`, so its net flux is `v = r1·r2 − Kd·p`. The steady state agrees
//! with the equilibrium solvers whenever each product forms by a single route.

use crate::equation_engine::{BinaryOp, Bytecode, Compiler, EquationSystem, Expr};
use crate::equilibrium::{regularize_kd, SolveError, SolverSettings};
use crate::error::BindingError;
use crate::network::ReactionNetwork;
use crate::solvers::RungeKutta;
use crate::stoichiometry::StoichiometryMap;
use crate::traits::{DynamicalSystem, EquilibriumBackend, Steppable};
use crate::types::{free_name, ParameterSchema, SpeciesMap};
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum KineticStepper {
    #[default]
    Rk4,
    Tsit5,
}

impl KineticStepper {
    fn build(self, dim: usize) -> RungeKutta<f64> {
        match self {
            KineticStepper::Rk4 => RungeKutta::rk4(dim),
            KineticStepper::Tsit5 => RungeKutta::tsit5(dim),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct KineticSettings {
    pub stepper: KineticStepper,
    /// First integration horizon. It grows tenfold, up to `max_t_end`, while
    /// the rates are still above the steady-state threshold.
    pub t_end: f64,
    pub max_t_end: f64,
    pub initial_dt: f64,
    /// Step-doubling error target and steady-state threshold, relative to the
    /// largest initial concentration.
    pub rel_tol: f64,
    pub max_steps: usize,
}

impl Default for KineticSettings {
    fn default() -> Self {
        Self {
            stepper: KineticStepper::Rk4,
            t_end: 100.0,
            max_t_end: 1e12,
            initial_dt: 1e-3,
            rel_tol: 1e-9,
            max_steps: 2_000_000,
        }
    }
}

/// Integrates `system` from `initial` until every rate falls below `rel_tol`
/// times the largest initial value.
///
/// Steps are sized by step doubling: a full step is compared against two
/// half steps and the more accurate result is kept. Reaching `max_t_end`
/// without a steady state fails with [`SolveError::NonConvergence`].
pub fn integrate_to_steady_state<S>(
    system: &S,
    initial: &[f64],
    settings: &KineticSettings,
) -> Result<Vec<f64>>
where
    S: DynamicalSystem<f64>,
{
    let dim = system.dimension();
    if initial.len() != dim {
        bail!(
            "Initial state dimension mismatch. Expected {}, got {}.",
            dim,
            initial.len()
        );
    }
    if !(settings.t_end > 0.0) {
        bail!("t_end must be positive.");
    }
    if !(settings.max_t_end >= settings.t_end) {
        bail!("max_t_end must be at least t_end.");
    }
    if !(settings.initial_dt > 0.0) {
        bail!("initial_dt must be positive.");
    }
    if !(settings.rel_tol > 0.0) {
        bail!("rel_tol must be positive.");
    }

    let scale = initial.iter().fold(0.0_f64, |acc, v| acc.max(v.abs()));
    if scale == 0.0 {
        return Ok(initial.to_vec());
    }

    let mut stepper = settings.stepper.build(dim);
    let mut state = initial.to_vec();
    let mut full = vec![0.0; dim];
    let mut half = vec![0.0; dim];
    let mut rates = vec![0.0; dim];
    let mut t = 0.0;
    let mut dt = settings.initial_dt;
    let mut steps = 0usize;
    let mut horizon = settings.t_end;
    let mut fastest = f64::INFINITY;

    loop {
        if t >= horizon {
            if horizon >= settings.max_t_end {
                return Err(SolveError::NonConvergence {
                    iterations: steps,
                    residual: fastest / scale,
                }
                .into());
            }
            horizon = (horizon * 10.0).min(settings.max_t_end);
            debug!(t, horizon, fastest, "steady state not reached, extending horizon");
        }
        if steps >= settings.max_steps {
            bail!(
                "Kinetic integration exceeded {} steps before reaching steady state (t = {t:e}).",
                settings.max_steps
            );
        }
        steps += 1;
        let h = dt.min(horizon - t);

        full.copy_from_slice(&state);
        let mut t_probe = t;
        stepper.step(system, &mut t_probe, &mut full, h);

        half.copy_from_slice(&state);
        let mut t_half = t;
        stepper.step(system, &mut t_half, &mut half, 0.5 * h);
        stepper.step(system, &mut t_half, &mut half, 0.5 * h);

        let error = full
            .iter()
            .zip(&half)
            .fold(0.0_f64, |acc, (a, b)| acc.max((a - b).abs()))
            / scale;
        if !error.is_finite() {
            bail!("Kinetic integration diverged at t = {t:e}.");
        }

        let factor = if error == 0.0 {
            4.0
        } else {
            (0.9 * (settings.rel_tol / error).powf(0.2)).clamp(0.1, 4.0)
        };
        if error > settings.rel_tol && h > 1e-14 * horizon {
            dt = h * factor;
            continue;
        }

        state.copy_from_slice(&half);
        t += h;
        dt = h * factor;

        system.apply(t, &state, &mut rates);
        fastest = rates.iter().fold(0.0_f64, |acc, v| acc.max(v.abs()));
        if fastest <= settings.rel_tol * scale {
            debug!(t, steps, "kinetic integration reached steady state");
            break;
        }
    }

    if state.iter().any(|v| !v.is_finite()) {
        bail!("Kinetic integration produced non-finite concentrations.");
    }
    Ok(state)
}

/// Mass-action ODEs for a reaction network, integrated on every query.
#[derive(Debug, Clone)]
pub struct KineticSystem {
    network: ReactionNetwork,
    stoichiometry: StoichiometryMap,
    schema: ParameterSchema,
    equations: Vec<Bytecode>,
    /// `(argument index, divisor)` used as the signal normalizer instead of
    /// the stoichiometric ceiling.
    reference: Option<(usize, f64)>,
    settings: KineticSettings,
    kd_floor: f64,
}

impl KineticSystem {
    pub fn from_definition(definition: &str, settings: KineticSettings) -> Result<Self, BindingError> {
        let network = ReactionNetwork::parse(definition)?;
        Self::new(network, settings)
    }

    pub fn new(network: ReactionNetwork, settings: KineticSettings) -> Result<Self, BindingError> {
        let stoichiometry = StoichiometryMap::resolve(&network)?;
        let kd_names = network.kd_names();
        let schema = ParameterSchema::new(network.fundamental().to_vec(), kd_names.clone());
        let compiler = Compiler::new(network.species(), &kd_names);

        let fluxes: Vec<Expr> = network
            .reactions()
            .iter()
            .map(|reaction| {
                let [r1, r2] = &reaction.reactants;
                let forward = Expr::binary(Expr::var(r1.as_str()), BinaryOp::Mul, Expr::var(r2.as_str()));
                let backward = Expr::binary(
                    Expr::var(reaction.kd_name()),
                    BinaryOp::Mul,
                    Expr::var(reaction.product.as_str()),
                );
                Expr::binary(forward, BinaryOp::Sub, backward)
            })
            .collect();

        let mut equations = Vec::with_capacity(network.species().len());
        for species in network.species() {
            let mut terms = Vec::new();
            for (reaction, flux) in network.reactions().iter().zip(&fluxes) {
                let consumed = reaction.reactants.iter().filter(|r| *r == species).count() as u32;
                let produced = u32::from(&reaction.product == species);
                if produced > consumed {
                    terms.push(flux.clone().times(produced - consumed));
                } else if consumed > produced {
                    terms.push(Expr::Neg(Box::new(flux.clone().times(consumed - produced))));
                }
            }
            equations.push(compiler.compile(&Expr::sum(terms))?);
        }

        Ok(Self {
            network,
            stoichiometry,
            schema,
            equations,
            reference: None,
            settings,
            kd_floor: SolverSettings::default().kd_floor,
        })
    }

    /// A fixed topology with renamed constants and a reference normalizer.
    fn named(
        definition: &str,
        kds: &[&str],
        reference: (usize, f64),
        settings: KineticSettings,
    ) -> Result<Self, BindingError> {
        let mut system = Self::from_definition(definition, settings)?;
        system.schema.kds = kds.iter().map(|kd| kd.to_string()).collect();
        system.reference = Some(reference);
        Ok(system)
    }

    /// `p + l <-> pl` with constant `kdpl`, normalized by total ligand.
    pub fn one_to_one(settings: KineticSettings) -> Result<Self, BindingError> {
        Self::named("p+l<->pl*", &["kdpl"], (1, 1.0), settings)
    }

    /// `p + l <-> pl`, `p + i <-> pi` with `kdpl`, `kdpi`, normalized by total ligand.
    pub fn competition(settings: KineticSettings) -> Result<Self, BindingError> {
        Self::named("p+l<->pl*, p+i<->pi", &["kdpl", "kdpi"], (1, 1.0), settings)
    }

    /// `p + p <-> pp` with constant `kdpp`, normalized by half the monomer.
    pub fn homodimer_formation(settings: KineticSettings) -> Result<Self, BindingError> {
        Self::named("p+p<->pp*", &["kdpp"], (0, 2.0), settings)
    }

    /// `p + p <-> pp`, `p + i <-> pi` with `kdpp`, `kdpi`.
    pub fn homodimer_breaking(settings: KineticSettings) -> Result<Self, BindingError> {
        Self::named("p+p<->pp*, p+i<->pi", &["kdpp", "kdpi"], (0, 2.0), settings)
    }

    pub fn settings(&self) -> &KineticSettings {
        &self.settings
    }

    fn integrate(&self, args: &[f64]) -> Result<Vec<f64>, BindingError> {
        if args.len() != self.schema.len() {
            return Err(anyhow::anyhow!(
                "Expected {} arguments, got {}.",
                self.schema.len(),
                args.len()
            )
            .into());
        }
        for (&value, name) in args.iter().zip(self.schema.names()) {
            if !value.is_finite() || value < 0.0 {
                return Err(BindingError::InvalidParameter {
                    name: name.to_string(),
                    value,
                });
            }
        }

        let n = self.schema.totals.len();
        let kds: Vec<f64> = args[n..]
            .iter()
            .map(|&kd| regularize_kd(kd, self.kd_floor))
            .collect();
        let system = EquationSystem::new(self.equations.clone(), kds);

        let initial: Vec<f64> = self
            .network
            .species()
            .iter()
            .map(|s| {
                self.network
                    .fundamental()
                    .iter()
                    .position(|f| f == s)
                    .map_or(0.0, |idx| args[idx])
            })
            .collect();

        match integrate_to_steady_state(&system, &initial, &self.settings) {
            Ok(state) => Ok(state),
            Err(err) => match err.downcast::<SolveError>() {
                Ok(solve) => Err(solve.into()),
                Err(err) => Err(err
                    .context(format!("integrating network '{}'", self.describe_reactions()))
                    .into()),
            },
        }
    }

    fn describe_reactions(&self) -> String {
        self.network
            .reactions()
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl EquilibriumBackend for KineticSystem {
    fn schema(&self) -> &ParameterSchema {
        &self.schema
    }

    fn default_readout(&self) -> &str {
        self.network.readout()
    }

    fn is_analytical(&self) -> bool {
        false
    }

    fn species(&self) -> Vec<String> {
        self.network
            .fundamental()
            .iter()
            .map(|f| free_name(f))
            .chain(self.network.derived().iter().cloned())
            .collect()
    }

    fn normalizer(&self, readout: &str, args: &[f64]) -> f64 {
        if let Some((idx, divisor)) = self.reference {
            return args.get(idx).copied().unwrap_or(0.0) / divisor;
        }
        let Some(composition) = self.stoichiometry.composition(readout) else {
            return 0.0;
        };
        composition
            .iter()
            .enumerate()
            .filter(|(_, &count)| count > 0)
            .map(|(i, &count)| args.get(i).copied().unwrap_or(0.0) / f64::from(count))
            .fold(f64::INFINITY, f64::min)
    }

    fn equilibrate(&self, args: &[f64]) -> Result<Vec<SpeciesMap>, BindingError> {
        let state = self.integrate(args)?;
        let mut map = SpeciesMap::with_capacity(state.len());
        for (species, value) in self.network.species().iter().zip(&state) {
            if self.network.is_fundamental(species) {
                map.insert(free_name(species), *value);
            }
        }
        for (species, value) in self.network.species().iter().zip(&state) {
            if !self.network.is_fundamental(species) {
                map.insert(species.as_str(), *value);
            }
        }
        Ok(vec![map])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::closed_form::{self, ClosedFormKind, ClosedFormSystem};

    fn assert_err_contains<T: std::fmt::Debug>(result: Result<T>, needle: &str) {
        let err = result.expect_err("expected error");
        let message = format!("{err:#}");
        assert!(
            message.contains(needle),
            "expected error to contain \"{needle}\", got \"{message}\""
        );
    }

    fn relative_eq(a: f64, b: f64, tol: f64) -> bool {
        (a - b).abs() <= tol * a.abs().max(b.abs())
    }

    #[test]
    fn one_to_one_reaches_closed_form() {
        let system = KineticSystem::one_to_one(KineticSettings::default()).expect("build");
        let names: Vec<&str> = system.schema().names().collect();
        assert_eq!(names, vec!["p", "l", "kdpl"]);
        let maps = system.equilibrate(&[1.0, 10.0, 1.0]).expect("integrate");
        let pl = maps[0].get("pl").expect("pl");
        assert!(relative_eq(pl, 0.9009804864072152, 1e-4), "pl = {pl}");
        assert_eq!(system.normalizer("pl", &[1.0, 10.0, 1.0]), 10.0);
    }

    #[test]
    fn homodimer_formation_reaches_closed_form() {
        let settings = KineticSettings {
            stepper: KineticStepper::Tsit5,
            ..KineticSettings::default()
        };
        let system = KineticSystem::homodimer_formation(settings).expect("build");
        let maps = system.equilibrate(&[4.0, 2.0]).expect("integrate");
        let exact = closed_form::homodimer_formation(4.0, 2.0);
        let pp = maps[0].get("pp").expect("pp");
        assert!(relative_eq(pp, exact.get("pp").expect("pp"), 1e-4), "pp = {pp}");
        assert_eq!(system.normalizer("pp", &[4.0, 2.0]), 2.0);
    }

    #[test]
    fn custom_competition_matches_closed_form() {
        let system =
            KineticSystem::from_definition("p+l<->pl*, p+i<->pi", KineticSettings::default())
                .expect("build");
        let args = [2.0, 3.0, 1.5, 0.8, 2.5];
        let kinetic = system.equilibrate(&args).expect("integrate");
        let exact = ClosedFormSystem::new(ClosedFormKind::Competition)
            .equilibrate(&args)
            .expect("closed form");
        for name in ["p_f", "l_f", "i_f", "pl", "pi"] {
            let a = kinetic[0].get(name).expect(name);
            let b = exact[0].get(name).expect(name);
            assert!(relative_eq(a, b, 1e-4), "{name}: {a} vs {b}");
        }
    }

    #[test]
    fn slow_relaxation_extends_the_horizon() {
        let system = KineticSystem::one_to_one(KineticSettings::default()).expect("build");
        let args = [1e-3, 1e-3, 1e-3];
        let maps = system.equilibrate(&args).expect("integrate");
        let exact = closed_form::one_to_one(1e-3, 1e-3, 1e-3);
        let pl = maps[0].get("pl").expect("pl");
        assert!(relative_eq(pl, exact.get("pl").expect("pl"), 1e-4), "pl = {pl}");
    }

    #[test]
    fn unfinished_integration_is_an_error() {
        let settings = KineticSettings {
            t_end: 1.0,
            max_t_end: 1.0,
            ..KineticSettings::default()
        };
        let system = KineticSystem::one_to_one(settings).expect("build");
        let result = system.equilibrate(&[1e-3, 1e-3, 1e-3]);
        assert!(
            matches!(
                result,
                Err(BindingError::Solve(SolveError::NonConvergence { .. }))
            ),
            "{result:?}"
        );
    }

    #[test]
    fn named_competition_and_breaking_match_closed_forms() {
        let settings = KineticSettings::default();
        let cases = [
            (
                KineticSystem::competition(settings).expect("build"),
                ClosedFormKind::Competition,
                vec![12.0, 10.0, 25.0, 10.0, 1.0],
                "pl",
            ),
            (
                KineticSystem::homodimer_breaking(settings).expect("build"),
                ClosedFormKind::HomodimerBreaking,
                vec![30.0, 20.0, 10.0, 1.0],
                "pp",
            ),
        ];
        for (kinetic, kind, args, readout) in cases {
            let exact = ClosedFormSystem::new(kind);
            assert_eq!(kinetic.schema(), exact.schema());
            let a = kinetic.equilibrate(&args).expect("kinetic")[0].get(readout).expect(readout);
            let b = exact.equilibrate(&args).expect("closed form")[0].get(readout).expect(readout);
            assert!(relative_eq(a, b, 1e-4), "{kind:?}: {a} vs {b}");
            assert_eq!(kinetic.normalizer(readout, &args), exact.normalizer(readout, &args));
        }
    }

    #[test]
    fn derivatives_follow_mass_action() {
        let system =
            KineticSystem::from_definition("p+p<->pp*", KineticSettings::default()).expect("build");
        let ode = EquationSystem::new(system.equations.clone(), vec![3.0]);
        let mut out = [0.0; 2];
        // v = 2·2 − 3·1 = 1; p is consumed twice.
        ode.apply(0.0, &[2.0, 1.0], &mut out);
        assert_eq!(out, [-2.0, 1.0]);
    }

    #[test]
    fn rejects_invalid_integration_settings() {
        let system =
            KineticSystem::from_definition("p+l<->pl*", KineticSettings::default()).expect("build");
        let ode = EquationSystem::new(system.equations.clone(), vec![1.0]);
        let settings = KineticSettings {
            t_end: 0.0,
            ..KineticSettings::default()
        };
        assert_err_contains(
            integrate_to_steady_state(&ode, &[1.0, 1.0, 0.0], &settings),
            "t_end must be positive",
        );
        let settings = KineticSettings {
            max_steps: 3,
            ..KineticSettings::default()
        };
        assert_err_contains(
            integrate_to_steady_state(&ode, &[1.0, 1.0, 0.0], &settings),
            "exceeded 3 steps",
        );
        assert_err_contains(
            integrate_to_steady_state(&ode, &[1.0], &KineticSettings::default()),
            "dimension mismatch",
        );
    }
}
