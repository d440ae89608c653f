//! Turns a resolved reaction network into mass-action and conservation
//! programs for the bytecode VM, and solves them for equilibrium.

use crate::autodiff::Dual;
use crate::equation_engine::{BinaryOp, Bytecode, Compiler, Expr, VM};
use crate::equilibrium::{self, regularize_kd, SolveError, SolverSettings};
use crate::error::BindingError;
use crate::network::ReactionNetwork;
use crate::precision::DoubleDouble;
use crate::stoichiometry::StoichiometryMap;
use crate::traits::{DynamicalSystem, EquilibriumBackend, Objective, Scalar};
use crate::types::{free_name, ParameterSchema, SpeciesMap};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::fmt::Write as _;
use tracing::info;

/// How the compiled conservation system is handed to the root finder.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompileStrategy {
    /// Solve the conservation residuals directly.
    #[default]
    DirectResidual,
    /// Seek the stationary point of the readout under the conservation constraints.
    Lagrangian,
}

#[derive(Debug, Clone)]
struct Program {
    name: String,
    expr: Expr,
    bytecode: Bytecode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadoutSource {
    Free(usize),
    Derived(usize),
}

/// A reaction network compiled once into VM programs.
///
/// Argument order is fixed by `schema()`: totals of the fundamental species,
/// then dissociation constants in first-encountered order.
#[derive(Debug, Clone)]
pub struct CompiledNetwork {
    network: ReactionNetwork,
    stoichiometry: StoichiometryMap,
    schema: ParameterSchema,
    free_names: Vec<String>,
    /// Derived species, topologically ordered.
    derived: Vec<Program>,
    /// One conservation residual per fundamental species.
    residuals: Vec<Program>,
    readout: ReadoutSource,
    strategy: CompileStrategy,
    settings: SolverSettings,
}

impl CompiledNetwork {
    pub fn from_definition(
        definition: &str,
        strategy: CompileStrategy,
        settings: SolverSettings,
    ) -> Result<Self, BindingError> {
        let network = ReactionNetwork::parse(definition)?;
        Self::new(network, strategy, settings)
    }

    pub fn new(
        network: ReactionNetwork,
        strategy: CompileStrategy,
        settings: SolverSettings,
    ) -> Result<Self, BindingError> {
        settings.validate()?;
        let stoichiometry = StoichiometryMap::resolve(&network)?;
        let schema = ParameterSchema::new(network.fundamental().to_vec(), network.kd_names());
        let free_names: Vec<String> = network.fundamental().iter().map(|f| free_name(f)).collect();
        let order = stoichiometry.order().to_vec();
        let param_names: Vec<String> = schema.names().map(str::to_string).collect();
        let compiler = Compiler::new(&free_names, &param_names).with_slots(&order);

        let species_term = |species: &str| {
            if network.is_fundamental(species) {
                Expr::var(free_name(species))
            } else {
                Expr::var(species)
            }
        };

        let mut derived = Vec::with_capacity(order.len());
        for product in &order {
            let (products, kds): (Vec<Expr>, Vec<Expr>) = network
                .routes(product)
                .map(|route| {
                    let [r1, r2] = &route.reactants;
                    let complex = Expr::binary(species_term(r1), BinaryOp::Mul, species_term(r2));
                    (complex, Expr::var(route.kd_name()))
                })
                .unzip();
            let expr = Expr::binary(Expr::sum(products), BinaryOp::Div, Expr::sum(kds));
            derived.push(Program {
                name: product.clone(),
                bytecode: compiler.compile(&expr)?,
                expr,
            });
        }

        let mut residuals = Vec::with_capacity(free_names.len());
        for (fundamental, free) in network.fundamental().iter().zip(&free_names) {
            let bound = order.iter().filter_map(|species| {
                let count = stoichiometry.count(fundamental, species);
                (count > 0).then(|| Expr::var(species.as_str()).times(count))
            });
            let held = Expr::sum(std::iter::once(Expr::var(free.as_str())).chain(bound));
            let expr = Expr::binary(Expr::var(fundamental.as_str()), BinaryOp::Sub, held);
            residuals.push(Program {
                name: fundamental.clone(),
                bytecode: compiler.compile(&expr)?,
                expr,
            });
        }

        let readout = locate(&network, &order, network.readout())
            .ok_or_else(|| BindingError::UnknownReadout(network.readout().to_string()))?;

        info!(
            species = network.species().len(),
            dissociation_constants = schema.kds.len(),
            readout = network.readout(),
            ?strategy,
            "compiled binding network"
        );

        Ok(Self {
            network,
            stoichiometry,
            schema,
            free_names,
            derived,
            residuals,
            readout,
            strategy,
            settings,
        })
    }

    pub fn network(&self) -> &ReactionNetwork {
        &self.network
    }

    pub fn stoichiometry(&self) -> &StoichiometryMap {
        &self.stoichiometry
    }

    pub fn strategy(&self) -> CompileStrategy {
        self.strategy
    }

    pub fn settings(&self) -> &SolverSettings {
        &self.settings
    }

    /// The compiled equations as readable source, one per line.
    pub fn describe(&self) -> String {
        let mut out = String::new();
        for program in &self.derived {
            let _ = writeln!(out, "{} = {}", program.name, program.expr);
        }
        for program in &self.residuals {
            let _ = writeln!(out, "0 = {}", program.expr);
        }
        out
    }

    /// Conservation residuals bound to one argument vector.
    pub fn residuals<T: Scalar>(&self, args: &[f64]) -> ResidualSystem<'_, T> {
        ResidualSystem {
            network: self,
            params: args.iter().map(|&v| T::of(v)).collect(),
            slots: RefCell::new(vec![T::zero(); self.derived.len()]),
            stack: RefCell::new(Vec::new()),
        }
    }

    /// Checks and regularizes an argument vector in schema order.
    fn prepare(&self, args: &[f64]) -> Result<Vec<f64>, SolveError> {
        if args.len() != self.schema.len() {
            return Err(SolveError::DimensionMismatch {
                expected: self.schema.len(),
                found: args.len(),
            });
        }
        args.iter()
            .zip(self.schema.names())
            .enumerate()
            .map(|(i, (&value, name))| {
                if !value.is_finite() || value < 0.0 {
                    return Err(SolveError::InvalidParameter {
                        name: name.to_string(),
                        value,
                    });
                }
                Ok(if self.schema.is_kd(i) {
                    regularize_kd(value, self.settings.kd_floor)
                } else {
                    value
                })
            })
            .collect()
    }

    /// Solves for every free and derived concentration.
    pub fn solve(&self, args: &[f64]) -> Result<SpeciesMap, SolveError> {
        let params = self.prepare(args)?;
        let totals = &params[..self.free_names.len()];
        let precise = self.residuals::<DoubleDouble>(&params);
        let tangent = self.residuals::<Dual>(&params);

        let solution = match self.strategy {
            CompileStrategy::DirectResidual => {
                equilibrium::solve_direct(&precise, &tangent, totals, &self.settings)?
            }
            CompileStrategy::Lagrangian => {
                equilibrium::solve_lagrangian(&precise, &tangent, totals, &self.settings)?
            }
        };

        let free: Vec<DoubleDouble> = solution
            .free
            .iter()
            .map(|&v| DoubleDouble::from_f64(v))
            .collect();
        let derived = precise.derived_values(&free);

        let mut species = SpeciesMap::with_capacity(self.free_names.len() + self.derived.len());
        for (name, value) in self.free_names.iter().zip(&solution.free) {
            species.insert(name.as_str(), *value);
        }
        for name in self.network.derived() {
            if let Some(idx) = self.derived.iter().position(|p| &p.name == name) {
                species.insert(name.as_str(), derived[idx].to_f64());
            }
        }
        Ok(species)
    }
}

fn locate(network: &ReactionNetwork, order: &[String], species: &str) -> Option<ReadoutSource> {
    if let Some(idx) = network.fundamental().iter().position(|f| f == species) {
        return Some(ReadoutSource::Free(idx));
    }
    order
        .iter()
        .position(|d| d == species)
        .map(ReadoutSource::Derived)
}

impl EquilibriumBackend for CompiledNetwork {
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
        self.free_names
            .iter()
            .chain(self.network.derived())
            .cloned()
            .collect()
    }

    /// Stoichiometric ceiling `min_f total_f / n_f` over the monomers of `readout`.
    fn normalizer(&self, readout: &str, args: &[f64]) -> f64 {
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
        Ok(vec![self.solve(args)?])
    }
}

/// The compiled conservation residuals of a network with fixed arguments,
/// evaluated over any scalar type.
pub struct ResidualSystem<'a, T: Scalar> {
    network: &'a CompiledNetwork,
    params: Vec<T>,
    slots: RefCell<Vec<T>>,
    stack: RefCell<Vec<T>>,
}

impl<'a, T: Scalar> ResidualSystem<'a, T> {
    fn fill_slots(&self, x: &[T]) {
        let mut slots = self.slots.borrow_mut();
        let mut stack = self.stack.borrow_mut();
        for (idx, program) in self.network.derived.iter().enumerate() {
            let value = VM::execute(&program.bytecode, x, &self.params, &slots, &mut stack);
            slots[idx] = value;
        }
    }

    /// Derived concentrations at free concentrations `x`, in topological order.
    pub fn derived_values(&self, x: &[T]) -> Vec<T> {
        self.fill_slots(x);
        self.slots.borrow().clone()
    }
}

impl<'a, T: Scalar> DynamicalSystem<T> for ResidualSystem<'a, T> {
    fn dimension(&self) -> usize {
        self.network.residuals.len()
    }

    fn apply(&self, _t: T, x: &[T], out: &mut [T]) {
        self.fill_slots(x);
        let slots = self.slots.borrow();
        let mut stack = self.stack.borrow_mut();
        for (value, program) in out.iter_mut().zip(&self.network.residuals) {
            *value = VM::execute(&program.bytecode, x, &self.params, &slots, &mut stack);
        }
    }
}

impl<'a, T: Scalar> Objective<T> for ResidualSystem<'a, T> {
    fn value(&self, x: &[T]) -> T {
        match self.network.readout {
            ReadoutSource::Free(idx) => x.get(idx).copied().unwrap_or_else(T::nan),
            ReadoutSource::Derived(idx) => {
                self.fill_slots(x);
                self.slots.borrow()[idx]
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn compile(definition: &str) -> CompiledNetwork {
        CompiledNetwork::from_definition(
            definition,
            CompileStrategy::DirectResidual,
            SolverSettings::default(),
        )
        .expect("compile")
    }

    fn assert_err_contains<T: std::fmt::Debug, E: std::fmt::Display>(
        result: Result<T, E>,
        needle: &str,
    ) {
        let err = result.expect_err("expected error");
        let message = format!("{err}");
        assert!(
            message.contains(needle),
            "expected error to contain \"{needle}\", got \"{message}\""
        );
    }

    fn relative_eq(a: f64, b: f64, tol: f64) -> bool {
        (a - b).abs() <= tol * a.abs().max(b.abs()).max(f64::MIN_POSITIVE)
    }

    #[test]
    fn schema_lists_totals_then_constants() {
        let compiled = compile("p+l<->pl*, p+i<->pi");
        let names: Vec<&str> = compiled.schema().names().collect();
        assert_eq!(names, vec!["p", "l", "i", "kd_p_l_pl", "kd_p_i_pi"]);
        assert_eq!(compiled.default_readout(), "pl");
        assert_eq!(compiled.species(), vec!["p_f", "l_f", "i_f", "pl", "pi"]);
    }

    #[test]
    fn describes_compiled_equations() {
        let listing = compile("p+p<->pp, pp+l<->ppl*").describe();
        assert!(listing.contains("pp = p_f * p_f / kd_p_p_pp"), "{listing}");
        assert!(listing.contains("ppl = pp * l_f / kd_pp_l_ppl"), "{listing}");
        assert!(listing.contains("0 = p - (p_f + 2 * pp + 2 * ppl)"), "{listing}");
        assert!(listing.contains("0 = l - (l_f + ppl)"), "{listing}");
    }

    #[test]
    fn solves_one_to_one_reference_point() {
        let species = compile("p+l<->pl*").solve(&[1.0, 10.0, 1.0]).expect("solve");
        let pl = species.get("pl").expect("pl");
        assert!((pl - 0.9009804864072152).abs() < 1e-12, "pl = {pl}");
        assert!((species.get("p_f").expect("p_f") - (1.0 - pl)).abs() < 1e-12);
    }

    #[test]
    fn solves_competition_reference_point() {
        let species = compile("p+l<->pl*,p+i<->pi")
            .solve(&[12.0, 10.0, 25.0, 10.0, 1.0])
            .expect("solve");
        let pl = species.get("pl").expect("pl");
        assert!((pl - 0.683784871182570).abs() < 1e-9, "pl = {pl}");
    }

    #[test]
    fn parallel_routes_share_a_pooled_constant() {
        let compiled = compile("p+l<->pl1, p+l<->pl2, pl1+l<->pl1l2, pl2+l<->pl1l2*");
        let args = [2.0, 5.0, 0.5, 2.0, 1.5, 3.0];
        let species = compiled.solve(&args).expect("solve");
        let get = |s: &str| species.get(s).expect(s);
        let expected = (get("pl1") * get("l_f") + get("pl2") * get("l_f")) / (1.5 + 3.0);
        assert!(relative_eq(get("pl1l2"), expected, 1e-12));
        let p_total = get("p_f") + get("pl1") + get("pl2") + get("pl1l2");
        assert!(relative_eq(p_total, 2.0, 1e-10));
    }

    #[test]
    fn lagrangian_strategy_agrees_with_direct() {
        let definition = "P+C<->PC, P+U<->PU, PC+U<->PCU, PU+C<->PCU*";
        let direct = compile(definition);
        let lagrange = CompiledNetwork::from_definition(
            definition,
            CompileStrategy::Lagrangian,
            SolverSettings::default(),
        )
        .expect("compile");
        let args = [5.0, 120.0, 50.0, 1.0, 2.0, 3.0, 4.0];
        let a = direct.solve(&args).expect("direct");
        let b = lagrange.solve(&args).expect("lagrange");
        for ((name, x), (_, y)) in a.iter().zip(b.iter()) {
            assert!(relative_eq(x, y, 1e-8), "{name}: {x} vs {y}");
        }
    }

    #[test]
    fn compiling_twice_is_deterministic() {
        let args = [3.0, 4.0, 0.7];
        let first = compile("p+l<->pl*").solve(&args).expect("first");
        let second = compile("p+l<->pl*").solve(&args).expect("second");
        assert_eq!(first, second);
    }

    #[test]
    fn zero_totals_give_zero_complex() {
        let species = compile("p+l<->pl*").solve(&[0.0, 10.0, 1.0]).expect("solve");
        assert_eq!(species.get("pl"), Some(0.0));
        assert_eq!(species.get("l_f"), Some(10.0));
    }

    #[test]
    fn near_zero_constants_are_regularized() {
        let species = compile("p+l<->pl*").solve(&[1.0, 10.0, 0.0]).expect("solve");
        let pl = species.get("pl").expect("pl");
        assert!((pl - 1.0).abs() < 1e-8, "pl = {pl}");
    }

    #[test]
    fn rejects_bad_arguments() {
        let compiled = compile("p+l<->pl*");
        assert_err_contains(compiled.solve(&[1.0, 2.0]), "expected 3 arguments, got 2");
        assert_err_contains(
            compiled.solve(&[1.0, 2.0, -1.0]),
            "invalid value -1 for 'kd_p_l_pl'",
        );
        assert_err_contains(
            compiled.solve(&[f64::NAN, 2.0, 1.0]),
            "invalid value NaN for 'p'",
        );
    }

    #[test]
    fn normalizer_is_the_stoichiometric_ceiling() {
        let compiled = compile("p+p<->pp*, pp+l<->ppl");
        let args = [10.0, 3.0, 1.0, 1.0];
        assert_eq!(compiled.normalizer("pp", &args), 5.0);
        assert_eq!(compiled.normalizer("ppl", &args), 3.0);
        assert_eq!(compiled.normalizer("l", &args), 3.0);
        assert_eq!(compiled.normalizer("missing", &args), 0.0);
    }

    const NETWORKS: [&str; 5] = [
        "p+l<->pl*",
        "p+l<->pl*, p+i<->pi",
        "p+p<->pp*, p+i<->pi",
        "p+l<->pl, pl+i<->pli*",
        "P+C<->PC, P+U<->PU, PC+U<->PCU, PU+C<->PCU*",
    ];

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn conservation_holds_across_magnitudes(
            which in 0usize..NETWORKS.len(),
            exponents in proptest::collection::vec(-6.0f64..3.0, 7),
        ) {
            let compiled = compile(NETWORKS[which]);
            let args: Vec<f64> = exponents[..compiled.schema().len()]
                .iter()
                .map(|e| 10f64.powf(*e))
                .collect();
            let species = compiled.solve(&args).expect("solve");

            for (f, fundamental) in compiled.network().fundamental().iter().enumerate() {
                let mut held = species.get(&free_name(fundamental)).expect("free");
                for derived in compiled.network().derived() {
                    let count = compiled.stoichiometry().count(fundamental, derived);
                    held += f64::from(count) * species.get(derived).expect("derived");
                }
                prop_assert!(
                    relative_eq(held, args[f], 1e-8),
                    "{} in {}: held {} vs total {}", fundamental, NETWORKS[which], held, args[f]
                );
            }
        }
    }
}
