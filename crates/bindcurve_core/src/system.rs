//! The uniform query surface over every equilibrium backend.

use crate::closed_form::{ClosedFormKind, ClosedFormSystem};
use crate::compiler::{CompileStrategy, CompiledNetwork};
use crate::equation_engine::{parse, Bytecode, CompileError, Compiler, Expr, VM};
use crate::equilibrium::SolverSettings;
use crate::error::BindingError;
use crate::kinetic::{KineticSettings, KineticSystem};
use crate::traits::EquilibriumBackend;
use crate::types::{free_name, BranchPolicy, ParameterSchema, SpeciesMap};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::warn;

/// Name of the raw readout inside a transform expression.
const READOUT_VARIABLE: &str = "y";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParamValue {
    Scalar(f64),
    /// The changing parameter of a swept query.
    Sweep(Vec<f64>),
}

impl ParamValue {
    fn at(&self, index: usize) -> f64 {
        match self {
            ParamValue::Scalar(v) => *v,
            ParamValue::Sweep(values) => values.get(index).copied().unwrap_or(f64::NAN),
        }
    }

    fn values(&self) -> &[f64] {
        match self {
            ParamValue::Scalar(v) => std::slice::from_ref(v),
            ParamValue::Sweep(values) => values,
        }
    }
}

impl From<f64> for ParamValue {
    fn from(value: f64) -> Self {
        ParamValue::Scalar(value)
    }
}

impl From<Vec<f64>> for ParamValue {
    fn from(values: Vec<f64>) -> Self {
        ParamValue::Sweep(values)
    }
}

impl From<&[f64]> for ParamValue {
    fn from(values: &[f64]) -> Self {
        ParamValue::Sweep(values.to_vec())
    }
}

/// A compiled expression over the raw readout `y` and any query parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadoutTransform {
    label: String,
    source: String,
    expr: Expr,
}

impl ReadoutTransform {
    pub fn parse(label: impl Into<String>, source: &str) -> Result<Self, CompileError> {
        Ok(Self {
            label: label.into(),
            source: source.to_string(),
            expr: parse(source)?,
        })
    }

    fn builtin(label: &str, source: &str, expr: Expr) -> Self {
        Self {
            label: label.to_string(),
            source: source.to_string(),
            expr,
        }
    }

    /// Bound complex over total ligand.
    pub fn fraction_l() -> Self {
        use crate::equation_engine::BinaryOp::Div;
        Self::builtin(
            "Fraction l bound",
            "y / l",
            Expr::binary(Expr::var(READOUT_VARIABLE), Div, Expr::var("l")),
        )
    }

    /// Dimer over the largest possible dimer concentration, `p / 2`.
    pub fn fraction_possible_dimer() -> Self {
        use crate::equation_engine::BinaryOp::Div;
        Self::builtin(
            "Fraction possible dimer",
            "y / (p / 2)",
            Expr::binary(
                Expr::var(READOUT_VARIABLE),
                Div,
                Expr::binary(Expr::var("p"), Div, Expr::Number(2.0)),
            ),
        )
    }

    pub fn complex_concentration() -> Self {
        Self::builtin("[Complex]", "y", Expr::var(READOUT_VARIABLE))
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    fn bind(&self, param_names: &[String]) -> Result<Bytecode, CompileError> {
        Compiler::new(&[READOUT_VARIABLE.to_string()], param_names).compile(&self.expr)
    }
}

/// A parameter assignment with at most one swept value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    params: BTreeMap<String, ParamValue>,
    ymin: Option<f64>,
    ymax: Option<f64>,
    readout: Option<String>,
    transform: Option<ReadoutTransform>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a parameter. `ymin` and `ymax` set the scaling bounds instead.
    pub fn with(mut self, name: &str, value: impl Into<ParamValue>) -> Self {
        let name = name.trim().to_lowercase();
        let value = value.into();
        let bound = match &value {
            ParamValue::Scalar(v) if name == "ymin" || name == "ymax" => Some(*v),
            _ => None,
        };
        match bound {
            Some(v) if name == "ymin" => self.ymin = Some(v),
            Some(v) => self.ymax = Some(v),
            None => {
                self.params.insert(name, value);
            }
        }
        self
    }

    pub fn with_sweep(self, name: &str, values: impl Into<Vec<f64>>) -> Self {
        self.with(name, ParamValue::Sweep(values.into()))
    }

    pub fn with_bounds(mut self, ymin: Option<f64>, ymax: Option<f64>) -> Self {
        self.ymin = ymin;
        self.ymax = ymax;
        self
    }

    /// Reports `species` instead of the system's readout.
    pub fn with_readout(mut self, species: &str) -> Self {
        self.readout = Some(species.trim().to_lowercase());
        self
    }

    pub fn with_transform(mut self, transform: ReadoutTransform) -> Self {
        self.transform = Some(transform);
        self
    }

    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.params.get(name)
    }

    pub fn transform(&self) -> Option<&ReadoutTransform> {
        self.transform.as_ref()
    }

    /// Resolved `(ymin, ymax)`, filling a single missing bound.
    fn bounds(&self) -> Option<(f64, f64)> {
        match (self.ymin, self.ymax) {
            (None, None) => None,
            (Some(ymin), Some(ymax)) => Some((ymin, ymax)),
            (Some(ymin), None) => {
                warn!("only ymin was supplied, setting ymax to 1.0");
                Some((ymin, 1.0))
            }
            (None, Some(ymax)) => {
                warn!("only ymax was supplied, setting ymin to 0.0");
                Some((0.0, ymax))
            }
        }
    }

    /// Values of the changing parameter, if any.
    pub(crate) fn sweep(&self) -> Option<&[f64]> {
        self.params.values().find_map(|v| match v {
            ParamValue::Sweep(values) => Some(values.as_slice()),
            ParamValue::Scalar(_) => None,
        })
    }

    pub(crate) fn is_scaled(&self) -> bool {
        self.ymin.is_some() || self.ymax.is_some()
    }

    fn changing(&self) -> Vec<&str> {
        self.params
            .iter()
            .filter(|(_, v)| matches!(v, ParamValue::Sweep(_)))
            .map(|(k, _)| k.as_str())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum QueryResult {
    Point(f64),
    /// Every exposed solution branch at a single point.
    Branches(Vec<f64>),
    Curve(Vec<f64>),
    /// Exposed branches at each point of a sweep.
    BranchCurves(Vec<Vec<f64>>),
}

impl QueryResult {
    pub fn as_point(&self) -> Option<f64> {
        match self {
            QueryResult::Point(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_curve(&self) -> Option<&[f64]> {
        match self {
            QueryResult::Curve(values) => Some(values),
            _ => None,
        }
    }

    /// Physical-branch value at every point.
    pub fn values(&self) -> Vec<f64> {
        match self {
            QueryResult::Point(v) => vec![*v],
            QueryResult::Branches(b) => b.first().copied().into_iter().collect(),
            QueryResult::Curve(values) => values.clone(),
            QueryResult::BranchCurves(points) => points
                .iter()
                .map(|b| b.first().copied().unwrap_or(f64::NAN))
                .collect(),
        }
    }
}

/// One equilibrium backend with a readout and branch policy.
pub struct BindingSystem {
    backend: Box<dyn EquilibriumBackend>,
    readout: String,
    branch_policy: BranchPolicy,
}

impl fmt::Debug for BindingSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BindingSystem")
            .field("arguments", &self.arguments())
            .field("readout", &self.readout)
            .field("analytical", &self.is_analytical())
            .field("branch_policy", &self.branch_policy)
            .finish()
    }
}

const ONE_TO_ONE: &str = "p+l<->pl*";
const COMPETITION: &str = "p+l<->pl*, p+i<->pi";
const HOMODIMER_FORMATION: &str = "p+p<->pp*";
const HOMODIMER_BREAKING: &str = "p+p<->pp*, p+i<->pi";
const ONE_TO_TWO: &str = "p+l<->pl1, p+l<->pl2, pl1+l<->pl1l2, pl2+l<->pl1l2*";
const ONE_TO_THREE: &str = "p+l<->pl1, p+l<->pl2, p+l<->pl3, \
    pl1+l<->pl1l2, pl2+l<->pl1l2, pl1+l<->pl1l3, pl3+l<->pl1l3, pl2+l<->pl2l3, pl3+l<->pl2l3, \
    pl1l2+l<->pl1l2l3, pl1l3+l<->pl1l2l3, pl2l3+l<->pl1l2l3*";

#[derive(Debug, Clone, Copy)]
enum Variant {
    Analytical,
    Min,
    Lagrange,
    Kinetic,
}

/// Longest suffixes first so `min` does not shadow `minimiser`.
const SHORTCUT_VARIANTS: [(&str, Variant); 8] = [
    ("analytical", Variant::Analytical),
    ("minimiser", Variant::Min),
    ("minimizer", Variant::Min),
    ("minimised", Variant::Min),
    ("minimized", Variant::Min),
    ("lagrange", Variant::Lagrange),
    ("kinetic", Variant::Kinetic),
    ("min", Variant::Min),
];

#[derive(Debug, Clone, Copy)]
enum Shortcut {
    Closed(ClosedFormKind),
    Multisite(&'static str),
}

fn kind_definition(kind: ClosedFormKind) -> &'static str {
    match kind {
        ClosedFormKind::OneToOne => ONE_TO_ONE,
        ClosedFormKind::Competition => COMPETITION,
        ClosedFormKind::HomodimerFormation => HOMODIMER_FORMATION,
        ClosedFormKind::HomodimerBreaking => HOMODIMER_BREAKING,
    }
}

impl BindingSystem {
    pub fn from_backend(backend: Box<dyn EquilibriumBackend>) -> Self {
        let readout = backend.default_readout().to_string();
        Self {
            backend,
            readout,
            branch_policy: BranchPolicy::default(),
        }
    }

    /// Compiles a network definition such as `"p+l<->pl*, p+i<->pi"`.
    pub fn custom(definition: &str) -> Result<Self, BindingError> {
        Self::custom_with(
            definition,
            CompileStrategy::DirectResidual,
            SolverSettings::default(),
        )
    }

    pub fn custom_with(
        definition: &str,
        strategy: CompileStrategy,
        settings: SolverSettings,
    ) -> Result<Self, BindingError> {
        let compiled = CompiledNetwork::from_definition(definition, strategy, settings)?;
        Ok(Self::from_backend(Box::new(compiled)))
    }

    pub fn lagrangian(definition: &str) -> Result<Self, BindingError> {
        Self::custom_with(definition, CompileStrategy::Lagrangian, SolverSettings::default())
    }

    pub fn kinetic(definition: &str, settings: KineticSettings) -> Result<Self, BindingError> {
        let system = KineticSystem::from_definition(definition, settings)?;
        Ok(Self::from_backend(Box::new(system)))
    }

    pub fn closed_form(kind: ClosedFormKind) -> Self {
        Self::from_backend(Box::new(ClosedFormSystem::new(kind)))
    }

    pub fn one_to_one() -> Self {
        Self::closed_form(ClosedFormKind::OneToOne)
    }

    pub fn competition() -> Self {
        Self::closed_form(ClosedFormKind::Competition)
    }

    pub fn homodimer_formation() -> Self {
        Self::closed_form(ClosedFormKind::HomodimerFormation)
    }

    pub fn homodimer_breaking() -> Self {
        Self::closed_form(ClosedFormKind::HomodimerBreaking)
    }

    /// Builds a named system, e.g. `"1:1"`, `"competition lagrange"` or
    /// `"homodimer formation kinetic"`. Case and whitespace are ignored.
    pub fn from_shortcut(name: &str) -> Result<Self, BindingError> {
        let key: String = name
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect::<String>()
            .to_lowercase();
        let unknown = || BindingError::UnknownSystem(name.to_string());

        let (base, variant) = SHORTCUT_VARIANTS
            .iter()
            .find_map(|&(suffix, variant)| {
                key.strip_suffix(suffix)
                    .filter(|base| !base.is_empty())
                    .map(|base| (base, Some(variant)))
            })
            .unwrap_or((key.as_str(), None));

        let topology = match base {
            "simple" | "1:1" => Shortcut::Closed(ClosedFormKind::OneToOne),
            "competition" | "1:1:1" => Shortcut::Closed(ClosedFormKind::Competition),
            "homodimerformation" | "homodimer" => {
                Shortcut::Closed(ClosedFormKind::HomodimerFormation)
            }
            "homodimerbreaking" => Shortcut::Closed(ClosedFormKind::HomodimerBreaking),
            "1:2" => Shortcut::Multisite(ONE_TO_TWO),
            "1:3" => Shortcut::Multisite(ONE_TO_THREE),
            _ => return Err(unknown()),
        };

        match (topology, variant) {
            (Shortcut::Closed(kind), None | Some(Variant::Analytical)) => {
                Ok(Self::closed_form(kind))
            }
            (Shortcut::Closed(kind), Some(Variant::Min)) => Self::custom(kind_definition(kind)),
            (Shortcut::Closed(kind), Some(Variant::Lagrange)) => {
                Self::lagrangian(kind_definition(kind))
            }
            (Shortcut::Closed(kind), Some(Variant::Kinetic)) => {
                let settings = KineticSettings::default();
                let system = match kind {
                    ClosedFormKind::OneToOne => KineticSystem::one_to_one(settings)?,
                    ClosedFormKind::Competition => KineticSystem::competition(settings)?,
                    ClosedFormKind::HomodimerFormation => {
                        KineticSystem::homodimer_formation(settings)?
                    }
                    ClosedFormKind::HomodimerBreaking => {
                        KineticSystem::homodimer_breaking(settings)?
                    }
                };
                Ok(Self::from_backend(Box::new(system)))
            }
            (Shortcut::Multisite(definition), None | Some(Variant::Min)) => {
                Self::custom(definition)
            }
            (Shortcut::Multisite(definition), Some(Variant::Lagrange)) => {
                Self::lagrangian(definition)
            }
            (Shortcut::Multisite(_), Some(Variant::Analytical | Variant::Kinetic)) => Err(unknown()),
        }
    }

    /// Reports `species` by default. Fundamental species report their free
    /// concentration.
    pub fn with_readout(mut self, species: &str) -> Result<Self, BindingError> {
        let species = species.trim().to_lowercase();
        self.check_readout(&species)?;
        self.readout = species;
        Ok(self)
    }

    pub fn with_branch_policy(mut self, policy: BranchPolicy) -> Self {
        self.branch_policy = policy;
        self
    }

    pub fn schema(&self) -> &ParameterSchema {
        self.backend.schema()
    }

    /// Required argument names in call order.
    pub fn arguments(&self) -> Vec<&str> {
        self.backend.schema().names().collect()
    }

    pub fn readout(&self) -> &str {
        &self.readout
    }

    pub fn is_analytical(&self) -> bool {
        self.backend.is_analytical()
    }

    pub fn branch_policy(&self) -> BranchPolicy {
        self.branch_policy
    }

    /// Number of branches a query may report under the current policy.
    pub fn num_solutions(&self) -> usize {
        match self.branch_policy {
            BranchPolicy::Physical => 1,
            BranchPolicy::All => self.backend.num_solutions(),
        }
    }

    /// Every species concentration for arguments in `arguments()` order.
    pub fn equilibrate(&self, args: &[f64]) -> Result<Vec<SpeciesMap>, BindingError> {
        let mut maps = self.backend.equilibrate(args)?;
        if self.branch_policy == BranchPolicy::Physical {
            maps.truncate(1);
        }
        Ok(maps)
    }

    fn check_readout(&self, species: &str) -> Result<(), BindingError> {
        let known = self.backend.species();
        let free = free_name(species);
        if known.iter().any(|s| s == species || *s == free) {
            Ok(())
        } else {
            Err(BindingError::UnknownReadout(species.to_string()))
        }
    }

    pub fn query(&self, query: &Query) -> Result<QueryResult, BindingError> {
        let schema = self.backend.schema();
        let missing: Vec<String> = schema
            .names()
            .filter(|name| !query.params.contains_key(*name))
            .map(str::to_string)
            .collect();
        if !missing.is_empty() {
            return Err(BindingError::MissingParameters(missing));
        }

        let changing = query.changing();
        if let Some(name) = changing.iter().find(|name| schema.position(name).is_none()) {
            return Err(BindingError::InvalidSweep(name.to_string()));
        }
        if changing.len() > 1 {
            return Err(BindingError::MultipleChangingParameters(
                changing.iter().map(|s| s.to_string()).collect(),
            ));
        }

        for name in schema.names() {
            let values = query.params.get(name).map_or(&[][..], ParamValue::values);
            if let Some(&value) = values.iter().find(|v| !v.is_finite() || **v < 0.0) {
                return Err(BindingError::InvalidParameter {
                    name: name.to_string(),
                    value,
                });
            }
        }

        let readout = query.readout.as_deref().unwrap_or(&self.readout);
        self.check_readout(readout)?;
        let bounds = query.bounds();

        let param_names: Vec<String> = query.params.keys().cloned().collect();
        let transform = query
            .transform
            .as_ref()
            .map(|t| t.bind(&param_names))
            .transpose()?;

        let points = match changing.first() {
            Some(name) => query.params[*name].values().len(),
            None => 1,
        };

        let mut results = Vec::with_capacity(points);
        let mut stack = Vec::new();
        for index in 0..points {
            let args: Vec<f64> = schema
                .names()
                .map(|name| query.params[name].at(index))
                .collect();
            let normalizer = self.backend.normalizer(readout, &args);
            let params: Vec<f64> = query.params.values().map(|v| v.at(index)).collect();

            let mut branches = Vec::new();
            for map in self.equilibrate(&args)? {
                let raw = map
                    .concentration(readout)
                    .ok_or_else(|| BindingError::UnknownReadout(readout.to_string()))?;
                let mut value = match bounds {
                    Some((ymin, ymax)) => scale(raw, normalizer, ymin, ymax),
                    None => raw,
                };
                if let Some(bytecode) = &transform {
                    value = VM::execute(bytecode, &[value], &params, &[], &mut stack);
                }
                branches.push(value);
            }
            results.push(branches);
        }

        let physical = self.branch_policy == BranchPolicy::Physical;
        Ok(match (changing.is_empty(), physical) {
            (true, true) => QueryResult::Point(first(&results)),
            (true, false) => QueryResult::Branches(results.into_iter().next().unwrap_or_default()),
            (false, true) => QueryResult::Curve(
                results
                    .iter()
                    .map(|b| b.first().copied().unwrap_or(f64::NAN))
                    .collect(),
            ),
            (false, false) => QueryResult::BranchCurves(results),
        })
    }
}

fn first(results: &[Vec<f64>]) -> f64 {
    results
        .first()
        .and_then(|b| b.first())
        .copied()
        .unwrap_or(f64::NAN)
}

/// `ymin + (ymax − ymin) · raw / normalizer`, with a zero normalizer giving `ymin`.
fn scale(raw: f64, normalizer: f64, ymin: f64, ymax: f64) -> f64 {
    let ratio = raw / normalizer;
    let ratio = if ratio.is_finite() { ratio } else { 0.0 };
    ymin + (ymax - ymin) * ratio
}
