use crate::error::BindingError;
use crate::types::{ParameterSchema, SpeciesMap};
use num_traits::{Float, FromPrimitive};
use std::fmt::Debug;

/// A trait for types that can be used as scalars in the equation engine and solvers.
/// Implemented by `f64`, `Dual` (forward-mode derivatives) and `DoubleDouble`
/// (extended precision residuals).
pub trait Scalar: Float + FromPrimitive + Debug + 'static {
    /// Lifts an `f64` constant into the scalar type.
    fn of(value: f64) -> Self {
        Self::from_f64(value).unwrap_or_else(Self::nan)
    }
}

impl<T: Float + FromPrimitive + Debug + 'static> Scalar for T {}

/// Represents a vector-valued function of a state vector.
///
/// Used both for ODE right-hand sides (kinetic backend) and for the
/// conservation residuals of a compiled network, where `t` is ignored.
pub trait DynamicalSystem<T: Scalar> {
    /// Returns the dimension of the state space.
    fn dimension(&self) -> usize;

    /// Evaluates the vector field or residual.
    /// t: current time
    /// x: current state
    /// out: buffer to write the result
    fn apply(&self, t: T, x: &[T], out: &mut [T]);
}

/// A scalar objective over the same state as a `DynamicalSystem`.
pub trait Objective<T: Scalar> {
    fn value(&self, x: &[T]) -> T;
}

/// A trait for solvers that can step a system forward.
pub trait Steppable<T: Scalar> {
    /// Performs one step of size dt, updating `t` and `state` in place.
    fn step(&mut self, system: &impl DynamicalSystem<T>, t: &mut T, state: &mut [T], dt: T);
}

/// A backend that can compute equilibrium species concentrations.
///
/// Arguments are passed positionally in the order given by `schema()`.
pub trait EquilibriumBackend: Send + Sync {
    fn schema(&self) -> &ParameterSchema;

    fn default_readout(&self) -> &str;

    /// True for closed-form (analytical) systems.
    fn is_analytical(&self) -> bool;

    /// Maximum number of algebraic solution branches `equilibrate` may return.
    fn num_solutions(&self) -> usize {
        1
    }

    /// Names of all species reported in the output maps.
    fn species(&self) -> Vec<String>;

    /// Maximum achievable concentration of `readout` for the given arguments.
    fn normalizer(&self, readout: &str, args: &[f64]) -> f64;

    /// Solves the system. The first map is always the physically valid branch.
    fn equilibrate(&self, args: &[f64]) -> Result<Vec<SpeciesMap>, BindingError>;
}
