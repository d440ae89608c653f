/// Implements the compound-assignment operators in terms of the binary ones.
macro_rules! impl_assign_ops {
    ($ty:ty) => {
        impl std::ops::AddAssign for $ty {
            fn add_assign(&mut self, rhs: Self) {
                *self = *self + rhs;
            }
        }
        impl std::ops::SubAssign for $ty {
            fn sub_assign(&mut self, rhs: Self) {
                *self = *self - rhs;
            }
        }
        impl std::ops::MulAssign for $ty {
            fn mul_assign(&mut self, rhs: Self) {
                *self = *self * rhs;
            }
        }
        impl std::ops::DivAssign for $ty {
            fn div_assign(&mut self, rhs: Self) {
                *self = *self / rhs;
            }
        }
        impl std::ops::RemAssign for $ty {
            fn rem_assign(&mut self, rhs: Self) {
                *self = *self % rhs;
            }
        }
    };
}

pub mod autodiff;
pub mod cache;
pub mod closed_form;
pub mod compiler;
pub mod equation_engine;
pub mod equilibrium;
pub mod error;
pub mod fitting;
pub mod kinetic;
pub mod network;
pub mod precision;
pub mod solvers;
pub mod stoichiometry;
pub mod system;
/// The `bindcurve_core` crate compiles textual binding networks (e.g.
/// `"p+l<->pl*, p+i<->pi"`) into conservation equations and solves them for
/// equilibrium species concentrations.
///
/// Key components:
/// - **Network / Stoichiometry**: DSL parsing and monomer-count resolution.
/// - **Compiler**: mass-action and conservation expressions compiled to bytecode for the VM.
/// - **Equilibrium**: log-space Newton solver with double-double residuals and dual-number Jacobians.
/// - **Closed Form**: exact solutions for 1:1, competition and homodimer systems.
/// - **Kinetic**: mass-action ODE integration to steady state, used as a cross-check.
/// - **System**: the `BindingSystem` query dispatcher (point and swept queries, signal scaling).
/// - **Fitting / Cache**: Levenberg-Marquardt parameter fitting and a CSV sweep cache.
pub mod traits;
pub mod types;

pub use cache::SweepCache;
pub use error::BindingError;
pub use fitting::{fit, FitParameter, FitResult, FitSettings};
pub use system::{BindingSystem, ParamValue, Query, QueryResult, ReadoutTransform};
pub use types::{BranchPolicy, ParameterSchema, SpeciesMap};
