use thiserror::Error;

use crate::cache::CacheError;
use crate::equation_engine::CompileError;
use crate::equilibrium::SolveError;
use crate::network::NetworkError;

/// Errors surfaced by binding systems and queries.
#[derive(Debug, Error)]
pub enum BindingError {
    #[error("Malformed network: {0}")]
    Network(#[from] NetworkError),

    #[error("Compilation failed: {0}")]
    Compile(#[from] CompileError),

    #[error("Equilibrium solve failed: {0}")]
    Solve(#[from] SolveError),

    #[error("Missing required parameters: {}", .0.join(", "))]
    MissingParameters(Vec<String>),

    #[error("Only one parameter may vary per query, found: {}", .0.join(", "))]
    MultipleChangingParameters(Vec<String>),

    #[error("Parameter '{0}' cannot be swept; only system arguments may vary")]
    InvalidSweep(String),

    #[error("Invalid value {value} for parameter '{name}'; expected a finite, non-negative number")]
    InvalidParameter { name: String, value: f64 },

    #[error("Unknown binding system '{0}'")]
    UnknownSystem(String),

    #[error("Unknown readout species '{0}'")]
    UnknownReadout(String),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
