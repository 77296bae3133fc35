//! Error taxonomy for the SCF workflow.
//!
//! Configuration and shape errors are detected eagerly at the boundary
//! (molecule construction, functional registration, dataset loading) and are
//! always fatal. Numerical divergence is fatal and raised mid-iteration.
//! Non-convergence is *not* an error: the SCF solver reports it as a terminal
//! status so batch callers can aggregate statistics without aborting.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Invalid input detected before any numerics run: malformed shapes,
    /// missing required tensors, unknown functional names, bad omega requests.
    #[error("configuration error: {0}")]
    Config(String),

    /// NaN/Inf detected in the energy or Fock operator during iteration.
    /// Divergent values are never clamped or silently propagated.
    #[error("numerical divergence in SCF cycle {cycle}: {detail}")]
    Divergence { cycle: usize, detail: String },

    #[error("dataset i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("dataset format error: {0}")]
    Format(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }
}
