//! Differentiable Kohn-Sham SCF with pluggable exchange-correlation
//! functionals.
//!
//! The energy functional is a differentiable map from the density matrix to
//! a scalar; one reverse pass over the [`tape`] recovers the Fock operator,
//! and [`scf_impl`] drives the fixed-point iteration to self-consistency.
//! Snapshots come from an external quantum-chemistry engine through
//! [`io::dataset`].

pub mod config;
pub mod error;
pub mod functional;
pub mod io;
pub mod molecule;
pub mod predictor;
pub mod scf_impl;
pub mod tape;

#[doc(hidden)]
pub mod test_fixtures;

pub use error::{Error, Result};
pub use functional::{Functional, FunctionalParams};
pub use molecule::Molecule;
pub use predictor::Predictor;
pub use scf_impl::{ScfSolution, ScfSolver, ScfStatus};
