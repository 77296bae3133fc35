//! Energy-and-Fock predictor.
//!
//! The Fock operator is the gradient of the energy with respect to the
//! density matrix, recovered by one reverse pass over the tape. Raw
//! adjoints of expressions that are not manifestly symmetric need not be
//! symmetric, so every contribution is symmetrized before use.

use crate::error::{Error, Result};
use crate::functional::{DispersionFunctional, Functional, FunctionalParams, SpinVar};
use crate::molecule::{coulomb_potential, Molecule, SpinMatrix};
use crate::tape::Tape;

/// Spin-indexed effective one-electron operator, same shape as `rdm1`.
pub type FockOperator = SpinMatrix;

/// Pure function of (params, molecule) once constructed: evaluates the
/// functional's energy at the snapshot's density matrix and derives the
/// Fock operator from it.
pub struct Predictor {
    functional: Functional,
    dispersion: Option<DispersionFunctional>,
}

impl Predictor {
    /// Validates the functional's capability pairing eagerly; a predictor
    /// never holds an inconsistent functional.
    pub fn new(functional: Functional) -> Result<Self> {
        functional.validate()?;
        Ok(Predictor {
            functional,
            dispersion: None,
        })
    }

    pub fn with_dispersion(mut self, dispersion: DispersionFunctional) -> Self {
        self.dispersion = Some(dispersion);
        self
    }

    pub fn functional(&self) -> &Functional {
        &self.functional
    }

    /// Energy and Fock operator at the snapshot's density matrix.
    ///
    /// The energy map is evaluated with the two spin slices of `rdm1` as
    /// tape leaves; its adjoint is the variational Fock operator. Explicit
    /// gradient hooks then contribute `V + V^T` for the stop-gradiented
    /// channels, and for XC-only functionals the classical Coulomb and
    /// core-Hamiltonian terms are stacked on per spin.
    pub fn predict(
        &self,
        params: &FunctionalParams,
        molecule: &Molecule,
    ) -> Result<(f64, FockOperator)> {
        let tape = Tape::new();
        let alpha = tape.var(molecule.rdm1.alpha.clone());
        let beta = tape.var(molecule.rdm1.beta.clone());
        let rdm1 = SpinVar { alpha, beta };

        let mut e = self.functional.energy(&tape, params, molecule, rdm1)?;
        if let Some(disp) = &self.dispersion {
            e = e + tape.scalar(disp.energy(molecule));
        }
        let energy = e.value()[(0, 0)];

        let grads = tape.backward(e);
        let n = molecule.n_ao();
        let mut fock =
            SpinMatrix::new(grads.wrt(alpha, n, n), grads.wrt(beta, n, n)).symmetrized();

        if let Some(hook) = &self.functional.density_feature_grads {
            let generator = self
                .functional
                .nograd_density_features
                .as_ref()
                .ok_or_else(|| {
                    Error::config("explicit density gradients without a without-grad channel")
                })?;
            let detached = generator(molecule)?;
            let v = hook(params, molecule, &detached)?;
            fock += &v.plus_transpose();
        }
        if let Some(hook) = &self.functional.coefficient_input_grads {
            let generator = self
                .functional
                .nograd_coefficient_inputs
                .as_ref()
                .ok_or_else(|| {
                    Error::config("explicit coefficient gradients without a without-grad channel")
                })?;
            let detached = generator(molecule)?;
            let v = hook(params, molecule, &detached)?;
            fock += &v.plus_transpose();
        }

        if self.functional.exchange_correlation_only {
            let eri = molecule.rep_tensor.as_ref().ok_or_else(|| {
                Error::config(
                    "XC-only functional needs the two-electron repulsion tensor \
                     for the classical Coulomb term",
                )
            })?;
            let symmetric = molecule.rdm1.symmetrized();
            let j = coulomb_potential(&symmetric, eri);
            fock.alpha += &j;
            fock.beta += &j;
            fock.alpha += &molecule.h1e;
            fock.beta += &molecule.h1e;
        }

        Ok((energy, fock))
    }
}
