//! Exchange-correlation functionals as capability sets.
//!
//! A [`Functional`] is a struct of optional boxed closures rather than a
//! trait hierarchy: the predictor branches on which capabilities are present
//! instead of downcasting. The split into "with-grad" and "without-grad"
//! feature channels mirrors the two ways a feature can enter the energy:
//! built on the tape from the density-matrix leaves (so reverse mode sees
//! it), or computed up front from the snapshot and entered as a tape
//! constant (stop-gradient). Functionals that stop-gradient a channel may
//! supply a closed-form Fock contribution for it through the explicit
//! gradient hooks.

pub mod classical;
pub mod neural;

extern crate nalgebra as na;

use na::DMatrix;

use crate::error::{Error, Result};
use crate::molecule::{Molecule, SpinMatrix};
use crate::tape::{Tape, Var};

pub use neural::{DenseLayer, FunctionalParams};

/// The density-matrix leaves of one energy evaluation, one tape node per
/// spin channel.
#[derive(Clone, Copy)]
pub struct SpinVar<'t> {
    pub alpha: Var<'t>,
    pub beta: Var<'t>,
}

/// Gradient-requiring feature generator: builds features on the tape from
/// the density-matrix leaves so reverse mode can reach them.
pub type GradFeatureFn =
    Box<dyn for<'t> Fn(&'t Tape, &Molecule, SpinVar<'t>) -> Result<Var<'t>> + Send + Sync>;

/// Gradient-free feature generator: evaluated off the tape, entered as a
/// constant. Its output is a per-grid-point matrix `(n_grid, k)`.
pub type NogradFeatureFn = Box<dyn Fn(&Molecule) -> Result<DMatrix<f64>> + Send + Sync>;

/// Merges the with-grad and without-grad channels of one feature pair.
pub type CombineFn = Box<dyn for<'t> Fn(&'t Tape, Var<'t>, Var<'t>) -> Var<'t> + Send + Sync>;

/// Per-grid-point energy contributions `(n_grid, 1)` from the coefficient
/// inputs and densities; the caller integrates them against grid weights.
pub type PointwiseFn = Box<
    dyn for<'t> Fn(&'t Tape, &FunctionalParams, Option<Var<'t>>, Option<Var<'t>>) -> Result<Var<'t>>
        + Send
        + Sync,
>;

/// Closed-form Fock contribution for a stop-gradiented channel. Receives
/// the channel's (detached) feature values; returns the half-potential `V`
/// per spin, already summed over omega channels. The predictor adds
/// `V + V^T`.
pub type ExplicitGradFn =
    Box<dyn Fn(&FunctionalParams, &Molecule, &DMatrix<f64>) -> Result<SpinMatrix> + Send + Sync>;

/// A pluggable exchange-correlation functional.
///
/// Only `pointwise` is required. Every other capability is optional and the
/// energy composition skips absent channels; see [`Functional::validate`]
/// for the pairing invariants between explicit gradients and their
/// without-grad channels.
pub struct Functional {
    pub name: String,
    pub pointwise: PointwiseFn,
    pub density_features: Option<GradFeatureFn>,
    pub nograd_density_features: Option<NogradFeatureFn>,
    pub combine_densities: Option<CombineFn>,
    pub coefficient_inputs: Option<GradFeatureFn>,
    pub nograd_coefficient_inputs: Option<NogradFeatureFn>,
    pub combine_inputs: Option<CombineFn>,
    pub density_feature_grads: Option<ExplicitGradFn>,
    pub coefficient_input_grads: Option<ExplicitGradFn>,
    /// If true the functional returns only the XC correction; the classical
    /// Coulomb and core-Hamiltonian terms are added by the predictor and the
    /// non-XC energy enters [`Functional::energy`] as a constant.
    pub exchange_correlation_only: bool,
}

impl Functional {
    /// XC-only functional with no optional channels.
    pub fn new(name: impl Into<String>, pointwise: PointwiseFn) -> Self {
        Functional {
            name: name.into(),
            pointwise,
            density_features: None,
            nograd_density_features: None,
            combine_densities: None,
            coefficient_inputs: None,
            nograd_coefficient_inputs: None,
            combine_inputs: None,
            density_feature_grads: None,
            coefficient_input_grads: None,
            exchange_correlation_only: true,
        }
    }

    /// Registration-time invariant checks. An explicit gradient hook is
    /// defined with respect to a without-grad channel, so that channel must
    /// exist; a channel pair needs a combiner.
    pub fn validate(&self) -> Result<()> {
        if self.density_feature_grads.is_some() && self.nograd_density_features.is_none() {
            return Err(Error::config(format!(
                "functional '{}' declares explicit density gradients without a \
                 without-grad density channel",
                self.name
            )));
        }
        if self.coefficient_input_grads.is_some() && self.nograd_coefficient_inputs.is_none() {
            return Err(Error::config(format!(
                "functional '{}' declares explicit coefficient gradients without a \
                 without-grad coefficient channel",
                self.name
            )));
        }
        if self.density_features.is_some()
            && self.nograd_density_features.is_some()
            && self.combine_densities.is_none()
        {
            return Err(Error::config(format!(
                "functional '{}' has both density channels but no combiner",
                self.name
            )));
        }
        if self.coefficient_inputs.is_some()
            && self.nograd_coefficient_inputs.is_some()
            && self.combine_inputs.is_none()
        {
            return Err(Error::config(format!(
                "functional '{}' has both coefficient channels but no combiner",
                self.name
            )));
        }
        Ok(())
    }

    /// Total energy at the given density-matrix leaves, as a scalar tape
    /// node. XC contributions are integrated against the grid weights; for
    /// XC-only functionals the classical energy enters as a constant so the
    /// tape gradient stays the pure XC potential.
    pub fn energy<'t>(
        &self,
        tape: &'t Tape,
        params: &FunctionalParams,
        molecule: &Molecule,
        rdm1: SpinVar<'t>,
    ) -> Result<Var<'t>> {
        let densities = self.compose(
            tape,
            molecule,
            rdm1,
            &self.density_features,
            &self.nograd_density_features,
            &self.combine_densities,
        )?;
        let cinputs = self.compose(
            tape,
            molecule,
            rdm1,
            &self.coefficient_inputs,
            &self.nograd_coefficient_inputs,
            &self.combine_inputs,
        )?;
        let pointwise = (self.pointwise)(tape, params, cinputs, densities)?;

        let weights = DMatrix::from_column_slice(
            molecule.grid.len(),
            1,
            molecule.grid.weights.as_slice(),
        );
        let mut e = pointwise.dot(tape.constant(weights));
        if self.exchange_correlation_only {
            e = e + tape.scalar(molecule.non_xc_energy()?);
        }
        Ok(e)
    }

    /// Merge one with-grad/without-grad channel pair, handling all four
    /// presence combinations. The without-grad output enters the tape as a
    /// constant, so nothing downstream of it receives an adjoint.
    fn compose<'t>(
        &self,
        tape: &'t Tape,
        molecule: &Molecule,
        rdm1: SpinVar<'t>,
        with_grad: &Option<GradFeatureFn>,
        without_grad: &Option<NogradFeatureFn>,
        combine: &Option<CombineFn>,
    ) -> Result<Option<Var<'t>>> {
        let grad = match with_grad {
            Some(f) => Some(f(tape, molecule, rdm1)?),
            None => None,
        };
        let nograd = match without_grad {
            Some(f) => Some(tape.constant(f(molecule)?)),
            None => None,
        };
        match (grad, nograd) {
            (Some(g), Some(n)) => {
                let combine = combine.as_ref().ok_or_else(|| {
                    Error::config(format!(
                        "functional '{}' has both channels but no combiner",
                        self.name
                    ))
                })?;
                Ok(Some(combine(tape, g, n)))
            }
            (Some(g), None) => Ok(Some(g)),
            (None, Some(n)) => Ok(Some(n)),
            (None, None) => Ok(None),
        }
    }
}

impl std::fmt::Debug for Functional {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Functional")
            .field("name", &self.name)
            .field("density_features", &self.density_features.is_some())
            .field(
                "nograd_density_features",
                &self.nograd_density_features.is_some(),
            )
            .field("coefficient_inputs", &self.coefficient_inputs.is_some())
            .field(
                "nograd_coefficient_inputs",
                &self.nograd_coefficient_inputs.is_some(),
            )
            .field("density_feature_grads", &self.density_feature_grads.is_some())
            .field(
                "coefficient_input_grads",
                &self.coefficient_input_grads.is_some(),
            )
            .field("exchange_correlation_only", &self.exchange_correlation_only)
            .finish()
    }
}

/// Per-spin densities on the grid as a `(n_grid, 2)` tape node built from
/// the density-matrix leaves. The shared with-grad channel of the local
/// functionals.
pub fn density_features<'t>(
    tape: &'t Tape,
    molecule: &Molecule,
    rdm1: SpinVar<'t>,
) -> Result<Var<'t>> {
    let ao = tape.constant(molecule.ao.clone());
    let rho_a = ao.bilinear(rdm1.alpha, ao);
    let rho_b = ao.bilinear(rdm1.beta, ao);
    Ok(tape.hstack(&[rho_a, rho_b]))
}

/// Per-spin densities plus squared density gradients,
/// `(n_grid, 4) = [rho_a, rho_b, sigma_a, sigma_b]`. The with-grad channel
/// of the gradient-corrected functionals.
pub fn gga_density_features<'t>(
    tape: &'t Tape,
    molecule: &Molecule,
    rdm1: SpinVar<'t>,
) -> Result<Var<'t>> {
    let ao = tape.constant(molecule.ao.clone());
    let rho_a = ao.bilinear(rdm1.alpha, ao);
    let rho_b = ao.bilinear(rdm1.beta, ao);
    // d_a rho_s = 2 (d_a phi)^T D_s phi for symmetric D.
    let sigma = |d: Var<'t>| {
        let mut acc: Option<Var<'t>> = None;
        for axis in 0..3 {
            let dao = tape.constant(molecule.grad_ao[axis].clone());
            let comp = dao.bilinear(d, ao).scale(2.0);
            let sq = comp * comp;
            acc = Some(match acc {
                Some(a) => a + sq,
                None => sq,
            });
        }
        acc.expect("three axes")
    };
    let sigma_a = sigma(rdm1.alpha);
    let sigma_b = sigma(rdm1.beta);
    Ok(tape.hstack(&[rho_a, rho_b, sigma_a, sigma_b]))
}

/// Additive dispersion correction. Constant with respect to the density
/// matrix, so it shifts the energy without touching the Fock operator.
#[derive(Debug, Clone)]
pub struct DispersionFunctional {
    /// Pairwise C6 coefficient, atomic units.
    pub c6: f64,
    /// Damping radius keeping the short-range limit finite.
    pub r0: f64,
}

impl DispersionFunctional {
    pub fn new(c6: f64, r0: f64) -> Self {
        DispersionFunctional { c6, r0 }
    }

    /// Damped pairwise -C6/R^6 over the nuclear positions.
    pub fn energy(&self, molecule: &Molecule) -> f64 {
        let pos = &molecule.nuclear_pos;
        let mut e = 0.0;
        for i in 0..pos.len() {
            for j in i + 1..pos.len() {
                let r2 = (pos[i] - pos[j]).norm_squared();
                let r6 = r2 * r2 * r2;
                e -= self.c6 / (r6 + self.r0.powi(6));
            }
        }
        e
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::functional::classical::lsda;
    use crate::test_fixtures::h2_like;
    use approx::assert_relative_eq;

    #[test]
    fn validate_rejects_explicit_grad_without_nograd_channel() {
        let mut f = lsda();
        f.density_feature_grads = Some(Box::new(|_, _, _| {
            Ok(SpinMatrix::zeros(2))
        }));
        assert!(matches!(f.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn validate_rejects_channel_pair_without_combiner() {
        let mut f = lsda();
        f.nograd_density_features = Some(Box::new(|m: &Molecule| m.exact_exchange_density()));
        assert!(matches!(f.validate(), Err(Error::Config(_))));
        f.combine_densities = Some(Box::new(|t, g, n| t.hstack(&[g, n])));
        assert!(f.validate().is_ok());
    }

    #[test]
    fn energy_skips_absent_channels() {
        // No feature channels at all: pointwise sees two Nones and the
        // energy is just the integrated constant plus the classical part.
        let mol = h2_like();
        let f = Functional::new(
            "flat",
            Box::new(|t: &Tape, _: &FunctionalParams, c, d| {
                assert!(c.is_none() && d.is_none());
                Ok(t.constant(na::DMatrix::from_element(6, 1, 0.0)))
            }),
        );
        let tape = Tape::new();
        let rdm1 = SpinVar {
            alpha: tape.var(mol.rdm1.alpha.clone()),
            beta: tape.var(mol.rdm1.beta.clone()),
        };
        let e = f
            .energy(&tape, &FunctionalParams::empty(), &mol, rdm1)
            .unwrap();
        assert_relative_eq!(e.value()[(0, 0)], mol.non_xc_energy().unwrap());
    }

    #[test]
    fn density_features_match_direct_evaluation() {
        let mol = h2_like();
        let tape = Tape::new();
        let rdm1 = SpinVar {
            alpha: tape.var(mol.rdm1.alpha.clone()),
            beta: tape.var(mol.rdm1.beta.clone()),
        };
        let feats = density_features(&tape, &mol, rdm1).unwrap().value();
        let [rho_a, rho_b] = mol.density_on_grid();
        for g in 0..mol.grid.len() {
            assert_relative_eq!(feats[(g, 0)], rho_a[g], epsilon = 1e-12);
            assert_relative_eq!(feats[(g, 1)], rho_b[g], epsilon = 1e-12);
        }
    }

    #[test]
    fn gga_features_match_direct_gradients() {
        let mol = h2_like();
        let tape = Tape::new();
        let rdm1 = SpinVar {
            alpha: tape.var(mol.rdm1.alpha.clone()),
            beta: tape.var(mol.rdm1.beta.clone()),
        };
        let feats = gga_density_features(&tape, &mol, rdm1).unwrap().value();
        let grads = mol.density_gradient_on_grid();
        for g in 0..mol.grid.len() {
            let sigma_a: f64 = (0..3).map(|ax| grads[0][ax][g].powi(2)).sum();
            assert_relative_eq!(feats[(g, 2)], sigma_a, epsilon = 1e-12);
        }
    }

    #[test]
    fn dispersion_is_attractive_and_finite() {
        let mol = h2_like();
        let disp = DispersionFunctional::new(6.5, 2.0);
        let e = disp.energy(&mol);
        assert!(e < 0.0 && e.is_finite());
    }
}
