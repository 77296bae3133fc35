//! Learned exchange-correlation functional.
//!
//! A small per-grid-point MLP modulates the local exchange energy density:
//! the squashed spin densities go through dense tanh layers and the output
//! gates the Slater energy density through a sigmoid. The parameters live
//! on the tape as leaves, so one backward pass yields both the Fock operator
//! (adjoint of the density-matrix leaves) and, for training, the parameter
//! adjoints.

extern crate nalgebra as na;

use na::DMatrix;
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::tape::{Tape, Var};

use super::{density_features, Functional};

/// One affine layer; `bias` is a `(1, out)` row broadcast over grid points.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DenseLayer {
    pub weight: DMatrix<f64>,
    pub bias: DMatrix<f64>,
}

/// Parameters of the learned functional. Classical functionals carry an
/// empty set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionalParams {
    pub layers: Vec<DenseLayer>,
}

impl FunctionalParams {
    pub fn empty() -> Self {
        FunctionalParams { layers: Vec::new() }
    }

    /// Random MLP mapping the two spin densities through hidden `widths`
    /// to a single gate output. 1/sqrt(fan-in) scaling.
    pub fn random_mlp(widths: &[usize]) -> Self {
        let mut dims = vec![2];
        dims.extend_from_slice(widths);
        dims.push(1);
        let layers = dims
            .windows(2)
            .map(|d| {
                let (fan_in, fan_out) = (d[0], d[1]);
                let scale = 1.0 / (fan_in as f64).sqrt();
                DenseLayer {
                    weight: (DMatrix::new_random(fan_in, fan_out).add_scalar(-0.5)).scale(scale),
                    bias: DMatrix::zeros(1, fan_out),
                }
            })
            .collect();
        FunctionalParams { layers }
    }

    /// Enter every layer as differentiable leaves on the tape.
    fn on_tape<'t>(&self, tape: &'t Tape) -> Vec<(Var<'t>, Var<'t>)> {
        self.layers
            .iter()
            .map(|l| (tape.var(l.weight.clone()), tape.var(l.bias.clone())))
            .collect()
    }
}

/// The MLP-gated Slater functional.
pub fn mlp() -> Functional {
    let mut f = Functional::new(
        "neural-mlp",
        Box::new(|tape: &Tape, params: &FunctionalParams, _c, densities| {
            let d = densities
                .ok_or_else(|| Error::config("neural functional requires density features"))?;
            if params.layers.is_empty() {
                return Err(Error::config("neural functional evaluated with empty parameters"));
            }
            let first = &params.layers[0].weight;
            let last = &params.layers[params.layers.len() - 1].weight;
            if first.nrows() != 2 || last.ncols() != 1 {
                return Err(Error::config(format!(
                    "MLP must map 2 densities to 1 gate, got {} -> {}",
                    first.nrows(),
                    last.ncols()
                )));
            }

            // log(|x| + 1e-4) squash keeps the dynamic range of the
            // densities manageable for the network.
            let mut x = d.abs().shift(1e-4).ln();
            let n_layers = params.layers.len();
            for (i, (w, b)) in params.on_tape(tape).into_iter().enumerate() {
                x = x.matmul(w).add_row(b);
                if i + 1 < n_layers {
                    x = x.tanh();
                }
            }
            // Gate in (0, 2): the network scales local exchange up or down.
            let gate = x.sigmoid().scale(2.0);

            let rho_a = d.col(0).shift(1e-27);
            let rho_b = d.col(1).shift(1e-27);
            let e_x = (rho_a.powf(4.0 / 3.0) + rho_b.powf(4.0 / 3.0))
                .scale(-0.75 * (3.0 / std::f64::consts::PI).powf(1.0 / 3.0) * 2.0_f64.powf(1.0 / 3.0));
            Ok(gate * e_x)
        }),
    );
    f.density_features = Some(Box::new(density_features));
    f
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::functional::SpinVar;
    use crate::test_fixtures::h2_like;
    use approx::assert_relative_eq;

    fn energy_with(params: &FunctionalParams) -> f64 {
        let mol = h2_like();
        let f = mlp();
        let tape = Tape::new();
        let rdm1 = SpinVar {
            alpha: tape.var(mol.rdm1.alpha.clone()),
            beta: tape.var(mol.rdm1.beta.clone()),
        };
        f.energy(&tape, params, &mol, rdm1).unwrap().value()[(0, 0)]
    }

    #[test]
    fn energy_depends_on_parameters() {
        let mut params = FunctionalParams::random_mlp(&[4]);
        let e1 = energy_with(&params);
        params.layers[1].bias[(0, 0)] += 3.0;
        let e2 = energy_with(&params);
        assert!((e1 - e2).abs() > 1e-8, "bias shift must move the gate");
        assert!(e1.is_finite() && e2.is_finite());
    }

    #[test]
    fn empty_parameters_are_rejected() {
        let mol = h2_like();
        let f = mlp();
        let tape = Tape::new();
        let rdm1 = SpinVar {
            alpha: tape.var(mol.rdm1.alpha.clone()),
            beta: tape.var(mol.rdm1.beta.clone()),
        };
        let r = f.energy(&tape, &FunctionalParams::empty(), &mol, rdm1);
        assert!(matches!(r, Err(Error::Config(_))));
    }

    #[test]
    fn parameters_round_trip_through_json() {
        let params = FunctionalParams::random_mlp(&[3, 3]);
        let text = serde_json::to_string(&params).unwrap();
        let back: FunctionalParams = serde_json::from_str(&text).unwrap();
        assert_eq!(back.layers.len(), params.layers.len());
        assert_relative_eq!(
            back.layers[0].weight[(0, 0)],
            params.layers[0].weight[(0, 0)]
        );
    }
}
