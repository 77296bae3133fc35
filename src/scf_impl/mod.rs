//! SCF fixed-point iteration.
//!
//! Each cycle builds the Fock operator through the predictor, solves the
//! generalized eigenproblem `F C = S C diag(e)` per spin channel by
//! symmetric orthogonalization, refills the orbitals bottom-up and rebuilds
//! the density matrix. Snapshots are immutable: every cycle produces a new
//! [`Molecule`] via [`Molecule::with_orbitals`].
//!
//! Non-convergence is a terminal *status*, not an error, so batch callers
//! can aggregate it. NaN/Inf anywhere in the energy or Fock operator is a
//! fatal [`Error::Divergence`] and is never clamped.

mod diis;

pub use diis::SpinDiis;

extern crate nalgebra as na;

use na::{DMatrix, DVector};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::functional::FunctionalParams;
use crate::molecule::{Molecule, SpinMatrix};
use crate::predictor::{FockOperator, Predictor};

/// Terminal state of one SCF run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScfStatus {
    Converged,
    /// Max cycle count reached without meeting tolerance; the caller
    /// decides whether to treat this as failure.
    MaxCyclesExceeded,
}

/// Result of one SCF run: the last snapshot, its energy and Fock operator,
/// and the per-cycle energy history.
#[derive(Debug)]
pub struct ScfSolution {
    pub energy: f64,
    pub fock: FockOperator,
    pub molecule: Molecule,
    pub status: ScfStatus,
    pub cycles: usize,
    pub history: Vec<f64>,
}

impl ScfSolution {
    pub fn converged(&self) -> bool {
        self.status == ScfStatus::Converged
    }
}

/// Fixed-point solver configuration.
#[derive(Debug, Clone)]
pub struct ScfSolver {
    pub max_cycles: usize,
    /// Convergence tolerance on |dE| between cycles.
    pub energy_tol: f64,
    /// Convergence tolerance on the max-abs change of `rdm1`.
    pub density_tol: f64,
    /// Linear mixing weight for the new density matrix, if any.
    pub density_mixing: Option<f64>,
    /// DIIS subspace size; `None` disables acceleration.
    pub diis_subspace: Option<usize>,
}

impl Default for ScfSolver {
    fn default() -> Self {
        ScfSolver {
            max_cycles: 100,
            energy_tol: 1e-6,
            density_tol: 1e-5,
            density_mixing: None,
            diis_subspace: Some(8),
        }
    }
}

impl ScfSolver {
    /// Iterate to self-consistency from the snapshot's current density
    /// matrix. The input molecule is never mutated.
    pub fn run(
        &self,
        predictor: &Predictor,
        params: &FunctionalParams,
        molecule: &Molecule,
    ) -> Result<ScfSolution> {
        let x = orthogonalizer(&molecule.s1e);
        let nelec = molecule.nelec();
        let mut state = molecule.clone();
        let mut diis = self.diis_subspace.map(SpinDiis::new);
        let mut last_energy = f64::INFINITY;
        let mut last: Option<(f64, FockOperator)> = None;
        let mut history = Vec::new();

        for cycle in 1..=self.max_cycles {
            let (energy, raw_fock) = predictor.predict(params, &state)?;
            if !energy.is_finite() {
                return Err(Error::Divergence {
                    cycle,
                    detail: format!("energy is {energy}"),
                });
            }
            if !raw_fock.is_finite() {
                return Err(Error::Divergence {
                    cycle,
                    detail: "NaN/Inf in Fock operator".to_string(),
                });
            }

            let fock = match diis.as_mut() {
                Some(d) => {
                    d.update(raw_fock.clone(), &state.rdm1, &state.s1e);
                    d.extrapolate().unwrap_or_else(|| raw_fock.clone())
                }
                None => raw_fock.clone(),
            };

            let (mo_coeff, mo_energy) = diagonalize(&fock, &x);
            let mo_occ = aufbau_occupations(&mo_energy, nelec);
            let mut rdm1 = density_from_orbitals(&mo_coeff, &mo_occ);
            if let Some(mix) = self.density_mixing {
                rdm1 = SpinMatrix::new(
                    rdm1.alpha.scale(mix) + state.rdm1.alpha.scale(1.0 - mix),
                    rdm1.beta.scale(mix) + state.rdm1.beta.scale(1.0 - mix),
                );
            }

            let delta_e = (energy - last_energy).abs();
            let delta_d = rdm1.max_abs_diff(&state.rdm1);
            debug!(cycle, energy, delta_e, delta_d, "scf cycle");
            history.push(energy);

            state = state.with_orbitals(mo_coeff, mo_energy, mo_occ, rdm1);

            if delta_e < self.energy_tol && delta_d < self.density_tol {
                info!(cycle, energy, "scf converged");
                return Ok(ScfSolution {
                    energy,
                    fock: raw_fock,
                    molecule: state,
                    status: ScfStatus::Converged,
                    cycles: cycle,
                    history,
                });
            }
            last = Some((energy, raw_fock));
            last_energy = energy;
        }

        match last {
            Some((energy, fock)) => {
                info!(
                    max_cycles = self.max_cycles,
                    energy, "scf reached max cycles without converging"
                );
                Ok(ScfSolution {
                    energy,
                    fock,
                    molecule: state,
                    status: ScfStatus::MaxCyclesExceeded,
                    cycles: self.max_cycles,
                    history,
                })
            }
            None => Err(Error::config("scf max_cycles must be at least 1")),
        }
    }
}

/// Inverse square root of the overlap matrix (symmetric orthogonalization),
/// discarding near-null eigendirections.
pub fn orthogonalizer(s1e: &DMatrix<f64>) -> DMatrix<f64> {
    let eig = s1e.clone().symmetric_eigen();
    let threshold = 1e-10;
    let mut inv_sqrt = DVector::from_element(eig.eigenvalues.len(), 0.0);
    for i in 0..eig.eigenvalues.len() {
        let val = eig.eigenvalues[i];
        if val > threshold {
            inv_sqrt[i] = 1.0 / val.sqrt();
        }
    }
    &eig.eigenvectors * DMatrix::from_diagonal(&inv_sqrt) * eig.eigenvectors.transpose()
}

/// Solve `F C = S C diag(e)` per spin slice via the orthogonalizer `x`:
/// diagonalize `x^T F x` and back-transform, eigenpairs sorted ascending.
fn diagonalize(fock: &SpinMatrix, x: &DMatrix<f64>) -> (SpinMatrix, [DVector<f64>; 2]) {
    let solve = |f: &DMatrix<f64>| {
        let fp = x.transpose() * f * x;
        let eig = fp.symmetric_eigen();
        let n = eig.eigenvalues.len();
        let mut order: Vec<usize> = (0..n).collect();
        // Ascending energies; index order breaks numerical ties.
        order.sort_by(|&i, &j| {
            eig.eigenvalues[i]
                .partial_cmp(&eig.eigenvalues[j])
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(i.cmp(&j))
        });
        let energies = DVector::from_fn(n, |k, _| eig.eigenvalues[order[k]]);
        let mut sorted_vecs = DMatrix::zeros(n, n);
        for (k, &idx) in order.iter().enumerate() {
            sorted_vecs.set_column(k, &eig.eigenvectors.column(idx));
        }
        (x * sorted_vecs, energies)
    };
    let (ca, ea) = solve(&fock.alpha);
    let (cb, eb) = solve(&fock.beta);
    (SpinMatrix::new(ca, cb), [ea, eb])
}

/// Zero-temperature Fermi filling: the `nelec[s]` lowest orbitals of each
/// spin channel get occupation one.
fn aufbau_occupations(mo_energy: &[DVector<f64>; 2], nelec: [usize; 2]) -> [DVector<f64>; 2] {
    let fill = |energies: &DVector<f64>, n: usize| {
        DVector::from_fn(energies.len(), |i, _| if i < n { 1.0 } else { 0.0 })
    };
    // Energies are already sorted ascending with index tie-break, so
    // occupation by position is Aufbau filling.
    [fill(&mo_energy[0], nelec[0]), fill(&mo_energy[1], nelec[1])]
}

/// `D_s = C_s diag(occ_s) C_s^T`.
fn density_from_orbitals(mo_coeff: &SpinMatrix, mo_occ: &[DVector<f64>; 2]) -> SpinMatrix {
    let build = |c: &DMatrix<f64>, occ: &DVector<f64>| c * DMatrix::from_diagonal(occ) * c.transpose();
    SpinMatrix::new(
        build(&mo_coeff.alpha, &mo_occ[0]),
        build(&mo_coeff.beta, &mo_occ[1]),
    )
}
