//! DIIS (Direct Inversion in the Iterative Subspace) acceleration,
//! spin-resolved.
//!
//! The error matrix per spin slice is the transformed commutator
//! `E = FDS - SDF`; both spin channels share one set of extrapolation
//! coefficients, obtained by minimizing `||sum c_i E_i||^2` subject to
//! `sum c_i = 1`.

extern crate nalgebra as na;

use na::{DMatrix, DVector};
use tracing::debug;

use crate::molecule::SpinMatrix;

/// Largest acceptable extrapolation coefficient magnitude. Anything beyond
/// this signals a near-singular subspace.
const COEFF_LIMIT: f64 = 20.0;

pub struct SpinDiis {
    error_matrices: Vec<SpinMatrix>,
    fock_matrices: Vec<SpinMatrix>,
    max_subspace_size: usize,
}

impl SpinDiis {
    pub fn new(max_subspace_size: usize) -> Self {
        SpinDiis {
            error_matrices: Vec::new(),
            fock_matrices: Vec::new(),
            max_subspace_size,
        }
    }

    fn error_matrix(fock: &SpinMatrix, density: &SpinMatrix, overlap: &DMatrix<f64>) -> SpinMatrix {
        let commutator = |f: &DMatrix<f64>, d: &DMatrix<f64>| {
            let fds = f * d * overlap;
            let sdf = overlap * d * f;
            fds - sdf
        };
        SpinMatrix::new(
            commutator(&fock.alpha, &density.alpha),
            commutator(&fock.beta, &density.beta),
        )
    }

    /// Push a Fock/error pair into the subspace, dropping the oldest entry
    /// once full.
    pub fn update(&mut self, fock: SpinMatrix, density: &SpinMatrix, overlap: &DMatrix<f64>) {
        let error = Self::error_matrix(&fock, density, overlap);
        if self.error_matrices.len() >= self.max_subspace_size {
            self.error_matrices.remove(0);
            self.fock_matrices.remove(0);
        }
        self.error_matrices.push(error);
        self.fock_matrices.push(fock);
    }

    /// Extrapolated Fock operator, or `None` while the subspace is too
    /// small or no well-conditioned sub-window exists.
    ///
    /// Linearly dependent error vectors make the B matrix near-singular,
    /// and the solved coefficients blow up; an extrapolation built from
    /// them departs arbitrarily far from the raw operator. The solve is
    /// retried on progressively newer suffixes of the subspace until the
    /// coefficients are sane, and the caller falls back to the raw Fock
    /// when no suffix qualifies.
    pub fn extrapolate(&self) -> Option<SpinMatrix> {
        let n = self.error_matrices.len();
        for start in 0..n {
            let len = n - start;
            if len < 2 {
                return None;
            }
            let Some(coeffs) = self.solve_window(start, len) else {
                continue;
            };
            let n_ao = self.fock_matrices[0].n_ao();
            let mut fock = SpinMatrix::zeros(n_ao);
            for (i, c) in coeffs.iter().enumerate() {
                fock.alpha += self.fock_matrices[start + i].alpha.scale(*c);
                fock.beta += self.fock_matrices[start + i].beta.scale(*c);
            }
            debug!("DIIS extrapolation with {} vectors", len);
            return Some(fock);
        }
        None
    }

    /// Solve the bordered DIIS equations over `[start, start + len)`.
    /// `None` on a singular B matrix or out-of-range coefficients.
    fn solve_window(&self, start: usize, len: usize) -> Option<Vec<f64>> {
        // B_ij = <e_i|e_j> over both spin slices, bordered by the
        // normalization constraint.
        let mut b = DMatrix::zeros(len + 1, len + 1);
        for i in 0..len {
            for j in 0..len {
                let ei = &self.error_matrices[start + i];
                let ej = &self.error_matrices[start + j];
                b[(i, j)] = ei.alpha.dot(&ej.alpha) + ei.beta.dot(&ej.beta);
            }
            b[(i, len)] = -1.0;
            b[(len, i)] = -1.0;
        }
        b[(len, len)] = 0.0;

        let mut rhs = DVector::zeros(len + 1);
        rhs[len] = -1.0;

        let solved = b.lu().solve(&rhs)?;
        let coeffs: Vec<f64> = solved.iter().take(len).copied().collect();
        if coeffs.iter().any(|c| !c.is_finite() || c.abs() > COEFF_LIMIT) {
            debug!("DIIS coefficients out of range, shrinking subspace");
            return None;
        }
        Some(coeffs)
    }

    pub fn reset(&mut self) {
        self.error_matrices.clear();
        self.fock_matrices.clear();
    }

    pub fn size(&self) -> usize {
        self.error_matrices.len()
    }
}
