//! Electronic-structure snapshots.
//!
//! A [`Molecule`] is an immutable per-iteration snapshot of a molecule's
//! electronic structure: grid, atomic-orbital values, density matrix,
//! one/two-electron integrals and orbital data, as produced by an external
//! quantum-chemistry engine. The SCF loop never mutates a snapshot in place;
//! every cycle derives a new one via [`Molecule::with_orbitals`] so the
//! differentiable computation graph and the convergence history stay
//! unambiguous.

extern crate nalgebra as na;

use na::{DMatrix, DVector, Vector3};
use rayon::prelude::*;

use crate::error::{Error, Result};

/// Symmetry tolerance applied when validating density matrices.
const SYMMETRY_TOL: f64 = 1e-8;

/// Numerical-integration grid: ordered 3D points with scalar weights.
#[derive(Debug, Clone)]
pub struct Grid {
    pub coords: Vec<Vector3<f64>>,
    pub weights: DVector<f64>,
}

impl Grid {
    pub fn new(coords: Vec<Vector3<f64>>, weights: DVector<f64>) -> Result<Self> {
        if coords.len() != weights.len() {
            return Err(Error::config(format!(
                "grid has {} coordinates but {} weights",
                coords.len(),
                weights.len()
            )));
        }
        Ok(Grid { coords, weights })
    }

    pub fn len(&self) -> usize {
        self.coords.len()
    }

    pub fn is_empty(&self) -> bool {
        self.coords.is_empty()
    }
}

/// A spin-indexed pair of square matrices (density matrices, Fock operators,
/// molecular-orbital coefficients).
#[derive(Debug, Clone, PartialEq)]
pub struct SpinMatrix {
    pub alpha: DMatrix<f64>,
    pub beta: DMatrix<f64>,
}

impl SpinMatrix {
    pub fn new(alpha: DMatrix<f64>, beta: DMatrix<f64>) -> Self {
        SpinMatrix { alpha, beta }
    }

    pub fn zeros(n: usize) -> Self {
        SpinMatrix {
            alpha: DMatrix::zeros(n, n),
            beta: DMatrix::zeros(n, n),
        }
    }

    /// Split a restricted (closed-shell) matrix into two identical half
    /// densities, the convention the upstream engine uses for rank-2 input.
    pub fn from_restricted(total: &DMatrix<f64>) -> Self {
        let half = total.scale(0.5);
        SpinMatrix {
            alpha: half.clone(),
            beta: half,
        }
    }

    pub fn n_ao(&self) -> usize {
        self.alpha.nrows()
    }

    pub fn map<F>(&self, f: F) -> Self
    where
        F: Fn(&DMatrix<f64>) -> DMatrix<f64>,
    {
        SpinMatrix {
            alpha: f(&self.alpha),
            beta: f(&self.beta),
        }
    }

    /// (M + M^T) / 2 per spin slice.
    pub fn symmetrized(&self) -> Self {
        self.map(|m| (m + m.transpose()).scale(0.5))
    }

    /// M + M^T per spin slice (used for explicit gradient contributions).
    pub fn plus_transpose(&self) -> Self {
        self.map(|m| m + m.transpose())
    }

    pub fn total(&self) -> DMatrix<f64> {
        &self.alpha + &self.beta
    }

    pub fn is_finite(&self) -> bool {
        self.alpha.iter().all(|x| x.is_finite()) && self.beta.iter().all(|x| x.is_finite())
    }

    pub fn max_abs_diff(&self, other: &SpinMatrix) -> f64 {
        let d = |a: &DMatrix<f64>, b: &DMatrix<f64>| {
            a.iter()
                .zip(b.iter())
                .map(|(x, y)| (x - y).abs())
                .fold(0.0_f64, f64::max)
        };
        d(&self.alpha, &other.alpha).max(d(&self.beta, &other.beta))
    }

    fn is_symmetric(&self, tol: f64) -> bool {
        let sym = |m: &DMatrix<f64>| {
            let n = m.nrows();
            (0..n).all(|i| (i + 1..n).all(|j| (m[(i, j)] - m[(j, i)]).abs() <= tol))
        };
        sym(&self.alpha) && sym(&self.beta)
    }
}

impl std::ops::AddAssign<&SpinMatrix> for SpinMatrix {
    fn add_assign(&mut self, rhs: &SpinMatrix) {
        self.alpha += &rhs.alpha;
        self.beta += &rhs.beta;
    }
}

/// Two-electron repulsion integrals (pq|rs), stored flat.
#[derive(Debug, Clone)]
pub struct EriTensor {
    n_ao: usize,
    data: Vec<f64>,
}

impl EriTensor {
    pub fn new(n_ao: usize, data: Vec<f64>) -> Result<Self> {
        if data.len() != n_ao.pow(4) {
            return Err(Error::config(format!(
                "repulsion tensor has {} entries, expected {}^4",
                data.len(),
                n_ao
            )));
        }
        Ok(EriTensor { n_ao, data })
    }

    pub fn n_ao(&self) -> usize {
        self.n_ao
    }

    #[inline]
    pub fn at(&self, p: usize, q: usize, r: usize, s: usize) -> f64 {
        let n = self.n_ao;
        self.data[((p * n + q) * n + r) * n + s]
    }

    pub fn data(&self) -> &[f64] {
        &self.data
    }
}

/// Precomputed range-separated exchange kernel contracted with the reference
/// density matrix, shape `(n_grid, n_omegas, n_spin, n_ao)`.
#[derive(Debug, Clone)]
pub struct ChiTensor {
    pub n_grid: usize,
    pub n_omegas: usize,
    pub n_ao: usize,
    data: Vec<f64>,
}

impl ChiTensor {
    pub fn new(n_grid: usize, n_omegas: usize, n_ao: usize, data: Vec<f64>) -> Result<Self> {
        if data.len() != n_grid * n_omegas * 2 * n_ao {
            return Err(Error::config(format!(
                "chi tensor has {} entries, expected {}x{}x2x{}",
                data.len(),
                n_grid,
                n_omegas,
                n_ao
            )));
        }
        Ok(ChiTensor {
            n_grid,
            n_omegas,
            n_ao,
            data,
        })
    }

    #[inline]
    pub fn at(&self, g: usize, w: usize, s: usize, a: usize) -> f64 {
        self.data[((g * self.n_omegas + w) * 2 + s) * self.n_ao + a]
    }

    pub fn data(&self) -> &[f64] {
        &self.data
    }

    /// Keep only the given omega channels, in the given order.
    pub fn select(&self, indices: &[usize]) -> ChiTensor {
        let mut data = Vec::with_capacity(self.n_grid * indices.len() * 2 * self.n_ao);
        for g in 0..self.n_grid {
            for &w in indices {
                for s in 0..2 {
                    for a in 0..self.n_ao {
                        data.push(self.at(g, w, s, a));
                    }
                }
            }
        }
        ChiTensor {
            n_grid: self.n_grid,
            n_omegas: indices.len(),
            n_ao: self.n_ao,
            data,
        }
    }
}

/// One electronic-structure snapshot.
///
/// Constructed once from the external engine's output (see
/// [`crate::io::dataset`]); all shape and symmetry invariants are checked
/// eagerly by [`Molecule::validated`] so numerics never see malformed input.
#[derive(Debug, Clone)]
pub struct Molecule {
    pub grid: Grid,
    /// AO values at grid points, `(n_grid, n_ao)`.
    pub ao: DMatrix<f64>,
    /// AO spatial gradients at grid points, one `(n_grid, n_ao)` matrix per axis.
    pub grad_ao: [DMatrix<f64>; 3],
    /// Reduced one-particle density matrix, spin-resolved.
    pub rdm1: SpinMatrix,
    pub h1e: DMatrix<f64>,
    pub s1e: DMatrix<f64>,
    /// Two-electron repulsion tensor; may be absent to save memory.
    pub rep_tensor: Option<EriTensor>,
    pub mo_coeff: SpinMatrix,
    pub mo_energy: [DVector<f64>; 2],
    pub mo_occ: [DVector<f64>; 2],
    pub energy_nuc: f64,
    /// Reference total energy from the external engine (training only).
    pub reference_energy: Option<f64>,
    /// Range-separation values; empty means plain Coulomb only.
    pub omegas: Vec<f64>,
    pub chi: Option<ChiTensor>,
    pub nuclear_pos: Vec<Vector3<f64>>,
    pub atom_index: Vec<u32>,
    pub basis: String,
    /// 2S = n_alpha - n_beta.
    pub spin: i32,
    pub charge: i32,
}

impl Molecule {
    /// Eager boundary validation (shapes, symmetry, omegas). Consumes and
    /// returns the snapshot so loaders can write `Molecule { .. }.validated()?`.
    pub fn validated(self) -> Result<Self> {
        let n_grid = self.grid.len();
        let n_ao = self.rdm1.n_ao();

        if self.rdm1.alpha.shape() != (n_ao, n_ao) || self.rdm1.beta.shape() != (n_ao, n_ao) {
            return Err(Error::config("rdm1 spin slices must be square and equal-sized"));
        }
        if !self.rdm1.is_symmetric(SYMMETRY_TOL) {
            return Err(Error::config("rdm1 must be symmetric within each spin slice"));
        }
        if self.ao.shape() != (n_grid, n_ao) {
            return Err(Error::config(format!(
                "ao values have shape {:?}, expected ({}, {})",
                self.ao.shape(),
                n_grid,
                n_ao
            )));
        }
        for (axis, g) in self.grad_ao.iter().enumerate() {
            if g.shape() != (n_grid, n_ao) {
                return Err(Error::config(format!(
                    "grad_ao axis {} has shape {:?}, expected ({}, {})",
                    axis,
                    g.shape(),
                    n_grid,
                    n_ao
                )));
            }
        }
        for m in [&self.h1e, &self.s1e] {
            if m.shape() != (n_ao, n_ao) {
                return Err(Error::config("h1e/s1e must be n_ao x n_ao"));
            }
        }
        if self.mo_coeff.n_ao() != n_ao {
            return Err(Error::config("mo_coeff must agree with rdm1 on orbital count"));
        }
        for s in 0..2 {
            if self.mo_energy[s].len() != n_ao || self.mo_occ[s].len() != n_ao {
                return Err(Error::config(
                    "mo_energy/mo_occ must agree with mo_coeff on orbital count",
                ));
            }
            if self.mo_occ[s].iter().any(|&o| o < 0.0) {
                return Err(Error::config("orbital occupations must be non-negative"));
            }
            let total = self.mo_occ[s].sum();
            if (total - total.round()).abs() > 1e-6 {
                return Err(Error::config(format!(
                    "spin-{} occupations sum to {}, expected an integer electron count",
                    s, total
                )));
            }
        }
        if self.omegas.iter().any(|&w| w < 0.0) {
            return Err(Error::config("omega values must be non-negative"));
        }
        if let Some(chi) = &self.chi {
            if chi.n_grid != n_grid || chi.n_ao != n_ao || chi.n_omegas != self.omegas.len() {
                return Err(Error::config(format!(
                    "chi tensor dims ({}, {}, 2, {}) do not match grid/omegas/orbitals ({}, {}, 2, {})",
                    chi.n_grid,
                    chi.n_omegas,
                    chi.n_ao,
                    n_grid,
                    self.omegas.len(),
                    n_ao
                )));
            }
        }
        if let Some(eri) = &self.rep_tensor {
            if eri.n_ao() != n_ao {
                return Err(Error::config("repulsion tensor must be n_ao^4"));
            }
        }
        let [na, nb] = self.nelec();
        if na as i32 - nb as i32 != self.spin {
            return Err(Error::config(format!(
                "occupations give n_alpha - n_beta = {}, but spin = {}",
                na as i32 - nb as i32,
                self.spin
            )));
        }
        Ok(self)
    }

    pub fn n_ao(&self) -> usize {
        self.rdm1.n_ao()
    }

    /// Electron count per spin channel, from the occupation vectors.
    pub fn nelec(&self) -> [usize; 2] {
        [
            self.mo_occ[0].sum().round() as usize,
            self.mo_occ[1].sum().round() as usize,
        ]
    }

    /// New snapshot with a replaced density matrix; everything else shared.
    pub fn with_rdm1(&self, rdm1: SpinMatrix) -> Molecule {
        Molecule {
            rdm1,
            ..self.clone()
        }
    }

    /// New snapshot after one SCF diagonalization: fresh orbitals,
    /// occupations and the density matrix rebuilt from them.
    pub fn with_orbitals(
        &self,
        mo_coeff: SpinMatrix,
        mo_energy: [DVector<f64>; 2],
        mo_occ: [DVector<f64>; 2],
        rdm1: SpinMatrix,
    ) -> Molecule {
        Molecule {
            mo_coeff,
            mo_energy,
            mo_occ,
            rdm1,
            ..self.clone()
        }
    }

    /// Per-spin electron density on the grid: rho_s(g) = phi_g^T D_s phi_g.
    pub fn density_on_grid(&self) -> [DVector<f64>; 2] {
        let rho = |d: &DMatrix<f64>| {
            let t = &self.ao * d;
            DVector::from_fn(self.grid.len(), |g, _| t.row(g).dot(&self.ao.row(g)))
        };
        [rho(&self.rdm1.alpha), rho(&self.rdm1.beta)]
    }

    /// Per-spin density gradient components on the grid,
    /// d_a rho_s(g) = 2 (d_a phi_g)^T D_s phi_g for symmetric D.
    pub fn density_gradient_on_grid(&self) -> [[DVector<f64>; 3]; 2] {
        let comp = |d: &DMatrix<f64>, dao: &DMatrix<f64>| {
            let t = dao * d;
            DVector::from_fn(self.grid.len(), |g, _| 2.0 * t.row(g).dot(&self.ao.row(g)))
        };
        [
            [
                comp(&self.rdm1.alpha, &self.grad_ao[0]),
                comp(&self.rdm1.alpha, &self.grad_ao[1]),
                comp(&self.rdm1.alpha, &self.grad_ao[2]),
            ],
            [
                comp(&self.rdm1.beta, &self.grad_ao[0]),
                comp(&self.rdm1.beta, &self.grad_ao[1]),
                comp(&self.rdm1.beta, &self.grad_ao[2]),
            ],
        ]
    }

    /// Exact-exchange energy densities from the precomputed chi tensor:
    /// e_hf(g, w, s) = -1/2 sum_a phi_a(g) chi(g, w, s, a).
    ///
    /// Returned as `(n_grid, 2 * n_omegas)` with column layout `2w + s`.
    /// Missing chi (omegas requested without precomputed kernels) is a
    /// configuration error.
    pub fn exact_exchange_density(&self) -> Result<DMatrix<f64>> {
        let chi = self.chi.as_ref().ok_or_else(|| {
            Error::config("exact-exchange features requested but no chi tensor is present")
        })?;
        let n_grid = self.grid.len();
        let mut out = DMatrix::zeros(n_grid, 2 * chi.n_omegas);
        for g in 0..n_grid {
            for w in 0..chi.n_omegas {
                for s in 0..2 {
                    let mut acc = 0.0;
                    for a in 0..chi.n_ao {
                        acc += self.ao[(g, a)] * chi.at(g, w, s, a);
                    }
                    out[(g, 2 * w + s)] = -0.5 * acc;
                }
            }
        }
        Ok(out)
    }

    /// Classical (non-XC) energy: nuclear repulsion, core Hamiltonian and
    /// Hartree terms at the snapshot's density matrix. Requires the
    /// repulsion tensor.
    pub fn non_xc_energy(&self) -> Result<f64> {
        let eri = self.rep_tensor.as_ref().ok_or_else(|| {
            Error::config("non-XC energy requires the two-electron repulsion tensor")
        })?;
        let j = coulomb_potential(&self.rdm1, eri);
        let total = self.rdm1.total();
        // Both operands are symmetric, so elementwise dot equals Tr(D H).
        let core = total.dot(&self.h1e);
        let hartree = 0.5 * total.dot(&j);
        Ok(self.energy_nuc + core + hartree)
    }
}

/// Classical Coulomb (Hartree) potential built from the full, spin-summed
/// density matrix: J_pq = sum_rs (pq|rs) D_rs. Both spin channels feel the
/// same potential.
pub fn coulomb_potential(rdm1: &SpinMatrix, eri: &EriTensor) -> DMatrix<f64> {
    let n = eri.n_ao();
    let total = rdm1.total();
    let entries: Vec<f64> = (0..n * n)
        .into_par_iter()
        .map(|pq| {
            let (p, q) = (pq / n, pq % n);
            let mut acc = 0.0;
            for r in 0..n {
                for s in 0..n {
                    acc += eri.at(p, q, r, s) * total[(r, s)];
                }
            }
            acc
        })
        .collect();
    DMatrix::from_fn(n, n, |p, q| entries[p * n + q])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_fixtures::h2_like;
    use approx::assert_relative_eq;

    #[test]
    fn restricted_split_halves_density() {
        let total = DMatrix::from_row_slice(2, 2, &[2.0, 0.4, 0.4, 1.0]);
        let sm = SpinMatrix::from_restricted(&total);
        assert_relative_eq!(sm.alpha[(0, 0)], 1.0);
        assert_relative_eq!(sm.total()[(0, 1)], 0.4);
    }

    #[test]
    fn validation_rejects_asymmetric_rdm1() {
        let mut mol = h2_like();
        mol.rdm1.alpha[(0, 1)] += 1e-3;
        assert!(matches!(mol.validated(), Err(Error::Config(_))));
    }

    #[test]
    fn validation_rejects_negative_omega() {
        let mut mol = h2_like();
        mol.omegas = vec![-0.4];
        mol.chi = None;
        assert!(matches!(mol.validated(), Err(Error::Config(_))));
    }

    #[test]
    fn validation_rejects_shape_mismatch() {
        let mut mol = h2_like();
        mol.h1e = DMatrix::zeros(3, 3);
        assert!(matches!(mol.validated(), Err(Error::Config(_))));
    }

    #[test]
    fn density_integrates_to_electron_count() {
        let mol = h2_like();
        let [rho_a, rho_b] = mol.density_on_grid();
        let n_a = mol.grid.weights.dot(&rho_a);
        let n_b = mol.grid.weights.dot(&rho_b);
        // The fixture grid is a crude quadrature; just require the right scale.
        assert!(n_a > 0.0 && n_b > 0.0);
        assert_relative_eq!(n_a, n_b, epsilon = 1e-12);
    }

    #[test]
    fn coulomb_potential_is_symmetric_and_spin_summed() {
        let mol = h2_like();
        let eri = mol.rep_tensor.as_ref().unwrap();
        let j = coulomb_potential(&mol.rdm1, eri);
        assert_relative_eq!(j[(0, 1)], j[(1, 0)], epsilon = 1e-12);
        // Doubling one spin channel must change J: it sees the full density.
        let mut boosted = mol.rdm1.clone();
        boosted.alpha *= 2.0;
        let j2 = coulomb_potential(&boosted, eri);
        assert!(j2[(0, 0)] > j[(0, 0)]);
    }

    #[test]
    fn chi_selection_reorders_channels() {
        let mol = h2_like();
        let chi = mol.chi.as_ref().unwrap();
        let sel = chi.select(&[1, 0]);
        assert_eq!(sel.n_omegas, 2);
        assert_relative_eq!(sel.at(0, 0, 0, 0), chi.at(0, 1, 0, 0));
        assert_relative_eq!(sel.at(0, 1, 1, 1), chi.at(0, 0, 1, 1));
    }

    #[test]
    fn snapshots_are_immutable_updates() {
        let mol = h2_like();
        let new_dm = SpinMatrix::zeros(mol.n_ao());
        let next = mol.with_rdm1(new_dm);
        assert!(mol.rdm1.alpha[(0, 0)] != 0.0);
        assert_relative_eq!(next.rdm1.alpha[(0, 0)], 0.0);
    }
}
