//! Small hand-built snapshots shared across unit tests.

extern crate nalgebra as na;

use na::{DMatrix, DVector, Vector3};

use crate::molecule::{ChiTensor, EriTensor, Grid, Molecule, SpinMatrix};

/// Tiny closed-shell two-orbital system loosely modelled on H2 in a minimal
/// basis: two s-type Gaussians on a short grid along the bond axis. The
/// numbers are not converged chemistry, but every shape and symmetry
/// invariant holds, the grid weights are positive and the repulsion tensor
/// has the full eight-fold symmetry.
pub fn h2_like() -> Molecule {
    let n_grid = 6;
    let n_ao = 2;
    let centers = [-0.7_f64, 0.7_f64];
    let zs: Vec<f64> = (0..n_grid).map(|g| -2.0 + 0.8 * g as f64).collect();

    let coords: Vec<Vector3<f64>> = zs.iter().map(|&z| Vector3::new(0.0, 0.0, z)).collect();
    let weights = DVector::from_element(n_grid, 0.8);

    let ao = DMatrix::from_fn(n_grid, n_ao, |g, a| (-(zs[g] - centers[a]).powi(2)).exp());
    let grad_z = DMatrix::from_fn(n_grid, n_ao, |g, a| {
        -2.0 * (zs[g] - centers[a]) * (-(zs[g] - centers[a]).powi(2)).exp()
    });
    let grad_ao = [
        DMatrix::zeros(n_grid, n_ao),
        DMatrix::zeros(n_grid, n_ao),
        grad_z,
    ];

    // One doubly occupied bonding orbital, split over the spin channels.
    let c = DVector::from_column_slice(&[0.62, 0.55]);
    let dm = &c * c.transpose();
    let rdm1 = SpinMatrix::new(dm.clone(), dm);

    let h1e = DMatrix::from_row_slice(n_ao, n_ao, &[-1.1, -0.45, -0.45, -1.1]);
    let s1e = DMatrix::from_row_slice(n_ao, n_ao, &[1.0, 0.35, 0.35, 1.0]);

    // Separable (pq|rs) = f_pq f_rs keeps the eight-fold symmetry exact.
    let f = DMatrix::from_row_slice(n_ao, n_ao, &[0.9, 0.3, 0.3, 0.7]);
    let mut eri = Vec::with_capacity(n_ao.pow(4));
    for p in 0..n_ao {
        for q in 0..n_ao {
            for r in 0..n_ao {
                for s in 0..n_ao {
                    eri.push(f[(p, q)] * f[(r, s)]);
                }
            }
        }
    }

    let omegas = vec![0.0, 0.4];
    let mut chi = Vec::with_capacity(n_grid * omegas.len() * 2 * n_ao);
    for g in 0..n_grid {
        for w in 0..omegas.len() {
            for s in 0..2 {
                for a in 0..n_ao {
                    chi.push(0.05 * (1.0 + g as f64) / (1.0 + w as f64 + s as f64 + a as f64));
                }
            }
        }
    }

    let mo_coeff = SpinMatrix::new(
        DMatrix::from_row_slice(n_ao, n_ao, &[0.62, 0.84, 0.55, -0.84]),
        DMatrix::from_row_slice(n_ao, n_ao, &[0.62, 0.84, 0.55, -0.84]),
    );
    let mo_energy = [
        DVector::from_column_slice(&[-0.58, 0.67]),
        DVector::from_column_slice(&[-0.58, 0.67]),
    ];
    let mo_occ = [
        DVector::from_column_slice(&[1.0, 0.0]),
        DVector::from_column_slice(&[1.0, 0.0]),
    ];

    Molecule {
        grid: Grid::new(coords, weights).unwrap(),
        ao,
        grad_ao,
        rdm1,
        h1e,
        s1e,
        rep_tensor: Some(EriTensor::new(n_ao, eri).unwrap()),
        mo_coeff,
        mo_energy,
        mo_occ,
        energy_nuc: 0.713,
        reference_energy: Some(-1.05),
        omegas,
        chi: Some(ChiTensor::new(n_grid, 2, n_ao, chi).unwrap()),
        nuclear_pos: vec![Vector3::new(0.0, 0.0, -0.7), Vector3::new(0.0, 0.0, 0.7)],
        atom_index: vec![1, 1],
        basis: "sto-3g".to_string(),
        spin: 0,
        charge: 0,
    }
}
