//! Classical exchange-correlation functionals expressed on the tape.
//!
//! These exist for two reasons: regression anchors for the predictor (their
//! self-consistent energies can be checked against a direct quadrature
//! evaluation) and as worked examples of the capability set. All of them are
//! XC-only, so the predictor supplies the Coulomb and core-Hamiltonian
//! terms.

extern crate nalgebra as na;

use std::f64::consts::PI;

use na::DMatrix;

use crate::error::{Error, Result};
use crate::molecule::{Molecule, SpinMatrix};
use crate::tape::Var;

use super::{density_features, gga_density_features, Functional};

/// Density floor applied before fractional powers and divisions.
const RHO_FLOOR: f64 = 1e-27;
/// Floor for squared density gradients before the square root.
const SIGMA_FLOOR: f64 = 1e-24;

const B88_BETA: f64 = 0.0042;
const PBE_KAPPA: f64 = 0.804;
const PBE_MU: f64 = 0.219_514_972_764_517_1;

#[inline]
fn c_x() -> f64 {
    -0.75 * (3.0 / PI).powf(1.0 / 3.0)
}

/// Spin-scaling factor turning the unpolarized Slater constant into the
/// per-spin form: e_x = c_x 2^(1/3) sum_s rho_s^(4/3).
#[inline]
fn spin_c_x() -> f64 {
    c_x() * 2.0_f64.powf(1.0 / 3.0)
}

/// Look up a functional for configuration and CLI use.
pub fn by_name(name: &str) -> Result<Functional> {
    match name {
        "lsda" => Ok(lsda()),
        "pw92" => Ok(pw92()),
        "b88" => Ok(b88()),
        "pbe-x" | "pbex" => Ok(pbe_x()),
        "hybrid" => Ok(hybrid(0.25)),
        other => Err(Error::config(format!("unknown functional '{other}'"))),
    }
}

/// Slater exchange per spin channel from `(n_grid, 2)` densities.
fn slater_exchange<'t>(densities: Var<'t>) -> Var<'t> {
    let rho_a = densities.col(0).shift(RHO_FLOOR);
    let rho_b = densities.col(1).shift(RHO_FLOOR);
    (rho_a.powf(4.0 / 3.0) + rho_b.powf(4.0 / 3.0)).scale(spin_c_x())
}

/// One parameterization of the PW92 interpolation function
/// G(rs) = -2A(1 + a1 rs) ln(1 + 1/(2A(b1 rs^1/2 + b2 rs + b3 rs^3/2 + b4 rs^2))).
fn pw92_g<'t>(rs: Var<'t>, a: f64, a1: f64, b1: f64, b2: f64, b3: f64, b4: f64) -> Var<'t> {
    let srs = rs.sqrt();
    let q = (srs.scale(b1) + rs.scale(b2) + (rs * srs).scale(b3) + (rs * rs).scale(b4))
        .scale(2.0 * a);
    let ln_term = q.powf(-1.0).shift(1.0).ln();
    (rs.scale(a1).shift(1.0) * ln_term).scale(-2.0 * a)
}

/// PW92 correlation energy density (per volume) with the full zeta
/// interpolation, from `(n_grid, 2)` densities.
fn pw92_correlation<'t>(densities: Var<'t>) -> Var<'t> {
    let rho_a = densities.col(0).shift(RHO_FLOOR);
    let rho_b = densities.col(1).shift(RHO_FLOOR);
    let rho = rho_a + rho_b;
    let rs = rho.powf(-1.0 / 3.0).scale((3.0 / (4.0 * PI)).powf(1.0 / 3.0));
    let zeta = (rho_a - rho_b) / rho;

    let ec0 = pw92_g(rs, 0.031091, 0.21370, 7.5957, 3.5876, 1.6382, 0.49294);
    let ec1 = pw92_g(rs, 0.015545, 0.20548, 14.1189, 6.1977, 3.3662, 0.62517);
    let neg_ac = pw92_g(rs, 0.016887, 0.11125, 10.357, 3.6231, 0.88026, 0.49671);

    // f(zeta) and f''(0); the tiny shift keeps the 4/3 power differentiable
    // at full polarization.
    let denom = 2.0_f64.powf(4.0 / 3.0) - 2.0;
    let f_zeta = (zeta.shift(1.0 + 1e-15).powf(4.0 / 3.0)
        + (-zeta).shift(1.0 + 1e-15).powf(4.0 / 3.0))
    .shift(-2.0)
    .scale(1.0 / denom);
    let fpp0 = 8.0 / (9.0 * denom);

    let z2 = zeta * zeta;
    let z4 = z2 * z2;
    // eps_c = ec(rs,0) + alpha_c f/f''(0) (1 - z^4) + [ec(rs,1) - ec(rs,0)] f z^4,
    // with alpha_c = -neg_ac.
    let eps = ec0
        + neg_ac.scale(-1.0 / fpp0) * f_zeta * z4.scale(-1.0).shift(1.0)
        + (ec1 - ec0) * f_zeta * z4;
    rho * eps
}

/// B88 gradient correction to Slater exchange, per spin, from
/// `(n_grid, 4)` densities-with-sigmas.
fn b88_exchange<'t>(densities: Var<'t>) -> Var<'t> {
    let per_spin = |s: usize| {
        let rho = densities.col(s).shift(RHO_FLOOR);
        let sigma = densities.col(2 + s).shift(SIGMA_FLOOR);
        let r43 = rho.powf(4.0 / 3.0);
        let x = sigma.sqrt() / r43;
        let damp = (x * x.asinh()).scale(6.0 * B88_BETA).shift(1.0);
        r43.scale(spin_c_x()) - (r43 * x * x / damp).scale(B88_BETA)
    };
    per_spin(0) + per_spin(1)
}

/// PBE exchange via the spin-scaling relation
/// e_x[rho_a, rho_b] = (e_x[2 rho_a] + e_x[2 rho_b]) / 2,
/// with the enhancement factor written in terms of s^2 to avoid a square
/// root at zero gradient.
fn pbe_exchange<'t>(densities: Var<'t>) -> Var<'t> {
    let c2 = 4.0 * (3.0 * PI * PI).powf(2.0 / 3.0);
    let per_spin = |s: usize| {
        let rho2 = densities.col(s).shift(RHO_FLOOR).scale(2.0);
        let sigma2 = densities.col(2 + s).scale(4.0);
        let e_unif = rho2.powf(4.0 / 3.0).scale(c_x());
        let s2 = sigma2 / rho2.powf(8.0 / 3.0).scale(c2);
        let t = s2.scale(PBE_MU / PBE_KAPPA).shift(1.0);
        let fx = t.powf(-1.0).scale(-PBE_KAPPA).shift(1.0 + PBE_KAPPA);
        e_unif * fx
    };
    (per_spin(0) + per_spin(1)).scale(0.5)
}

/// Local spin-density exchange (Slater).
pub fn lsda() -> Functional {
    let mut f = Functional::new(
        "lsda",
        Box::new(|_t, _p, _c, densities| {
            let d = densities.ok_or_else(|| Error::config("lsda requires density features"))?;
            Ok(slater_exchange(d))
        }),
    );
    f.density_features = Some(Box::new(density_features));
    f
}

/// LSDA exchange plus PW92 correlation.
pub fn pw92() -> Functional {
    let mut f = Functional::new(
        "pw92",
        Box::new(|_t, _p, _c, densities| {
            let d = densities.ok_or_else(|| Error::config("pw92 requires density features"))?;
            Ok(slater_exchange(d) + pw92_correlation(d))
        }),
    );
    f.density_features = Some(Box::new(density_features));
    f
}

/// B88 gradient-corrected exchange plus PW92 correlation.
pub fn b88() -> Functional {
    let mut f = Functional::new(
        "b88",
        Box::new(|_t, _p, _c, densities| {
            let d = densities.ok_or_else(|| Error::config("b88 requires density features"))?;
            Ok(b88_exchange(d) + pw92_correlation(d))
        }),
    );
    f.density_features = Some(Box::new(gga_density_features));
    f
}

/// PBE exchange only, no correlation.
pub fn pbe_x() -> Functional {
    let mut f = Functional::new(
        "pbe-x",
        Box::new(|_t, _p, _c, densities| {
            let d = densities.ok_or_else(|| Error::config("pbe-x requires density features"))?;
            Ok(pbe_exchange(d))
        }),
    );
    f.density_features = Some(Box::new(gga_density_features));
    f
}

/// Global hybrid: (1 - a) LSDA exchange + PW92 correlation + a times exact
/// exchange. The exact-exchange energy densities come from the precomputed
/// chi kernel through the without-grad channel, so their Fock contribution
/// is supplied by the explicit density-gradient hook instead of the tape.
pub fn hybrid(a: f64) -> Functional {
    let mut f = Functional::new(
        "hybrid",
        Box::new(move |_t, _p, _c, densities| {
            let d = densities.ok_or_else(|| Error::config("hybrid requires density features"))?;
            let (_, cols) = d.shape();
            let mut e = slater_exchange(d).scale(1.0 - a) + pw92_correlation(d);
            // Columns beyond the two densities are the stacked exact-exchange
            // channels e_hf(g, 2w + s).
            for c in 2..cols {
                e = e + d.col(c).scale(a);
            }
            Ok(e)
        }),
    );
    f.density_features = Some(Box::new(density_features));
    f.nograd_density_features = Some(Box::new(|m: &Molecule| m.exact_exchange_density()));
    f.combine_densities = Some(Box::new(|t, g, n| t.hstack(&[g, n])));
    f.density_feature_grads = Some(Box::new(move |_p, molecule, _nograd| {
        exact_exchange_half_potential(molecule, a)
    }));
    f
}

/// Half of the exact-exchange potential from the chi kernel, summed over
/// omega channels: V[s]_pq = -(a/4) sum_gw w_g phi_p(g) chi(g, w, s, q).
/// The predictor adds V + V^T, which restores the full symmetric term.
fn exact_exchange_half_potential(molecule: &Molecule, a: f64) -> Result<SpinMatrix> {
    let chi = molecule.chi.as_ref().ok_or_else(|| {
        Error::config("exact-exchange potential requested but no chi tensor is present")
    })?;
    let n_ao = molecule.n_ao();
    let mut v = SpinMatrix::zeros(n_ao);
    for s in 0..2 {
        let mut m = DMatrix::zeros(n_ao, n_ao);
        for g in 0..molecule.grid.len() {
            let wg = molecule.grid.weights[g];
            for w in 0..chi.n_omegas {
                for p in 0..n_ao {
                    let phi = molecule.ao[(g, p)];
                    for q in 0..n_ao {
                        m[(p, q)] -= 0.25 * a * wg * phi * chi.at(g, w, s, q);
                    }
                }
            }
        }
        if s == 0 {
            v.alpha = m;
        } else {
            v.beta = m;
        }
    }
    Ok(v)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::functional::{FunctionalParams, SpinVar};
    use crate::tape::Tape;
    use crate::test_fixtures::h2_like;
    use approx::assert_relative_eq;

    fn energy_of(f: &Functional, mol: &Molecule) -> f64 {
        let tape = Tape::new();
        let rdm1 = SpinVar {
            alpha: tape.var(mol.rdm1.alpha.clone()),
            beta: tape.var(mol.rdm1.beta.clone()),
        };
        f.energy(&tape, &FunctionalParams::empty(), mol, rdm1)
            .unwrap()
            .value()[(0, 0)]
    }

    #[test]
    fn lsda_matches_direct_quadrature() {
        let mol = h2_like();
        let [rho_a, rho_b] = mol.density_on_grid();
        let mut e_x = 0.0;
        for g in 0..mol.grid.len() {
            e_x += mol.grid.weights[g]
                * spin_c_x()
                * (rho_a[g].powf(4.0 / 3.0) + rho_b[g].powf(4.0 / 3.0));
        }
        let expected = e_x + mol.non_xc_energy().unwrap();
        assert_relative_eq!(energy_of(&lsda(), &mol), expected, epsilon = 1e-9);
    }

    #[test]
    fn pw92_is_spin_symmetric() {
        let mut mol = h2_like();
        let e1 = energy_of(&pw92(), &mol);
        std::mem::swap(&mut mol.rdm1.alpha, &mut mol.rdm1.beta);
        let e2 = energy_of(&pw92(), &mol);
        assert_relative_eq!(e1, e2, epsilon = 1e-10);
    }

    #[test]
    fn pw92_correlation_is_negative() {
        let mol = h2_like();
        let e_corr = energy_of(&pw92(), &mol) - energy_of(&lsda(), &mol);
        assert!(e_corr < 0.0, "correlation must lower the energy: {e_corr}");
    }

    #[test]
    fn b88_reduces_to_lsda_for_uniform_density() {
        let mut mol = h2_like();
        // Kill the density gradient; B88's correction must vanish and only
        // the PW92 correlation separates the two functionals.
        for g in mol.grad_ao.iter_mut() {
            g.fill(0.0);
        }
        let e_b88 = energy_of(&b88(), &mol);
        let e_ref = energy_of(&pw92(), &mol);
        assert_relative_eq!(e_b88, e_ref, epsilon = 1e-7);
    }

    #[test]
    fn pbe_enhancement_never_weakens_exchange() {
        let mol = h2_like();
        // F_x >= 1 pointwise, so PBE exchange is at least as negative.
        assert!(energy_of(&pbe_x(), &mol) <= energy_of(&lsda(), &mol) + 1e-12);
    }

    #[test]
    fn hybrid_interpolates_toward_lsda() {
        let mol = h2_like();
        let e0 = energy_of(&hybrid(0.0), &mol);
        let e_lsda_pw92 = energy_of(&pw92(), &mol);
        assert_relative_eq!(e0, e_lsda_pw92, epsilon = 1e-10);
    }

    #[test]
    fn unknown_name_is_a_config_error() {
        assert!(matches!(by_name("b3lyp"), Err(Error::Config(_))));
        assert!(by_name("pbe-x").is_ok());
    }
}
