//! End-to-end tests: dataset on disk -> predictor -> SCF loop.
//!
//! The regression anchor is a direct quadrature evaluation of each
//! classical functional on the fixture snapshot; the predictor's autodiff
//! path must reproduce it, and the self-consistent energies must stay
//! within the 10 kcal/mol acceptance bound used for classical functionals.

use approx::assert_relative_eq;
use std::path::PathBuf;

use mlscf::functional::classical::{b88, by_name, lsda, pw92};
use mlscf::io::{load_dataset, save_dataset};
use mlscf::scf_impl::{ScfSolver, ScfStatus};
use mlscf::test_fixtures::h2_like;
use mlscf::{Error, FunctionalParams, Predictor};

const HARTREE_TO_KCALMOL: f64 = 627.509_474;

fn temp_path(tag: &str) -> PathBuf {
    std::env::temp_dir().join(format!("mlscf-it-{}-{}.json", tag, std::process::id()))
}

fn solver() -> ScfSolver {
    ScfSolver {
        max_cycles: 80,
        energy_tol: 1e-8,
        density_tol: 1e-6,
        density_mixing: None,
        diis_subspace: Some(8),
    }
}

/// Direct quadrature of the spin-resolved Slater exchange, no tape.
fn direct_lsda_energy(mol: &mlscf::Molecule) -> f64 {
    let spin_cx = -0.75 * (3.0 / std::f64::consts::PI).powf(1.0 / 3.0) * 2.0_f64.powf(1.0 / 3.0);
    let [rho_a, rho_b] = mol.density_on_grid();
    let mut e_x = 0.0;
    for g in 0..mol.grid.len() {
        e_x += mol.grid.weights[g] * spin_cx * (rho_a[g].powf(4.0 / 3.0) + rho_b[g].powf(4.0 / 3.0));
    }
    e_x + mol.non_xc_energy().unwrap()
}

#[test]
fn predictor_matches_direct_quadrature_within_acceptance_bound() {
    let mol = h2_like();
    let params = FunctionalParams::empty();
    let reference = direct_lsda_energy(&mol);

    let predictor = Predictor::new(lsda()).unwrap();
    let (e, _) = predictor.predict(&params, &mol).unwrap();

    // The autodiff path should agree to numerical precision, and in any
    // case far inside the 10 kcal/mol acceptance threshold.
    assert_relative_eq!(e, reference, epsilon = 1e-9);
    assert!((e - reference).abs() * HARTREE_TO_KCALMOL < 10.0);
}

#[test]
fn classical_functionals_reach_self_consistency() {
    // Each classical functional must converge on the fixture, and the
    // converged energy must be reproducible by one more evaluation at the
    // final density to within the acceptance bound.
    let mol = h2_like();
    let params = FunctionalParams::empty();
    let s = solver();

    for f in [lsda(), pw92(), b88()] {
        let name = f.name.clone();
        let predictor = Predictor::new(f).unwrap();
        let sol = s.run(&predictor, &params, &mol).unwrap();
        assert_eq!(sol.status, ScfStatus::Converged, "functional {name}");

        let (e_again, _) = predictor.predict(&params, &sol.molecule).unwrap();
        assert!(
            (e_again - sol.energy).abs() * HARTREE_TO_KCALMOL < 10.0,
            "functional {name}: {} vs {}",
            sol.energy,
            e_again
        );
    }

    // For LSDA the converged energy is also checkable against a direct
    // quadrature at the final density.
    let predictor = Predictor::new(lsda()).unwrap();
    let sol = s.run(&predictor, &params, &mol).unwrap();
    // sol.energy was evaluated one density update before sol.molecule's
    // final rdm1, so agreement is bounded by the tolerances, not exact.
    let direct = direct_lsda_energy(&sol.molecule);
    assert_relative_eq!(sol.energy, direct, epsilon = 1e-4);
}

#[test]
fn scf_runs_directly_from_a_loaded_dataset() {
    let mol = h2_like();
    let path = temp_path("scf");
    save_dataset(&path, &[("h2".to_string(), mol)]).unwrap();
    let loaded = load_dataset(&path, None).unwrap();
    std::fs::remove_file(&path).ok();

    let (_, molecule) = &loaded[0];
    let predictor = Predictor::new(pw92()).unwrap();
    let sol = solver()
        .run(&predictor, &FunctionalParams::empty(), molecule)
        .unwrap();
    assert!(sol.converged());
    assert!(sol.energy.is_finite());
    // Loaded snapshots keep their reference energy for training use.
    assert!(sol.molecule.reference_energy.is_some());
}

#[test]
fn hybrid_needs_its_omega_channels() {
    // Dropping all omega channels at load time removes the chi tensor, and
    // the hybrid functional's exact-exchange features must then fail
    // eagerly as a configuration error.
    let mol = h2_like();
    let path = temp_path("hybrid");
    save_dataset(&path, &[("h2".to_string(), mol)]).unwrap();
    let loaded = load_dataset(&path, Some(&[])).unwrap();
    std::fs::remove_file(&path).ok();

    let (_, molecule) = &loaded[0];
    let predictor = Predictor::new(by_name("hybrid").unwrap()).unwrap();
    let r = predictor.predict(&FunctionalParams::empty(), molecule);
    assert!(matches!(r, Err(Error::Config(_))));
}

#[test]
fn requesting_an_unstored_omega_fails_the_load() {
    let mol = h2_like();
    let path = temp_path("omega");
    save_dataset(&path, &[("h2".to_string(), mol)]).unwrap();
    let r = load_dataset(&path, Some(&[0.0, 0.9]));
    std::fs::remove_file(&path).ok();
    assert!(matches!(r, Err(Error::Config(_))));
}

#[test]
fn single_cycle_budget_reports_non_convergence() {
    let mol = h2_like();
    let predictor = Predictor::new(lsda()).unwrap();
    let s = ScfSolver {
        max_cycles: 1,
        energy_tol: 1e-10,
        density_tol: 1e-10,
        density_mixing: None,
        diis_subspace: None,
    };
    let sol = s.run(&predictor, &FunctionalParams::empty(), &mol).unwrap();
    assert_eq!(sol.status, ScfStatus::MaxCyclesExceeded);
    assert!(sol.energy.is_finite());
}

#[test]
fn electron_count_survives_the_whole_batch() {
    let mol = h2_like();
    let nelec = mol.nelec();
    let params = FunctionalParams::empty();
    for name in ["lsda", "pw92", "b88", "pbe-x"] {
        let predictor = Predictor::new(by_name(name).unwrap()).unwrap();
        let sol = solver().run(&predictor, &params, &mol).unwrap();
        assert_eq!(sol.molecule.nelec(), nelec, "functional {name}");
    }
}
