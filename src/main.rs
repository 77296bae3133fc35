//! Batch SCF command-line interface.
//!
//! Loads a molecule dataset, runs the SCF loop per molecule with the
//! configured functional and reports energies and convergence statistics.
//! Runs are independent, so the batch is parallelized per molecule.

use clap::Parser;
use color_eyre::eyre::{eyre, Result, WrapErr};
use rayon::prelude::*;
use std::fs;
use tracing::{info, warn};

use mlscf::config::{Args, Config};
use mlscf::functional::{classical, DispersionFunctional};
use mlscf::io::output::{log_history, setup_output, write_results};
use mlscf::io::load_dataset;
use mlscf::{FunctionalParams, Predictor, ScfSolution};

fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();
    setup_output(args.output.as_ref());

    info!("Reading configuration from: {}", args.config_file);
    let config_content = fs::read_to_string(&args.config_file)
        .wrap_err_with(|| format!("Unable to read configuration file: {}", args.config_file))?;
    let mut config: Config = serde_yml::from_str::<Config>(&config_content)
        .wrap_err("Failed to parse configuration file")?
        .with_defaults();

    // Command-line overrides.
    if let Some(dm) = args.density_mixing {
        info!("Overriding density_mixing with: {}", dm);
        config.scf_params.density_mixing = Some(dm);
    }
    if let Some(mc) = args.max_cycle {
        info!("Overriding max_cycle with: {}", mc);
        config.scf_params.max_cycle = Some(mc);
    }
    if let Some(size) = args.diis_subspace_size {
        info!("Overriding diis_subspace_size with: {}", size);
        config.scf_params.diis_subspace_size = Some(size);
    }
    if let Some(tol) = args.convergence_threshold {
        info!("Overriding convergence_threshold with: {}", tol);
        config.scf_params.convergence_threshold = Some(tol);
    }
    if let Some(f) = args.functional {
        config.functional = Some(f);
    }
    if let Some(omegas) = args.omegas {
        config.omegas = Some(omegas);
    }
    let dataset_path = args.dataset.as_deref().unwrap_or(&config.dataset);

    let functional = classical::by_name(config.functional_name())
        .map_err(|e| eyre!("{e}"))?;
    info!("Functional: {:?}", functional);

    let mut predictor = Predictor::new(functional).map_err(|e| eyre!("{e}"))?;
    if config.is_dispersion_enabled() {
        let disp = config
            .dispersion
            .as_ref()
            .cloned()
            .unwrap_or_default()
            .with_defaults();
        predictor = predictor.with_dispersion(DispersionFunctional::new(
            disp.c6.unwrap_or(6.5),
            disp.damping_radius.unwrap_or(2.0),
        ));
        info!("Dispersion correction enabled");
    }

    info!("Loading dataset: {}", dataset_path);
    let molecules = load_dataset(dataset_path, config.omegas.as_deref())
        .map_err(|e| eyre!("{e}"))?;
    info!("Loaded {} molecules", molecules.len());

    let solver = config.solver();
    let params = FunctionalParams::empty();

    // Each run owns its own snapshot chain; no shared mutable state.
    let outcomes: Vec<(String, mlscf::Result<ScfSolution>)> = molecules
        .into_par_iter()
        .map(|(name, molecule)| {
            let result = solver.run(&predictor, &params, &molecule);
            (name, result)
        })
        .collect();

    let mut results: Vec<(String, ScfSolution)> = Vec::new();
    let mut failures = 0;
    for (name, outcome) in outcomes {
        match outcome {
            Ok(sol) => {
                log_history(&name, &sol);
                results.push((name, sol));
            }
            Err(e) => {
                failures += 1;
                warn!("{}: {}", name, e);
            }
        }
    }

    let mut stdout = std::io::stdout();
    write_results(&mut stdout, &results).map_err(|e| eyre!("{e}"))?;
    if failures > 0 {
        warn!("{} molecules failed fatally", failures);
    }

    Ok(())
}
