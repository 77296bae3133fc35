//! Configuration for batch SCF runs.
//!
//! YAML file with optional fields plus defaults, overridable from the
//! command line. Range-separation values and the functional choice are
//! explicit configuration, never ambient state.

mod args;

pub use args::Args;

use serde::{Deserialize, Serialize};

use crate::scf_impl::ScfSolver;

/// Main configuration structure.
#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    /// Path to the JSON molecule dataset.
    pub dataset: String,
    /// Functional name; see `functional::classical::by_name`.
    pub functional: Option<String>,
    /// Omega channels to select from the precomputed chi tensors.
    /// Absent keeps everything stored; empty drops them.
    pub omegas: Option<Vec<f64>>,
    #[serde(default)]
    pub scf_params: ScfParams,
    pub dispersion: Option<DispersionParams>,
}

/// SCF-specific parameters.
#[derive(Debug, Deserialize, Serialize)]
pub struct ScfParams {
    pub density_mixing: Option<f64>,
    pub max_cycle: Option<usize>,
    pub diis_subspace_size: Option<usize>,
    pub convergence_threshold: Option<f64>,
    pub density_threshold: Option<f64>,
}

impl Default for ScfParams {
    fn default() -> Self {
        ScfParams {
            density_mixing: None,
            max_cycle: Some(100),
            diis_subspace_size: Some(8),
            convergence_threshold: Some(1e-6),
            density_threshold: Some(1e-5),
        }
    }
}

impl ScfParams {
    /// Apply default values to any missing parameters.
    pub fn with_defaults(mut self) -> Self {
        let defaults = Self::default();
        if self.max_cycle.is_none() {
            self.max_cycle = defaults.max_cycle;
        }
        if self.diis_subspace_size.is_none() {
            self.diis_subspace_size = defaults.diis_subspace_size;
        }
        if self.convergence_threshold.is_none() {
            self.convergence_threshold = defaults.convergence_threshold;
        }
        if self.density_threshold.is_none() {
            self.density_threshold = defaults.density_threshold;
        }
        self
    }
}

/// Dispersion correction parameters.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DispersionParams {
    pub enabled: Option<bool>,
    pub c6: Option<f64>,
    pub damping_radius: Option<f64>,
}

impl Default for DispersionParams {
    fn default() -> Self {
        DispersionParams {
            enabled: Some(false),
            c6: Some(6.5),
            damping_radius: Some(2.0),
        }
    }
}

impl DispersionParams {
    pub fn with_defaults(mut self) -> Self {
        let defaults = Self::default();
        if self.enabled.is_none() {
            self.enabled = defaults.enabled;
        }
        if self.c6.is_none() {
            self.c6 = defaults.c6;
        }
        if self.damping_radius.is_none() {
            self.damping_radius = defaults.damping_radius;
        }
        self
    }
}

impl Config {
    /// Apply defaults to all configuration sections.
    pub fn with_defaults(mut self) -> Self {
        self.scf_params = self.scf_params.with_defaults();
        if let Some(disp) = self.dispersion.take() {
            self.dispersion = Some(disp.with_defaults());
        }
        self
    }

    pub fn functional_name(&self) -> &str {
        self.functional.as_deref().unwrap_or("lsda")
    }

    pub fn is_dispersion_enabled(&self) -> bool {
        self.dispersion
            .as_ref()
            .and_then(|d| d.enabled)
            .unwrap_or(false)
    }

    /// Build the solver from the (defaulted) SCF parameters, with
    /// command-line overrides already merged in by the caller.
    pub fn solver(&self) -> ScfSolver {
        ScfSolver {
            max_cycles: self.scf_params.max_cycle.unwrap_or(100),
            energy_tol: self.scf_params.convergence_threshold.unwrap_or(1e-6),
            density_tol: self.scf_params.density_threshold.unwrap_or(1e-5),
            density_mixing: self.scf_params.density_mixing,
            diis_subspace: match self.scf_params.diis_subspace_size {
                Some(0) | None => None,
                some => some,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yaml_with_defaults_fills_gaps() {
        let text = "
dataset: molecules.json
functional: pw92
scf_params:
  max_cycle: 30
";
        let config: Config = serde_yml::from_str::<Config>(text).unwrap().with_defaults();
        assert_eq!(config.scf_params.max_cycle, Some(30));
        assert_eq!(config.scf_params.convergence_threshold, Some(1e-6));
        assert_eq!(config.functional_name(), "pw92");
        assert!(!config.is_dispersion_enabled());
        let solver = config.solver();
        assert_eq!(solver.max_cycles, 30);
        assert_eq!(solver.diis_subspace, Some(8));
    }

    #[test]
    fn zero_diis_subspace_disables_acceleration() {
        let text = "
dataset: molecules.json
scf_params:
  diis_subspace_size: 0
";
        let config: Config = serde_yml::from_str::<Config>(text).unwrap().with_defaults();
        assert_eq!(config.solver().diis_subspace, None);
    }
}
