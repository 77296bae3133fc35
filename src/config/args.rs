//! Command-line argument parsing.

use clap::Parser;

/// Batch SCF over a molecule dataset with a pluggable XC functional.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to the YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    pub config_file: String,

    /// Override the dataset path
    #[arg(long)]
    pub dataset: Option<String>,

    /// Override the functional (lsda, pw92, b88, pbe-x, hybrid)
    #[arg(short, long)]
    pub functional: Option<String>,

    /// Override the selected omega channels (repeatable)
    #[arg(long, num_args = 0..)]
    pub omegas: Option<Vec<f64>>,

    /// Override density mixing weight
    #[arg(long)]
    pub density_mixing: Option<f64>,

    /// Override maximum SCF cycles
    #[arg(long)]
    pub max_cycle: Option<usize>,

    /// Override DIIS subspace size (0 disables)
    #[arg(long)]
    pub diis_subspace_size: Option<usize>,

    /// Override energy convergence threshold
    #[arg(long)]
    pub convergence_threshold: Option<f64>,

    /// Override output file (default stdout)
    #[arg(short, long)]
    pub output: Option<String>,
}
