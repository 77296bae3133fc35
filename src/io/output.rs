//! Logging setup and result reporting.

use std::fmt;
use std::fs::File;
use std::io::Write;
use std::time::SystemTime as StdSystemTime;

use tracing::info;
use tracing_subscriber::{
    fmt::format::Writer, fmt::layer, fmt::time::FormatTime, layer::SubscriberExt,
    util::SubscriberInitExt, Registry,
};

use crate::error::Result;
use crate::scf_impl::ScfSolution;

/// Custom time formatter that shows only seconds.
struct SecondPrecisionTimer;

impl FormatTime for SecondPrecisionTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> fmt::Result {
        let now = StdSystemTime::now();
        let duration = now
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();

        let total_seconds = duration.as_secs();
        let hours = (total_seconds / 3600) % 24;
        let minutes = (total_seconds / 60) % 60;
        let seconds = total_seconds % 60;

        write!(w, "{:02}:{:02}:{:02}", hours, minutes, seconds)
    }
}

/// Setup output logging to file or stdout.
pub fn setup_output(output_path: Option<&String>) {
    match output_path {
        Some(path) => {
            if let Ok(log) = File::create(path) {
                let file_layer = layer()
                    .with_writer(log)
                    .with_timer(SecondPrecisionTimer)
                    .with_ansi(false);
                Registry::default().with(file_layer).init();
            } else {
                eprintln!("Could not create output file: {}", path);
            }
        }
        None => {
            let stdout_layer = layer()
                .with_writer(std::io::stdout)
                .with_timer(SecondPrecisionTimer)
                .with_ansi(true);
            Registry::default().with(stdout_layer).init();
        }
    }
}

/// Per-molecule result lines plus a batch summary. Non-convergence shows up
/// here as a flag, never as a missing entry.
pub fn write_results<W: Write>(
    writer: &mut W,
    results: &[(String, ScfSolution)],
) -> Result<()> {
    let mut unconverged = 0;
    for (name, sol) in results {
        let flag = if sol.converged() {
            "converged"
        } else {
            unconverged += 1;
            "NOT CONVERGED"
        };
        writeln!(
            writer,
            "  {:<24} E = {:>16.10} au  ({} cycles, {})",
            name, sol.energy, sol.cycles, flag
        )?;
        if let Some(reference) = sol.molecule.reference_energy {
            writeln!(
                writer,
                "  {:<24} reference delta = {:+.6e} au",
                "", sol.energy - reference
            )?;
        }
    }
    writeln!(
        writer,
        "{} molecules, {} unconverged",
        results.len(),
        unconverged
    )?;
    Ok(())
}

/// Log per-cycle energy history at info level.
pub fn log_history(name: &str, sol: &ScfSolution) {
    for (i, e) in sol.history.iter().enumerate() {
        info!("{}: cycle {:>3}  E = {:.10} au", name, i + 1, e);
    }
}
