//! Command-line entry point: run every quantity described in a job
//! container and write the moment arrays back into it.

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "rustkpm",
    about = "Chebyshev spectral-moment engine for sparse tight-binding Hamiltonians"
)]
struct Cli {
    /// Job container with the Hamiltonian description and the quantities to
    /// compute; results are written back into the same file.
    input: PathBuf,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match Rustkpm::engine::run_file(&cli.input) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "job aborted");
            ExitCode::FAILURE
        }
    }
}
