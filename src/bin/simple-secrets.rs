//! simple-secrets binary entry point.

use std::process::ExitCode;

use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    // Quiet by default; RUST_LOG=simple_secrets=debug for troubleshooting.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    simple_secrets::cli::run(std::env::args().collect())
}
