mod cli;
mod commands;
mod error;
mod output;

use clap::Parser;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

use crate::cli::Cli;
use crate::error::CliError;

const DEFAULT_LOG_FILTER: &str = "shopwire=info";

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => code,
        Err(error) => {
            eprintln!("error: {error}");
            ExitCode::from(error.exit_code())
        }
    }
}

async fn run() -> Result<ExitCode, CliError> {
    let cli = Cli::parse();
    init_tracing();

    let envelope = commands::run(&cli).await?;
    output::render(&envelope, cli.pretty)?;

    if envelope.failed {
        return Ok(ExitCode::from(3));
    }

    Ok(ExitCode::SUCCESS)
}

/// Logs go to stderr so stdout stays machine-readable.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}
