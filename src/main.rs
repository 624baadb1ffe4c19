//! Pagesift CLI application entry point.

use std::process::ExitCode;

use clap::Parser;
use pagesift::cli::{Arguments, ExitStatus, run_cli};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    let args = Arguments::parse();
    let default_level = if args.command.common().is_some_and(|c| c.verbose) {
        "pagesift=debug"
    } else {
        "pagesift=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    match run_cli(args).await {
        Ok(status) => status.into(),
        Err(err) => {
            eprintln!("Error: {err:#}");
            ExitStatus::Error.into()
        }
    }
}
