//! `huk-identity`: developer shell over the device identity core.

mod cli;
mod commands;

use std::process::ExitCode;

use clap::Parser;
use huk_identity_core::IdentityError;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::EnvFilter;

use crate::cli::Cli;

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr));

    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return;
    }
    // the core logs through `log`
    if let Err(err) = tracing_log::LogTracer::init() {
        eprintln!("failed to bridge log records: {err}");
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match commands::run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(report) => {
            match report.downcast_ref::<IdentityError>() {
                Some(err) => eprintln!("error: {} ({})", err.label(), err.code()),
                None => eprintln!("error: {report:#}"),
            }
            ExitCode::FAILURE
        }
    }
}
