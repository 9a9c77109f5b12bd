//! stmcli - serial terminal + STM32 UART bootloader flasher
//!
//! Interactive mode multiplexes a live terminal and the factory-bootloader
//! programmer over one port; one-shot verbs cover scripted flashing.

use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use stmcli::cli::Cli;

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .with(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn,stmcli=info")),
        )
        .init();

    let cli = Cli::parse();
    match stmcli::cli::run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}
