// SPDX-FileCopyrightText: The rcoredump contributors
//
// SPDX-License-Identifier: GPL-3.0-only

//! The `rcoredump` CLI entry point. All of the actual work lives in
//! [`rcoredump::forwarder`]; this is the thin binary shim `core_pattern`
//! invokes.

use std::process::ExitCode;

use clap::Parser;

use rcoredump::forwarder::{self, Cli};
use rcoredump::log;

fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(e) = log::init(cli.log_sink()) {
        eprintln!("failed to initialize logging: {e:#}");
        return ExitCode::FAILURE;
    }
    match forwarder::run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}
