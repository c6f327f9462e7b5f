use std::process::ExitCode;

use clap::Parser;
use warehouse_cli::{report_failure, run_cli, Cli};

fn main() -> ExitCode {
    match run_cli(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => report_failure(&err),
    }
}
