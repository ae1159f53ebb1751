pub mod app;

use std::process::ExitCode;

use clap::Parser;
use tracing::error;

use app::cli::{execute, Cli};
use app::logging::init_logging;

pub fn run() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    match execute(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(code = %err.code, trace_id = %err.trace_id, "{}", err.error);
            eprintln!("{err}");
            ExitCode::FAILURE
        }
    }
}
