use std::process::ExitCode;

use clap::Parser;

fn main() -> ExitCode {
    docflow_cli::init_tracing();
    let cli = docflow_cli::Cli::parse();
    match docflow_cli::run_cli(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!(
                "error[{}]: {err:#}",
                docflow_store_sqlite::error_code(&err)
            );
            ExitCode::FAILURE
        }
    }
}
