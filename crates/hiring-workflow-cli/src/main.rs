use std::process::ExitCode;

use clap::Parser;

fn main() -> ExitCode {
    let cli = hiring_workflow_cli::Cli::parse();
    match hiring_workflow_cli::run_cli(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{}", hiring_workflow_cli::render_error(&err));
            ExitCode::FAILURE
        }
    }
}
