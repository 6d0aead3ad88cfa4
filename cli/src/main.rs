//! qvm-remote — guest-side submitter for authenticated command execution
//! in dom0.

use std::process::ExitCode;

use clap::Parser;

use qvm_remote::cli::Cli;
use qvm_remote::failure_code;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    tokio::select! {
        result = cli.run() => match result {
            Ok(code) => ExitCode::from(code),
            Err(e) => {
                eprintln!("Error: {e}");
                ExitCode::from(failure_code(&e))
            }
        },
        _ = tokio::signal::ctrl_c() => {
            eprintln!("\nInterrupted");
            ExitCode::from(130)
        }
    }
}
