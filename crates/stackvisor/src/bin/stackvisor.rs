//! Stackvisor CLI
//!
//! Usage:
//!   stackvisor up stack.yaml
//!   stackvisor up stack.yaml -a web_port:=9000
//!   stackvisor up stack.yaml --dry-run
//!   stackvisor down
//!   stackvisor status -f json

use stackvisor::cli::{self, Command};
use stackvisor::StackvisorArgs;
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    let args: StackvisorArgs = argh::from_env();

    // RUST_LOG still wins over -l
    let log_level = match args.log_level.to_lowercase().as_str() {
        "error" => "error",
        "warn" => "warn",
        "debug" => "debug",
        "trace" => "trace",
        _ => "info",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .target(env_logger::Target::Stderr)
        .init();

    let result = match args.command {
        Command::Up(up) => cli::up(up).await,
        Command::Down(down) => cli::down(down).await,
        Command::Status(status) => cli::status(status),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            log::error!("{:#}", e);
            ExitCode::from(1)
        }
    }
}
