//! # ebtrace - Main Entry Point
//!
//! Parses the command line, sets up logging and runs the agent until
//! SIGINT, SIGTERM or `--duration`.

use anyhow::Result;
use clap::Parser;

use ebtrace::agent::{self, AgentConfig};
use ebtrace::cli::Args;
use ebtrace::preflight::{exit_code_for, EXIT_SUCCESS};

fn main() {
    let args = Args::parse();

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(if args.verbose { "info" } else { "warn" }),
    )
    .init();

    std::process::exit(match run(&args) {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            let code = exit_code_for(&e);
            eprintln!("error: {e:#}");
            code
        }
    });
}

#[tokio::main]
async fn run(args: &Args) -> Result<()> {
    println!("ebtrace v{}", env!("CARGO_PKG_VERSION"));
    agent::run(AgentConfig::from(args)).await
}
